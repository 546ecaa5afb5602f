//! Back-to-back user agent.
//!
//! The bridge terminates an accepting dialog, originates an initiating
//! dialog toward the real target, and rewrites everything that crosses
//! between them: dialog-scoped headers (Via, Call-ID, CSeq, tags,
//! Contact, routing) are stripped and regenerated per leg, bodies and
//! the remaining headers pass through. Redirects on the initiating leg
//! are chased up to a bound; closing either leg closes the other.
//!
//! Application policy is injected as handler closures at construction
//! and always answers with an explicit decision
//! ([`bridge::InviteDecision`], [`bridge::RequestDecision`]) rather than
//! a maybe-null value.

pub mod bridge;
pub mod session;

#[cfg(test)]
mod tests;

pub use bridge::{B2bUa, B2bUaBuilder, InviteDecision, RequestDecision};
pub use session::{BridgeSession, BridgeSide};
