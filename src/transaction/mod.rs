//! RFC 3261 section 17 transactions.
//!
//! A [`transaction::Transaction`] is one request plus all of its
//! retransmits and responses, driven by one of the four state machines
//! (client/server crossed with INVITE/non-INVITE). Retransmission and
//! timeout timers are deadlines registered with the owning endpoint's
//! timing queue and delivered back to the transaction on the endpoint's
//! background tick, so a transaction only ever changes state inside its
//! own event loop.

use crate::transport::SipConnection;
use key::TransactionKey;
use rsip::SipMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod endpoint;
pub mod key;
pub mod message;
pub mod timer;
pub mod transaction;

#[cfg(test)]
pub(crate) mod tests;

pub use endpoint::{Endpoint, EndpointBuilder, EndpointOption};

/// Estimated round-trip time (RFC 3261 T1).
pub const T1: Duration = Duration::from_millis(500);
/// Retransmit interval cap (RFC 3261 T2).
pub const T2: Duration = Duration::from_secs(4);
/// Maximum lifetime a message may stay in the network (RFC 3261 T4).
pub const T4: Duration = Duration::from_secs(5);
/// Total transaction timeout, 64 times T1.
pub const T1X64: Duration = Duration::from_millis(500 * 64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

/// Combined state space of the four machines. A transaction never moves
/// backward, and `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Created but nothing sent or consumed yet.
    Unknown,
    InviteCalling,
    InviteProceeding,
    InviteCompleted,
    InviteConfirmed,
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Deadline events. Retransmit timers carry the interval to double on the
/// next arming.
#[derive(Debug, Clone)]
pub enum TransactionTimer {
    TimerA(TransactionKey, Duration),
    TimerB(TransactionKey),
    TimerD(TransactionKey),
    TimerE(TransactionKey, Duration),
    TimerF(TransactionKey),
    TimerG(TransactionKey, Duration),
    TimerH(TransactionKey),
    TimerI(TransactionKey),
    TimerJ(TransactionKey),
    TimerK(TransactionKey),
    TimerCleanup(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key, _)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerJ(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerCleanup(key) => key,
        }
    }
}

/// Events delivered into a transaction's event loop.
pub enum TransactionEvent {
    /// A matched message arrived from the wire.
    Received(SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    /// Command the (server) transaction to emit this response.
    Respond(rsip::Response),
    Terminate,
}

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;
pub type TransactionReceiver = UnboundedReceiver<transaction::Transaction>;
pub type TransactionSender = UnboundedSender<transaction::Transaction>;

// Identifier generation: a process-wide counter seeded from the system
// CSPRNG, rendered as SIP-token-safe base64 (no padding, `/`->`-`,
// `+`->`.`). Monotonic input keeps the encoding injective.
const ID_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789.-";

fn next_id() -> u64 {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    COUNTER
        .get_or_init(|| AtomicU64::new(rand::random::<u64>()))
        .fetch_add(1, Ordering::Relaxed)
}

fn encode_id(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let group = (b0 << 16) | (b1 << 8) | b2;
        out.push(ID_ALPHABET[(group >> 18) as usize & 0x3f] as char);
        out.push(ID_ALPHABET[(group >> 12) as usize & 0x3f] as char);
        if chunk.len() > 1 {
            out.push(ID_ALPHABET[(group >> 6) as usize & 0x3f] as char);
        }
        if chunk.len() > 2 {
            out.push(ID_ALPHABET[group as usize & 0x3f] as char);
        }
    }
    out
}

/// A fresh From/To tag.
pub fn make_tag() -> String {
    encode_id(&next_id().to_be_bytes())
}

/// A fresh Via branch, `z9hG4bK-` prefixed as RFC 3261 requires.
pub fn make_branch() -> String {
    format!("z9hG4bK-{}", encode_id(&next_id().to_be_bytes()))
}

/// A fresh Call-ID, optionally suffixed with `@domain`.
pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&next_id().to_be_bytes());
    bytes[8..].copy_from_slice(&rand::random::<u64>().to_be_bytes());
    let id = encode_id(&bytes);
    match domain {
        Some(domain) => format!("{}@{}", id, domain).into(),
        None => id.into(),
    }
}

/// Starting CSeq for a fresh sequence space: random, 16-bit, nonzero.
pub fn generate_random_cseq() -> u32 {
    (rand::random::<u16>() as u32 & 0x7fff) | 1
}

#[cfg(test)]
mod id_tests {
    use super::*;

    #[test]
    fn test_id_alphabet_is_token_safe() {
        for _ in 0..64 {
            let tag = make_tag();
            let branch = make_branch();
            let call_id = make_call_id(None).to_string();
            for id in [tag, branch.clone(), call_id] {
                assert!(!id.contains('/'), "{}", id);
                assert!(!id.contains('+'), "{}", id);
                assert!(!id.contains('='), "{}", id);
            }
            assert!(branch.starts_with("z9hG4bK-"));
        }
    }

    #[test]
    fn test_ids_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(make_tag()));
        }
    }

    #[test]
    fn test_random_cseq_is_nonzero_16bit() {
        for _ in 0..1000 {
            let seq = generate_random_cseq();
            assert!(seq > 0);
            assert!(seq <= 0x7fff);
        }
    }

    #[test]
    fn test_encode_id_known_value() {
        // "Man" encodes to "TWFu" in every base64 variant
        assert_eq!(encode_id(b"Man"), "TWFu");
        // trailing group is emitted without padding
        assert_eq!(encode_id(b"Ma"), "TWE");
    }
}
