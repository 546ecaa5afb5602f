//! INVITE dialogs: the long-lived relationship above transactions.
//!
//! A dialog is identified by Call-ID plus the two tags. Until the far
//! side's tag is known the dialog lives in the layer's *early* table,
//! keyed by a prefixed string (`i:` initiating, `a:` accepting) so the
//! two halves of one call can coexist in a single process. The
//! [`dialog_layer::DialogLayer`] owns both tables and routes in-dialog
//! traffic; [`invitation`] establishes outbound dialogs,
//! [`registration`] keeps a registrar binding alive.

use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};

pub mod authenticate;
pub mod client_dialog;
pub mod dialog;
pub mod dialog_layer;
pub mod invitation;
pub mod registration;
pub mod server_dialog;

#[cfg(test)]
pub(crate) mod tests;

/// Full dialog identity: Call-ID, From tag, To tag, oriented as they
/// appeared on the dialog-creating INVITE.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl DialogId {
    /// Both tags known.
    pub fn is_complete(&self) -> bool {
        !self.from_tag.is_empty() && !self.to_tag.is_empty()
    }

    /// The same dialog seen from the other side: requests sent by the
    /// callee carry the tags mirrored.
    pub fn swapped(&self) -> DialogId {
        DialogId {
            call_id: self.call_id.clone(),
            from_tag: self.to_tag.clone(),
            to_tag: self.from_tag.clone(),
        }
    }

    /// Early-table key for the side that sent the INVITE and is still
    /// waiting for the peer's tag.
    pub fn early_initiating_key(&self) -> String {
        format!("i:{}:{}", self.call_id, self.from_tag)
    }

    /// Early-table key for the side that received the INVITE, derived
    /// from the caller's tag.
    pub fn early_accepting_key(&self) -> String {
        format!("a:{}:{}", self.call_id, self.from_tag)
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.from_tag, self.to_tag)
    }
}

impl TryFrom<&rsip::Request> for DialogId {
    type Error = Error;

    fn try_from(request: &rsip::Request) -> Result<Self> {
        let call_id = request.call_id_header()?.value().to_string();
        let from_tag = request
            .from_header()?
            .tag()?
            .map(|t| t.to_string())
            .unwrap_or_default();
        let to_tag = request
            .to_header()?
            .tag()?
            .map(|t| t.to_string())
            .unwrap_or_default();
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag,
        })
    }
}

impl TryFrom<&rsip::Response> for DialogId {
    type Error = Error;

    fn try_from(response: &rsip::Response) -> Result<Self> {
        let call_id = response.call_id_header()?.value().to_string();
        let from_tag = response
            .from_header()?
            .tag()?
            .map(|t| t.to_string())
            .unwrap_or_default();
        let to_tag = response
            .to_header()?
            .tag()?
            .map(|t| t.to_string())
            .unwrap_or_default();
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag,
        })
    }
}
