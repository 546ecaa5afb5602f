use crate::rsip_ext::via_branch;
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Identity of a transaction on the wire: the top-Via branch plus the
/// CSeq pair, qualified by which side of the exchange we are on.
///
/// A response matches a client transaction only when both the branch and
/// the CSeq (number and method) match; a request retransmit matches a
/// server transaction by branch. An ACK for a non-2xx final carries the
/// INVITE's CSeq number with method ACK, so on the server side it is
/// keyed back onto the INVITE transaction. An ACK for a 2xx matches
/// nothing and is handed to the dialog instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionKey {
    pub role: TransactionRole,
    pub branch: String,
    pub cseq: u32,
    pub method: rsip::Method,
}

impl std::hash::Hash for TransactionKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.branch.hash(state);
        self.cseq.hash(state);
        self.method.to_string().hash(state);
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = match self.role {
            TransactionRole::Client => "c",
            TransactionRole::Server => "s",
        };
        write!(f, "{}:{}:{}:{}", role, self.branch, self.cseq, self.method)
    }
}

impl TransactionKey {
    pub fn from_request(request: &rsip::Request, role: TransactionRole) -> Result<Self> {
        let via = request.via_header()?.typed()?;
        let branch = via_branch(&via).ok_or_else(|| {
            Error::SipMessageError(format!("request without via branch: {}", request.method))
        })?;
        let cseq_header = request.cseq_header()?;
        let cseq = cseq_header.seq()?;
        let mut method = cseq_header.method()?;
        if role == TransactionRole::Server && method == rsip::Method::Ack {
            method = rsip::Method::Invite;
        }
        Ok(TransactionKey {
            role,
            branch,
            cseq,
            method,
        })
    }

    pub fn from_response(response: &rsip::Response, role: TransactionRole) -> Result<Self> {
        let via = response.via_header()?.typed()?;
        let branch = via_branch(&via).ok_or_else(|| {
            Error::SipMessageError(format!(
                "response without via branch: {}",
                response.status_code
            ))
        })?;
        let cseq_header = response.cseq_header()?;
        Ok(TransactionKey {
            role,
            branch,
            cseq: cseq_header.seq()?,
            method: cseq_header.method()?,
        })
    }
}
