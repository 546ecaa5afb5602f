use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use crate::transaction::{endpoint::EndpointInnerRef, make_tag};
use crate::{header_pop, Error, Result};
use rsip::headers::auth::{Algorithm, AuthQop, Qop, Scheme};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::services::DigestGenerator;
use rsip::{Header, Response, StatusCode, StatusCodeKind};
use tracing::{debug, info};

/// Digest credentials for answering 401/407 challenges.
///
/// A credential with a `realm` is pinned to it: challenges from any
/// other realm are refused instead of being answered with the wrong
/// secret. `None` answers whatever realm the server names.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential({})", self.username)
    }
}

/// Outcome of a request submitted through [`request_with_auth`].
pub struct SipResult {
    pub status: StatusCode,
    pub response: Option<Response>,
}

/// Answer one digest challenge: compute the response for the challenge
/// carried by `resp`, clone the transaction's request with the matching
/// Authorization or Proxy-Authorization header and the new CSeq number,
/// pop the spent Via so the retry runs under a fresh branch, and return
/// the replacement client transaction together with the header (callers
/// cache it for the ACK).
pub async fn handle_client_authenticate(
    new_seq: u32,
    tx: Transaction,
    resp: Response,
    credential: &Credential,
) -> Result<(Transaction, Header)> {
    let challenge = match resp.status_code {
        StatusCode::Unauthorized => resp.headers.iter().find_map(|h| match h {
            Header::WwwAuthenticate(w) => w.typed().ok(),
            _ => None,
        }),
        StatusCode::ProxyAuthenticationRequired => resp.headers.iter().find_map(|h| match h {
            Header::ProxyAuthenticate(p) => p.typed().ok().map(|t| t.0),
            _ => None,
        }),
        _ => None,
    }
    .ok_or_else(|| {
        Error::SipMessageError(format!(
            "{} carried no usable challenge",
            resp.status_code
        ))
    })?;

    if let Some(realm) = &credential.realm {
        if !realm.eq_ignore_ascii_case(&challenge.realm) {
            return Err(Error::Error(format!(
                "credential is scoped to realm {}, challenge names {}",
                realm, challenge.realm
            )));
        }
    }

    let mut request = tx.original.clone();
    let algorithm = challenge.algorithm.unwrap_or(Algorithm::Md5);
    let qop = match challenge.qop {
        Some(Qop::Auth) => Some(AuthQop::Auth {
            cnonce: make_tag(),
            nc: 1,
        }),
        Some(Qop::AuthInt) => Some(AuthQop::AuthInt {
            cnonce: make_tag(),
            nc: 1,
        }),
        _ => None,
    };
    let digest = DigestGenerator {
        username: &credential.username,
        password: &credential.password,
        algorithm,
        nonce: &challenge.nonce,
        method: &request.method,
        qop: qop.as_ref(),
        uri: &request.uri,
        realm: &challenge.realm,
    }
    .compute();

    let authorization = rsip::typed::Authorization {
        scheme: Scheme::Digest,
        username: credential.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: request.uri.clone(),
        response: digest,
        algorithm: Some(algorithm),
        opaque: challenge.opaque.clone(),
        qop,
    };
    let auth_header = match resp.status_code {
        StatusCode::ProxyAuthenticationRequired => Header::ProxyAuthorization(
            rsip::typed::ProxyAuthorization(authorization).into(),
        ),
        _ => Header::Authorization(authorization.into()),
    };
    request.headers.unique_push(auth_header.clone());

    // fresh CSeq number, same method
    let method = request.method;
    let mut headers: Vec<Header> = Vec::new();
    for header in request.headers.iter() {
        match header {
            Header::CSeq(_) => headers.push(Header::CSeq(
                rsip::typed::CSeq {
                    seq: new_seq,
                    method,
                }
                .into(),
            )),
            other => headers.push(other.clone()),
        }
    }
    request.headers = headers.into();

    // the spent Via goes; the retry is a new transaction with its own
    // branch
    header_pop!(request.headers, Header::Via);
    let via = tx.endpoint_inner.get_via(None, None)?;
    let mut headers: Vec<Header> = vec![Header::Via(via.into())];
    headers.extend(request.headers.iter().cloned());
    request.headers = headers.into();

    info!(
        "answering {} for {} cseq={}",
        resp.status_code, request.uri, new_seq
    );
    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
    let destination = tx.destination.clone();
    let mut new_tx = Transaction::new_client(key, request, tx.endpoint_inner.clone(), None);
    new_tx.destination = destination;
    Ok((new_tx, auth_header))
}

/// Submit a request and wait for its final answer, transparently
/// answering one proxy challenge and one user-agent challenge when
/// credentials are at hand. A second challenge of the same kind is
/// surfaced to the caller untouched.
pub async fn request_with_auth(
    endpoint: EndpointInnerRef,
    request: rsip::Request,
    credential: Option<&Credential>,
) -> Result<SipResult> {
    let mut last_seq = request.cseq_header()?.seq()?;
    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
    let mut tx = Transaction::new_client(key, request, endpoint, None);
    tx.send().await?;

    let mut www_answered = false;
    let mut proxy_answered = false;

    while let Some(msg) = tx.receive().await {
        let resp = match msg {
            rsip::SipMessage::Response(resp) => resp,
            _ => break,
        };
        match resp.status_code {
            _ if resp.status_code.kind() == StatusCodeKind::Provisional => continue,
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                let answered = match resp.status_code {
                    StatusCode::Unauthorized => &mut www_answered,
                    _ => &mut proxy_answered,
                };
                let credential = match credential {
                    Some(credential) if !*answered => credential,
                    _ => {
                        debug!("surfacing {} to the caller", resp.status_code);
                        return Ok(SipResult {
                            status: resp.status_code.clone(),
                            response: Some(resp),
                        });
                    }
                };
                *answered = true;
                last_seq += 1;
                let (new_tx, _) =
                    handle_client_authenticate(last_seq, tx, resp, credential).await?;
                tx = new_tx;
                tx.send().await?;
            }
            _ => {
                return Ok(SipResult {
                    status: resp.status_code.clone(),
                    response: Some(resp),
                })
            }
        }
    }
    Err(Error::Error(
        "transaction ended without a final response".to_string(),
    ))
}
