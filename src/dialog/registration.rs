use super::authenticate::{handle_client_authenticate, Credential};
use crate::{
    rsip_ext::{expires_header, via_received},
    transaction::{
        endpoint::EndpointInnerRef,
        generate_random_cseq,
        key::{TransactionKey, TransactionRole},
        make_call_id, make_tag,
        transaction::Transaction,
    },
    transport::SipAddr,
    Error, Result,
};
use get_if_addrs::get_if_addrs;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, HostWithPort, Response, SipMessage, StatusCode, StatusCodeKind};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Requested binding lifetime when the caller does not say otherwise.
pub const DEFAULT_EXPIRES: u32 = 3600;
/// Pause before retrying after a failed registration.
const RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// One registrar binding: builds and sends REGISTER requests over a
/// stable Call-ID and an increasing CSeq, answering digest challenges
/// with the configured credential.
///
/// The registrar reports our source address back through the Via
/// `received`/`rport` parameters; the discovered public binding is used
/// for the Contact of subsequent refreshes, which is what keeps the
/// binding reachable from behind a NAT.
pub struct Registration {
    pub last_seq: u32,
    pub endpoint: EndpointInnerRef,
    pub credential: Option<Credential>,
    /// The address-of-record; defaults to `sip:user@registrar`.
    pub account: Option<rsip::Uri>,
    pub contact: Option<rsip::typed::Contact>,
    pub public_address: Option<(IpAddr, u16)>,
    call_id: rsip::headers::CallId,
    from_tag: String,
}

impl Registration {
    pub fn new(endpoint: EndpointInnerRef, credential: Option<Credential>) -> Self {
        let call_id = make_call_id(endpoint.option.callid_suffix.as_deref());
        Self {
            last_seq: generate_random_cseq(),
            endpoint,
            credential,
            account: None,
            contact: None,
            public_address: None,
            call_id,
            from_tag: make_tag(),
        }
    }

    /// The binding lifetime granted by the last response: the Expires
    /// header, else the Contact `expires` parameter.
    pub fn granted_expires(response: &Response) -> Option<u32> {
        if let Some(expires) = expires_header(&response.headers) {
            return Some(expires);
        }
        response
            .contact_header()
            .ok()
            .and_then(|c| c.typed().ok())
            .and_then(|c| c.expires().and_then(|e| e.seconds().ok()))
    }

    fn get_first_non_loopback_interface() -> Result<IpAddr> {
        get_if_addrs()?
            .iter()
            .find(|i| !i.is_loopback())
            .map(|i| match i.addr {
                get_if_addrs::IfAddr::V4(ref addr) => Ok(IpAddr::V4(addr.ip)),
                _ => Err(Error::Error("no ipv4 address found".to_string())),
            })
            .unwrap_or(Err(Error::Error("no interface found".to_string())))
    }

    /// Register with the given lifetime. `register` and `unregister` are
    /// thin wrappers choosing the lifetime.
    pub async fn register_with_expires(
        &mut self,
        server: &rsip::Uri,
        expires: u32,
    ) -> Result<Response> {
        self.last_seq += 1;

        let account = match &self.account {
            Some(account) => account.clone(),
            None => {
                let mut account = server.clone();
                if let Some(credential) = &self.credential {
                    account.auth = Some(rsip::auth::Auth {
                        user: credential.username.clone(),
                        password: None,
                    });
                }
                account
            }
        };

        let to = rsip::typed::To {
            display_name: None,
            uri: account.clone(),
            params: vec![],
        };
        let from = rsip::typed::From {
            display_name: None,
            uri: account.clone(),
            params: vec![],
        }
        .with_tag(self.from_tag.clone().into());

        let via_addr = match self.public_address {
            Some((ip, port)) => Some(SipAddr {
                r#type: Some(rsip::Transport::Udp),
                addr: HostWithPort {
                    host: ip.into(),
                    port: Some(port.into()),
                },
            }),
            None => self.endpoint.get_addrs().first().cloned(),
        };
        let via = self.endpoint.get_via(via_addr, None)?;

        let contact = self.contact.clone().unwrap_or_else(|| {
            let host_with_port = match self.public_address {
                Some((ip, port)) => HostWithPort {
                    host: ip.into(),
                    port: Some(port.into()),
                },
                None => self
                    .endpoint
                    .get_addrs()
                    .first()
                    .map(|a| a.addr.clone())
                    .or_else(|| {
                        Self::get_first_non_loopback_interface()
                            .ok()
                            .map(HostWithPort::from)
                    })
                    .unwrap_or_default(),
            };
            rsip::typed::Contact {
                display_name: None,
                uri: rsip::Uri {
                    auth: account.auth.clone(),
                    scheme: Some(rsip::Scheme::Sip),
                    host_with_port,
                    params: vec![],
                    headers: vec![],
                },
                params: vec![],
            }
        });

        let mut request = self.endpoint.make_request(
            rsip::Method::Register,
            server.clone(),
            via,
            from,
            to,
            self.last_seq,
        );
        // refreshes of one binding share one Call-ID
        let mut headers: Vec<Header> = Vec::new();
        for header in request.headers.iter() {
            match header {
                Header::CallId(_) => headers.push(Header::CallId(self.call_id.clone())),
                other => headers.push(other.clone()),
            }
        }
        request.headers = headers.into();
        request.headers.unique_push(contact.into());
        request
            .headers
            .unique_push(Header::Expires(expires.to_string().into()));
        request
            .headers
            .unique_push(Header::Allow(self.endpoint.allow_header()));

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
        tx.send().await?;

        let mut www_answered = false;
        let mut proxy_answered = false;

        while let Some(msg) = tx.receive().await {
            let resp = match msg {
                SipMessage::Response(resp) => resp,
                _ => break,
            };
            if resp.status_code.kind() == StatusCodeKind::Provisional {
                continue;
            }
            self.learn_public_address(&resp);
            match resp.status_code {
                StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                    let answered = match resp.status_code {
                        StatusCode::Unauthorized => &mut www_answered,
                        _ => &mut proxy_answered,
                    };
                    let credential = match &self.credential {
                        Some(credential) if !*answered => credential.clone(),
                        _ => {
                            info!("registration refused: {}", resp.status_code);
                            return Ok(resp);
                        }
                    };
                    *answered = true;
                    self.last_seq += 1;
                    let (new_tx, _) =
                        handle_client_authenticate(self.last_seq, tx, resp, &credential).await?;
                    tx = new_tx;
                    tx.send().await?;
                }
                _ => {
                    debug!("registration answered: {}", resp.status_code);
                    return Ok(resp);
                }
            }
        }
        Err(Error::Error(
            "registration transaction ended without a final response".to_string(),
        ))
    }

    pub async fn register(&mut self, server: &rsip::Uri) -> Result<Response> {
        self.register_with_expires(server, DEFAULT_EXPIRES).await
    }

    /// Remove the binding (`Expires: 0`).
    pub async fn unregister(&mut self, server: &rsip::Uri) -> Result<Response> {
        self.register_with_expires(server, 0).await
    }

    /// The registrar's view of our source address, from the Via it
    /// stamped.
    fn learn_public_address(&mut self, response: &Response) {
        let via = match response.via_header().and_then(|v| Ok(v.typed()?)) {
            Ok(via) => via,
            Err(_) => return,
        };
        let (received, rport) = via_received(&via);
        if let (Some(ip), Some(port)) = (received, rport) {
            if self.public_address != Some((ip, port)) {
                info!("registrar sees us as {}:{}", ip, port);
                self.public_address = Some((ip, port));
                // regenerate the contact with the public binding
                self.contact = None;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    Registered { expires: u32 },
    Failed { status: Option<StatusCode> },
    Unregistered,
}

pub type RegistrationEventReceiver = UnboundedReceiver<RegistrationEvent>;
pub type RegistrationEventSender = UnboundedSender<RegistrationEvent>;

/// Keeps one registrar binding alive: refreshes at 90% of the granted
/// lifetime, retries every minute on failure, reports changes through
/// the event channel, and removes the binding on [`AutoRegistrar::stop`].
pub struct AutoRegistrar {
    registration: Arc<tokio::sync::Mutex<Registration>>,
    registrar: rsip::Uri,
    registered: Arc<AtomicBool>,
    cancel_token: CancellationToken,
}

impl AutoRegistrar {
    pub fn start(
        endpoint: EndpointInnerRef,
        registrar: rsip::Uri,
        account: Option<rsip::Uri>,
        credential: Option<Credential>,
        events: RegistrationEventSender,
    ) -> Self {
        let mut registration = Registration::new(endpoint.clone(), credential);
        registration.account = account;
        let registration = Arc::new(tokio::sync::Mutex::new(registration));
        let registered = Arc::new(AtomicBool::new(false));
        let cancel_token = endpoint.cancel_token.child_token();

        let loop_registration = registration.clone();
        let loop_registered = registered.clone();
        let loop_token = cancel_token.clone();
        let loop_registrar = registrar.clone();
        tokio::spawn(async move {
            loop {
                let outcome = {
                    let mut registration = loop_registration.lock().await;
                    registration.register(&loop_registrar).await
                };
                let delay = match outcome {
                    Ok(resp) if resp.status_code == StatusCode::OK => {
                        let expires =
                            Registration::granted_expires(&resp).unwrap_or(DEFAULT_EXPIRES);
                        let was = loop_registered.swap(true, Ordering::Relaxed);
                        if !was {
                            info!("registered with {} for {}s", loop_registrar, expires);
                        }
                        events
                            .send(RegistrationEvent::Registered { expires })
                            .ok();
                        // refresh with margin, well before the registrar
                        // forgets us
                        Duration::from_secs((expires as u64) * 9 / 10)
                    }
                    Ok(resp) => {
                        warn!("registration failed: {}", resp.status_code);
                        loop_registered.store(false, Ordering::Relaxed);
                        events
                            .send(RegistrationEvent::Failed {
                                status: Some(resp.status_code),
                            })
                            .ok();
                        RETRY_INTERVAL
                    }
                    Err(e) => {
                        warn!("registration error: {}", e);
                        loop_registered.store(false, Ordering::Relaxed);
                        events.send(RegistrationEvent::Failed { status: None }).ok();
                        RETRY_INTERVAL
                    }
                };
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            events.send(RegistrationEvent::Unregistered).ok();
        });

        AutoRegistrar {
            registration,
            registrar,
            registered,
            cancel_token,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Relaxed)
    }

    /// Stop refreshing and remove the binding.
    pub async fn stop(&self) {
        self.cancel_token.cancel();
        let mut registration = self.registration.lock().await;
        if let Err(e) = registration.unregister(&self.registrar).await {
            warn!("unregister failed: {}", e);
        }
        self.registered.store(false, Ordering::Relaxed);
    }
}
