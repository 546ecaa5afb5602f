use super::{
    authenticate::{handle_client_authenticate, Credential},
    client_dialog::ClientInviteDialog,
    server_dialog::ServerInviteDialog,
    DialogId,
};
use crate::{
    rsip_ext::extract_uri_from_contact,
    transaction::{
        endpoint::EndpointInnerRef,
        generate_random_cseq,
        key::{TransactionKey, TransactionRole},
        transaction::Transaction,
        TransactionEventSender,
    },
    Result,
};
use rsip::{
    headers::Route,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    typed::{CSeq, Contact},
    Header, Param, Request, Response, SipMessage, StatusCode, StatusCodeKind,
};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dialog life cycle.
///
/// An initiating dialog starts in `Waiting` (INVITE sent, nothing heard
/// yet), an accepting dialog starts in `Early`. The `ClosePending*`
/// states cover teardown begun before the dialog settled: waiting for
/// the first provisional (so a CANCEL has something to chase), for the
/// CANCELed INVITE's final answer, or for a straggling ACK.
/// `CloseEventPending` marks a close requested from inside a dialog
/// callback; the actual teardown runs once the callback has returned.
/// `Closed` is terminal and is broadcast exactly once.
#[derive(Clone)]
pub enum DialogState {
    Waiting(DialogId),
    Early(DialogId, Option<Response>),
    Confirmed(DialogId),
    CloseEventPending(DialogId),
    ClosePendingProvisional(DialogId),
    ClosePendingFinal(DialogId),
    ClosePendingAck(DialogId),
    Closed(DialogId, CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    LocalBye,
    PeerBye,
    LocalCancel,
    PeerCancel,
    /// The far side declined the INVITE with this final.
    Rejected(Option<StatusCode>),
    /// Torn down before any final was sent (410 Gone to the peer).
    Gone,
    Timeout,
    AuthRequired,
}

/// Application decision for an in-dialog request the dialog itself does
/// not consume. `None` falls back to 501 Not Implemented.
pub type DialogRequestHook =
    Arc<dyn Fn(&DialogId, &Request) -> Option<(StatusCode, Option<Vec<u8>>)> + Send + Sync>;

#[derive(Clone)]
pub enum Dialog {
    ServerInvite(ServerInviteDialog),
    ClientInvite(ClientInviteDialog),
}

pub type DialogStateReceiver = UnboundedReceiver<DialogState>;
pub type DialogStateSender = UnboundedSender<DialogState>;

pub(super) type DialogInnerRef = Arc<DialogInner>;
pub(super) type TuSenderRef = Mutex<Option<TransactionEventSender>>;

/// How long an unsettled early dialog may linger before the layer prunes
/// it.
pub(super) const EARLY_DIALOG_TTL: Duration = Duration::from_secs(300);

/// State shared by the two dialog roles: identity, the two sequence
/// spaces, targets, the recorded route set, and the channels tying the
/// dialog to its transactions and to the application.
pub struct DialogInner {
    pub role: TransactionRole,
    pub cancel_token: CancellationToken,
    pub id: Mutex<DialogId>,
    pub state: Mutex<DialogState>,

    pub local_seq: AtomicU32,
    /// Zero until the first in-dialog request from the peer.
    pub remote_seq: AtomicU32,
    /// The INVITE's CSeq number, reserved for the ACK.
    pub invite_seq: AtomicU32,

    pub from: String,
    pub to: Mutex<String>,
    pub local_contact: Option<rsip::Uri>,
    pub remote_uri: Mutex<rsip::Uri>,
    pub route_set: Mutex<Vec<Route>>,

    pub credential: Option<Credential>,
    /// Authorization headers proven good during establishment; the ACK
    /// repeats them.
    pub auth_cache: Mutex<Vec<Header>>,

    pub initial_request: Request,
    pub final_response: Mutex<Option<Response>>,
    pub last_ack: Mutex<Option<Request>>,

    pub early_deadline: Instant,

    pub(super) endpoint_inner: EndpointInnerRef,
    pub(super) state_sender: DialogStateSender,
    pub(super) tu_sender: TuSenderRef,
    pub(super) request_hook: Mutex<Option<DialogRequestHook>>,
}

impl DialogState {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, DialogState::Closed(_, _))
    }
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogState::Waiting(id) => write!(f, "{}(Waiting)", id),
            DialogState::Early(id, _) => write!(f, "{}(Early)", id),
            DialogState::Confirmed(id) => write!(f, "{}(Confirmed)", id),
            DialogState::CloseEventPending(id) => write!(f, "{}(CloseEventPending)", id),
            DialogState::ClosePendingProvisional(id) => {
                write!(f, "{}(ClosePendingProvisional)", id)
            }
            DialogState::ClosePendingFinal(id) => write!(f, "{}(ClosePendingFinal)", id),
            DialogState::ClosePendingAck(id) => write!(f, "{}(ClosePendingAck)", id),
            DialogState::Closed(id, reason) => write!(f, "{}(Closed {:?})", id, reason),
        }
    }
}

impl DialogInner {
    pub fn new(
        role: TransactionRole,
        id: DialogId,
        initial_request: Request,
        endpoint_inner: EndpointInnerRef,
        state_sender: DialogStateSender,
        credential: Option<Credential>,
        local_contact: Option<rsip::Uri>,
    ) -> Result<Self> {
        let initial_cseq = initial_request.cseq_header()?.seq()?;

        // the side that sent the INVITE owns that sequence space; the
        // accepting side seeds its own
        let (local_cseq, remote_cseq) = match role {
            TransactionRole::Client => (initial_cseq, 0),
            TransactionRole::Server => (generate_random_cseq(), initial_cseq),
        };

        let remote_uri = match role {
            TransactionRole::Client => initial_request.uri.clone(),
            TransactionRole::Server => {
                extract_uri_from_contact(initial_request.contact_header()?.value())?
            }
        };

        let from = initial_request.from_header()?.typed()?;
        let mut to = initial_request.to_header()?.typed()?;
        if !to.params.iter().any(|p| matches!(p, Param::Tag(_))) && !id.to_tag.is_empty() {
            to.params.push(Param::Tag(id.to_tag.clone().into()));
        }

        let (from, to) = match role {
            TransactionRole::Client => (from.to_string(), to.to_string()),
            TransactionRole::Server => (to.to_string(), from.to_string()),
        };

        // the accepting side records the route set off the INVITE; the
        // initiating side learns it from the 2xx, reversed
        let mut route_set = vec![];
        if role == TransactionRole::Server {
            for header in initial_request.headers.iter() {
                if let Header::RecordRoute(rr) = header {
                    route_set.push(Route::from(rr.value()));
                }
            }
        }

        let state = match role {
            TransactionRole::Client => DialogState::Waiting(id.clone()),
            TransactionRole::Server => DialogState::Early(id.clone(), None),
        };

        Ok(Self {
            role,
            cancel_token: CancellationToken::new(),
            id: Mutex::new(id),
            state: Mutex::new(state),
            local_seq: AtomicU32::new(local_cseq),
            remote_seq: AtomicU32::new(remote_cseq),
            invite_seq: AtomicU32::new(initial_cseq),
            from,
            to: Mutex::new(to),
            local_contact,
            remote_uri: Mutex::new(remote_uri),
            route_set: Mutex::new(route_set),
            credential,
            auth_cache: Mutex::new(vec![]),
            initial_request,
            final_response: Mutex::new(None),
            last_ack: Mutex::new(None),
            early_deadline: Instant::now() + EARLY_DIALOG_TTL,
            endpoint_inner,
            state_sender,
            tu_sender: Mutex::new(None),
            request_hook: Mutex::new(None),
        })
    }

    pub fn is_confirmed(&self) -> bool {
        self.state.lock().unwrap().is_confirmed()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().is_closed()
    }

    pub fn get_local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Relaxed)
    }

    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed);
        self.local_seq.load(Ordering::Relaxed)
    }

    /// Enforce remote CSeq ordering: a request numbered below the
    /// high-water mark is rejected, everything else advances it.
    pub fn validate_remote_seq(&self, cseq: u32) -> bool {
        let mut current = self.remote_seq.load(Ordering::Relaxed);
        loop {
            if current != 0 && cseq < current {
                return false;
            }
            match self.remote_seq.compare_exchange(
                current,
                cseq,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn update_remote_tag(&self, tag: &str) -> Result<()> {
        self.id.lock().unwrap().to_tag = tag.to_string();
        let to: rsip::headers::untyped::To = self.to.lock().unwrap().clone().into();
        *self.to.lock().unwrap() = to.typed()?.with_tag(tag.to_string().into()).to_string();
        debug!("remote tag learned: {}", self.id.lock().unwrap());
        Ok(())
    }

    /// Remember an Authorization/Proxy-Authorization that satisfied a
    /// challenge so the ACK can repeat it.
    pub(super) fn cache_auth_header(&self, header: Header) {
        self.auth_cache.lock().unwrap().push(header);
    }

    pub fn set_request_hook(&self, hook: DialogRequestHook) {
        *self.request_hook.lock().unwrap() = Some(hook);
    }

    pub(crate) fn make_request(
        &self,
        method: rsip::Method,
        cseq: Option<u32>,
        branch: Option<Param>,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let mut headers = headers.unwrap_or_default();
        let cseq_header = CSeq {
            seq: cseq.unwrap_or_else(|| self.increment_local_seq()),
            method,
        };

        let via = self.endpoint_inner.get_via(None, branch)?;
        headers.push(via.into());
        headers.push(Header::CallId(
            self.id.lock().unwrap().call_id.clone().into(),
        ));
        headers.push(Header::From(self.from.clone().into()));
        headers.push(Header::To(self.to.lock().unwrap().clone().into()));
        headers.push(Header::CSeq(cseq_header.into()));
        headers.push(Header::UserAgent(
            self.endpoint_inner.user_agent.clone().into(),
        ));

        self.local_contact
            .as_ref()
            .map(|c| headers.push(Contact::from(c.clone()).into()));

        for route in self.route_set.lock().unwrap().iter() {
            headers.push(Header::Route(route.clone()));
        }
        headers.push(Header::MaxForwards(70.into()));

        body.as_ref().map(|b| {
            headers.push(Header::ContentLength((b.len() as u32).into()));
        });

        Ok(Request {
            method,
            uri: self.remote_uri.lock().unwrap().clone(),
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        })
    }

    /// The ACK for a 2xx final: dialog-level, fresh branch, the INVITE's
    /// CSeq number, cached auth headers repeated.
    pub(super) fn make_ack(&self) -> Result<Request> {
        let auth_headers = self.auth_cache.lock().unwrap().clone();
        self.make_request(
            rsip::Method::Ack,
            Some(self.invite_seq.load(Ordering::Relaxed)),
            None,
            Some(auth_headers),
            None,
        )
    }

    pub(super) fn make_response(
        &self,
        request: &Request,
        status: StatusCode,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut resp_headers = rsip::Headers::default();
        self.local_contact
            .as_ref()
            .map(|c| resp_headers.push(Contact::from(c.clone()).into()));

        for header in request.headers.iter() {
            match header {
                Header::RecordRoute(rr) => {
                    resp_headers.push(Header::RecordRoute(rr.clone()));
                }
                Header::Via(via) => {
                    resp_headers.push(Header::Via(via.clone()));
                }
                Header::From(from) => {
                    resp_headers.push(Header::From(from.clone()));
                }
                Header::To(to) => {
                    let mut to = match to.clone().typed() {
                        Ok(to) => to,
                        Err(e) => {
                            info!("skipping unparsable to header: {}", e);
                            continue;
                        }
                    };
                    if status != StatusCode::Trying
                        && !to.params.iter().any(|p| matches!(p, Param::Tag(_)))
                    {
                        let own_tag = match self.role {
                            TransactionRole::Server => self.id.lock().unwrap().to_tag.clone(),
                            TransactionRole::Client => self.id.lock().unwrap().from_tag.clone(),
                        };
                        to.params.push(Param::Tag(own_tag.into()));
                    }
                    resp_headers.push(Header::To(to.into()));
                }
                Header::CSeq(cseq) => {
                    resp_headers.push(Header::CSeq(cseq.clone()));
                }
                Header::CallId(call_id) => {
                    resp_headers.push(Header::CallId(call_id.clone()));
                }
                _ => {}
            }
        }

        if let Some(headers) = headers {
            for header in headers {
                resp_headers.unique_push(header);
            }
        }
        body.as_ref().map(|b| {
            resp_headers.push(Header::ContentLength((b.len() as u32).into()));
        });
        resp_headers.unique_push(Header::UserAgent(
            self.endpoint_inner.user_agent.clone().into(),
        ));

        Response {
            status_code: status,
            headers: resp_headers,
            body: body.unwrap_or_default(),
            version: request.version().clone(),
        }
    }

    /// Run an in-dialog client transaction to its final answer. A 401
    /// and a 407 are each answered once when credentials exist; the
    /// headers that satisfied them are cached for the ACK.
    pub(crate) async fn do_request(&self, request: Request) -> Result<Option<Response>> {
        let method = request.method().to_owned();
        let destination = request
            .route_header()
            .and_then(|r| r.typed().ok())
            .and_then(|route| route.uris().first().cloned())
            .and_then(|first| {
                let mut uri = first.uri;
                uri.params.retain(|p| matches!(p, Param::Transport(_)));
                crate::transport::TransportLayer::uri_destination(&uri).ok()
            });

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint_inner.clone(), None);
        tx.destination = destination;
        tx.send().await?;

        let mut www_answered = false;
        let mut proxy_answered = false;

        while let Some(msg) = tx.receive().await {
            match msg {
                SipMessage::Response(resp) => {
                    if resp.status_code.kind() == StatusCodeKind::Provisional {
                        continue;
                    }
                    match resp.status_code {
                        StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                            let answered = match resp.status_code {
                                StatusCode::Unauthorized => &mut www_answered,
                                _ => &mut proxy_answered,
                            };
                            let credential = match &self.credential {
                                Some(credential) if !*answered => credential,
                                _ => {
                                    info!("unanswerable {} for {}", resp.status_code, method);
                                    return Ok(Some(resp));
                                }
                            };
                            *answered = true;
                            let new_seq = match method {
                                rsip::Method::Cancel | rsip::Method::Ack => self.get_local_seq(),
                                _ => self.increment_local_seq(),
                            };
                            let (new_tx, header) =
                                handle_client_authenticate(new_seq, tx, resp, credential).await?;
                            self.cache_auth_header(header);
                            tx = new_tx;
                            tx.send().await?;
                        }
                        _ => {
                            debug!("in-dialog {} answered {}", method, resp.status_code);
                            return Ok(Some(resp));
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(None)
    }

    /// Shared receipt path for in-dialog requests the INVITE machinery
    /// does not own: CSeq ordering first, BYE consumed here, the rest
    /// offered to the application hook with a 501 fallback.
    pub(super) async fn handle_in_dialog_request(&self, mut tx: Transaction) -> Result<()> {
        let cseq = tx.original.cseq_header()?.seq()?;
        if !self.validate_remote_seq(cseq) {
            warn!(
                "out-of-order {} cseq={} on {}",
                tx.original.method,
                cseq,
                self.id.lock().unwrap()
            );
            return tx.reply(StatusCode::ServerInternalError).await;
        }

        match tx.original.method {
            rsip::Method::Bye => {
                tx.reply(StatusCode::OK).await?;
                let id = self.id.lock().unwrap().clone();
                self.transition(DialogState::Closed(id, CloseReason::PeerBye))?;
                Ok(())
            }
            _ => {
                let hook = self.request_hook.lock().unwrap().clone();
                let decision = hook.and_then(|hook| {
                    let id = self.id.lock().unwrap().clone();
                    hook(&id, &tx.original)
                });
                match decision {
                    Some((status, body)) => {
                        let response = self.make_response(&tx.original, status, None, body);
                        tx.respond(response).await
                    }
                    None => {
                        if tx.last_response.is_none() {
                            tx.reply(StatusCode::NotImplemented).await?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    /// Record and broadcast a state change. `Closed` wins over anything
    /// later, which makes teardown idempotent.
    pub(crate) fn transition(&self, state: DialogState) -> Result<()> {
        {
            let mut current = self.state.lock().unwrap();
            if current.is_closed() {
                return Ok(());
            }
            info!("dialog transition: {} -> {}", current, state);
            *current = state.clone();
        }
        if self.state_sender.send(state).is_err() {
            debug!("dialog state receiver dropped");
        }
        Ok(())
    }
}

impl Dialog {
    pub fn id(&self) -> DialogId {
        match self {
            Dialog::ServerInvite(d) => d.inner.id.lock().unwrap().clone(),
            Dialog::ClientInvite(d) => d.inner.id.lock().unwrap().clone(),
        }
    }

    pub async fn handle(&mut self, tx: Transaction) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.handle(tx).await,
            Dialog::ClientInvite(d) => d.handle(tx).await,
        }
    }

    pub fn on_remove(&self) {
        match self {
            Dialog::ServerInvite(d) => d.inner.cancel_token.cancel(),
            Dialog::ClientInvite(d) => d.inner.cancel_token.cancel(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Dialog::ServerInvite(d) => d.inner.is_closed(),
            Dialog::ClientInvite(d) => d.inner.is_closed(),
        }
    }

    pub(super) fn early_deadline(&self) -> Instant {
        match self {
            Dialog::ServerInvite(d) => d.inner.early_deadline,
            Dialog::ClientInvite(d) => d.inner.early_deadline,
        }
    }

    /// Tear the dialog down in whatever way its current state calls for.
    pub async fn hangup(&self) -> Result<()> {
        match self {
            Dialog::ServerInvite(d) => d.close().await,
            Dialog::ClientInvite(d) => d.close().await,
        }
    }
}
