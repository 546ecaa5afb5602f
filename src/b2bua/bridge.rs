use super::session::{BridgeSession, BridgeSide};
use crate::dialog::authenticate::Credential;
use crate::dialog::client_dialog::ClientInviteDialog;
use crate::dialog::dialog::{Dialog, DialogState, DialogStateReceiver};
use crate::dialog::dialog_layer::DialogLayer;
use crate::dialog::invitation::InviteOption;
use crate::dialog::DialogId;
use crate::rsip_ext::{extract_uri_from_contact, relay_response_headers, strip_dialog_scope};
use crate::transaction::transaction::Transaction;
use crate::transaction::{make_tag, TransactionReceiver};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Header, Method, Request, Response, StatusCode, StatusCodeKind};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, warn};

/// What the application wants done with an inbound INVITE.
pub enum InviteDecision {
    /// Send this (possibly edited) request down the initiating leg.
    Forward(Request),
    /// Short-circuit: answer the accepting leg with this response and
    /// never create the far leg.
    Respond(Response),
    /// Swallow the INVITE without answering; retransmits are absorbed.
    Drop,
    /// Refuse and tear the session down.
    CloseSession,
}

/// What the application wants done with an in-session request.
pub enum RequestDecision {
    Forward(Request),
    Respond(StatusCode),
    Drop,
}

pub type InviteHook =
    Box<dyn Fn(&Arc<BridgeSession>, Request) -> InviteDecision + Send + Sync>;
pub type RequestHook =
    Box<dyn Fn(&Arc<BridgeSession>, BridgeSide, Request) -> RequestDecision + Send + Sync>;
pub type ResponseHook =
    Box<dyn Fn(&Arc<BridgeSession>, BridgeSide, Response) -> Response + Send + Sync>;
pub type SessionClosingHook = Box<dyn Fn(&Arc<BridgeSession>) + Send + Sync>;

const DEFAULT_MAX_REDIRECTS: u8 = 5;

#[derive(Default)]
struct BridgeHooks {
    invite: Option<InviteHook>,
    request: Option<RequestHook>,
    response: Option<ResponseHook>,
    closing: Option<SessionClosingHook>,
}

pub struct B2bUaBuilder {
    dialog_layer: Arc<DialogLayer>,
    contact: Option<rsip::Uri>,
    credential: Option<Credential>,
    target: Option<rsip::Uri>,
    max_redirects: u8,
    hooks: BridgeHooks,
}

impl B2bUaBuilder {
    pub fn new(dialog_layer: Arc<DialogLayer>) -> Self {
        B2bUaBuilder {
            dialog_layer,
            contact: None,
            credential: None,
            target: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            hooks: BridgeHooks::default(),
        }
    }

    /// Contact advertised on both legs unless a session overrides it.
    pub fn with_contact(mut self, contact: rsip::Uri) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Route every forwarded INVITE here instead of its request-URI.
    pub fn with_target(mut self, target: rsip::Uri) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_max_redirects(mut self, bound: u8) -> Self {
        self.max_redirects = bound;
        self
    }

    pub fn on_invite(mut self, hook: InviteHook) -> Self {
        self.hooks.invite = Some(hook);
        self
    }

    pub fn on_request(mut self, hook: RequestHook) -> Self {
        self.hooks.request = Some(hook);
        self
    }

    pub fn on_response(mut self, hook: ResponseHook) -> Self {
        self.hooks.response = Some(hook);
        self
    }

    pub fn on_session_closing(mut self, hook: SessionClosingHook) -> Self {
        self.hooks.closing = Some(hook);
        self
    }

    pub fn build(self) -> B2bUa {
        B2bUa {
            inner: Arc::new(B2bUaInner {
                dialog_layer: self.dialog_layer,
                contact: self.contact,
                credential: self.credential,
                target: self.target,
                max_redirects: self.max_redirects,
                sessions: RwLock::new(HashMap::new()),
                hooks: self.hooks,
            }),
        }
    }
}

/// The bridge: consumes the endpoint's incoming transactions, pairs
/// dialogs into sessions and moves rewritten traffic between them.
#[derive(Clone)]
pub struct B2bUa {
    inner: Arc<B2bUaInner>,
}

struct B2bUaInner {
    dialog_layer: Arc<DialogLayer>,
    contact: Option<rsip::Uri>,
    credential: Option<Credential>,
    target: Option<rsip::Uri>,
    max_redirects: u8,
    /// Indexed under both legs' dialog ids.
    sessions: RwLock<HashMap<DialogId, Arc<BridgeSession>>>,
    hooks: BridgeHooks,
}

impl B2bUa {
    pub fn session_count(&self) -> usize {
        let sessions = self.inner.sessions.read().unwrap();
        let mut seen = std::collections::HashSet::new();
        sessions.values().filter(|s| seen.insert(s.id.clone())).count()
    }

    pub fn find_session(&self, id: &DialogId) -> Option<Arc<BridgeSession>> {
        let sessions = self.inner.sessions.read().unwrap();
        sessions
            .get(id)
            .or_else(|| sessions.get(&id.swapped()))
            .cloned()
    }

    /// Main loop: drain the endpoint's server transactions.
    pub async fn serve(&self, mut incoming: TransactionReceiver) -> Result<()> {
        while let Some(mut tx) = incoming.recv().await {
            let has_to_tag = tx
                .original
                .to_header()
                .ok()
                .and_then(|to| to.tag().ok())
                .flatten()
                .is_some();

            if has_to_tag {
                match self.inner.dialog_layer.match_dialog(&tx.original) {
                    Some(dialog) => {
                        let bridge = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = bridge.dispatch_in_dialog(dialog, tx).await {
                                debug!("in-dialog dispatch failed: {}", e);
                            }
                        });
                    }
                    None => {
                        debug!("no dialog for {} with tag", tx.original.method);
                        tx.reply(StatusCode::CallTransactionDoesNotExist).await.ok();
                    }
                }
                continue;
            }

            match tx.original.method {
                Method::Invite => {
                    let bridge = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge.handle_invite(tx).await {
                            warn!("invite bridging failed: {}", e);
                        }
                    });
                }
                Method::Cancel | Method::Ack => {
                    // tagless CANCEL chases a pending accepting dialog
                    match self.inner.dialog_layer.match_dialog(&tx.original) {
                        Some(mut dialog) => {
                            let bridge = self.clone();
                            tokio::spawn(async move {
                                let id = dialog.id();
                                dialog.handle(tx).await.ok();
                                bridge.cascade_if_closed(&id).await;
                            });
                        }
                        None => {
                            if tx.original.method == Method::Cancel {
                                tx.reply(StatusCode::CallTransactionDoesNotExist).await.ok();
                            }
                        }
                    }
                }
                Method::Options => {
                    tx.reply(StatusCode::OK).await.ok();
                }
                _ => {
                    tx.reply(StatusCode::NotImplemented).await.ok();
                }
            }
        }
        Ok(())
    }

    /// Accepting side of a new call: create the near dialog and session,
    /// ask the application, then drive the far leg.
    async fn handle_invite(&self, tx: Transaction) -> Result<()> {
        let (state_sender, state_receiver) = unbounded_channel();
        let contact = self.inner.contact.clone();
        let accepting = match self.inner.dialog_layer.get_or_create_server_invite(
            &tx,
            state_sender,
            self.inner.credential.clone(),
            contact,
        ) {
            Ok(dialog) => dialog,
            Err(e) => {
                warn!("cannot build accepting dialog: {}", e);
                let mut tx = tx;
                tx.reply(StatusCode::BadRequest).await.ok();
                return Ok(());
            }
        };

        let accepting_id = accepting.id();
        if self.find_session(&accepting_id).is_some() {
            // a late INVITE retransmit resurfaced after its transaction
            // aged out; the session already exists
            debug!("duplicate invite for existing session: {}", accepting_id);
            return Ok(());
        }
        let session = Arc::new(BridgeSession::new(
            make_tag(),
            accepting.clone(),
            self.inner.max_redirects,
        ));
        self.inner
            .sessions
            .write()
            .unwrap()
            .insert(accepting_id.clone(), session.clone());
        info!("session {} accepting {}", session.id, accepting_id);

        // watch the accepting leg so a peer CANCEL folds the far leg too
        self.watch_leg(session.clone(), state_receiver, BridgeSide::Accepting);

        // the default forwarded request: the INVITE minus everything
        // dialog-scoped
        let mut forward = strip_dialog_scope(&tx.original)?;
        if let Some(target) = &self.inner.target {
            forward.uri = target.clone();
        }

        // hand the INVITE transaction to the dialog before any answer
        // can be commanded through it
        let mut accepting_driver = accepting.clone();
        tokio::spawn(async move {
            accepting_driver.handle(tx).await.ok();
        });

        let decision = match &self.inner.hooks.invite {
            Some(hook) => {
                match catch_unwind(AssertUnwindSafe(|| hook(&session, forward.clone()))) {
                    Ok(decision) => decision,
                    Err(_) => {
                        warn!("invite hook panicked, refusing call");
                        accepting.reject(Some(StatusCode::ServerInternalError)).ok();
                        self.unlink_session(&session);
                        return Ok(());
                    }
                }
            }
            None => InviteDecision::Forward(forward),
        };

        let forward = match decision {
            InviteDecision::Forward(forward) => forward,
            InviteDecision::Respond(response) => {
                let status = response.status_code.clone();
                debug!("invite short-circuited with {}", status);
                if status.kind() == StatusCodeKind::Successful {
                    let headers = relay_response_headers(&response);
                    let body = if response.body.is_empty() {
                        None
                    } else {
                        Some(response.body)
                    };
                    accepting.accept(Some(headers), body)?;
                } else {
                    accepting.reject(Some(status))?;
                    self.unlink_session(&session);
                }
                return Ok(());
            }
            InviteDecision::Drop => {
                debug!("invite dropped by hook");
                self.unlink_session(&session);
                self.inner.dialog_layer.remove_dialog(&accepting_id);
                return Ok(());
            }
            InviteDecision::CloseSession => {
                // the hook asked for teardown from inside the callback;
                // mark it and run the actual close now that it returned
                accepting
                    .inner
                    .transition(DialogState::CloseEventPending(accepting_id.clone()))
                    .ok();
                accepting.reject(Some(StatusCode::Decline)).ok();
                self.close_session(&session).await;
                return Ok(());
            }
        };

        match self.call_downstream(&session, forward).await {
            Ok((initiating, Some(response)))
                if response.status_code.kind() == StatusCodeKind::Successful =>
            {
                let initiating_id = initiating.id();
                *session.initiating.lock().unwrap() = Some(initiating.clone());
                self.inner
                    .sessions
                    .write()
                    .unwrap()
                    .insert(initiating_id, session.clone());

                let response = self.run_response_hook(&session, BridgeSide::Accepting, response);
                let headers = relay_response_headers(&response);
                let body = if response.body.is_empty() {
                    None
                } else {
                    Some(response.body)
                };
                accepting.accept(Some(headers), body)?;
            }
            Ok((_, Some(response))) => {
                debug!("far leg answered {}", response.status_code);
                let response = self.run_response_hook(&session, BridgeSide::Accepting, response);
                accepting.reject(Some(response.status_code)).ok();
                self.unlink_session(&session);
            }
            Ok((_, None)) => {
                accepting.reject(Some(StatusCode::RequestTimeout)).ok();
                self.unlink_session(&session);
            }
            Err(e) => {
                warn!("far leg failed: {}", e);
                accepting.reject(Some(StatusCode::ServerInternalError)).ok();
                self.unlink_session(&session);
            }
        }
        Ok(())
    }

    /// Originate the far leg, chasing 3xx Contacts up to the session's
    /// redirect bound. The To user part survives retargeting unless the
    /// Contact names its own.
    async fn call_downstream(
        &self,
        session: &Arc<BridgeSession>,
        forward: Request,
    ) -> Result<(ClientInviteDialog, Option<Response>)> {
        use rsip::prelude::ToTypedHeader;

        let caller = forward.from_header()?.typed()?.uri.clone();
        let original_callee = forward.to_header()?.typed()?.uri.clone();
        let content_type = forward.headers.iter().find_map(|h| match h {
            Header::ContentType(ct) => Some(ct.value().to_string()),
            _ => None,
        });
        let contact = session
            .initiating_contact
            .lock()
            .unwrap()
            .clone()
            .or_else(|| self.inner.contact.clone())
            .unwrap_or_else(|| caller.clone());
        let offer = if forward.body.is_empty() {
            None
        } else {
            Some(forward.body.clone())
        };

        let mut target = forward.uri.clone();
        let bound = session.max_redirects.load(Ordering::Relaxed);
        let mut redirects = 0u8;

        loop {
            let (state_sender, state_receiver) = unbounded_channel();
            self.mirror_provisionals(session.clone(), state_receiver);

            let opt = InviteOption {
                caller: caller.clone(),
                callee: target.clone(),
                content_type: content_type.clone(),
                offer: offer.clone(),
                contact: contact.clone(),
                credential: self.inner.credential.clone(),
                headers: None,
            };
            let (dialog, response) = self.inner.dialog_layer.do_invite(opt, state_sender).await?;

            let response = match response {
                Some(response) => response,
                None => return Ok((dialog, None)),
            };
            if response.status_code.kind() != StatusCodeKind::Redirection {
                return Ok((dialog, Some(response)));
            }

            redirects += 1;
            if redirects > bound {
                return Err(Error::DialogError(
                    format!("redirect bound of {} exceeded", bound),
                    dialog.id(),
                ));
            }
            let contact_header = response.contact_header().map_err(|_| {
                Error::DialogError("redirect without contact".to_string(), dialog.id())
            })?;
            let mut next = extract_uri_from_contact(contact_header.value())?;
            if next.auth.is_none() {
                next.auth = original_callee.auth.clone();
            }
            info!(
                "following {} redirect {}/{} -> {}",
                response.status_code, redirects, bound, next
            );
            target = next;
        }
    }

    /// Forward an in-session request to the peer leg and mirror the
    /// answer back.
    async fn dispatch_in_dialog(&self, mut dialog: Dialog, mut tx: Transaction) -> Result<()> {
        let id = dialog.id();
        let method = tx.original.method;

        // session renegotiation is deferred; answer in-dialog INVITEs
        // directly instead of re-entering the INVITE machinery
        if method == Method::Invite {
            return tx.reply(StatusCode::NotImplemented).await;
        }
        // the dialog machine owns its own teardown traffic
        if matches!(method, Method::Bye | Method::Cancel | Method::Ack) {
            dialog.handle(tx).await?;
            self.cascade_if_closed(&id).await;
            return Ok(());
        }

        let session = match self.find_session(&id) {
            Some(session) => session,
            None => return dialog.handle(tx).await,
        };
        let from_side = if session.accepting_id() == id || session.accepting_id() == id.swapped()
        {
            BridgeSide::Accepting
        } else {
            BridgeSide::Initiating
        };

        // CSeq discipline on the receiving leg before anything crosses
        let near = match &dialog {
            Dialog::ServerInvite(d) => d.inner.clone(),
            Dialog::ClientInvite(d) => d.inner.clone(),
        };
        let cseq = tx.original.cseq_header()?.seq()?;
        if !near.validate_remote_seq(cseq) {
            return tx.reply(StatusCode::ServerInternalError).await;
        }

        let forward = strip_dialog_scope(&tx.original)?;
        let decision = match &self.inner.hooks.request {
            Some(hook) => {
                match catch_unwind(AssertUnwindSafe(|| hook(&session, from_side, forward.clone())))
                {
                    Ok(decision) => decision,
                    Err(_) => {
                        warn!("request hook panicked");
                        return tx.reply(StatusCode::ServerInternalError).await;
                    }
                }
            }
            None => RequestDecision::Forward(forward),
        };

        let forward = match decision {
            RequestDecision::Forward(forward) => forward,
            RequestDecision::Respond(status) => return tx.reply(status).await,
            RequestDecision::Drop => {
                tx.abort();
                return Ok(());
            }
        };

        let far = {
            let initiating = session.initiating.lock().unwrap().clone();
            match from_side {
                BridgeSide::Accepting => initiating.map(Dialog::ClientInvite),
                BridgeSide::Initiating => Some(Dialog::ServerInvite(session.accepting.clone())),
            }
        };
        let far = match far {
            Some(far) => far,
            None => return tx.reply(StatusCode::NotFound).await,
        };
        let far_inner = match &far {
            Dialog::ServerInvite(d) => d.inner.clone(),
            Dialog::ClientInvite(d) => d.inner.clone(),
        };

        // re-home the request on the far leg: its own Via/identity/CSeq,
        // pass-through body and non-dialog headers
        let mut extra = Vec::new();
        for header in forward.headers.iter() {
            match header {
                Header::From(_) | Header::To(_) | Header::ContentLength(_) => {}
                other => extra.push(other.clone()),
            }
        }
        let body = if forward.body.is_empty() {
            None
        } else {
            Some(forward.body.clone())
        };
        let far_request = far_inner.make_request(method, None, None, Some(extra), body)?;
        let far_response = far_inner.do_request(far_request).await?;

        match far_response {
            Some(response) => {
                let response = self.run_response_hook(&session, from_side, response);
                let headers = relay_response_headers(&response);
                let body = if response.body.is_empty() {
                    None
                } else {
                    Some(response.body)
                };
                tx.reply_with(response.status_code, headers, body).await
            }
            None => tx.reply(StatusCode::RequestTimeout).await,
        }
    }

    fn run_response_hook(
        &self,
        session: &Arc<BridgeSession>,
        side: BridgeSide,
        response: Response,
    ) -> Response {
        match &self.inner.hooks.response {
            Some(hook) => {
                match catch_unwind(AssertUnwindSafe(|| hook(session, side, response.clone()))) {
                    Ok(rewritten) => rewritten,
                    Err(_) => {
                        warn!("response hook panicked, passing response through");
                        response
                    }
                }
            }
            None => response,
        }
    }

    /// Relay downstream call progress onto the accepting leg and fold
    /// the session when the watched leg dies.
    fn mirror_provisionals(
        &self,
        session: Arc<BridgeSession>,
        mut state_receiver: DialogStateReceiver,
    ) {
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(state) = state_receiver.recv().await {
                match state {
                    DialogState::Early(_, Some(response)) => {
                        let status = response.status_code.clone();
                        let body = if response.body.is_empty() {
                            None
                        } else {
                            Some(response.body)
                        };
                        if let Err(e) =
                            session
                                .accepting
                                .respond_provisional(status.clone(), None, body)
                        {
                            debug!("cannot mirror {}: {}", status, e);
                        }
                    }
                    DialogState::Closed(_, _) => {
                        bridge.close_session(&session).await;
                    }
                    _ => {}
                }
            }
        });
    }

    fn watch_leg(
        &self,
        session: Arc<BridgeSession>,
        mut state_receiver: DialogStateReceiver,
        side: BridgeSide,
    ) {
        let bridge = self.clone();
        tokio::spawn(async move {
            while let Some(state) = state_receiver.recv().await {
                if let DialogState::Closed(id, reason) = state {
                    debug!("{:?} leg closed: {} ({:?})", side, id, reason);
                    bridge.close_session(&session).await;
                    break;
                }
            }
        });
    }

    async fn cascade_if_closed(&self, id: &DialogId) {
        let closed = self
            .inner
            .dialog_layer
            .get_dialog(id)
            .map(|d| d.is_closed())
            .unwrap_or(true);
        if !closed {
            return;
        }
        if let Some(session) = self.find_session(id) {
            self.close_session(&session).await;
        }
    }

    /// Close both legs; the closing hook fires exactly once.
    pub async fn close_session(&self, session: &Arc<BridgeSession>) {
        if !session.begin_close() {
            return;
        }
        if let Some(hook) = &self.inner.hooks.closing {
            if catch_unwind(AssertUnwindSafe(|| hook(session))).is_err() {
                warn!("session-closing hook panicked");
            }
        }
        session.close_dialogs().await;
        self.unlink_session(session);
    }

    fn unlink_session(&self, session: &Arc<BridgeSession>) {
        let mut sessions = self.inner.sessions.write().unwrap();
        sessions.remove(&session.accepting_id());
        if let Some(id) = session.initiating_id() {
            sessions.remove(&id);
        }
    }
}
