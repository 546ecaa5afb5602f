use super::dialog::{Dialog, DialogInner, DialogStateSender};
use super::server_dialog::ServerInviteDialog;
use super::{authenticate::Credential, DialogId};
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::key::TransactionRole;
use crate::transaction::transaction::Transaction;
use crate::transaction::{generate_random_cseq, make_tag};
use crate::{Error, Result};
use rsip::prelude::HeadersExt;
use rsip::StatusCodeKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, warn};

/// Owns every dialog of an endpoint.
///
/// Confirmed dialogs are keyed by their full id; dialogs still missing a
/// tag live in the early table under their `i:`/`a:` string key until
/// the missing tag arrives (outbound) or the dialog dies. A background
/// sweep drops closed dialogs and early dialogs that outstayed their
/// deadline.
pub struct DialogLayer {
    pub endpoint: EndpointInnerRef,
    pub inner: Arc<DialogLayerInner>,
}

pub struct DialogLayerInner {
    pub(super) dialogs: RwLock<HashMap<DialogId, Dialog>>,
    pub(super) early_dialogs: RwLock<HashMap<String, Dialog>>,
    last_seq: AtomicU32,
}

impl DialogLayer {
    pub fn new(endpoint: EndpointInnerRef) -> Self {
        let inner = Arc::new(DialogLayerInner {
            dialogs: RwLock::new(HashMap::new()),
            early_dialogs: RwLock::new(HashMap::new()),
            last_seq: AtomicU32::new(generate_random_cseq()),
        });

        // adopt responses no transaction claims: a retransmitted 2xx to
        // an INVITE means our ACK was lost
        let (orphan_tx, mut orphan_rx) = unbounded_channel();
        endpoint.set_orphan_response_sender(Some(orphan_tx));
        let orphan_inner = inner.clone();
        let cancel_token = endpoint.cancel_token.child_token();
        tokio::spawn(async move {
            loop {
                let (response, _connection) = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    received = orphan_rx.recv() => match received {
                        Some(received) => received,
                        None => break,
                    },
                };
                DialogLayerInner::on_orphan_response(&orphan_inner, response);
            }
        });

        DialogLayer { endpoint, inner }
    }

    /// CSeq counter for out-of-dialog requests originated here.
    pub fn increment_last_seq(&self) -> u32 {
        self.inner.last_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.last_seq.load(Ordering::Relaxed)
    }

    /// The accepting side of dialog establishment: validate the INVITE,
    /// choose our tag, record the peer's identity, target and route set,
    /// and park the dialog in both tables (its full id is already
    /// computable since we picked our own tag).
    pub fn get_or_create_server_invite(
        &self,
        tx: &Transaction,
        state_sender: DialogStateSender,
        credential: Option<Credential>,
        local_contact: Option<rsip::Uri>,
    ) -> Result<ServerInviteDialog> {
        let request = &tx.original;
        let mut id = DialogId::try_from(request)?;
        if !id.to_tag.is_empty() {
            return Err(Error::DialogError(
                "dialog-creating invite already carries a remote tag".to_string(),
                id,
            ));
        }
        if id.from_tag.is_empty() {
            return Err(Error::DialogError("invite without from tag".to_string(), id));
        }
        request.contact_header()?;
        request.cseq_header()?;

        if let Some(Dialog::ServerInvite(existing)) = self
            .inner
            .early_dialogs
            .read()
            .unwrap()
            .get(&id.early_accepting_key())
        {
            return Ok(existing.clone());
        }

        id.to_tag = make_tag();
        let inner = DialogInner::new(
            TransactionRole::Server,
            id.clone(),
            request.clone(),
            self.endpoint.clone(),
            state_sender,
            credential,
            local_contact,
        )?;
        let dialog = ServerInviteDialog {
            inner: Arc::new(inner),
        };
        // answers are commanded through the INVITE transaction; attach
        // its channel before anyone can race an accept() against the
        // driver task
        *dialog.inner.tu_sender.lock().unwrap() = Some(tx.tu_sender.clone());

        self.inner
            .dialogs
            .write()
            .unwrap()
            .insert(id.clone(), Dialog::ServerInvite(dialog.clone()));
        self.inner
            .early_dialogs
            .write()
            .unwrap()
            .insert(id.early_accepting_key(), Dialog::ServerInvite(dialog.clone()));
        info!("server dialog created: {}", id);
        Ok(dialog)
    }

    /// Find the dialog a received request belongs to: full id first (in
    /// both orientations), then the accepting early key for tagless
    /// requests such as CANCEL.
    pub fn match_dialog(&self, request: &rsip::Request) -> Option<Dialog> {
        let id = DialogId::try_from(request).ok()?;
        if id.is_complete() {
            return self.get_dialog(&id);
        }
        self.inner
            .early_dialogs
            .read()
            .unwrap()
            .get(&id.early_accepting_key())
            .cloned()
    }

    /// Fetch a dialog still parked in the early table by its prefixed
    /// key.
    pub fn get_early_dialog(&self, early_key: &str) -> Option<Dialog> {
        self.inner
            .early_dialogs
            .read()
            .unwrap()
            .get(early_key)
            .cloned()
    }

    pub fn get_dialog(&self, id: &DialogId) -> Option<Dialog> {
        let dialogs = self.inner.dialogs.read().unwrap();
        dialogs
            .get(id)
            .or_else(|| dialogs.get(&id.swapped()))
            .cloned()
    }

    /// Promote an outbound dialog out of the early table once its remote
    /// tag is known.
    pub(super) fn confirm_client_dialog(
        &self,
        early_key: &str,
        id: DialogId,
        dialog: Dialog,
    ) {
        self.inner.early_dialogs.write().unwrap().remove(early_key);
        debug!("dialog confirmed: {} (was {})", id, early_key);
        self.inner.dialogs.write().unwrap().insert(id, dialog);
    }

    pub fn remove_dialog(&self, id: &DialogId) {
        let removed = {
            let mut dialogs = self.inner.dialogs.write().unwrap();
            dialogs.remove(id).or_else(|| dialogs.remove(&id.swapped()))
        };
        let mut early = self.inner.early_dialogs.write().unwrap();
        early.remove(&id.early_initiating_key());
        early.remove(&id.early_accepting_key());
        drop(early);
        if let Some(dialog) = removed {
            debug!("dialog removed: {}", id);
            dialog.on_remove();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.dialogs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Background sweep: drop closed dialogs, hang up early dialogs past
    /// their deadline. Run alongside the endpoint's serve loop.
    pub async fn serve(&self) -> Result<()> {
        let cancel_token = self.endpoint.cancel_token.child_token();
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => return Ok(()),
                _ = tick.tick() => self.prune().await,
            }
        }
    }

    pub async fn prune(&self) {
        let now = Instant::now();

        let closed: Vec<DialogId> = self
            .inner
            .dialogs
            .read()
            .unwrap()
            .iter()
            .filter(|(_, d)| d.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        for id in closed {
            self.remove_dialog(&id);
        }

        let expired: Vec<Dialog> = self
            .inner
            .early_dialogs
            .read()
            .unwrap()
            .values()
            .filter(|d| !d.is_closed() && d.early_deadline() <= now)
            .cloned()
            .collect();
        for dialog in expired {
            let id = dialog.id();
            warn!("early dialog expired: {}", id);
            dialog.hangup().await.ok();
            self.remove_dialog(&id);
        }
    }
}

impl DialogLayerInner {
    fn on_orphan_response(inner: &Arc<DialogLayerInner>, response: rsip::Response) {
        let is_invite_2xx = response.status_code.kind() == StatusCodeKind::Successful
            && response
                .cseq_header()
                .ok()
                .and_then(|c| c.method().ok())
                .map(|m| m == rsip::Method::Invite)
                .unwrap_or(false);
        if !is_invite_2xx {
            return;
        }
        let id = match DialogId::try_from(&response) {
            Ok(id) => id,
            Err(_) => return,
        };
        let dialogs = inner.dialogs.read().unwrap();
        let dialog = dialogs
            .get(&id)
            .or_else(|| dialogs.get(&id.swapped()))
            .cloned();
        drop(dialogs);
        if let Some(Dialog::ClientInvite(dialog)) = dialog {
            debug!("2xx retransmit for {}, repeating ack", id);
            tokio::spawn(async move {
                if let Err(e) = dialog.send_ack_again().await {
                    warn!("failed to repeat ack: {}", e);
                }
            });
        }
    }
}
