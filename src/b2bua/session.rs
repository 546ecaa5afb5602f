use crate::dialog::client_dialog::ClientInviteDialog;
use crate::dialog::server_dialog::ServerInviteDialog;
use crate::dialog::DialogId;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeSide {
    /// The leg that received the INVITE.
    Accepting,
    /// The leg this bridge originated.
    Initiating,
}

impl BridgeSide {
    pub fn other(&self) -> BridgeSide {
        match self {
            BridgeSide::Accepting => BridgeSide::Initiating,
            BridgeSide::Initiating => BridgeSide::Accepting,
        }
    }
}

/// One bridged call: the accepting dialog, the initiating dialog once it
/// exists, per-side contact overrides, and an opaque slot for whatever
/// the application wants to pin to the call.
pub struct BridgeSession {
    pub id: String,
    pub accepting: ServerInviteDialog,
    pub initiating: Mutex<Option<ClientInviteDialog>>,
    pub accepting_contact: Mutex<Option<rsip::Uri>>,
    pub initiating_contact: Mutex<Option<rsip::Uri>>,
    pub max_redirects: AtomicU8,
    pub application_state: Mutex<Option<Box<dyn Any + Send>>>,
    closing: AtomicBool,
}

impl BridgeSession {
    pub(crate) fn new(id: String, accepting: ServerInviteDialog, max_redirects: u8) -> Self {
        BridgeSession {
            id,
            accepting,
            initiating: Mutex::new(None),
            accepting_contact: Mutex::new(None),
            initiating_contact: Mutex::new(None),
            max_redirects: AtomicU8::new(max_redirects),
            application_state: Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }

    pub fn set_max_redirects(&self, bound: u8) {
        self.max_redirects.store(bound, Ordering::Relaxed);
    }

    pub fn set_contact(&self, side: BridgeSide, contact: rsip::Uri) {
        match side {
            BridgeSide::Accepting => *self.accepting_contact.lock().unwrap() = Some(contact),
            BridgeSide::Initiating => *self.initiating_contact.lock().unwrap() = Some(contact),
        }
    }

    pub fn set_application_state(&self, state: Box<dyn Any + Send>) {
        *self.application_state.lock().unwrap() = Some(state);
    }

    pub fn accepting_id(&self) -> DialogId {
        self.accepting.id()
    }

    pub fn initiating_id(&self) -> Option<DialogId> {
        self.initiating.lock().unwrap().as_ref().map(|d| d.id())
    }

    /// First closer wins; everybody else sees `false`.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Tear both legs down. Called through the bridge so the closing
    /// hook fires exactly once beforehand.
    pub(crate) async fn close_dialogs(&self) {
        info!("closing session {}", self.id);
        let initiating = self.initiating.lock().unwrap().clone();
        if let Some(initiating) = initiating {
            initiating.close().await.ok();
        }
        self.accepting.close().await.ok();
    }
}
