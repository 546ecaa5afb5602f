use super::dialog::{CloseReason, DialogInnerRef, DialogState};
use super::DialogId;
use crate::transaction::transaction::Transaction;
use crate::transaction::TransactionEvent;
use crate::{Error, Result};
use rsip::{Header, Method, Request, SipMessage, StatusCode, StatusCodeKind};
use tracing::{debug, info, warn};

/// The accepting half of an INVITE dialog. Provisionals and finals are
/// commanded through the adopted INVITE transaction; the dialog confirms
/// on the peer's ACK and tears down with 410, 487 or BYE depending on
/// how far it got.
#[derive(Clone)]
pub struct ServerInviteDialog {
    pub inner: DialogInnerRef,
}

impl ServerInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id.lock().unwrap().clone()
    }

    fn command_respond(&self, response: rsip::Response) -> Result<()> {
        let sender = self
            .inner
            .tu_sender
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| {
                Error::DialogError("invite transaction not attached".to_string(), self.id())
            })?;
        sender
            .send(TransactionEvent::Respond(response))
            .map_err(|e| Error::DialogError(e.to_string(), self.id()))
    }

    /// Send a provisional on the pending INVITE.
    pub fn respond_provisional(
        &self,
        status: StatusCode,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        if status.kind() != StatusCodeKind::Provisional {
            return Err(Error::DialogError(
                format!("{} is not provisional", status),
                self.id(),
            ));
        }
        let response = self
            .inner
            .make_response(&self.inner.initial_request, status, headers, body);
        self.inner
            .transition(DialogState::Early(self.id(), Some(response.clone())))?;
        self.command_respond(response)
    }

    pub fn ringing(&self, body: Option<Vec<u8>>) -> Result<()> {
        self.respond_provisional(StatusCode::Ringing, None, body)
    }

    /// Answer the INVITE with 2xx. The dialog confirms only once the
    /// peer's ACK arrives.
    pub fn accept(&self, headers: Option<Vec<Header>>, body: Option<Vec<u8>>) -> Result<()> {
        let response =
            self.inner
                .make_response(&self.inner.initial_request, StatusCode::OK, headers, body);
        *self.inner.final_response.lock().unwrap() = Some(response.clone());
        self.command_respond(response)
    }

    /// Decline the INVITE with a non-2xx final.
    pub fn reject(&self, status: Option<StatusCode>) -> Result<()> {
        let status = status.unwrap_or(StatusCode::BusyHere);
        if matches!(
            status.kind(),
            StatusCodeKind::Provisional | StatusCodeKind::Successful
        ) {
            return Err(Error::DialogError(
                format!("{} cannot reject a dialog", status),
                self.id(),
            ));
        }
        let response =
            self.inner
                .make_response(&self.inner.initial_request, status.clone(), None, None);
        *self.inner.final_response.lock().unwrap() = Some(response.clone());
        self.command_respond(response)?;
        self.inner.transition(DialogState::Closed(
            self.id(),
            CloseReason::Rejected(Some(status)),
        ))
    }

    /// Drive a transaction belonging to this dialog: the INVITE itself,
    /// the confirming ACK, a CANCEL, a BYE, or any other in-dialog
    /// request.
    pub async fn handle(&mut self, mut tx: Transaction) -> Result<()> {
        match tx.original.method {
            // renegotiation is deferred; a re-INVITE goes to the hook or
            // gets the 501 default
            Method::Invite if self.inner.is_confirmed() => {
                self.inner.handle_in_dialog_request(tx).await
            }
            Method::Invite => {
                *self.inner.tu_sender.lock().unwrap() = Some(tx.tu_sender.clone());
                while let Some(msg) = tx.receive().await {
                    match msg {
                        SipMessage::Request(_request) if _request.method == Method::Ack => {
                            // transaction-level ACK: completes a non-2xx
                            // final, nothing to confirm
                            debug!("invite transaction acknowledged: {}", self.id());
                        }
                        SipMessage::Response(response)
                            if response.status_code == StatusCode::RequestTimeout =>
                        {
                            info!("ack never arrived: {}", self.id());
                            self.inner.transition(DialogState::Closed(
                                self.id(),
                                CloseReason::Timeout,
                            ))?;
                        }
                        _ => {}
                    }
                }
                *self.inner.tu_sender.lock().unwrap() = None;
                Ok(())
            }
            Method::Ack => {
                self.confirm_with_ack(tx.original.clone());
                Ok(())
            }
            Method::Cancel => {
                tx.reply(StatusCode::OK).await?;
                let terminated = self.inner.make_response(
                    &self.inner.initial_request,
                    StatusCode::RequestTerminated,
                    None,
                    None,
                );
                if let Err(e) = self.command_respond(terminated) {
                    warn!("cancel raced the invite transaction: {}", e);
                }
                self.inner.transition(DialogState::Closed(
                    self.id(),
                    CloseReason::PeerCancel,
                ))
            }
            _ => self.inner.handle_in_dialog_request(tx).await,
        }
    }

    /// A dialog-level ACK: the peer acknowledged our 2xx.
    fn confirm_with_ack(&self, ack: Request) {
        *self.inner.last_ack.lock().unwrap() = Some(ack);
        let state = self.inner.state.lock().unwrap().clone();
        match state {
            DialogState::ClosePendingAck(id) => {
                // close already ran its BYE; the straggler just settles
                // things
                self.inner
                    .transition(DialogState::Closed(id, CloseReason::LocalBye))
                    .ok();
            }
            _ => {
                self.inner
                    .transition(DialogState::Confirmed(self.id()))
                    .ok();
            }
        }
    }

    /// Send BYE on a confirmed dialog and close it.
    pub async fn bye(&self) -> Result<()> {
        if !self.inner.is_confirmed() {
            return Err(Error::DialogError(
                "bye before confirmation".to_string(),
                self.id(),
            ));
        }
        let request = self
            .inner
            .make_request(Method::Bye, None, None, None, None)?;
        self.inner.do_request(request).await?;
        self.inner
            .transition(DialogState::Closed(self.id(), CloseReason::LocalBye))?;
        Ok(())
    }

    /// Tear down according to state: 410 Gone while no final went out,
    /// BYE-and-wait-for-the-ACK when the 2xx is in flight, plain BYE once
    /// confirmed. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let state = self.inner.state.lock().unwrap().clone();
        match state {
            DialogState::Confirmed(_) => self.bye().await,
            DialogState::Waiting(id) | DialogState::Early(id, _) => {
                let final_sent = self.inner.final_response.lock().unwrap().is_some();
                if !final_sent {
                    self.reject(Some(StatusCode::Gone))?;
                    self.inner
                        .transition(DialogState::Closed(id, CloseReason::Gone))
                } else {
                    // answered but not yet acknowledged; say goodbye and
                    // keep a slot open for the straggling ACK
                    let request =
                        self.inner
                            .make_request(Method::Bye, None, None, None, None)?;
                    self.inner.do_request(request).await.ok();
                    self.inner.transition(DialogState::ClosePendingAck(id))
                }
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for ServerInviteDialog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServerInviteDialog({})", self.id())
    }
}
