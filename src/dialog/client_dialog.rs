use super::dialog::{CloseReason, DialogInnerRef, DialogState};
use super::DialogId;
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::{Header, Method, Response, SipMessage, StatusCode, StatusCodeKind};
use tracing::{debug, info, warn};

/// The initiating half of an INVITE dialog: owns the outbound INVITE
/// transaction from first send to final answer, acknowledges the 2xx at
/// dialog level, and tears the dialog down with CANCEL or BYE depending
/// on how far establishment got.
#[derive(Clone)]
pub struct ClientInviteDialog {
    pub inner: DialogInnerRef,
}

impl ClientInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id.lock().unwrap().clone()
    }

    /// Drive the INVITE transaction to its conclusion and return the
    /// settled dialog id with the final response. Blocks until the
    /// dialog is confirmed or abandoned, never while it is still early.
    pub async fn process_invite(
        &self,
        mut tx: Transaction,
    ) -> Result<(DialogId, Option<Response>)> {
        tx.send().await?;
        let mut www_answered = false;
        let mut proxy_answered = false;

        while let Some(msg) = tx.receive().await {
            let resp = match msg {
                SipMessage::Response(resp) => resp,
                _ => continue,
            };

            if resp.status_code.kind() == StatusCodeKind::Provisional {
                if resp.status_code == StatusCode::Trying {
                    continue;
                }
                if let Some(tag) = resp
                    .to_header()
                    .ok()
                    .and_then(|to| to.tag().ok())
                    .flatten()
                {
                    self.inner.update_remote_tag(&tag.to_string())?;
                }
                let id = self.id();
                let close_was_requested = matches!(
                    *self.inner.state.lock().unwrap(),
                    DialogState::ClosePendingProvisional(_)
                );
                if close_was_requested {
                    // there finally is a transaction to chase
                    self.send_cancel().await.ok();
                    self.inner
                        .transition(DialogState::ClosePendingFinal(id))?;
                } else {
                    self.inner
                        .transition(DialogState::Early(id, Some(resp)))?;
                }
                continue;
            }

            match resp.status_code {
                StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                    let answered = match resp.status_code {
                        StatusCode::Unauthorized => &mut www_answered,
                        _ => &mut proxy_answered,
                    };
                    let credential = match &self.inner.credential {
                        Some(credential) if !*answered => credential.clone(),
                        _ => {
                            let id = self.id();
                            info!("invite rejected: {} without usable credential", resp.status_code);
                            self.inner.transition(DialogState::Closed(
                                id.clone(),
                                CloseReason::AuthRequired,
                            ))?;
                            return Ok((id, Some(resp)));
                        }
                    };
                    *answered = true;
                    let new_seq = self.inner.increment_local_seq();
                    let (new_tx, header) = super::authenticate::handle_client_authenticate(
                        new_seq,
                        tx,
                        resp,
                        &credential,
                    )
                    .await?;
                    self.inner.cache_auth_header(header);
                    // the ACK must mirror the CSeq of the INVITE that won
                    self.inner
                        .invite_seq
                        .store(new_seq, std::sync::atomic::Ordering::Relaxed);
                    tx = new_tx;
                    tx.send().await?;
                }
                _ if resp.status_code.kind() == StatusCodeKind::Successful => {
                    if let Some(tag) = resp
                        .to_header()
                        .ok()
                        .and_then(|to| to.tag().ok())
                        .flatten()
                    {
                        self.inner.update_remote_tag(&tag.to_string())?;
                    }
                    self.learn_remote_target(&resp);
                    *self.inner.final_response.lock().unwrap() = Some(resp.clone());

                    let ack = self.inner.make_ack()?;
                    if let Err(e) = tx.send_ack(ack.clone()).await {
                        warn!("failed to send ack: {}", e);
                    }
                    *self.inner.last_ack.lock().unwrap() = Some(ack);

                    let id = self.id();
                    let close_was_requested = matches!(
                        *self.inner.state.lock().unwrap(),
                        DialogState::ClosePendingProvisional(_)
                            | DialogState::ClosePendingFinal(_)
                            | DialogState::CloseEventPending(_)
                    );
                    if close_was_requested {
                        // the answer raced our teardown; settle, then BYE
                        debug!("2xx raced teardown on {}, sending BYE", id);
                        let bye = self.inner.make_request(Method::Bye, None, None, None, None)?;
                        self.inner.do_request(bye).await.ok();
                        self.inner
                            .transition(DialogState::Closed(id.clone(), CloseReason::LocalBye))?;
                    } else {
                        self.inner.transition(DialogState::Confirmed(id.clone()))?;
                    }
                    return Ok((id, Some(resp)));
                }
                _ => {
                    let id = self.id();
                    let close_was_requested = matches!(
                        *self.inner.state.lock().unwrap(),
                        DialogState::ClosePendingProvisional(_)
                            | DialogState::ClosePendingFinal(_)
                    );
                    let reason = if close_was_requested
                        || resp.status_code == StatusCode::RequestTerminated
                    {
                        CloseReason::LocalCancel
                    } else if resp.status_code == StatusCode::RequestTimeout {
                        CloseReason::Timeout
                    } else {
                        CloseReason::Rejected(Some(resp.status_code.clone()))
                    };
                    self.inner
                        .transition(DialogState::Closed(id.clone(), reason))?;
                    return Ok((id, Some(resp)));
                }
            }
        }

        let id = self.id();
        self.inner
            .transition(DialogState::Closed(id.clone(), CloseReason::Timeout))?;
        Ok((id, None))
    }

    /// In-dialog requests from the peer land here via the dialog layer.
    pub async fn handle(&mut self, tx: Transaction) -> Result<()> {
        match tx.original.method {
            // this side sent the INVITE; an ACK or CANCEL pointed at us
            // is a protocol slip by the peer
            Method::Ack | Method::Cancel => Ok(()),
            _ => self.inner.handle_in_dialog_request(tx).await,
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

    /// CANCEL the pending INVITE: same request-URI, Call-ID, From, To,
    /// CSeq number and top Via (branch included) as the INVITE.
    pub async fn send_cancel(&self) -> Result<()> {
        let original = &self.inner.initial_request;
        let cseq = original.cseq_header()?.seq()?;
        let mut headers: Vec<Header> = vec![
            Header::Via(original.via_header()?.clone()),
            Header::CallId(original.call_id_header()?.clone()),
            Header::From(original.from_header()?.clone()),
            Header::To(original.to_header()?.clone()),
            Header::CSeq(
                rsip::typed::CSeq {
                    seq: cseq,
                    method: Method::Cancel,
                }
                .into(),
            ),
            Header::MaxForwards(70.into()),
        ];
        for header in original.headers.iter() {
            if let Header::Route(route) = header {
                headers.push(Header::Route(route.clone()));
            }
        }
        let cancel = rsip::Request {
            method: Method::Cancel,
            uri: original.uri.clone(),
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        };

        let key = TransactionKey::from_request(&cancel, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, cancel, self.inner.endpoint_inner.clone(), None);
        tx.send().await?;
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                if resp.status_code.kind() != StatusCodeKind::Provisional {
                    debug!("cancel answered {}", resp.status_code);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Tear down according to how far establishment got: BYE once
    /// confirmed, CANCEL while early, deferred CANCEL while nothing has
    /// been heard yet. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let state = self.inner.state.lock().unwrap().clone();
        match state {
            DialogState::Confirmed(_) => self.bye().await,
            DialogState::Early(id, _) => {
                self.send_cancel().await?;
                self.inner.transition(DialogState::ClosePendingFinal(id))
            }
            DialogState::Waiting(id) => self
                .inner
                .transition(DialogState::ClosePendingProvisional(id)),
            _ => Ok(()),
        }
    }

    /// The peer retransmitted its 2xx, meaning our ACK was lost; repeat
    /// it outside any transaction.
    pub async fn send_ack_again(&self) -> Result<()> {
        let ack = self
            .inner
            .last_ack
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::DialogError("no ack recorded".to_string(), self.id()))?;
        let endpoint = &self.inner.endpoint_inner;
        let (connection, destination) = endpoint
            .transport_layer
            .lookup(&ack.uri, endpoint.transport_tx.clone())
            .await?;
        debug!("re-acknowledging {} -> {}", self.id(), destination);
        connection.send(ack.into(), Some(&destination)).await
    }

    fn learn_remote_target(&self, resp: &Response) {
        if let Ok(contact) = resp.contact_header() {
            if let Ok(uri) = crate::rsip_ext::extract_uri_from_contact(contact.value()) {
                *self.inner.remote_uri.lock().unwrap() = uri;
            }
        }
        // the initiating side's route set is the 2xx Record-Route,
        // reversed
        let mut route_set: Vec<rsip::headers::Route> = resp
            .headers
            .iter()
            .filter_map(|h| match h {
                Header::RecordRoute(rr) => Some(rsip::headers::Route::from(rr.value())),
                _ => None,
            })
            .collect();
        route_set.reverse();
        if !route_set.is_empty() {
            *self.inner.route_set.lock().unwrap() = route_set;
        }
    }
}

impl std::fmt::Debug for ClientInviteDialog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientInviteDialog({})", self.id())
    }
}
