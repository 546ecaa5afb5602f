use super::endpoint::EndpointInnerRef;
use super::key::{TransactionKey, TransactionRole};
use super::{
    TransactionEvent, TransactionEventReceiver, TransactionEventSender, TransactionState,
    TransactionTimer, TransactionType,
};
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Method, SipMessage, StatusCode, StatusCodeKind};
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, trace, warn};

/// One RFC 3261 transaction: the original request, its retransmits, its
/// responses, and (for an INVITE server) the terminating ACK.
///
/// The owning task drives the machine by awaiting [`Transaction::receive`];
/// everything the transaction user should see (provisionals, finals, the
/// ACK) is returned from there, while retransmits and absorbed duplicates
/// are handled internally.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: rsip::Request,
    pub state: TransactionState,
    pub endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    /// Resolved remote binding; requests without one resolve through the
    /// transport layer on first send.
    pub destination: Option<SipAddr>,
    pub last_response: Option<rsip::Response>,
    pub last_ack: Option<rsip::Request>,
    pub tu_receiver: TransactionEventReceiver,
    pub tu_sender: TransactionEventSender,

    /// Synthesized failure waiting to be handed to the transaction user.
    pending_failure: Option<rsip::Response>,
    timer_retransmit: Option<u64>,
    timer_timeout: Option<u64>,
    timer_linger: Option<u64>,
    timer_cleanup: Option<u64>,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: rsip::Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        endpoint_inner.attach_transaction(&key, tu_sender.clone());
        trace!("transaction created: {} {:?}", key, transaction_type);
        Transaction {
            transaction_type,
            key,
            original,
            state: TransactionState::Unknown,
            endpoint_inner,
            connection,
            destination: None,
            last_response: None,
            last_ack: None,
            tu_receiver,
            tu_sender,
            pending_failure: None,
            timer_retransmit: None,
            timer_timeout: None,
            timer_linger: None,
            timer_cleanup: None,
        }
    }

    pub fn new_client(
        key: TransactionKey,
        original: rsip::Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let transaction_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Self::new(transaction_type, key, original, endpoint_inner, connection)
    }

    pub fn new_server(
        key: TransactionKey,
        original: rsip::Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let transaction_type = match original.method {
            Method::Invite | Method::Ack => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        let mut tx = Self::new(transaction_type, key, original, endpoint_inner, connection);
        if tx.original.method == Method::Ack {
            // an ACK for a 2xx matches no transaction; this shell only
            // carries it to the dialog layer
            tx.state = TransactionState::InviteConfirmed;
        } else {
            if transaction_type == TransactionType::ServerNonInvite {
                tx.state = TransactionState::Trying;
            }
            // time-to-die backstop: a server transaction the TU never
            // answers must not outlive the longest plausible ringing
            tx.timer_cleanup = Some(tx.arm_at(
                Duration::from_secs(300),
                TransactionTimer::TimerCleanup(tx.key.clone()),
            ));
        }
        tx
    }

    fn is_streaming(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_streaming())
            .unwrap_or(false)
    }

    fn option(&self) -> super::endpoint::EndpointOption {
        self.endpoint_inner.option.clone()
    }

    /// Send the original request (client transactions only) and arm the
    /// retransmission and timeout timers.
    pub async fn send(&mut self) -> Result<()> {
        match self.transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => {}
            _ => {
                return Err(Error::TransactionError(
                    "send only starts client transactions".to_string(),
                    self.key.clone(),
                ))
            }
        }

        if self.connection.is_none() || self.destination.is_none() {
            let lookup = match self.destination.clone() {
                Some(target) => {
                    self.endpoint_inner
                        .transport_layer
                        .lookup_target(target, self.endpoint_inner.transport_tx.clone())
                        .await
                }
                None => {
                    self.endpoint_inner
                        .transport_layer
                        .lookup(&self.original.uri, self.endpoint_inner.transport_tx.clone())
                        .await
                }
            };
            match lookup {
                Ok((connection, destination)) => {
                    self.connection.get_or_insert(connection);
                    self.destination = Some(destination);
                }
                Err(e) => {
                    warn!("{} no transport for request: {}", self.key, e);
                    self.fail(StatusCode::ServiceUnavailable);
                    return Ok(());
                }
            }
        }

        let connection = self.connection.clone().expect("connection resolved above");
        match connection
            .send(self.original.clone().into(), self.destination.as_ref())
            .await
        {
            Ok(()) => {}
            Err(e) => {
                warn!("{} send failed: {}", self.key, e);
                self.fail(StatusCode::ServiceUnavailable);
                return Ok(());
            }
        }

        let option = self.option();
        match self.transaction_type {
            TransactionType::ClientInvite => {
                self.transition(TransactionState::InviteCalling);
                if !self.is_streaming() {
                    self.timer_retransmit = Some(self.arm(TransactionTimer::TimerA(
                        self.key.clone(),
                        option.t1,
                    )));
                }
                self.timer_timeout =
                    Some(self.arm_at(option.t1x64, TransactionTimer::TimerB(self.key.clone())));
            }
            TransactionType::ClientNonInvite => {
                self.transition(TransactionState::Trying);
                if !self.is_streaming() {
                    self.timer_retransmit = Some(self.arm(TransactionTimer::TimerE(
                        self.key.clone(),
                        option.t1,
                    )));
                }
                self.timer_timeout =
                    Some(self.arm_at(option.t1x64, TransactionTimer::TimerF(self.key.clone())));
            }
            _ => unreachable!(),
        }
        self.timer_cleanup = Some(self.arm_at(
            option.t1x64 * 2,
            TransactionTimer::TimerCleanup(self.key.clone()),
        ));
        Ok(())
    }

    /// Emit `100 Trying` on a freshly created INVITE server transaction.
    pub async fn send_trying(&mut self) -> Result<()> {
        self.reply(StatusCode::Trying).await
    }

    pub async fn reply(&mut self, status: StatusCode) -> Result<()> {
        self.reply_with(status, vec![], None).await
    }

    pub async fn reply_with(
        &mut self,
        status: StatusCode,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut response = self
            .endpoint_inner
            .make_response(&self.original, status, body);
        for header in headers {
            response.headers.unique_push(header);
        }
        self.respond(response).await
    }

    /// Send a response on a server transaction, driving its machine.
    pub async fn respond(&mut self, response: rsip::Response) -> Result<()> {
        match self.transaction_type {
            TransactionType::ServerInvite | TransactionType::ServerNonInvite => {}
            _ => {
                return Err(Error::TransactionError(
                    "respond only applies to server transactions".to_string(),
                    self.key.clone(),
                ))
            }
        }
        if self.original.method == Method::Ack {
            return Err(Error::TransactionError(
                "an ACK is never answered".to_string(),
                self.key.clone(),
            ));
        }
        if matches!(
            self.state,
            TransactionState::Terminated
                | TransactionState::InviteConfirmed
                | TransactionState::Completed
                | TransactionState::InviteCompleted
        ) {
            return Err(Error::TransactionError(
                format!("cannot respond while {:?}", self.state),
                self.key.clone(),
            ));
        }

        self.send_response(response.clone()).await?;
        self.last_response = Some(response.clone());

        let option = self.option();
        match response.status_code.kind() {
            StatusCodeKind::Provisional => match self.transaction_type {
                TransactionType::ServerInvite => {
                    self.transition(TransactionState::InviteProceeding);
                }
                _ => self.transition(TransactionState::Proceeding),
            },
            StatusCodeKind::Successful => match self.transaction_type {
                TransactionType::ServerInvite => {
                    // the dialog takes over; the ACK will not come back
                    // through this machine
                    self.transition(TransactionState::Terminated);
                }
                _ => {
                    self.transition(TransactionState::Completed);
                    let linger = if self.is_streaming() {
                        Duration::ZERO
                    } else {
                        option.t1x64
                    };
                    self.timer_linger =
                        Some(self.arm_at(linger, TransactionTimer::TimerJ(self.key.clone())));
                }
            },
            _ => match self.transaction_type {
                TransactionType::ServerInvite => {
                    self.transition(TransactionState::InviteCompleted);
                    if !self.is_streaming() {
                        self.timer_retransmit = Some(self.arm(TransactionTimer::TimerG(
                            self.key.clone(),
                            option.t1,
                        )));
                    }
                    self.timer_timeout =
                        Some(self.arm_at(option.t1x64, TransactionTimer::TimerH(self.key.clone())));
                }
                _ => {
                    self.transition(TransactionState::Completed);
                    let linger = if self.is_streaming() {
                        Duration::ZERO
                    } else {
                        option.t1x64
                    };
                    self.timer_linger =
                        Some(self.arm_at(linger, TransactionTimer::TimerJ(self.key.clone())));
                }
            },
        }
        Ok(())
    }

    /// Stop answering without sending anything; remaining retransmits are
    /// absorbed until the machine ages out.
    pub fn abort(&mut self) {
        match self.transaction_type {
            TransactionType::ServerInvite => self.transition(TransactionState::InviteCompleted),
            TransactionType::ServerNonInvite => self.transition(TransactionState::Completed),
            _ => {}
        }
        let option = self.option();
        self.timer_linger = Some(self.arm_at(
            option.t1x64,
            TransactionTimer::TimerCleanup(self.key.clone()),
        ));
    }

    /// Send the ACK for a 2xx final. This is a dialog-level message that
    /// merely reuses the transaction's transport.
    pub async fn send_ack(&mut self, ack: rsip::Request) -> Result<()> {
        if ack.method != Method::Ack {
            return Err(Error::TransactionError(
                format!("send_ack got {}", ack.method),
                self.key.clone(),
            ));
        }
        let connection = self.connection.as_ref().ok_or_else(|| {
            Error::TransactionError("no transport to ack on".to_string(), self.key.clone())
        })?;
        connection
            .send(ack.clone().into(), self.destination.as_ref())
            .await?;
        self.last_ack = Some(ack);
        Ok(())
    }

    /// Await the next message the transaction user should handle. `None`
    /// once the transaction reaches `Terminated`.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        if let Some(failure) = self.pending_failure.take() {
            self.last_response = Some(failure.clone());
            self.transition(TransactionState::Terminated);
            return Some(failure.into());
        }
        if self.state == TransactionState::Terminated {
            return None;
        }
        while let Some(event) = self.tu_receiver.recv().await {
            let deliver = match event {
                TransactionEvent::Received(msg, connection) => {
                    self.process_received(msg, connection).await
                }
                TransactionEvent::Timer(timer) => self.process_timer(timer).await,
                TransactionEvent::Respond(response) => {
                    if let Err(e) = self.respond(response).await {
                        debug!("{} commanded respond failed: {}", self.key, e);
                    }
                    None
                }
                TransactionEvent::Terminate => {
                    self.transition(TransactionState::Terminated);
                    return None;
                }
            };
            if let Some(msg) = deliver {
                return Some(msg);
            }
            if self.state == TransactionState::Terminated {
                return None;
            }
        }
        None
    }

    async fn process_received(
        &mut self,
        msg: SipMessage,
        connection: Option<SipConnection>,
    ) -> Option<SipMessage> {
        if let Some(connection) = connection {
            self.connection.get_or_insert(connection);
        }
        match msg {
            SipMessage::Response(response) => self.process_response(response).await,
            SipMessage::Request(request) => self.process_request(request).await,
        }
    }

    async fn process_response(&mut self, response: rsip::Response) -> Option<SipMessage> {
        // the key already matched; drop responses whose CSeq disagrees
        // with the request we actually sent
        let cseq_ok = response
            .cseq_header()
            .ok()
            .and_then(|c| c.seq().ok())
            .map(|seq| Some(seq) == self.original.cseq_header().ok().and_then(|c| c.seq().ok()))
            .unwrap_or(false);
        if !cseq_ok {
            debug!("{} ignoring response with foreign cseq", self.key);
            return None;
        }

        let kind = response.status_code.kind();
        match self.transaction_type {
            TransactionType::ClientInvite => match self.state {
                TransactionState::InviteCalling | TransactionState::InviteProceeding => match kind {
                    StatusCodeKind::Provisional => {
                        self.cancel_retransmit();
                        self.transition(TransactionState::InviteProceeding);
                        self.last_response = Some(response.clone());
                        Some(response.into())
                    }
                    StatusCodeKind::Successful => {
                        self.last_response = Some(response.clone());
                        // the user agent, not this machine, acknowledges
                        self.transition(TransactionState::Terminated);
                        Some(response.into())
                    }
                    _ => {
                        self.last_response = Some(response.clone());
                        self.acknowledge_final(&response).await;
                        self.transition(TransactionState::InviteCompleted);
                        let linger = if self.is_streaming() {
                            Duration::ZERO
                        } else {
                            Duration::from_secs(32)
                        };
                        self.timer_linger =
                            Some(self.arm_at(linger, TransactionTimer::TimerD(self.key.clone())));
                        Some(response.into())
                    }
                },
                TransactionState::InviteCompleted => {
                    // final retransmit: answer with the same ACK, absorb
                    if let Some(ack) = self.last_ack.clone() {
                        self.resend(ack.into()).await;
                    }
                    None
                }
                _ => None,
            },
            TransactionType::ClientNonInvite => match self.state {
                TransactionState::Trying | TransactionState::Proceeding => match kind {
                    StatusCodeKind::Provisional => {
                        self.transition(TransactionState::Proceeding);
                        self.last_response = Some(response.clone());
                        Some(response.into())
                    }
                    _ => {
                        self.last_response = Some(response.clone());
                        self.transition(TransactionState::Completed);
                        let linger = if self.is_streaming() {
                            Duration::ZERO
                        } else {
                            self.option().t4
                        };
                        self.timer_linger =
                            Some(self.arm_at(linger, TransactionTimer::TimerK(self.key.clone())));
                        Some(response.into())
                    }
                },
                _ => None,
            },
            _ => {
                debug!("{} server transaction ignoring response", self.key);
                None
            }
        }
    }

    async fn process_request(&mut self, request: rsip::Request) -> Option<SipMessage> {
        match self.transaction_type {
            TransactionType::ServerInvite if request.method == Method::Ack => {
                match self.state {
                    TransactionState::InviteCompleted => {
                        self.cancel_retransmit();
                        self.cancel_timeout();
                        self.transition(TransactionState::InviteConfirmed);
                        let linger = if self.is_streaming() {
                            Duration::ZERO
                        } else {
                            self.option().t4
                        };
                        self.timer_linger =
                            Some(self.arm_at(linger, TransactionTimer::TimerI(self.key.clone())));
                        Some(request.into())
                    }
                    // duplicate ACK
                    _ => None,
                }
            }
            TransactionType::ServerInvite | TransactionType::ServerNonInvite => {
                // request retransmit: replay the last response, if any
                if let Some(last) = self.last_response.clone() {
                    self.resend(last.into()).await;
                }
                None
            }
            _ => None,
        }
    }

    async fn process_timer(&mut self, timer: TransactionTimer) -> Option<SipMessage> {
        let option = self.option();
        match timer {
            TransactionTimer::TimerA(key, interval) => {
                if self.state == TransactionState::InviteCalling {
                    self.resend(self.original.clone().into()).await;
                    self.timer_retransmit =
                        Some(self.arm_at(interval * 2, TransactionTimer::TimerA(key, interval * 2)));
                }
                None
            }
            TransactionTimer::TimerE(key, interval) => {
                if matches!(
                    self.state,
                    TransactionState::Trying | TransactionState::Proceeding
                ) {
                    self.resend(self.original.clone().into()).await;
                    let next = (interval * 2).min(option.t2);
                    self.timer_retransmit =
                        Some(self.arm_at(next, TransactionTimer::TimerE(key, next)));
                }
                None
            }
            TransactionTimer::TimerG(key, interval) => {
                if self.state == TransactionState::InviteCompleted {
                    if let Some(last) = self.last_response.clone() {
                        self.resend(last.into()).await;
                    }
                    let next = (interval * 2).min(option.t2);
                    self.timer_retransmit =
                        Some(self.arm_at(next, TransactionTimer::TimerG(key, next)));
                }
                None
            }
            TransactionTimer::TimerB(_) => {
                if matches!(
                    self.state,
                    TransactionState::InviteCalling | TransactionState::InviteProceeding
                ) {
                    return Some(self.timeout_final().into());
                }
                None
            }
            TransactionTimer::TimerF(_) => {
                if matches!(
                    self.state,
                    TransactionState::Trying | TransactionState::Proceeding
                ) {
                    return Some(self.timeout_final().into());
                }
                None
            }
            TransactionTimer::TimerH(_) => {
                if self.state == TransactionState::InviteCompleted {
                    // the ACK never arrived
                    return Some(self.timeout_final().into());
                }
                None
            }
            TransactionTimer::TimerD(_)
            | TransactionTimer::TimerI(_)
            | TransactionTimer::TimerJ(_)
            | TransactionTimer::TimerK(_)
            | TransactionTimer::TimerCleanup(_) => {
                self.transition(TransactionState::Terminated);
                None
            }
        }
    }

    /// Build and send the ACK that belongs to a non-2xx final: original
    /// top Via and From, To taken from the response (tag included), the
    /// INVITE's CSeq number with method ACK, Contact and Route preserved.
    async fn acknowledge_final(&mut self, response: &rsip::Response) {
        let ack = match build_non2xx_ack(&self.original, response) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("{} could not build ack: {}", self.key, e);
                return;
            }
        };
        self.resend(ack.clone().into()).await;
        self.last_ack = Some(ack);
    }

    fn timeout_final(&mut self) -> rsip::Response {
        let response =
            self.endpoint_inner
                .make_response(&self.original, StatusCode::RequestTimeout, None);
        self.last_response = Some(response.clone());
        self.transition(TransactionState::Terminated);
        response
    }

    fn fail(&mut self, status: StatusCode) {
        let response = self.endpoint_inner.make_response(&self.original, status, None);
        self.pending_failure = Some(response);
    }

    async fn resend(&self, msg: SipMessage) {
        if let Some(connection) = &self.connection {
            if let Err(e) = connection.send(msg, self.destination.as_ref()).await {
                warn!("{} retransmit failed: {}", self.key, e);
            }
        }
    }

    async fn send_response(&mut self, response: rsip::Response) -> Result<()> {
        let connection = self.connection.clone().ok_or_else(|| {
            Error::TransactionError(
                "server transaction without transport".to_string(),
                self.key.clone(),
            )
        })?;
        let destination = if connection.is_streaming() {
            None
        } else {
            match response.via_header().and_then(|v| Ok(v.typed()?)) {
                Ok(via) => Some(SipConnection::response_destination(&via)),
                Err(_) => self.destination.clone(),
            }
        };
        trace!(
            "{} sending response {} -> {:?}",
            self.key,
            response.status_code,
            destination
        );
        connection
            .send(response.into(), destination.as_ref().or(self.destination.as_ref()))
            .await
    }

    fn arm(&self, timer: TransactionTimer) -> u64 {
        let duration = match &timer {
            TransactionTimer::TimerA(_, d)
            | TransactionTimer::TimerE(_, d)
            | TransactionTimer::TimerG(_, d) => *d,
            _ => self.option().t1,
        };
        self.endpoint_inner.timers.timeout(duration, timer)
    }

    fn arm_at(&self, after: Duration, timer: TransactionTimer) -> u64 {
        self.endpoint_inner.timers.timeout(after, timer)
    }

    fn cancel_retransmit(&mut self) {
        if let Some(id) = self.timer_retransmit.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cancel_timeout(&mut self) {
        if let Some(id) = self.timer_timeout.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn transition(&mut self, state: TransactionState) {
        if self.state == state {
            return;
        }
        debug!("{} {:?} -> {:?}", self.key, self.state, state);
        self.state = state;
        if state == TransactionState::Terminated {
            self.cancel_retransmit();
            self.cancel_timeout();
            if let Some(id) = self.timer_linger.take() {
                self.endpoint_inner.timers.cancel(id);
            }
            if let Some(id) = self.timer_cleanup.take() {
                self.endpoint_inner.timers.cancel(id);
            }
            self.endpoint_inner.detach_transaction(&self.key);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        for id in [
            self.timer_retransmit.take(),
            self.timer_timeout.take(),
            self.timer_linger.take(),
            self.timer_cleanup.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.endpoint_inner.timers.cancel(id);
        }
        self.endpoint_inner.detach_transaction(&self.key);
        trace!("transaction dropped: {}", self.key);
    }
}

fn build_non2xx_ack(original: &rsip::Request, response: &rsip::Response) -> Result<rsip::Request> {
    let cseq = original.cseq_header()?.seq()?;
    let mut headers: Vec<Header> = vec![
        Header::Via(original.via_header()?.clone()),
        Header::From(original.from_header()?.clone()),
        Header::To(response.to_header()?.clone()),
        Header::CallId(original.call_id_header()?.clone()),
        Header::CSeq(
            rsip::typed::CSeq {
                seq: cseq,
                method: Method::Ack,
            }
            .into(),
        ),
        Header::MaxForwards(70.into()),
    ];
    for header in original.headers.iter() {
        match header {
            Header::Contact(contact) => headers.push(Header::Contact(contact.clone())),
            Header::Route(route) => headers.push(Header::Route(route.clone())),
            _ => {}
        }
    }
    Ok(rsip::Request {
        method: Method::Ack,
        uri: original.uri.clone(),
        headers: headers.into(),
        body: vec![],
        version: rsip::Version::V2,
    })
}

#[cfg(test)]
mod builder_tests {
    use super::*;

    #[test]
    fn test_build_non2xx_ack() -> Result<()> {
        let invite = rsip::Request::try_from(
            "INVITE sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK-77\r\n\
             Call-ID: ack-test\r\nFrom: <sip:alice@a>;tag=al\r\nTo: <sip:bob@b>\r\n\
             CSeq: 9 INVITE\r\nContact: <sip:alice@10.0.0.1:5060>\r\n\
             Route: <sip:proxy.example.com;lr>\r\nContent-Length: 0\r\n\r\n"
                .as_bytes(),
        )?;
        let response = rsip::Response::try_from(
            "SIP/2.0 486 Busy Here\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK-77\r\n\
             Call-ID: ack-test\r\nFrom: <sip:alice@a>;tag=al\r\nTo: <sip:bob@b>;tag=bo\r\n\
             CSeq: 9 INVITE\r\nContent-Length: 0\r\n\r\n"
                .as_bytes(),
        )?;
        let ack = build_non2xx_ack(&invite, &response)?;
        assert_eq!(ack.method, Method::Ack);
        let text = ack.to_string();
        assert!(text.contains("branch=z9hG4bK-77"));
        assert!(text.contains("tag=bo"));
        assert!(text.contains("CSeq: 9 ACK"));
        assert!(text.contains("Route: <sip:proxy.example.com;lr>"));
        Ok(())
    }
}
