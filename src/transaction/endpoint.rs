use super::key::{TransactionKey, TransactionRole};
use super::timer::Timer;
use super::transaction::Transaction;
use super::{
    TransactionEvent, TransactionEventSender, TransactionReceiver, TransactionSender,
    TransactionTimer,
};
use crate::transport::{
    SipAddr, SipConnection, TransportEvent, TransportLayer, TransportReceiver, TransportSender,
};
use crate::{Error, Result};
use rsip::{Method, SipMessage, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Per-endpoint protocol knobs. The timer bases follow RFC 3261; the tick
/// interval bounds how late a deadline can fire.
#[derive(Clone)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    pub t1x64: Duration,
    /// Granularity of the background tick driving all timers.
    pub timer_interval: Duration,
    /// How often the transport pool sweep runs, amortized over ticks.
    pub transport_interval: Duration,
    /// Appended to generated Call-IDs as `@suffix`.
    pub callid_suffix: Option<String>,
    /// Drop out-of-dialog OPTIONS instead of delivering them to the TU.
    pub ignore_out_of_dialog_option: bool,
}

impl Default for EndpointOption {
    fn default() -> Self {
        EndpointOption {
            t1: super::T1,
            t2: super::T2,
            t4: super::T4,
            t1x64: super::T1X64,
            timer_interval: Duration::from_millis(250),
            transport_interval: Duration::from_secs(30),
            callid_suffix: None,
            ignore_out_of_dialog_option: false,
        }
    }
}

/// Responses that match no transaction, handed to whoever registered the
/// sink (the dialog layer, which re-acknowledges retransmitted 2xx).
pub type OrphanResponseSender = UnboundedSender<(rsip::Response, Option<SipConnection>)>;

pub struct EndpointInner {
    pub user_agent: String,
    pub option: EndpointOption,
    pub allows: Mutex<Vec<Method>>,
    pub timers: Timer<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub transport_tx: TransportSender,
    pub cancel_token: CancellationToken,
    transport_rx: Mutex<Option<TransportReceiver>>,
    transactions: Mutex<HashMap<TransactionKey, TransactionEventSender>>,
    incoming_sender: Mutex<Option<TransactionSender>>,
    orphan_sender: Mutex<Option<OrphanResponseSender>>,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

/// The composed SIP core: transports, the transaction tables and the
/// background tick, behind one handle the transaction user drives.
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

pub struct EndpointBuilder {
    user_agent: String,
    cancel_token: Option<CancellationToken>,
    transport_layer: Option<TransportLayer>,
    option: EndpointOption,
    allows: Vec<Method>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: format!("sipbridge/{}", env!("CARGO_PKG_VERSION")),
            cancel_token: None,
            transport_layer: None,
            option: EndpointOption::default(),
            allows: vec![
                Method::Invite,
                Method::Ack,
                Method::Cancel,
                Method::Bye,
                Method::Options,
                Method::Info,
                Method::Message,
                Method::Update,
            ],
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn with_transport_layer(mut self, transport_layer: TransportLayer) -> Self {
        self.transport_layer = Some(transport_layer);
        self
    }

    pub fn with_option(mut self, option: EndpointOption) -> Self {
        self.option = option;
        self
    }

    /// Replace the default Allow set advertised by this endpoint.
    pub fn with_allows(mut self, allows: Vec<Method>) -> Self {
        self.allows = allows;
        self
    }

    pub fn build(self) -> Endpoint {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        let (transport_tx, transport_rx) = unbounded_channel();

        let inner = Arc::new(EndpointInner {
            user_agent: self.user_agent,
            option: self.option,
            allows: Mutex::new(self.allows),
            timers: Timer::new(),
            transport_layer,
            transport_tx,
            cancel_token,
            transport_rx: Mutex::new(Some(transport_rx)),
            transactions: Mutex::new(HashMap::new()),
            incoming_sender: Mutex::new(None),
            orphan_sender: Mutex::new(None),
        });
        Endpoint { inner }
    }
}

impl Endpoint {
    /// Run the endpoint until cancelled. Starting twice is a programming
    /// error and fails immediately.
    pub async fn serve(&self) -> Result<()> {
        self.inner.serve().await
    }

    /// Take the stream of server transactions created for unmatched
    /// requests. There is exactly one consumer.
    pub fn incoming_transactions(&self) -> Result<TransactionReceiver> {
        let mut sender = self.inner.incoming_sender.lock().unwrap();
        if sender.is_some() {
            return Err(Error::Error(
                "incoming transactions already claimed".to_string(),
            ));
        }
        let (tx, rx) = unbounded_channel();
        *sender = Some(tx);
        Ok(rx)
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.transport_layer.get_addrs()
    }

    pub fn shutdown(&self) {
        info!("endpoint shutting down");
        self.inner.cancel_token.cancel();
    }
}

impl EndpointInner {
    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.transport_layer.get_addrs()
    }

    pub fn allowed_methods(&self) -> Vec<Method> {
        self.allows.lock().unwrap().clone()
    }

    /// The Allow header matching [`EndpointInner::allowed_methods`].
    pub fn allow_header(&self) -> rsip::headers::Allow {
        let list = self
            .allowed_methods()
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        list.into()
    }

    pub(crate) fn attach_transaction(&self, key: &TransactionKey, sender: TransactionEventSender) {
        trace!("transaction attached: {}", key);
        self.transactions.lock().unwrap().insert(key.clone(), sender);
    }

    pub(crate) fn detach_transaction(&self, key: &TransactionKey) {
        if self.transactions.lock().unwrap().remove(key).is_some() {
            trace!("transaction detached: {}", key);
        }
    }

    /// The dialog layer's hook for responses no transaction claims.
    pub fn set_orphan_response_sender(&self, sender: Option<OrphanResponseSender>) {
        *self.orphan_sender.lock().unwrap() = sender;
    }

    pub async fn serve(self: &Arc<Self>) -> Result<()> {
        let mut transport_rx = self
            .transport_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Error("endpoint already serving".to_string()))?;

        self.transport_layer
            .serve_listens(self.transport_tx.clone())
            .await?;

        let mut tick = tokio::time::interval(self.option.timer_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_transport_tick = Instant::now();

        info!("endpoint serving, {} transport(s)", self.get_addrs().len());
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("endpoint cancelled");
                    return Ok(());
                }
                event = transport_rx.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.on_transport_event(event).await {
                            warn!("transport event error: {}", e);
                        }
                    }
                    None => return Ok(()),
                },
                _ = tick.tick() => {
                    self.on_background_tick(&mut last_transport_tick);
                }
            }
        }
    }

    fn on_background_tick(&self, last_transport_tick: &mut Instant) {
        for timer in self.timers.poll(Instant::now()) {
            let sender = self
                .transactions
                .lock()
                .unwrap()
                .get(timer.key())
                .cloned();
            if let Some(sender) = sender {
                sender.send(TransactionEvent::Timer(timer)).ok();
            }
        }
        if last_transport_tick.elapsed() >= self.option.transport_interval {
            *last_transport_tick = Instant::now();
            self.transport_layer.on_background_tick();
        }
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Incoming(msg, connection, source) => {
                self.on_message(msg, connection, source).await
            }
            TransportEvent::New(connection) => {
                self.transport_layer.add_connection(connection);
                Ok(())
            }
            TransportEvent::Closed(connection) => {
                self.transport_layer.del_connection(connection.get_addr());
                Ok(())
            }
        }
    }

    /// Route one received message: responses to the matching client
    /// transaction, requests to their server transaction or into a new
    /// one handed to the transaction user.
    async fn on_message(
        self: &Arc<Self>,
        msg: SipMessage,
        connection: SipConnection,
        source: SipAddr,
    ) -> Result<()> {
        match msg {
            SipMessage::Response(response) => {
                let key = match TransactionKey::from_response(&response, TransactionRole::Client) {
                    Ok(key) => key,
                    Err(e) => {
                        debug!("dropping unroutable response from {}: {}", source, e);
                        return Ok(());
                    }
                };
                let sender = self.transactions.lock().unwrap().get(&key).cloned();
                match sender {
                    Some(sender) => {
                        sender
                            .send(TransactionEvent::Received(
                                response.into(),
                                Some(connection),
                            ))
                            .ok();
                    }
                    None => {
                        let orphan = self.orphan_sender.lock().unwrap().clone();
                        match orphan {
                            Some(orphan) => {
                                orphan.send((response, Some(connection))).ok();
                            }
                            None => {
                                debug!("dropping uncorrelated response {} from {}", response.status_code, source)
                            }
                        }
                    }
                }
                Ok(())
            }
            SipMessage::Request(request) => {
                let key = match TransactionKey::from_request(&request, TransactionRole::Server) {
                    Ok(key) => key,
                    Err(e) => {
                        debug!("malformed request from {}: {}", source, e);
                        // stateless 400, datagram only gets it when the
                        // message at least framed
                        let response =
                            self.make_response(&request, StatusCode::BadRequest, None);
                        connection.send(response.into(), Some(&source)).await.ok();
                        return Ok(());
                    }
                };
                let existing = self.transactions.lock().unwrap().get(&key).cloned();
                if let Some(sender) = existing {
                    sender
                        .send(TransactionEvent::Received(request.into(), Some(connection)))
                        .ok();
                    return Ok(());
                }

                if self.option.ignore_out_of_dialog_option
                    && request.method == Method::Options
                    && !has_to_tag(&request)
                {
                    debug!("ignoring out-of-dialog OPTIONS from {}", source);
                    return Ok(());
                }

                let incoming = self.incoming_sender.lock().unwrap().clone();
                let incoming = match incoming {
                    Some(incoming) => incoming,
                    None => {
                        if request.method != Method::Ack {
                            warn!("no transaction user, refusing {} from {}", request.method, source);
                            let response =
                                self.make_response(&request, StatusCode::ServiceUnavailable, None);
                            connection.send(response.into(), Some(&source)).await.ok();
                        }
                        return Ok(());
                    }
                };

                let mut tx =
                    Transaction::new_server(key, request, self.clone(), Some(connection));
                tx.destination = Some(source);
                if tx.original.method == Method::Invite {
                    tx.send_trying().await.ok();
                }
                incoming.send(tx).map_err(|_| {
                    Error::Error("transaction user went away".to_string())
                })?;
                Ok(())
            }
        }
    }
}

fn has_to_tag(request: &rsip::Request) -> bool {
    use rsip::prelude::HeadersExt;
    request
        .to_header()
        .ok()
        .and_then(|to| to.tag().ok())
        .flatten()
        .is_some()
}
