use super::{SipAddr, SipConnection, TransportEvent, TransportSender};
use crate::{Error, Result};
use rsip::Param;
use rsip_dns::trust_dns_resolver::TokioAsyncResolver;
use rsip_dns::ResolvableExt;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Idle streaming connections are dropped after this long (RFC 3261
/// requires keeping them at least three minutes).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Owns the listening transports and a pool of outbound streaming
/// connections, and picks the transport for each outbound request.
pub struct TransportLayer {
    pub inner: std::sync::Arc<TransportLayerInner>,
}

pub struct TransportLayerInner {
    pub cancel_token: CancellationToken,
    listens: RwLock<HashMap<SipAddr, SipConnection>>,
    connections: RwLock<HashMap<SipAddr, SipConnection>>,
    /// Requests go here instead of the request-URI when set.
    pub outbound: Mutex<Option<SipAddr>>,
    pub idle_timeout: Duration,
}

impl Clone for TransportLayer {
    fn clone(&self) -> Self {
        TransportLayer {
            inner: self.inner.clone(),
        }
    }
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        TransportLayer {
            inner: std::sync::Arc::new(TransportLayerInner {
                cancel_token,
                listens: RwLock::new(HashMap::new()),
                connections: RwLock::new(HashMap::new()),
                outbound: Mutex::new(None),
                idle_timeout: DEFAULT_IDLE_TIMEOUT,
            }),
        }
    }

    pub fn add_transport(&self, connection: SipConnection) {
        let addr = connection.get_addr().clone();
        info!("transport added: {}", addr);
        self.inner.listens.write().unwrap().insert(addr, connection);
    }

    pub fn del_transport(&self, addr: &SipAddr) {
        if let Some(connection) = self.inner.listens.write().unwrap().remove(addr) {
            connection.close();
        }
    }

    pub(crate) fn add_connection(&self, connection: SipConnection) {
        let addr = connection.get_addr().clone();
        debug!("connection pooled: {}", addr);
        self.inner
            .connections
            .write()
            .unwrap()
            .insert(addr, connection);
    }

    pub(crate) fn del_connection(&self, addr: &SipAddr) {
        if self.inner.connections.write().unwrap().remove(addr).is_some() {
            debug!("connection dropped from pool: {}", addr);
        }
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner.listens.read().unwrap().keys().cloned().collect()
    }

    pub fn set_outbound(&self, outbound: Option<SipAddr>) {
        *self.inner.outbound.lock().unwrap() = outbound;
    }

    fn first_listen_of(&self, r#type: rsip::Transport) -> Option<SipConnection> {
        self.inner
            .listens
            .read()
            .unwrap()
            .values()
            .find(|c| c.the_type() == r#type)
            .cloned()
    }

    /// Resolve a request target to `(connection, destination)`.
    ///
    /// Honors the outbound proxy override and a `transport=` URI
    /// parameter; domains are resolved through DNS (NAPTR/SRV/A, per the
    /// rsip-dns lookup order). Datagram targets reuse the listening
    /// socket; streaming targets reuse a pooled connection or connect on
    /// the spot, which is why connect errors surface synchronously here.
    pub async fn lookup(
        &self,
        uri: &rsip::Uri,
        sender: TransportSender,
    ) -> Result<(SipConnection, SipAddr)> {
        let target = match self.inner.outbound.lock().unwrap().clone() {
            Some(outbound) => outbound,
            None => Self::uri_destination(uri)?,
        };
        let target = match &target.addr.host {
            rsip::Host::IpAddr(_) => target,
            rsip::Host::Domain(_) => self.resolve(uri, &target).await?,
        };
        self.lookup_target(target, sender).await
    }

    /// Second half of [`TransportLayer::lookup`] for targets that are
    /// already resolved to an address (retries, route destinations).
    pub(crate) async fn lookup_target(
        &self,
        target: SipAddr,
        sender: TransportSender,
    ) -> Result<(SipConnection, SipAddr)> {
        let transport = target.r#type.unwrap_or(rsip::Transport::Udp);

        match transport {
            rsip::Transport::Udp => {
                let connection = self.first_listen_of(rsip::Transport::Udp).ok_or_else(|| {
                    Error::TransportLayerError("no udp transport bound".to_string(), target.clone())
                })?;
                Ok((connection, target))
            }
            rsip::Transport::Tcp => {
                if let Some(connection) = self.inner.connections.read().unwrap().get(&target) {
                    return Ok((connection.clone(), target.clone()));
                }
                let connection: SipConnection = super::tcp::TcpConnection::connect(
                    &target,
                    Some(self.inner.cancel_token.child_token()),
                )
                .await?
                .into();
                self.add_connection(connection.clone());
                let serve = connection.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve.serve_loop(sender).await {
                        debug!("outbound tcp connection ended: {}", e);
                    }
                });
                Ok((connection, target))
            }
            #[cfg(feature = "rustls")]
            rsip::Transport::Tls => {
                if let Some(connection) = self.inner.connections.read().unwrap().get(&target) {
                    return Ok((connection.clone(), target.clone()));
                }
                let connection: SipConnection = super::tls::TlsConnection::connect(
                    &target,
                    Some(self.inner.cancel_token.child_token()),
                )
                .await?
                .into();
                self.add_connection(connection.clone());
                let serve = connection.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve.serve_loop(sender).await {
                        debug!("outbound tls connection ended: {}", e);
                    }
                });
                Ok((connection, target))
            }
            other => Err(Error::TransportLayerError(
                format!("unsupported transport: {}", other),
                target,
            )),
        }
    }

    /// The transport and binding a URI names before DNS: explicit
    /// `transport=` parameter wins, otherwise the scheme default.
    pub(crate) fn uri_destination(uri: &rsip::Uri) -> Result<SipAddr> {
        let param_transport = uri.params.iter().find_map(|p| match p {
            Param::Transport(t) => Some(*t),
            _ => None,
        });
        let secure = matches!(uri.scheme, Some(rsip::Scheme::Sips));
        let transport = param_transport.unwrap_or(if secure {
            rsip::Transport::Tls
        } else {
            rsip::Transport::Udp
        });
        let port = uri
            .host_with_port
            .port
            .clone()
            .or(Some(if secure { 5061 } else { 5060 }.into()));
        Ok(SipAddr {
            r#type: Some(transport),
            addr: rsip::HostWithPort {
                host: uri.host_with_port.host.clone(),
                port,
            },
        })
    }

    async fn resolve(&self, uri: &rsip::Uri, target: &SipAddr) -> Result<SipAddr> {
        let context = rsip_dns::Context::initialize_from(
            uri.clone(),
            rsip_dns::AsyncTrustDnsClient::new(
                TokioAsyncResolver::tokio(Default::default(), Default::default()).unwrap(),
            ),
            rsip_dns::SupportedTransports::any(),
        )?;
        let mut lookup = rsip_dns::Lookup::from(context);
        match lookup.resolve_next().await {
            Some(resolved) => {
                let addr = SipAddr {
                    r#type: target.r#type.or(Some(resolved.transport)),
                    addr: rsip::HostWithPort {
                        host: resolved.ip_addr.into(),
                        port: Some(resolved.port),
                    },
                };
                debug!("resolved {} -> {}", uri, addr);
                Ok(addr)
            }
            None => Err(Error::DnsResolutionError(format!(
                "no targets for {}",
                uri
            ))),
        }
    }

    /// Start the receive loop of every listening transport.
    pub async fn serve_listens(&self, sender: TransportSender) -> Result<()> {
        let listens = self
            .inner
            .listens
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for connection in listens {
            let serve_sender = sender.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.serve_loop(serve_sender).await {
                    warn!("transport serve loop ended: {}", e);
                }
            });
        }
        Ok(())
    }

    /// Sweep the streaming pool; invoked from the endpoint's amortized
    /// transport tick.
    pub fn on_background_tick(&self) {
        let idle_timeout = self.inner.idle_timeout;
        let mut expired = Vec::new();
        {
            let connections = self.inner.connections.read().unwrap();
            for (addr, connection) in connections.iter() {
                let idle = match connection {
                    SipConnection::Tcp(c) => c.idle_for(),
                    #[cfg(feature = "rustls")]
                    SipConnection::Tls(c) => c.idle_for(),
                    _ => Duration::ZERO,
                };
                if idle > idle_timeout {
                    expired.push(addr.clone());
                }
            }
        }
        for addr in expired {
            info!("closing idle connection: {}", addr);
            if let Some(connection) = self.inner.connections.write().unwrap().remove(&addr) {
                connection.close();
            }
        }
    }
}
