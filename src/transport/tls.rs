use super::stream::StreamDecoder;
use super::{SipAddr, SipConnection, TransportEvent, TransportSender};
use crate::{Error, Result};
use rsip::SipMessage;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Certificate material for the accepting side of a TLS transport.
#[derive(Clone, Default)]
pub struct TlsConfig {
    /// PEM-encoded certificate chain.
    pub cert: Option<Vec<u8>>,
    /// PEM-encoded private key.
    pub key: Option<Vec<u8>>,
}

/// One established TLS stream over TCP, client- or server-side.
#[derive(Clone)]
pub struct TlsConnection {
    inner: Arc<TlsInner>,
}

struct TlsInner {
    remote_addr: SipAddr,
    write_half: tokio::sync::Mutex<WriteHalf<Box<dyn IoStream>>>,
    read_half: std::sync::Mutex<Option<ReadHalf<Box<dyn IoStream>>>>,
    cancel_token: Option<CancellationToken>,
    disabled: AtomicBool,
    last_active: std::sync::Mutex<Instant>,
}

impl TlsConnection {
    /// Connect and complete the handshake, verifying the peer against the
    /// webpki root store. The server name is taken from the target host.
    pub async fn connect(
        remote: &SipAddr,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let server_name = ServerName::try_from(remote.addr.host.to_string())
            .map_err(|e| Error::Error(format!("bad tls server name: {}", e)))?;
        let peer = remote.get_socketaddr()?;
        let tcp = TcpStream::connect(peer).await.map_err(|e| {
            Error::TransportLayerError(super::describe_send_error(&e), remote.clone())
        })?;
        let stream = connector.connect(server_name, tcp).await.map_err(|e| {
            Error::TransportLayerError(format!("tls handshake: {}", e), remote.clone())
        })?;
        info!("tls connected: {}", remote);
        Ok(Self::from_parts(
            Box::new(stream),
            SipAddr::new(rsip::Transport::Tls, remote.addr.clone()),
            cancel_token,
        ))
    }

    fn from_parts(
        stream: Box<dyn IoStream>,
        remote_addr: SipAddr,
        cancel_token: Option<CancellationToken>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        TlsConnection {
            inner: Arc::new(TlsInner {
                remote_addr,
                write_half: tokio::sync::Mutex::new(write_half),
                read_half: std::sync::Mutex::new(Some(read_half)),
                cancel_token,
                disabled: AtomicBool::new(false),
                last_active: std::sync::Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }

    pub fn disable(&self, disabled: bool) {
        self.inner.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn close(&self) {
        if let Some(token) = &self.inner.cancel_token {
            token.cancel();
        }
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.inner.last_active.lock().unwrap().elapsed()
    }

    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        if self.inner.disabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        *self.inner.last_active.lock().unwrap() = Instant::now();
        let buf = msg.to_string();
        self.inner
            .write_half
            .lock()
            .await
            .write_all(buf.as_bytes())
            .await
            .map_err(|e| {
                Error::TransportLayerError(
                    super::describe_send_error(&e),
                    self.inner.remote_addr.clone(),
                )
            })
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let result = match self.inner.cancel_token.clone() {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => Ok(()),
                    r = self.recv_loop(sender.clone()) => r,
                }
            }
            None => self.recv_loop(sender.clone()).await,
        };
        sender.send(TransportEvent::Closed(self.clone().into())).ok();
        result
    }

    async fn recv_loop(&self, sender: TransportSender) -> Result<()> {
        let mut read_half = self
            .inner
            .read_half
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Error("tls stream already being served".to_string()))?;
        let peer = self.inner.remote_addr.get_socketaddr().ok();

        let mut decoder = StreamDecoder::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let len = read_half.read(&mut buf).await?;
            if len == 0 {
                debug!("tls peer closed: {}", self.inner.remote_addr);
                return Ok(());
            }
            if self.inner.disabled.load(Ordering::Relaxed) {
                continue;
            }
            *self.inner.last_active.lock().unwrap() = Instant::now();
            decoder.feed(&buf[..len]);
            loop {
                let raw = match decoder.decode() {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("dropping tls connection {}: {}", self.inner.remote_addr, e);
                        return Err(e);
                    }
                };
                let msg = match SipMessage::try_from(raw.as_slice()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("malformed message on {}: {}", self.inner.remote_addr, e);
                        continue;
                    }
                };
                let msg = match peer {
                    Some(peer) => SipConnection::update_msg_received(msg, peer)?,
                    None => msg,
                };
                sender.send(TransportEvent::Incoming(
                    msg,
                    self.clone().into(),
                    self.inner.remote_addr.clone(),
                ))?;
            }
        }
    }
}

/// Accepts inbound TLS streams using the configured certificate.
#[derive(Clone)]
pub struct TlsListenerConnection {
    inner: Arc<TlsListenerInner>,
}

struct TlsListenerInner {
    local_addr: SipAddr,
    acceptor: TlsAcceptor,
    listener: std::sync::Mutex<Option<tokio::net::TcpListener>>,
    cancel_token: Option<CancellationToken>,
}

impl TlsListenerConnection {
    pub async fn create_listener(
        local: SocketAddr,
        external: Option<SocketAddr>,
        config: TlsConfig,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self> {
        let cert_pem = config
            .cert
            .ok_or_else(|| Error::Error("tls listener requires a certificate".to_string()))?;
        let key_pem = config
            .key
            .ok_or_else(|| Error::Error("tls listener requires a private key".to_string()))?;

        let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<std::io::Result<Vec<_>>>()?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
            .ok_or_else(|| Error::Error("no private key in pem".to_string()))?;
        let server_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Error(format!("tls config: {}", e)))?;

        let listener = tokio::net::TcpListener::bind(local).await?;
        let bound = listener.local_addr()?;
        let advertised = external.unwrap_or(bound);
        info!("created TLS listener: {} (bound {})", advertised, bound);
        Ok(TlsListenerConnection {
            inner: Arc::new(TlsListenerInner {
                local_addr: SipAddr::new(rsip::Transport::Tls, advertised.into()),
                acceptor: TlsAcceptor::from(Arc::new(server_config)),
                listener: std::sync::Mutex::new(Some(listener)),
                cancel_token,
            }),
        })
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    pub fn close(&self) {
        if let Some(token) = &self.inner.cancel_token {
            token.cancel();
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self.inner.cancel_token.clone() {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => Ok(()),
                    r = self.accept_loop(sender) => r,
                }
            }
            None => self.accept_loop(sender).await,
        }
    }

    async fn accept_loop(&self, sender: TransportSender) -> Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Error("tls listener already being served".to_string()))?;
        loop {
            let (tcp, peer) = listener.accept().await?;
            let acceptor = self.inner.acceptor.clone();
            let conn_sender = sender.clone();
            let token = self.inner.cancel_token.as_ref().map(|t| t.child_token());
            tokio::spawn(async move {
                let stream = match acceptor.accept(tcp).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("tls handshake with {} failed: {}", peer, e);
                        return;
                    }
                };
                let conn = TlsConnection::from_parts(
                    Box::new(stream),
                    SipAddr::new(rsip::Transport::Tls, peer.into()),
                    token,
                );
                conn_sender
                    .send(TransportEvent::New(conn.clone().into()))
                    .ok();
                if let Err(e) = conn.serve_loop(conn_sender).await {
                    debug!("tls connection ended: {}", e);
                }
            });
        }
    }
}
