use super::stream::StreamDecoder;
use super::{SipAddr, SipConnection, TransportEvent, TransportSender};
use crate::{Error, Result};
use rsip::SipMessage;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// One established TCP stream, inbound or outbound. The peer binding is
/// the connection's identity; responses to requests received on the
/// stream always go back down the same stream.
#[derive(Clone)]
pub struct TcpConnection {
    pub(crate) inner: Arc<TcpInner>,
}

pub(crate) struct TcpInner {
    pub remote_addr: SipAddr,
    pub local_addr: SipAddr,
    write_half: tokio::sync::Mutex<OwnedWriteHalf>,
    read_half: std::sync::Mutex<Option<OwnedReadHalf>>,
    cancel_token: Option<CancellationToken>,
    disabled: AtomicBool,
    last_active: std::sync::Mutex<Instant>,
}

impl TcpConnection {
    pub async fn connect(
        remote: &SipAddr,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self> {
        let peer = remote.get_socketaddr()?;
        let stream = TcpStream::connect(peer).await.map_err(|e| {
            Error::TransportLayerError(super::describe_send_error(&e), remote.clone())
        })?;
        let conn = Self::from_stream(stream, cancel_token)?;
        info!(
            "tcp connected: {} -> {}",
            conn.inner.local_addr, conn.inner.remote_addr
        );
        Ok(conn)
    }

    pub fn from_stream(
        stream: TcpStream,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(TcpConnection {
            inner: Arc::new(TcpInner {
                remote_addr: SipAddr::new(rsip::Transport::Tcp, peer.into()),
                local_addr: SipAddr::new(rsip::Transport::Tcp, local.into()),
                write_half: tokio::sync::Mutex::new(write_half),
                read_half: std::sync::Mutex::new(Some(read_half)),
                cancel_token,
                disabled: AtomicBool::new(false),
                last_active: std::sync::Mutex::new(Instant::now()),
            }),
        })
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

    /// Seconds this connection has been idle, for the pool sweep.
    pub fn idle_for(&self) -> std::time::Duration {
        self.inner.last_active.lock().unwrap().elapsed()
    }

    fn touch(&self) {
        *self.inner.last_active.lock().unwrap() = Instant::now();
    }

    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        if self.inner.disabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.touch();
        let buf = msg.to_string();
        trace!("tcp sending {} bytes to {}", buf.len(), self.inner.remote_addr);
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
        use tokio::io::AsyncReadExt;
        let mut read_half = self
            .inner
            .read_half
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Error("tcp stream already being served".to_string()))?;
        let peer = self.inner.remote_addr.get_socketaddr()?;

        let mut decoder = StreamDecoder::new();
        let mut buf = vec![0u8; 8192];
        loop {
            let len = read_half.read(&mut buf).await?;
            if len == 0 {
                debug!("tcp peer closed: {}", self.inner.remote_addr);
                return Ok(());
            }
            if self.inner.disabled.load(Ordering::Relaxed) {
                continue;
            }
            self.touch();
            decoder.feed(&buf[..len]);
            loop {
                let raw = match decoder.decode() {
                    Ok(Some(raw)) => raw,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("dropping tcp connection {}: {}", self.inner.remote_addr, e);
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
                let msg = SipConnection::update_msg_received(msg, peer)?;
                sender.send(TransportEvent::Incoming(
                    msg,
                    self.clone().into(),
                    self.inner.remote_addr.clone(),
                ))?;
            }
        }
    }
}

/// Accepts inbound TCP streams and hands each one off as its own
/// [`TcpConnection`].
#[derive(Clone)]
pub struct TcpListenerConnection {
    pub(crate) inner: Arc<TcpListenerInner>,
}

pub(crate) struct TcpListenerInner {
    pub local_addr: SipAddr,
    listener: std::sync::Mutex<Option<TcpListener>>,
    cancel_token: Option<CancellationToken>,
}

impl TcpListenerConnection {
    pub async fn create_listener(
        local: SocketAddr,
        external: Option<SocketAddr>,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(local).await?;
        let bound = listener.local_addr()?;
        let advertised = external.unwrap_or(bound);
        info!("created TCP listener: {} (bound {})", advertised, bound);
        Ok(TcpListenerConnection {
            inner: Arc::new(TcpListenerInner {
                local_addr: SipAddr::new(rsip::Transport::Tcp, advertised.into()),
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
            .ok_or_else(|| Error::Error("tcp listener already being served".to_string()))?;
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("tcp accepted: {}", peer);
            let conn = match TcpConnection::from_stream(
                stream,
                self.inner.cancel_token.as_ref().map(|t| t.child_token()),
            ) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("failed to adopt tcp stream from {}: {}", peer, e);
                    continue;
                }
            };
            sender.send(TransportEvent::New(conn.clone().into()))?;
            let conn_sender = sender.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.serve_loop(conn_sender).await {
                    debug!("tcp connection ended: {}", e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_tcp_framing_roundtrip() -> Result<()> {
        let listener =
            TcpListenerConnection::create_listener("127.0.0.1:0".parse()?, None, None).await?;
        let (sender, mut receiver) = unbounded_channel();
        let serve = listener.clone();
        tokio::spawn(async move { serve.serve_loop(sender).await });

        let client = TcpConnection::connect(listener.get_addr(), None).await?;
        let raw = "MESSAGE sip:b@example.com SIP/2.0\r\n\
             Via: SIP/2.0/TCP 127.0.0.1:5099;branch=z9hG4bK-tcp1\r\n\
             Call-ID: tcp-1\r\nFrom: <sip:a@x>;tag=1\r\nTo: <sip:b@x>\r\n\
             CSeq: 2 MESSAGE\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello";
        client.send(SipMessage::try_from(raw)?).await?;

        // first event announces the accepted connection
        match receiver.recv().await {
            Some(TransportEvent::New(_)) => {}
            _ => panic!("expected new-connection event"),
        }
        match receiver.recv().await {
            Some(TransportEvent::Incoming(SipMessage::Request(req), conn, _)) => {
                assert_eq!(req.method, rsip::Method::Message);
                assert_eq!(req.body, b"hello");
                assert!(conn.is_streaming());
            }
            _ => panic!("expected incoming request"),
        }
        Ok(())
    }
}
