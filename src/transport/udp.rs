use super::{SipAddr, SipConnection, TransportEvent, TransportSender, KEEPALIVE_REQUEST};
use crate::{Error, Result};
use rsip::SipMessage;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Datagram transport. One socket serves every peer; the destination is
/// supplied per send.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

struct UdpInner {
    addr: SipAddr,
    socket: UdpSocket,
    cancel_token: Option<CancellationToken>,
    disabled: AtomicBool,
}

impl UdpConnection {
    pub async fn create_connection(
        local: SocketAddr,
        external: Option<SocketAddr>,
        cancel_token: Option<CancellationToken>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        let bound = socket.local_addr()?;
        let advertised = external.unwrap_or(bound);

        let addr = SipAddr {
            r#type: Some(rsip::Transport::Udp),
            addr: rsip::HostWithPort {
                host: advertised.ip().into(),
                port: Some(advertised.port().into()),
            },
        };
        info!("created UDP transport: {} (bound {})", addr, bound);
        Ok(UdpConnection {
            inner: Arc::new(UdpInner {
                addr,
                socket,
                cancel_token,
                disabled: AtomicBool::new(false),
            }),
        })
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub fn disable(&self, disabled: bool) {
        self.inner.disabled.store(disabled, Ordering::Relaxed);
    }

    pub fn close(&self) {
        if let Some(token) = &self.inner.cancel_token {
            token.cancel();
        }
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let destination = destination
            .ok_or_else(|| {
                Error::TransportLayerError(
                    "udp send without destination".to_string(),
                    self.inner.addr.clone(),
                )
            })?
            .get_socketaddr()?;

        if self.inner.disabled.load(Ordering::Relaxed) {
            trace!("udp transport disabled, dropping {} bytes", msg.to_string().len());
            return Ok(());
        }

        let buf = msg.to_string();
        trace!("sending {} bytes to {}\n{}", buf.len(), destination, buf);
        self.inner
            .socket
            .send_to(buf.as_bytes(), destination)
            .await
            .map_err(|e| {
                Error::TransportLayerError(
                    super::describe_send_error(&e),
                    SipAddr::from(destination),
                )
            })?;
        Ok(())
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match &self.inner.cancel_token {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("udp transport cancelled: {}", self.inner.addr);
                        sender.send(TransportEvent::Closed(self.clone().into()))?;
                        Ok(())
                    }
                    r = self.recv_loop(sender.clone()) => r,
                }
            }
            None => self.recv_loop(sender).await,
        }
    }

    async fn recv_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, source) = match self.inner.socket.recv_from(&mut buf).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("udp recv error: {}", e);
                    sender.send(TransportEvent::Closed(self.clone().into()))?;
                    return Err(e.into());
                }
            };

            if self.inner.disabled.load(Ordering::Relaxed) {
                continue;
            }
            // CRLFCRLF keep-alive probes never reach the parser
            if len <= KEEPALIVE_REQUEST.len() && buf[..len].iter().all(|&b| b == b'\r' || b == b'\n')
            {
                trace!("udp keep-alive from {}", source);
                continue;
            }

            let msg = match SipMessage::try_from(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(
                        "dropping malformed datagram from {}: {} {:?}",
                        source,
                        e,
                        String::from_utf8_lossy(&buf[..len.min(128)])
                    );
                    continue;
                }
            };
            let msg = match SipConnection::update_msg_received(msg, source) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("dropping message with broken top via from {}: {}", source, e);
                    continue;
                }
            };
            sender.send(TransportEvent::Incoming(
                msg,
                self.clone().into(),
                SipAddr::new(rsip::Transport::Udp, rsip::HostWithPort {
                    host: source.ip().into(),
                    port: Some(source.port().into()),
                }),
            ))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_udp_roundtrip() -> Result<()> {
        let a = UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;
        let b = UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;

        let (sender, mut receiver) = unbounded_channel();
        let b_serve = b.clone();
        tokio::spawn(async move { b_serve.serve_loop(sender).await });

        let register = "REGISTER sip:registrar.example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK-test;rport\r\n\
             Call-ID: udp-roundtrip\r\nFrom: <sip:a@x>;tag=1\r\nTo: <sip:a@x>\r\n\
             CSeq: 1 REGISTER\r\nContent-Length: 0\r\n\r\n";
        let msg = SipMessage::try_from(register)?;
        a.send(msg, Some(b.get_addr())).await?;

        match receiver.recv().await {
            Some(TransportEvent::Incoming(SipMessage::Request(req), _, source)) => {
                assert_eq!(req.method, rsip::Method::Register);
                assert_eq!(source.r#type, Some(rsip::Transport::Udp));
                // source differs from the advertised sent-by, so the top
                // via must have been stamped
                assert!(req.to_string().contains("received=127.0.0.1"));
            }
            other => panic!("expected incoming request, got {:?}", other.is_some()),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_disabled_transport_swallows_traffic() -> Result<()> {
        let a = UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;
        let b = UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;
        a.disable(true);

        let raw = "OPTIONS sip:b@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK-drop\r\n\
             Call-ID: drop\r\nFrom: <sip:a@x>;tag=1\r\nTo: <sip:b@x>\r\n\
             CSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";
        // reports success, sends nothing
        a.send(SipMessage::try_from(raw)?, Some(b.get_addr())).await?;

        let mut buf = [0u8; 1500];
        let received = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            b.inner.socket.recv_from(&mut buf),
        )
        .await;
        assert!(received.is_err(), "disabled transport leaked a packet");
        Ok(())
    }

    #[tokio::test]
    async fn test_udp_keepalive_ignored() -> Result<()> {
        let a = UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;
        let b = UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;

        let (sender, mut receiver) = unbounded_channel();
        let b_serve = b.clone();
        tokio::spawn(async move { b_serve.serve_loop(sender).await });

        let dest = b.get_addr().get_socketaddr()?;
        a.inner.socket.send_to(KEEPALIVE_REQUEST, dest).await?;

        let raw = "OPTIONS sip:b@127.0.0.1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK-ka\r\n\
             Call-ID: ka\r\nFrom: <sip:a@x>;tag=1\r\nTo: <sip:b@x>\r\n\
             CSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n";
        a.send(SipMessage::try_from(raw)?, Some(b.get_addr())).await?;

        // the keep-alive is swallowed; the first event is the OPTIONS
        match receiver.recv().await {
            Some(TransportEvent::Incoming(SipMessage::Request(req), _, _)) => {
                assert_eq!(req.method, rsip::Method::Options);
            }
            _ => panic!("expected OPTIONS request"),
        }
        Ok(())
    }
}
