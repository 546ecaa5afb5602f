//! Transports move framed SIP messages between this endpoint and a remote
//! binding. Each concrete transport ([`udp::UdpConnection`],
//! [`tcp::TcpConnection`], TLS behind the `rustls` feature) is wrapped in
//! the [`SipConnection`] enum; received messages are pushed to the
//! endpoint through a [`TransportSender`] together with their source
//! address and the connection they arrived on.

use crate::{Error, Result};
use rsip::prelude::{ToTypedHeader, UntypedHeader};
use rsip::{Header, HostWithPort, Param, SipMessage};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod layer;
pub mod stream;
pub mod tcp;
#[cfg(feature = "rustls")]
pub mod tls;
pub mod udp;

pub use layer::TransportLayer;

/// Double CRLF, sent by peers as a connection keep-alive probe.
pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
/// Single CRLF, the expected answer to a keep-alive probe.
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// Maximum bytes a streaming receiver accepts for the header section.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;
/// Maximum bytes a streaming receiver accepts for a message body.
pub const MAX_BODY_BYTES: usize = 128 * 1024;

/// A remote or local SIP binding: transport type plus host and port.
#[derive(Clone, Debug)]
pub struct SipAddr {
    pub r#type: Option<rsip::Transport>,
    pub addr: HostWithPort,
}

impl SipAddr {
    pub fn new(r#type: rsip::Transport, addr: HostWithPort) -> Self {
        SipAddr {
            r#type: Some(r#type),
            addr,
        }
    }

    /// The binding as a socket address; fails when the host is a domain
    /// that still needs resolving.
    pub fn get_socketaddr(&self) -> Result<SocketAddr> {
        let port = self.addr.port.as_ref().map(|p| *p.value()).unwrap_or(5060);
        match &self.addr.host {
            rsip::Host::IpAddr(ip) => Ok(SocketAddr::new(*ip, port)),
            rsip::Host::Domain(domain) => Err(Error::Error(format!(
                "unresolved domain in binding: {}",
                domain
            ))),
        }
    }
}

impl std::fmt::Display for SipAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.r#type {
            Some(t) => write!(f, "{}://{}", t, self.addr),
            None => write!(f, "{}", self.addr),
        }
    }
}

impl PartialEq for SipAddr {
    fn eq(&self, other: &Self) -> bool {
        self.r#type == other.r#type && self.addr.to_string() == other.addr.to_string()
    }
}
impl Eq for SipAddr {}

impl Hash for SipAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.r#type.map(|t| t.to_string()).hash(state);
        self.addr.to_string().hash(state);
    }
}

impl From<HostWithPort> for SipAddr {
    fn from(addr: HostWithPort) -> Self {
        SipAddr { r#type: None, addr }
    }
}

impl From<SocketAddr> for SipAddr {
    fn from(addr: SocketAddr) -> Self {
        SipAddr {
            r#type: None,
            addr: HostWithPort {
                host: addr.ip().into(),
                port: Some(addr.port().into()),
            },
        }
    }
}

impl From<SipAddr> for HostWithPort {
    fn from(addr: SipAddr) -> Self {
        addr.addr
    }
}

/// Classify a send-time I/O failure: peers that actively refuse are
/// reported apart from timeouts so the transaction layer can tell a dead
/// host from a slow one.
pub(crate) fn describe_send_error(e: &std::io::Error) -> String {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable => format!("rejected: {}", e),
        ErrorKind::TimedOut => format!("timed out: {}", e),
        _ => format!("send failed: {}", e),
    }
}

/// Events a transport reports to the endpoint.
pub enum TransportEvent {
    /// A framed message arrived: message, connection, source binding.
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportSender = UnboundedSender<TransportEvent>;
pub type TransportReceiver = UnboundedReceiver<TransportEvent>;

/// One live transport, shared by cloning.
#[derive(Clone)]
pub enum SipConnection {
    Udp(udp::UdpConnection),
    Tcp(tcp::TcpConnection),
    TcpListener(tcp::TcpListenerConnection),
    #[cfg(feature = "rustls")]
    Tls(tls::TlsConnection),
    #[cfg(feature = "rustls")]
    TlsListener(tls::TlsListenerConnection),
}

impl SipConnection {
    pub fn is_streaming(&self) -> bool {
        !matches!(self, SipConnection::Udp(_))
    }

    pub fn the_type(&self) -> rsip::Transport {
        match self {
            SipConnection::Udp(_) => rsip::Transport::Udp,
            SipConnection::Tcp(_) | SipConnection::TcpListener(_) => rsip::Transport::Tcp,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(_) | SipConnection::TlsListener(_) => rsip::Transport::Tls,
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Udp(c) => c.get_addr(),
            SipConnection::Tcp(c) => c.get_addr(),
            SipConnection::TcpListener(c) => c.get_addr(),
            #[cfg(feature = "rustls")]
            SipConnection::Tls(c) => c.get_addr(),
            #[cfg(feature = "rustls")]
            SipConnection::TlsListener(c) => c.get_addr(),
        }
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(c) => c.send(msg, destination).await,
            SipConnection::Tcp(c) => c.send(msg).await,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(c) => c.send(msg).await,
            listener => Err(Error::TransportLayerError(
                "cannot send on a listening socket".to_string(),
                listener.get_addr().clone(),
            )),
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Udp(c) => c.serve_loop(sender).await,
            SipConnection::Tcp(c) => c.serve_loop(sender).await,
            SipConnection::TcpListener(c) => c.serve_loop(sender).await,
            #[cfg(feature = "rustls")]
            SipConnection::Tls(c) => c.serve_loop(sender).await,
            #[cfg(feature = "rustls")]
            SipConnection::TlsListener(c) => c.serve_loop(sender).await,
        }
    }

    /// Test hook: silently swallow everything sent or received.
    pub fn disable(&self, disabled: bool) {
        match self {
            SipConnection::Udp(c) => c.disable(disabled),
            SipConnection::Tcp(c) => c.disable(disabled),
            #[cfg(feature = "rustls")]
            SipConnection::Tls(c) => c.disable(disabled),
            _ => {}
        }
    }

    pub fn close(&self) {
        match self {
            SipConnection::Udp(c) => c.close(),
            SipConnection::Tcp(c) => c.close(),
            SipConnection::TcpListener(c) => c.close(),
            #[cfg(feature = "rustls")]
            SipConnection::Tls(c) => c.close(),
            #[cfg(feature = "rustls")]
            SipConnection::TlsListener(c) => c.close(),
        }
    }
}

impl std::fmt::Display for SipConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get_addr())
    }
}

impl std::fmt::Debug for SipConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl From<udp::UdpConnection> for SipConnection {
    fn from(c: udp::UdpConnection) -> Self {
        SipConnection::Udp(c)
    }
}
impl From<tcp::TcpConnection> for SipConnection {
    fn from(c: tcp::TcpConnection) -> Self {
        SipConnection::Tcp(c)
    }
}
impl From<tcp::TcpListenerConnection> for SipConnection {
    fn from(c: tcp::TcpListenerConnection) -> Self {
        SipConnection::TcpListener(c)
    }
}
#[cfg(feature = "rustls")]
impl From<tls::TlsConnection> for SipConnection {
    fn from(c: tls::TlsConnection) -> Self {
        SipConnection::Tls(c)
    }
}
#[cfg(feature = "rustls")]
impl From<tls::TlsListenerConnection> for SipConnection {
    fn from(c: tls::TlsListenerConnection) -> Self {
        SipConnection::TlsListener(c)
    }
}

impl SipConnection {
    /// Stamp the top Via of a received request with `received`/`rport`.
    ///
    /// `received` is added when the advertised sent-by is a domain or
    /// differs from the packet source; an empty `rport` is filled with the
    /// source port (RFC 3581).
    pub fn update_msg_received(msg: SipMessage, source: SocketAddr) -> Result<SipMessage> {
        let mut request = match msg {
            SipMessage::Request(request) => request,
            response => return Ok(response),
        };

        let mut patched: Vec<Header> = Vec::new();
        let mut done = false;
        for header in request.headers.iter() {
            match header {
                Header::Via(via) if !done => {
                    done = true;
                    let mut typed = via.clone().typed()?;
                    let sent_by_matches = match &typed.uri.host_with_port.host {
                        rsip::Host::IpAddr(ip) => *ip == source.ip(),
                        rsip::Host::Domain(_) => false,
                    };
                    if !sent_by_matches {
                        typed
                            .params
                            .retain(|p| !matches!(p, Param::Received(_)));
                        typed
                            .params
                            .push(Param::Received(source.ip().to_string().into()));
                    }
                    let wants_rport = typed.params.iter().any(|p| {
                        matches!(p, Param::Other(key, None)
                            if key.value().eq_ignore_ascii_case("rport"))
                    });
                    if wants_rport {
                        typed.params.retain(|p| {
                            !matches!(p, Param::Other(key, _)
                                if key.value().eq_ignore_ascii_case("rport"))
                        });
                        typed.params.push(Param::Other(
                            "rport".into(),
                            Some(source.port().to_string().into()),
                        ));
                    }
                    patched.push(Header::Via(typed.into()));
                }
                other => patched.push(other.clone()),
            }
        }
        request.headers = patched.into();
        Ok(SipMessage::Request(request))
    }

    /// Where a response to this request must be sent (RFC 3261 18.2.2):
    /// `maddr` when present, else `received` with `rport`, else sent-by.
    pub fn response_destination(via: &rsip::typed::Via) -> SipAddr {
        let mut host: Option<rsip::Host> = None;
        let mut port: Option<u16> = None;
        for param in &via.params {
            match param {
                Param::Maddr(maddr) => {
                    if let Ok(ip) = maddr.value().parse::<IpAddr>() {
                        host = Some(ip.into());
                    }
                }
                Param::Received(received) => {
                    if host.is_none() {
                        if let Ok(ip) = received.value().parse::<IpAddr>() {
                            host = Some(ip.into());
                        }
                    }
                }
                Param::Other(key, Some(value))
                    if key.value().eq_ignore_ascii_case("rport") =>
                {
                    port = value.value().parse().ok();
                }
                _ => {}
            }
        }
        let addr = HostWithPort {
            host: host.unwrap_or_else(|| via.uri.host_with_port.host.clone()),
            port: port
                .map(Into::into)
                .or_else(|| via.uri.host_with_port.port.clone()),
        };
        SipAddr {
            r#type: Some(via.transport),
            addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_msg_received() -> Result<()> {
        let raw = "INVITE sip:bob@example.com SIP/2.0\r\n\
                   Via: SIP/2.0/UDP client.example.com:5060;branch=z9hG4bK-1;rport\r\n\
                   Call-ID: a\r\nFrom: <sip:a@x>;tag=1\r\nTo: <sip:b@x>\r\n\
                   CSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n";
        let msg = SipMessage::try_from(raw)?;
        let source: SocketAddr = "192.0.2.9:40000".parse().unwrap();
        let patched = SipConnection::update_msg_received(msg, source)?;
        let text = patched.to_string();
        assert!(text.contains("received=192.0.2.9"));
        assert!(text.contains("rport=40000"));
        Ok(())
    }

    #[test]
    fn test_response_destination_prefers_received() -> Result<()> {
        let via = rsip::headers::Via::new(
            "SIP/2.0/UDP host.example.com:5060;branch=z9hG4bK-x;received=198.51.100.4;rport=5099",
        )
        .typed()?;
        let dest = SipConnection::response_destination(&via);
        assert_eq!(dest.addr.to_string(), "198.51.100.4:5099");
        assert_eq!(dest.r#type, Some(rsip::Transport::Udp));
        Ok(())
    }
}
