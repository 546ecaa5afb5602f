//! An embeddable SIP user-agent stack.
//!
//! `sipbridge` terminates SIP signalling on top of the [`rsip`] message
//! model. It provides, bottom up:
//!
//! * [`transport`] — UDP/TCP/TLS connections behind one [`transport::SipConnection`]
//!   type, plus the [`transport::TransportLayer`] that resolves outbound
//!   targets and pools streaming connections
//! * [`transaction`] — the four RFC 3261 section 17 transaction state
//!   machines and the [`transaction::Endpoint`] that routes messages
//!   between transports, transactions and the transaction user
//! * [`dialog`] — INVITE dialogs (initiating and accepting), the dialog
//!   tables, digest authentication and registrar bindings
//! * [`b2bua`] — a back-to-back user agent that bridges an accepting
//!   dialog with an initiating dialog and rewrites traffic between them
//!
//! Media never passes through this crate; SDP offers and answers travel
//! as opaque bodies.
//!
//! # Example
//!
//! ```rust,no_run
//! use sipbridge::transaction::endpoint::EndpointBuilder;
//! use sipbridge::transport::{udp::UdpConnection, TransportLayer};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> sipbridge::Result<()> {
//! let token = CancellationToken::new();
//! let transport_layer = TransportLayer::new(token.child_token());
//! let udp = UdpConnection::create_connection("127.0.0.1:5060".parse()?, None, None).await?;
//! transport_layer.add_transport(udp.into());
//!
//! let endpoint = EndpointBuilder::new()
//!     .with_cancel_token(token)
//!     .with_transport_layer(transport_layer)
//!     .build();
//!
//! let _incoming = endpoint.incoming_transactions()?;
//! tokio::select! {
//!     _ = endpoint.serve() => {}
//! }
//! # Ok(())
//! # }
//! ```

pub mod b2bua;
pub mod dialog;
mod error;
pub mod rsip_ext;
pub mod transaction;
pub mod transport;

pub use error::Error;
pub use transaction::endpoint::EndpointBuilder;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Pop the first header matching the given variant from a header list.
#[macro_export]
macro_rules! header_pop {
    ($headers:expr, $header:path) => {
        let position = $headers.iter().position(|h| matches!(h, $header(_)));
        if let Some(position) = position {
            let mut headers = $headers.iter().cloned().collect::<Vec<_>>();
            headers.remove(position);
            $headers = headers.into();
        }
    };
}
