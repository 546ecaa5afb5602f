//! Transaction-layer tests: matching rules and the four machines driven
//! over loop-back UDP transports.

use crate::transaction::endpoint::{Endpoint, EndpointBuilder, EndpointOption};
use crate::transport::{udp::UdpConnection, SipAddr, TransportLayer};
use crate::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod test_machines;

/// An endpoint bound to an ephemeral loop-back UDP port with fast
/// timers, plus the address peers should target.
pub(crate) async fn test_endpoint(t1: Duration) -> Result<(Endpoint, SipAddr)> {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    let udp = UdpConnection::create_connection("127.0.0.1:0".parse()?, None, None).await?;
    let addr = udp.get_addr().clone();
    transport_layer.add_transport(udp.into());

    let option = EndpointOption {
        t1,
        t1x64: t1 * 64,
        timer_interval: Duration::from_millis(5),
        ..Default::default()
    };
    let endpoint = EndpointBuilder::new()
        .with_user_agent("sipbridge-test")
        .with_cancel_token(token)
        .with_transport_layer(transport_layer)
        .with_option(option)
        .build();
    Ok((endpoint, addr))
}

pub(crate) fn spawn_serve(endpoint: &Endpoint) {
    let inner = endpoint.inner.clone();
    tokio::spawn(async move {
        inner.serve().await.ok();
    });
}

pub(crate) fn target_uri(addr: &SipAddr) -> String {
    format!("sip:test@{}", addr.addr)
}
