//! Bridge tests: a caller on one side, the scripted UAS harness on the
//! other, the bridge in the middle on its own endpoint.

use super::bridge::{B2bUa, B2bUaBuilder, InviteDecision};
use crate::dialog::dialog_layer::DialogLayer;
use crate::dialog::invitation::InviteOption;
use crate::dialog::tests::{spawn_uas, UasMode};
use crate::transaction::tests::{spawn_serve, test_endpoint};
use crate::Result;
use rsip::StatusCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::timeout;

struct TestBridge {
    addr: crate::transport::SipAddr,
    b2bua: B2bUa,
}

async fn spawn_bridge<F>(target: rsip::Uri, configure: F) -> Result<TestBridge>
where
    F: FnOnce(B2bUaBuilder) -> B2bUaBuilder,
{
    let (endpoint, addr) = test_endpoint(Duration::from_millis(50)).await?;
    let incoming = endpoint.incoming_transactions()?;
    spawn_serve(&endpoint);

    let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
    let contact = rsip::Uri::try_from(format!("sip:bridge@{}", addr.addr))?;
    let builder = B2bUaBuilder::new(dialog_layer)
        .with_contact(contact)
        .with_target(target);
    let b2bua = configure(builder).build();

    let serve = b2bua.clone();
    tokio::spawn(async move {
        serve.serve(incoming).await.ok();
    });
    Ok(TestBridge { addr, b2bua })
}

async fn call_via(
    bridge: &TestBridge,
) -> Result<(
    Arc<DialogLayer>,
    crate::dialog::client_dialog::ClientInviteDialog,
    Option<rsip::Response>,
)> {
    let (endpoint, addr) = test_endpoint(Duration::from_millis(50)).await?;
    spawn_serve(&endpoint);
    let layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));

    let (state_sender, mut state_receiver) = unbounded_channel();
    tokio::spawn(async move { while state_receiver.recv().await.is_some() {} });

    let opt = InviteOption {
        caller: rsip::Uri::try_from("sip:alice@example.com")?,
        callee: rsip::Uri::try_from(format!("sip:alice@{}", bridge.addr.addr))?,
        content_type: None,
        offer: Some(b"v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".to_vec()),
        contact: rsip::Uri::try_from(format!("sip:alice@{}", addr.addr))?,
        credential: None,
        headers: None,
    };
    let (dialog, response) = timeout(Duration::from_secs(10), layer.do_invite(opt, state_sender))
        .await
        .expect("call settles in time")?;
    Ok((layer, dialog, response))
}

/// The bridge pairs two dialogs; the caller's leg keeps its own Call-ID
/// while the far leg runs under a fresh one.
#[tokio::test]
async fn test_bridged_call_and_teardown() -> Result<()> {
    let uas = spawn_uas(UasMode::Answer(Some(b"v=0\r\nanswer".to_vec()))).await?;
    let target = rsip::Uri::try_from(format!("sip:bob@{}", uas.addr.addr))?;
    let bridge = spawn_bridge(target, |builder| builder).await?;

    let (_caller_layer, dialog, response) = call_via(&bridge).await?;
    let response = response.expect("a final response");
    assert_eq!(response.status_code, StatusCode::OK);
    assert_eq!(response.body, b"v=0\r\nanswer".to_vec());
    // non-dialog headers from the far answer cross the bridge intact
    assert!(response.to_string().contains("Supported: timer"));
    assert!(dialog.inner.is_confirmed());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(bridge.b2bua.session_count(), 1);

    let session = bridge
        .b2bua
        .find_session(&dialog.id().swapped())
        .or_else(|| bridge.b2bua.find_session(&dialog.id()))
        .expect("session exists");
    let far_id = session.initiating_id().expect("far leg established");
    // the far leg is its own dialog, not a pass-through of ours
    assert_ne!(far_id.call_id, dialog.id().call_id);

    // hang up; the bridge folds the far leg
    timeout(Duration::from_secs(5), dialog.bye())
        .await
        .expect("bye settles")?;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(bridge.b2bua.session_count(), 0);
    let far = uas.dialog_layer.get_dialog(&far_id);
    assert!(far.map(|d| d.is_closed()).unwrap_or(true));
    Ok(())
}

/// A 302 downstream is chased to the new Contact; the caller sees one
/// 200 on its original leg.
#[tokio::test]
async fn test_redirect_following() -> Result<()> {
    let real_uas = spawn_uas(UasMode::Answer(None)).await?;
    let moved = spawn_uas(UasMode::Redirect(format!(
        "sip:alice@{}",
        real_uas.addr.addr
    )))
    .await?;

    let target = rsip::Uri::try_from(format!("sip:alice@{}", moved.addr.addr))?;
    let bridge = spawn_bridge(target, |builder| builder).await?;

    let (_caller_layer, dialog, response) = call_via(&bridge).await?;
    let response = response.expect("a final response");
    assert_eq!(response.status_code, StatusCode::OK);
    assert!(dialog.inner.is_confirmed());

    // the answered leg lives on the redirect target
    tokio::time::sleep(Duration::from_millis(300)).await;
    let session = bridge
        .b2bua
        .find_session(&dialog.id())
        .expect("session exists");
    let far_id = session.initiating_id().expect("far leg established");
    assert!(real_uas.dialog_layer.get_dialog(&far_id).is_some());

    dialog.bye().await.ok();
    Ok(())
}

/// The invite hook can short-circuit the call without a far leg.
#[tokio::test]
async fn test_invite_hook_short_circuit() -> Result<()> {
    // the target does not exist; the hook answers before it matters
    let target = rsip::Uri::try_from("sip:nobody@127.0.0.1:1")?;
    let rejected = Arc::new(AtomicUsize::new(0));
    let count = rejected.clone();
    let bridge = spawn_bridge(target, move |builder| {
        builder.on_invite(Box::new(move |session, _request| {
            count.fetch_add(1, Ordering::SeqCst);
            session.set_max_redirects(0);
            let response = rsip::Response {
                status_code: StatusCode::BusyHere,
                version: rsip::Version::V2,
                headers: Default::default(),
                body: vec![],
            };
            InviteDecision::Respond(response)
        }))
    })
    .await?;

    let (_caller_layer, dialog, response) = call_via(&bridge).await?;
    let response = response.expect("a final response");
    assert_eq!(response.status_code, StatusCode::BusyHere);
    assert!(!dialog.inner.is_confirmed());
    assert_eq!(rejected.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bridge.b2bua.session_count(), 0);
    Ok(())
}

/// Redirect loops stop at the bound and surface a server error.
#[tokio::test]
async fn test_redirect_bound() -> Result<()> {
    // a UAS that redirects to itself, forever
    let (endpoint, addr) = test_endpoint(Duration::from_millis(50)).await?;
    let mut incoming = endpoint.incoming_transactions()?;
    spawn_serve(&endpoint);
    let self_uri = format!("sip:loop@{}", addr.addr);
    let loop_uri = self_uri.clone();
    tokio::spawn(async move {
        while let Some(mut tx) = incoming.recv().await {
            if tx.original.method == rsip::Method::Invite {
                let contact = rsip::Header::Contact(format!("<{}>", loop_uri).into());
                tx.reply_with(StatusCode::MovedTemporarily, vec![contact], None)
                    .await
                    .ok();
            } else {
                tx.reply(StatusCode::OK).await.ok();
            }
        }
    });

    let target = rsip::Uri::try_from(self_uri)?;
    let bridge = spawn_bridge(target, |builder| builder.with_max_redirects(2)).await?;

    let (_caller_layer, dialog, response) = call_via(&bridge).await?;
    let response = response.expect("a final response");
    assert_eq!(response.status_code, StatusCode::ServerInternalError);
    assert!(!dialog.inner.is_confirmed());
    Ok(())
}
