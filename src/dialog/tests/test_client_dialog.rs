//! Client dialog unit tests: construction, sequence handling and state
//! transitions without any network involved.

use crate::dialog::{
    client_dialog::ClientInviteDialog,
    dialog::{CloseReason, DialogInner, DialogState},
    DialogId,
};
use crate::transaction::{endpoint::EndpointBuilder, key::TransactionRole};
use crate::transport::TransportLayer;
use crate::Result;
use rsip::headers::*;
use rsip::{Request, Uri};
use std::sync::Arc;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;

async fn create_test_endpoint() -> Result<crate::transaction::Endpoint> {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());
    let endpoint = EndpointBuilder::new()
        .with_user_agent("sipbridge-test")
        .with_transport_layer(transport_layer)
        .build();
    Ok(endpoint)
}

fn create_invite_request(from_tag: &str, to_tag: &str, call_id: &str) -> Request {
    let to = match to_tag.is_empty() {
        true => "Bob <sip:bob@example.com>".to_string(),
        false => format!("Bob <sip:bob@example.com>;tag={}", to_tag),
    };
    Request {
        method: rsip::Method::Invite,
        uri: Uri::try_from("sip:bob@example.com:5060").unwrap(),
        headers: vec![
            Via::new("SIP/2.0/UDP alice.example.com:5060;branch=z9hG4bK-nashds").into(),
            CSeq::new("100 INVITE").into(),
            From::new(format!("Alice <sip:alice@example.com>;tag={}", from_tag)).into(),
            To::new(to).into(),
            CallId::new(call_id).into(),
            Contact::new("<sip:alice@alice.example.com:5060>").into(),
            MaxForwards::new("70").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: b"v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n".to_vec(),
    }
}

fn create_client_dialog(
    endpoint: &crate::transaction::Endpoint,
    call_id: &str,
    to_tag: &str,
) -> Result<ClientInviteDialog> {
    let (state_sender, mut state_receiver) = unbounded_channel();
    tokio::spawn(async move { while state_receiver.recv().await.is_some() {} });

    let dialog_id = DialogId {
        call_id: call_id.to_string(),
        from_tag: "alice-tag".to_string(),
        to_tag: to_tag.to_string(),
    };
    let invite = create_invite_request("alice-tag", to_tag, call_id);
    let inner = DialogInner::new(
        TransactionRole::Client,
        dialog_id,
        invite,
        endpoint.inner.clone(),
        state_sender,
        None,
        Some(Uri::try_from("sip:alice@alice.example.com:5060").unwrap()),
    )?;
    Ok(ClientInviteDialog {
        inner: Arc::new(inner),
    })
}

#[tokio::test]
async fn test_client_dialog_creation() -> Result<()> {
    let endpoint = create_test_endpoint().await?;
    let dialog = create_client_dialog(&endpoint, "test-call-id", "bob-tag")?;

    assert_eq!(dialog.id().call_id, "test-call-id");
    assert!(!dialog.inner.is_confirmed());
    assert!(matches!(
        *dialog.inner.state.lock().unwrap(),
        DialogState::Waiting(_)
    ));
    Ok(())
}

#[tokio::test]
async fn test_client_dialog_sequence_handling() -> Result<()> {
    let endpoint = create_test_endpoint().await?;
    let dialog = create_client_dialog(&endpoint, "test-call-seq", "bob-tag")?;

    // the INVITE's number seeds the local space and is pinned for the ACK
    assert_eq!(dialog.inner.get_local_seq(), 100);
    assert_eq!(dialog.inner.increment_local_seq(), 101);
    assert_eq!(
        dialog
            .inner
            .invite_seq
            .load(std::sync::atomic::Ordering::Relaxed),
        100
    );
    Ok(())
}

#[tokio::test]
async fn test_remote_sequence_ordering() -> Result<()> {
    let endpoint = create_test_endpoint().await?;
    let dialog = create_client_dialog(&endpoint, "test-call-order", "bob-tag")?;

    // unassigned: the first value initializes the high-water mark
    assert!(dialog.inner.validate_remote_seq(7));
    // below the mark is refused and leaves it untouched
    assert!(!dialog.inner.validate_remote_seq(5));
    assert_eq!(
        dialog
            .inner
            .remote_seq
            .load(std::sync::atomic::Ordering::Relaxed),
        7
    );
    // equal and above pass
    assert!(dialog.inner.validate_remote_seq(7));
    assert!(dialog.inner.validate_remote_seq(9));
    Ok(())
}

#[tokio::test]
async fn test_client_dialog_state_transitions() -> Result<()> {
    let endpoint = create_test_endpoint().await?;
    let dialog = create_client_dialog(&endpoint, "test-call-flow", "")?;
    let id = dialog.id();

    assert!(matches!(
        *dialog.inner.state.lock().unwrap(),
        DialogState::Waiting(_)
    ));

    dialog
        .inner
        .transition(DialogState::Early(id.clone(), None))?;
    assert!(matches!(
        *dialog.inner.state.lock().unwrap(),
        DialogState::Early(_, _)
    ));

    dialog.inner.transition(DialogState::Confirmed(id.clone()))?;
    assert!(dialog.inner.is_confirmed());

    dialog
        .inner
        .transition(DialogState::Closed(id.clone(), CloseReason::LocalBye))?;
    assert!(dialog.inner.is_closed());

    // closed is terminal; nothing reopens the dialog
    dialog.inner.transition(DialogState::Confirmed(id))?;
    assert!(dialog.inner.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_full_id_stable_after_confirmation() -> Result<()> {
    let endpoint = create_test_endpoint().await?;
    let dialog = create_client_dialog(&endpoint, "test-call-id-stable", "")?;

    dialog.inner.update_remote_tag("bob-tag")?;
    let confirmed_id = dialog.id();
    assert!(confirmed_id.is_complete());

    // any later in-dialog request must compute the same id
    let request = dialog
        .inner
        .make_request(rsip::Method::Message, None, None, None, None)?;
    let derived = DialogId::try_from(&request)?;
    // requests we send carry our tag in From and theirs in To, the same
    // orientation the INVITE established
    assert_eq!(derived.call_id, confirmed_id.call_id);
    assert_eq!(derived.from_tag, confirmed_id.from_tag);
    assert_eq!(derived.to_tag, confirmed_id.to_tag);
    Ok(())
}

#[tokio::test]
async fn test_early_keys_distinguish_roles() -> Result<()> {
    let id = DialogId {
        call_id: "shared-call".to_string(),
        from_tag: "caller-tag".to_string(),
        to_tag: String::new(),
    };
    // both halves of one call in one process must not collide
    assert_ne!(id.early_initiating_key(), id.early_accepting_key());
    assert!(id.early_initiating_key().starts_with("i:"));
    assert!(id.early_accepting_key().starts_with("a:"));
    Ok(())
}
