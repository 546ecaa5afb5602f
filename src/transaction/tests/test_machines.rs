use super::{spawn_serve, target_uri, test_endpoint};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use crate::transaction::TransactionState;
use crate::Result;
use rsip::prelude::HeadersExt;
use rsip::{Method, SipMessage, StatusCode, StatusCodeKind};
use std::time::Duration;
use tokio::time::timeout;

fn build_request(
    endpoint: &crate::transaction::Endpoint,
    method: Method,
    target: &str,
    seq: u32,
) -> Result<rsip::Request> {
    let via = endpoint.inner.get_via(None, None)?;
    let from = rsip::typed::From {
        display_name: None,
        uri: rsip::Uri::try_from("sip:alice@example.com")?,
        params: vec![],
    }
    .with_tag(crate::transaction::make_tag().into());
    let to = rsip::typed::To {
        display_name: None,
        uri: rsip::Uri::try_from(target)?,
        params: vec![],
    };
    let mut request =
        endpoint
            .inner
            .make_request(method, rsip::Uri::try_from(target)?, via, from, to, seq);
    request.headers.unique_push(rsip::Header::Contact(
        rsip::typed::Contact {
            display_name: None,
            uri: rsip::Uri::try_from("sip:alice@127.0.0.1:5060")?,
            params: vec![],
        }
        .into(),
    ));
    Ok(request)
}

#[tokio::test]
async fn test_non_invite_round_trip() -> Result<()> {
    let (uac, _) = test_endpoint(Duration::from_millis(100)).await?;
    let (uas, uas_addr) = test_endpoint(Duration::from_millis(100)).await?;
    let mut incoming = uas.incoming_transactions()?;
    spawn_serve(&uac);
    spawn_serve(&uas);

    tokio::spawn(async move {
        while let Some(mut tx) = incoming.recv().await {
            tx.reply(StatusCode::OK).await.ok();
        }
    });

    let request = build_request(&uac, Method::Message, &target_uri(&uas_addr), 1)?;
    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
    let mut tx = Transaction::new_client(key, request, uac.inner.clone(), None);
    tx.send().await?;

    let final_response = timeout(Duration::from_secs(5), async {
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                if resp.status_code.kind() != StatusCodeKind::Provisional {
                    return Some(resp);
                }
            }
        }
        None
    })
    .await
    .expect("final response in time")
    .expect("a final response");

    assert_eq!(final_response.status_code, StatusCode::OK);
    assert!(matches!(
        tx.state,
        TransactionState::Completed | TransactionState::Terminated
    ));
    Ok(())
}

/// An unanswered INVITE over lossy UDP retransmits with doubling
/// intervals and gives up with a synthesized 408; no ACK ever goes out.
#[tokio::test]
async fn test_invite_retransmits_then_times_out() -> Result<()> {
    let t1 = Duration::from_millis(25);
    let (uac, _) = test_endpoint(t1).await?;
    spawn_serve(&uac);

    // a black hole that counts what it swallows
    let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    let peer_addr = peer.local_addr()?;
    let (count_tx, mut count_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((len, _)) = peer.recv_from(&mut buf).await {
            let text = String::from_utf8_lossy(&buf[..len]).to_string();
            count_tx.send(text).ok();
        }
    });

    let request = build_request(
        &uac,
        Method::Invite,
        &format!("sip:bob@{}", peer_addr),
        1,
    )?;
    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
    let mut tx = Transaction::new_client(key, request, uac.inner.clone(), None);
    tx.send().await?;

    // 64*T1 = 1.6s at T1=25ms
    let final_response = timeout(Duration::from_secs(5), async {
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                if resp.status_code.kind() != StatusCodeKind::Provisional {
                    return Some(resp);
                }
            }
        }
        None
    })
    .await
    .expect("timeout verdict in time")
    .expect("synthesized final");

    assert_eq!(final_response.status_code, StatusCode::RequestTimeout);
    assert_eq!(tx.state, TransactionState::Terminated);
    assert!(tx.last_ack.is_none());

    let mut copies = 0;
    while let Ok(text) = count_rx.try_recv() {
        assert!(text.starts_with("INVITE "), "unexpected message: {}", text);
        copies += 1;
    }
    // fired at 0, 25, 75, 175, 375, 775, 1575ms
    assert!(copies >= 4, "only {} retransmits observed", copies);
    Ok(())
}

/// A rejected INVITE: the UAC hears 100 then the final, acknowledges it
/// inside the transaction, and the UAS transaction surfaces that ACK.
#[tokio::test]
async fn test_invite_rejection_is_acknowledged() -> Result<()> {
    let (uac, _) = test_endpoint(Duration::from_millis(50)).await?;
    let (uas, uas_addr) = test_endpoint(Duration::from_millis(50)).await?;
    let mut incoming = uas.incoming_transactions()?;
    spawn_serve(&uac);
    spawn_serve(&uas);

    let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if let Some(mut tx) = incoming.recv().await {
            tx.reply(StatusCode::BusyHere).await.ok();
            while let Some(msg) = tx.receive().await {
                if let SipMessage::Request(req) = msg {
                    if req.method == Method::Ack {
                        ack_tx.send(req).ok();
                        break;
                    }
                }
            }
        }
    });

    let request = build_request(&uac, Method::Invite, &target_uri(&uas_addr), 7)?;
    let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
    let mut tx = Transaction::new_client(key, request, uac.inner.clone(), None);
    tx.send().await?;

    let mut saw_trying = false;
    let final_response = timeout(Duration::from_secs(5), async {
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                match resp.status_code.kind() {
                    StatusCodeKind::Provisional => saw_trying = true,
                    _ => return Some(resp),
                }
            }
        }
        None
    })
    .await
    .expect("final in time")
    .expect("a final response");

    // the server transaction answered 100 on its own before our 486
    assert!(saw_trying);
    assert_eq!(final_response.status_code, StatusCode::BusyHere);
    assert!(tx.last_ack.is_some());

    let ack = timeout(Duration::from_secs(5), ack_rx)
        .await
        .expect("ack in time")
        .expect("uas saw the ack");
    assert_eq!(ack.cseq_header()?.seq()?, 7);
    Ok(())
}

/// Request retransmits are absorbed by the server transaction: the reply
/// is repeated, the transaction user sees the request once.
#[tokio::test]
async fn test_server_absorbs_retransmits() -> Result<()> {
    let (uas, uas_addr) = test_endpoint(Duration::from_millis(50)).await?;
    let mut incoming = uas.incoming_transactions()?;
    spawn_serve(&uas);

    let delivered = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counted = delivered.clone();
    tokio::spawn(async move {
        while let Some(mut tx) = incoming.recv().await {
            counted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tx.reply(StatusCode::OK).await.ok();
            // keep absorbing until the machine ages out
            while tx.receive().await.is_some() {}
        }
    });

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    let raw = format!(
        "OPTIONS {} SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK-absorb\r\n\
         Call-ID: absorb-test\r\nFrom: <sip:a@x>;tag=1\r\nTo: <sip:b@x>\r\n\
         CSeq: 1 OPTIONS\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n",
        target_uri(&uas_addr)
    );
    let destination = uas_addr.get_socketaddr()?;
    for _ in 0..3 {
        socket.send_to(raw.as_bytes(), destination).await?;
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    // every copy gets an answer, the transaction user only one request
    let mut buf = vec![0u8; 65535];
    let mut answers = 0;
    while let Ok(Ok((len, _))) =
        timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await
    {
        let text = String::from_utf8_lossy(&buf[..len]);
        assert!(text.starts_with("SIP/2.0 200"));
        answers += 1;
    }
    assert!(answers >= 2, "only {} answers observed", answers);
    assert_eq!(delivered.load(std::sync::atomic::Ordering::SeqCst), 1);
    Ok(())
}
