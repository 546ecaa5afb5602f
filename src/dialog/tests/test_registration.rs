//! Registration against a scripted registrar: a proxy challenge followed
//! by a user-agent challenge, then success.

use crate::dialog::authenticate::Credential;
use crate::dialog::registration::Registration;
use crate::transaction::tests::{spawn_serve, test_endpoint};
use crate::Result;
use rsip::prelude::HeadersExt;
use rsip::{Header, StatusCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// 407 with nonce N1, then 401 with nonce N2, then 200 Expires 3600.
/// The third REGISTER must carry both authorization headers.
#[tokio::test]
async fn test_register_through_challenge_chain() -> Result<()> {
    let (registrar, registrar_addr) = test_endpoint(Duration::from_millis(50)).await?;
    let mut incoming = registrar.incoming_transactions()?;
    spawn_serve(&registrar);

    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = attempts.clone();
    tokio::spawn(async move {
        while let Some(mut tx) = incoming.recv().await {
            let attempt = seen.fetch_add(1, Ordering::SeqCst);
            match attempt {
                0 => {
                    let challenge = Header::ProxyAuthenticate(
                        "Digest realm=\"proxy.example.com\", nonce=\"N1\", algorithm=MD5"
                            .to_string()
                            .into(),
                    );
                    tx.reply_with(
                        StatusCode::ProxyAuthenticationRequired,
                        vec![challenge],
                        None,
                    )
                    .await
                    .ok();
                }
                1 => {
                    let has_proxy_auth = tx
                        .original
                        .headers
                        .iter()
                        .any(|h| matches!(h, Header::ProxyAuthorization(_)));
                    assert!(has_proxy_auth, "second register lacks proxy authorization");
                    let challenge = Header::WwwAuthenticate(
                        "Digest realm=\"uas.example.com\", nonce=\"N2\", algorithm=MD5"
                            .to_string()
                            .into(),
                    );
                    tx.reply_with(StatusCode::Unauthorized, vec![challenge], None)
                        .await
                        .ok();
                }
                _ => {
                    let has_proxy_auth = tx
                        .original
                        .headers
                        .iter()
                        .any(|h| matches!(h, Header::ProxyAuthorization(_)));
                    let has_auth = tx
                        .original
                        .headers
                        .iter()
                        .any(|h| matches!(h, Header::Authorization(_)));
                    assert!(
                        has_proxy_auth && has_auth,
                        "final register must answer both challenges"
                    );
                    tx.reply_with(
                        StatusCode::OK,
                        vec![Header::Expires("3600".to_string().into())],
                        None,
                    )
                    .await
                    .ok();
                }
            }
        }
    });

    let (client, _) = test_endpoint(Duration::from_millis(50)).await?;
    spawn_serve(&client);

    let credential = Credential {
        username: "alice".to_string(),
        password: "secret".to_string(),
        realm: None,
    };
    let mut registration = Registration::new(client.inner.clone(), Some(credential));
    let server = rsip::Uri::try_from(format!("sip:{}", registrar_addr.addr))?;

    let response = timeout(Duration::from_secs(5), registration.register(&server))
        .await
        .expect("registration settles in time")?;

    assert_eq!(response.status_code, StatusCode::OK);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // the refresh loop schedules at 90% of what was granted
    let granted = Registration::granted_expires(&response).expect("expires granted");
    assert_eq!(granted, 3600);
    assert_eq!(granted * 9 / 10, 3240);
    Ok(())
}

/// A credential pinned to its home realm answers a matching challenge
/// and refuses a foreign one outright.
#[tokio::test]
async fn test_realm_scoped_credential() -> Result<()> {
    let (registrar, registrar_addr) = test_endpoint(Duration::from_millis(50)).await?;
    let mut incoming = registrar.incoming_transactions()?;
    spawn_serve(&registrar);

    tokio::spawn(async move {
        while let Some(mut tx) = incoming.recv().await {
            let answered = tx
                .original
                .headers
                .iter()
                .any(|h| matches!(h, Header::Authorization(_)));
            if answered {
                tx.reply_with(
                    StatusCode::OK,
                    vec![Header::Expires("60".to_string().into())],
                    None,
                )
                .await
                .ok();
            } else {
                let challenge = Header::WwwAuthenticate(
                    "Digest realm=\"home.example.com\", nonce=\"N5\", algorithm=MD5"
                        .to_string()
                        .into(),
                );
                tx.reply_with(StatusCode::Unauthorized, vec![challenge], None)
                    .await
                    .ok();
            }
        }
    });

    let (client, _) = test_endpoint(Duration::from_millis(50)).await?;
    spawn_serve(&client);
    let server = rsip::Uri::try_from(format!("sip:{}", registrar_addr.addr))?;

    // pinned to the realm the registrar names: the challenge is answered
    let credential = Credential {
        username: "alice".to_string(),
        password: "secret".to_string(),
        realm: Some("home.example.com".to_string()),
    };
    let mut registration = Registration::new(client.inner.clone(), Some(credential));
    let response = timeout(Duration::from_secs(5), registration.register(&server))
        .await
        .expect("registration settles in time")?;
    assert_eq!(response.status_code, StatusCode::OK);

    // pinned elsewhere: the foreign challenge is refused, not answered
    let foreign = Credential {
        username: "alice".to_string(),
        password: "secret".to_string(),
        realm: Some("other.example.net".to_string()),
    };
    let mut registration = Registration::new(client.inner.clone(), Some(foreign));
    let outcome = timeout(Duration::from_secs(5), registration.register(&server))
        .await
        .expect("refusal settles in time");
    assert!(outcome.is_err(), "foreign-realm challenge must not be answered");
    Ok(())
}

/// The bare request API answers a challenge once and surfaces a repeat
/// of the same kind.
#[tokio::test]
async fn test_request_with_auth_single_retry_per_kind() -> Result<()> {
    use crate::dialog::authenticate::request_with_auth;

    let (uas, uas_addr) = test_endpoint(Duration::from_millis(50)).await?;
    let mut incoming = uas.incoming_transactions()?;
    spawn_serve(&uas);

    // a server that never stops asking
    tokio::spawn(async move {
        while let Some(mut tx) = incoming.recv().await {
            let challenge = Header::WwwAuthenticate(
                "Digest realm=\"stubborn.example.com\", nonce=\"N9\", algorithm=MD5"
                    .to_string()
                    .into(),
            );
            tx.reply_with(StatusCode::Unauthorized, vec![challenge], None)
                .await
                .ok();
        }
    });

    let (client, _) = test_endpoint(Duration::from_millis(50)).await?;
    spawn_serve(&client);

    let via = client.inner.get_via(None, None)?;
    let from = rsip::typed::From {
        display_name: None,
        uri: rsip::Uri::try_from("sip:alice@example.com")?,
        params: vec![],
    }
    .with_tag(crate::transaction::make_tag().into());
    let to = rsip::typed::To {
        display_name: None,
        uri: rsip::Uri::try_from(format!("sip:bob@{}", uas_addr.addr))?,
        params: vec![],
    };
    let request = client.inner.make_request(
        rsip::Method::Options,
        rsip::Uri::try_from(format!("sip:bob@{}", uas_addr.addr))?,
        via,
        from,
        to,
        41,
    );

    let credential = Credential {
        username: "alice".to_string(),
        password: "secret".to_string(),
        realm: None,
    };
    let result = timeout(
        Duration::from_secs(5),
        request_with_auth(client.inner.clone(), request, Some(&credential)),
    )
    .await
    .expect("request settles")?;

    // answered once, then the second 401 came straight through
    assert_eq!(result.status, StatusCode::Unauthorized);
    assert!(result.response.is_some());
    Ok(())
}

/// A refresh keeps the Call-ID stable and the CSeq climbing.
#[tokio::test]
async fn test_refresh_reuses_call_id() -> Result<()> {
    let (registrar, registrar_addr) = test_endpoint(Duration::from_millis(50)).await?;
    let mut incoming = registrar.incoming_transactions()?;
    spawn_serve(&registrar);

    let (meta_tx, mut meta_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(mut tx) = incoming.recv().await {
            let call_id = tx
                .original
                .call_id_header()
                .map(|c| c.to_string())
                .unwrap_or_default();
            let cseq = tx.original.cseq_header().and_then(|c| c.seq()).unwrap_or(0);
            meta_tx.send((call_id, cseq)).ok();
            tx.reply_with(
                StatusCode::OK,
                vec![Header::Expires("60".to_string().into())],
                None,
            )
            .await
            .ok();
        }
    });

    let (client, _) = test_endpoint(Duration::from_millis(50)).await?;
    spawn_serve(&client);
    let mut registration = Registration::new(client.inner.clone(), None);
    let server = rsip::Uri::try_from(format!("sip:{}", registrar_addr.addr))?;

    timeout(Duration::from_secs(5), registration.register(&server))
        .await
        .expect("first register settles")?;
    timeout(Duration::from_secs(5), registration.register(&server))
        .await
        .expect("refresh settles")?;
    // removing the binding goes out with Expires: 0
    let bye_bye = timeout(Duration::from_secs(5), registration.unregister(&server))
        .await
        .expect("unregister settles")?;
    assert_eq!(bye_bye.status_code, StatusCode::OK);

    let (first_call_id, first_seq) = meta_rx.recv().await.expect("first register seen");
    let (second_call_id, second_seq) = meta_rx.recv().await.expect("refresh seen");
    let (third_call_id, third_seq) = meta_rx.recv().await.expect("unregister seen");
    assert_eq!(first_call_id, second_call_id);
    assert_eq!(second_call_id, third_call_id);
    assert!(second_seq > first_seq);
    assert!(third_seq > second_seq);
    Ok(())
}
