//! Dialog-layer tests, driven over loop-back UDP endpoints with a small
//! answering-machine harness standing in for the far side.

use crate::dialog::dialog::Dialog;
use crate::dialog::dialog_layer::DialogLayer;
use crate::transaction::tests::{spawn_serve, test_endpoint};
use crate::transport::SipAddr;
use crate::Result;
use rsip::prelude::HeadersExt;
use rsip::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;

mod test_client_dialog;
mod test_registration;

/// How the far side treats an inbound call.
#[derive(Clone)]
pub(crate) enum UasMode {
    /// 180, then 200 with this answer body.
    Answer(Option<Vec<u8>>),
    /// 180 and nothing further.
    RingOnly,
    /// 302 with this Contact, no dialog at all.
    Redirect(String),
}

pub(crate) struct TestUas {
    pub addr: SipAddr,
    pub dialog_layer: Arc<DialogLayer>,
}

/// A user agent server in a box: answers calls per `mode`, accepts BYE
/// and CANCEL through the dialog machinery, and answers in-dialog
/// MESSAGE with 200 (everything else falls through to the 501 default).
pub(crate) async fn spawn_uas(mode: UasMode) -> Result<TestUas> {
    let (endpoint, addr) = test_endpoint(Duration::from_millis(50)).await?;
    let mut incoming = endpoint.incoming_transactions()?;
    spawn_serve(&endpoint);

    let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
    let serve_layer = dialog_layer.clone();
    let contact = rsip::Uri::try_from(format!("sip:uas@{}", addr.addr))?;

    tokio::spawn(async move {
        while let Some(mut tx) = incoming.recv().await {
            let has_to_tag = tx
                .original
                .to_header()
                .ok()
                .and_then(|to| to.tag().ok())
                .flatten()
                .is_some();
            if has_to_tag {
                match serve_layer.match_dialog(&tx.original) {
                    Some(mut dialog) => {
                        tokio::spawn(async move {
                            dialog.handle(tx).await.ok();
                        });
                    }
                    None => {
                        tx.reply(StatusCode::CallTransactionDoesNotExist).await.ok();
                    }
                }
                continue;
            }
            match tx.original.method {
                rsip::Method::Invite => {
                    if let UasMode::Redirect(contact_uri) = &mode {
                        let contact_header = rsip::Header::Contact(
                            format!("<{}>", contact_uri).into(),
                        );
                        tx.reply_with(
                            StatusCode::MovedTemporarily,
                            vec![contact_header],
                            None,
                        )
                        .await
                        .ok();
                        continue;
                    }
                    let (state_sender, mut state_receiver) = unbounded_channel();
                    tokio::spawn(async move {
                        while state_receiver.recv().await.is_some() {}
                    });
                    let dialog = match serve_layer.get_or_create_server_invite(
                        &tx,
                        state_sender,
                        None,
                        Some(contact.clone()),
                    ) {
                        Ok(dialog) => dialog,
                        Err(_) => {
                            tx.reply(StatusCode::BadRequest).await.ok();
                            continue;
                        }
                    };
                    dialog.inner.set_request_hook(Arc::new(|_, request| {
                        match request.method {
                            rsip::Method::Message => Some((StatusCode::OK, None)),
                            _ => None,
                        }
                    }));
                    let mut driver = dialog.clone();
                    tokio::spawn(async move {
                        driver.handle(tx).await.ok();
                    });
                    match &mode {
                        UasMode::Answer(body) => {
                            dialog.ringing(None).ok();
                            // a non-dialog header relays verbatim across
                            // a bridge, which the bridge tests assert
                            let extras = vec![rsip::Header::Supported(
                                "timer".to_string().into(),
                            )];
                            dialog.accept(Some(extras), body.clone()).ok();
                        }
                        UasMode::RingOnly => {
                            dialog.ringing(None).ok();
                        }
                        UasMode::Redirect(_) => unreachable!(),
                    }
                }
                rsip::Method::Cancel | rsip::Method::Ack => {
                    match serve_layer.match_dialog(&tx.original) {
                        Some(mut dialog) => {
                            tokio::spawn(async move {
                                dialog.handle(tx).await.ok();
                            });
                        }
                        None => {
                            if tx.original.method == rsip::Method::Cancel {
                                tx.reply(StatusCode::CallTransactionDoesNotExist).await.ok();
                            }
                        }
                    }
                }
                _ => {
                    tx.reply(StatusCode::OK).await.ok();
                }
            }
        }
    });

    Ok(TestUas { addr, dialog_layer })
}

/// The dialog a UAS harness holds for the given id, if any.
pub(crate) fn uas_dialog(uas: &TestUas, id: &crate::dialog::DialogId) -> Option<Dialog> {
    uas.dialog_layer.get_dialog(id)
}
