use super::{
    authenticate::Credential,
    client_dialog::ClientInviteDialog,
    dialog::{Dialog, DialogInner, DialogStateSender},
    dialog_layer::DialogLayer,
};
use crate::{
    dialog::DialogId,
    transaction::{
        key::{TransactionKey, TransactionRole},
        make_tag,
        transaction::Transaction,
    },
    Result,
};
use rsip::{Request, Response};
use std::sync::Arc;
use tracing::{debug, info};

/// Everything needed to originate a call.
///
/// The offer (typically SDP) travels as opaque bytes; `content_type`
/// defaults to `application/sdp`.
///
/// # Examples
///
/// ```rust,no_run
/// # use sipbridge::dialog::invitation::InviteOption;
/// # fn example() -> sipbridge::Result<()> {
/// let opt = InviteOption {
///     caller: "sip:alice@example.com".try_into()?,
///     callee: "sip:bob@example.com".try_into()?,
///     content_type: None,
///     offer: Some(b"v=0\r\n".to_vec()),
///     contact: "sip:alice@192.168.1.100:5060".try_into()?,
///     credential: None,
///     headers: None,
/// };
/// # Ok(())
/// # }
/// ```
pub struct InviteOption {
    pub caller: rsip::Uri,
    pub callee: rsip::Uri,
    pub content_type: Option<String>,
    pub offer: Option<Vec<u8>>,
    pub contact: rsip::Uri,
    pub credential: Option<Credential>,
    pub headers: Option<Vec<rsip::Header>>,
}

impl DialogLayer {
    /// Build the dialog-creating INVITE for the given options: fresh
    /// Call-ID, tagged From, tagless To, Contact and Content-Type, plus
    /// any caller-supplied headers on top.
    pub fn make_invite_request(&self, opt: &InviteOption) -> Result<Request> {
        let last_seq = self.increment_last_seq();
        let to = rsip::typed::To {
            display_name: None,
            uri: opt.callee.clone(),
            params: vec![],
        };
        let recipient = to.uri.clone();

        let from = rsip::typed::From {
            display_name: None,
            uri: opt.caller.clone(),
            params: vec![],
        }
        .with_tag(make_tag().into());

        let via = self.endpoint.get_via(None, None)?;
        let mut request =
            self.endpoint
                .make_request(rsip::Method::Invite, recipient, via, from, to, last_seq);

        let contact = rsip::typed::Contact {
            display_name: None,
            uri: opt.contact.clone(),
            params: vec![],
        };
        request
            .headers
            .unique_push(rsip::Header::Contact(contact.into()));
        request.headers.unique_push(rsip::Header::ContentType(
            opt.content_type
                .clone()
                .unwrap_or_else(|| "application/sdp".to_string())
                .into(),
        ));
        request
            .headers
            .unique_push(rsip::Header::Allow(self.endpoint.allow_header()));

        if let Some(headers) = opt.headers.as_ref() {
            for header in headers {
                request.headers.unique_push(header.clone());
            }
        }
        Ok(request)
    }

    /// Originate a dialog and wait for its outcome.
    ///
    /// The returned future resolves only once the INVITE has a final
    /// answer: the dialog is either confirmed (2xx, ACK sent) or already
    /// torn down. Provisionals and the confirmation arrive on
    /// `state_sender` along the way. Authentication challenges are
    /// answered transparently, once per kind, when the options carry a
    /// credential.
    pub async fn do_invite(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(ClientInviteDialog, Option<Response>)> {
        let mut request = self.make_invite_request(&opt)?;
        request.body = opt.offer.unwrap_or_default();
        request.headers.unique_push(rsip::Header::ContentLength(
            (request.body.len() as u32).into(),
        ));

        let id = DialogId::try_from(&request)?;
        let early_key = id.early_initiating_key();
        let dlg_inner = DialogInner::new(
            TransactionRole::Client,
            id.clone(),
            request.clone(),
            self.endpoint.clone(),
            state_sender,
            opt.credential,
            Some(opt.contact),
        )?;
        let dialog = ClientInviteDialog {
            inner: Arc::new(dlg_inner),
        };

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let tx = Transaction::new_client(key, request, self.endpoint.clone(), None);

        self.inner
            .early_dialogs
            .write()
            .unwrap()
            .insert(early_key.clone(), Dialog::ClientInvite(dialog.clone()));
        info!("client dialog created: {}", id);

        match dialog.process_invite(tx).await {
            Ok((new_id, resp)) => {
                if dialog.inner.is_confirmed() {
                    debug!("client dialog confirmed: {} => {}", id, new_id);
                    self.confirm_client_dialog(
                        &early_key,
                        new_id,
                        Dialog::ClientInvite(dialog.clone()),
                    );
                } else {
                    self.inner.early_dialogs.write().unwrap().remove(&early_key);
                }
                Ok((dialog, resp))
            }
            Err(e) => {
                self.inner.early_dialogs.write().unwrap().remove(&early_key);
                Err(e)
            }
        }
    }
}
