use super::endpoint::EndpointInner;
use super::{make_branch, make_call_id, make_tag};
use crate::transport::SipAddr;
use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, Param, Request, Response, StatusCode};

impl EndpointInner {
    /// Assemble an out-of-dialog request with the mandatory header set:
    /// Via, Call-ID, From, To, CSeq, Max-Forwards and User-Agent, in that
    /// order. Everything else is the caller's business.
    pub fn make_request(
        &self,
        method: rsip::Method,
        req_uri: rsip::Uri,
        via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        seq: u32,
    ) -> rsip::Request {
        let headers = vec![
            Header::Via(via.into()),
            Header::CallId(make_call_id(self.option.callid_suffix.as_deref())),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.user_agent.clone().into()),
        ];
        rsip::Request {
            method,
            uri: req_uri,
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        }
    }

    /// Derive a response from a request: Via, Call-ID, From, To, CSeq and
    /// Max-Forwards are carried over, the rest dropped. Finals get a To
    /// tag synthesized when the request carried none; real softswitches
    /// reject tagless finals no matter what the RFC merely discourages.
    pub fn make_response(
        &self,
        req: &Request,
        status_code: StatusCode,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut headers = req.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::MaxForwards(_)
                    | Header::CSeq(_)
            )
        });

        if status_code != StatusCode::Trying {
            let tagged = req
                .to_header()
                .ok()
                .and_then(|to| to.tag().ok())
                .flatten()
                .is_some();
            if !tagged {
                if let Ok(to) = req.to_header().and_then(|to| Ok(to.typed()?)) {
                    let to = to.with_tag(make_tag().into());
                    let mut patched: Vec<Header> = Vec::new();
                    for header in headers.iter() {
                        match header {
                            Header::To(_) => patched.push(Header::To(to.clone().into())),
                            other => patched.push(other.clone()),
                        }
                    }
                    headers = patched.into();
                }
            }
        }

        body.as_ref().map(|b| {
            headers.unique_push(Header::ContentLength((b.len() as u32).into()));
        });
        headers.unique_push(Header::UserAgent(self.user_agent.clone().into()));
        Response {
            status_code,
            version: req.version().clone(),
            headers,
            body: body.unwrap_or_default(),
        }
    }

    /// The Via this endpoint stamps on requests it originates: the given
    /// binding (or the first bound transport), a fresh branch unless one
    /// is supplied, and an empty `rport` asking the peer to disclose our
    /// source port.
    pub fn get_via(
        &self,
        addr: Option<SipAddr>,
        branch: Option<Param>,
    ) -> Result<rsip::typed::Via> {
        let addr = match addr {
            Some(addr) => addr,
            None => self
                .transport_layer
                .get_addrs()
                .first()
                .cloned()
                .ok_or_else(|| Error::Error("no transport bound".to_string()))?,
        };
        let transport = addr.r#type.unwrap_or(rsip::Transport::Udp);
        let branch = branch.unwrap_or_else(|| Param::Branch(make_branch().into()));
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport,
            uri: rsip::Uri {
                scheme: None,
                auth: None,
                host_with_port: addr.addr,
                params: vec![],
                headers: vec![],
            },
            params: vec![branch, Param::Other("rport".into(), None)],
        })
    }
}
