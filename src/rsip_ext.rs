//! Small helpers over the `rsip` message model that the stack needs in
//! more than one layer.

use crate::{Error, Result};
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::Param;

/// Extract the URI out of a raw `Contact` header value.
///
/// Accepts both name-addr (`"Bob" <sip:bob@host>;q=1`) and addr-spec
/// (`sip:bob@host`) forms.
pub fn extract_uri_from_contact(line: &str) -> Result<rsip::Uri> {
    match rsip::headers::Contact::new(line).typed() {
        Ok(contact) => Ok(contact.uri),
        Err(_) => {
            let line = line.trim();
            let inner = match (line.find('<'), line.find('>')) {
                (Some(start), Some(end)) if start < end => &line[start + 1..end],
                _ => line,
            };
            rsip::Uri::try_from(inner)
                .map_err(|e| Error::SipMessageError(format!("invalid contact: {} {}", line, e)))
        }
    }
}

/// The `branch` parameter of a typed Via, if any.
pub fn via_branch(via: &rsip::typed::Via) -> Option<String> {
    via.params.iter().find_map(|p| match p {
        Param::Branch(b) => Some(b.value().to_string()),
        _ => None,
    })
}

/// The `received` and `rport` parameters of a typed Via, parsed.
pub fn via_received(via: &rsip::typed::Via) -> (Option<std::net::IpAddr>, Option<u16>) {
    let mut received = None;
    let mut rport = None;
    for param in &via.params {
        match param {
            Param::Received(r) => received = r.value().parse().ok(),
            Param::Other(key, Some(value)) if key.value().eq_ignore_ascii_case("rport") => {
                rport = value.value().parse().ok()
            }
            _ => {}
        }
    }
    (received, rport)
}

/// The value of the topmost `Expires` header, if present and numeric.
pub fn expires_header(headers: &rsip::Headers) -> Option<u32> {
    headers.iter().find_map(|h| match h {
        rsip::Header::Expires(e) => e.value().trim().parse().ok(),
        _ => None,
    })
}

/// The tag parameter of a raw From/To header value, if present.
pub fn tag_of(header_value: &str) -> Option<String> {
    header_value.split(';').skip(1).find_map(|p| {
        let mut kv = p.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some(k), Some(v)) if k.eq_ignore_ascii_case("tag") => Some(v.to_string()),
            _ => None,
        }
    })
}

/// Clone a request while dropping every dialog- and hop-scoped header.
///
/// Used by the bridge to derive the request it forwards on the far leg:
/// Via, Call-ID, CSeq, Contact, routing headers and Max-Forwards are
/// removed, and From/To keep only their URIs (tags cleared). Body and the
/// remaining headers travel unchanged.
pub fn strip_dialog_scope(request: &rsip::Request) -> Result<rsip::Request> {
    let mut out = request.clone();
    let from = request.from_header()?.typed()?;
    let to = request.to_header()?.typed()?;

    let mut headers: Vec<rsip::Header> = Vec::new();
    for header in request.headers.iter() {
        match header {
            rsip::Header::Via(_)
            | rsip::Header::CallId(_)
            | rsip::Header::CSeq(_)
            | rsip::Header::Contact(_)
            | rsip::Header::Route(_)
            | rsip::Header::RecordRoute(_)
            | rsip::Header::MaxForwards(_)
            | rsip::Header::From(_)
            | rsip::Header::To(_) => {}
            other => headers.push(other.clone()),
        }
    }
    headers.push(rsip::Header::From(
        rsip::typed::From {
            display_name: from.display_name.clone(),
            uri: from.uri.clone(),
            params: vec![],
        }
        .into(),
    ));
    headers.push(rsip::Header::To(
        rsip::typed::To {
            display_name: to.display_name.clone(),
            uri: to.uri.clone(),
            params: vec![],
        }
        .into(),
    ));
    out.headers = headers.into();
    Ok(out)
}

/// The headers of a far-side response that survive relaying onto the
/// other leg of a bridge.
///
/// Same scope rule as [`strip_dialog_scope`], applied to a response:
/// identity, routing and hop headers belong to the leg they were sent
/// on, and Content-Length and User-Agent are recomputed by the near
/// side. Everything else (Allow, Supported, Require, application
/// headers, ...) passes through.
pub fn relay_response_headers(response: &rsip::Response) -> Vec<rsip::Header> {
    response
        .headers
        .iter()
        .filter(|header| {
            !matches!(
                header,
                rsip::Header::Via(_)
                    | rsip::Header::CallId(_)
                    | rsip::Header::CSeq(_)
                    | rsip::Header::Contact(_)
                    | rsip::Header::Route(_)
                    | rsip::Header::RecordRoute(_)
                    | rsip::Header::MaxForwards(_)
                    | rsip::Header::From(_)
                    | rsip::Header::To(_)
                    | rsip::Header::ContentLength(_)
                    | rsip::Header::UserAgent(_)
            )
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_uri_from_contact() {
        let uri = extract_uri_from_contact("<sip:alice@10.0.0.1:5060>").unwrap();
        assert_eq!(uri.to_string(), "sip:alice@10.0.0.1:5060");

        let uri = extract_uri_from_contact("\"Alice\" <sip:alice@example.com>;expires=60").unwrap();
        assert_eq!(uri.host_with_port.to_string(), "example.com");

        assert!(extract_uri_from_contact("sip:bob@example.com").is_ok());
    }

    #[test]
    fn test_strip_dialog_scope() {
        let invite = rsip::Request::try_from(
            "INVITE sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK-s\r\n\
             Call-ID: strip-test\r\nFrom: <sip:alice@a>;tag=al\r\nTo: <sip:bob@b>;tag=bo\r\n\
             CSeq: 2 INVITE\r\nContact: <sip:alice@10.0.0.1>\r\n\
             Record-Route: <sip:proxy;lr>\r\nMax-Forwards: 70\r\n\
             Content-Type: application/sdp\r\nContent-Length: 4\r\n\r\nsdp!"
                .as_bytes(),
        )
        .unwrap();
        let stripped = strip_dialog_scope(&invite).unwrap();
        let text = stripped.to_string();
        assert!(!text.contains("Via:"));
        assert!(!text.contains("Call-ID:"));
        assert!(!text.contains("Contact:"));
        assert!(!text.contains("Record-Route:"));
        assert!(!text.contains("tag="));
        assert!(text.contains("Content-Type: application/sdp"));
        assert_eq!(stripped.body, b"sdp!");
    }

    #[test]
    fn test_relay_response_headers() {
        let response = rsip::Response::try_from(
            "SIP/2.0 200 OK\r\n\
             Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bK-r\r\n\
             Call-ID: relay-test\r\nFrom: <sip:a@x>;tag=1\r\nTo: <sip:b@y>;tag=2\r\n\
             CSeq: 3 INVITE\r\nContact: <sip:b@10.0.0.2>\r\n\
             Record-Route: <sip:proxy;lr>\r\n\
             Allow: INVITE, ACK, BYE\r\nSupported: timer\r\n\
             Content-Type: application/sdp\r\nContent-Length: 4\r\n\r\nsdp!"
                .as_bytes(),
        )
        .unwrap();
        let kept = relay_response_headers(&response);
        let text = kept
            .iter()
            .map(|h| h.to_string())
            .collect::<Vec<_>>()
            .join("\r\n");
        assert!(text.contains("Allow: INVITE, ACK, BYE"));
        assert!(text.contains("Supported: timer"));
        assert!(text.contains("Content-Type: application/sdp"));
        assert!(!text.contains("Via:"));
        assert!(!text.contains("Call-ID:"));
        assert!(!text.contains("Contact:"));
        assert!(!text.contains("Record-Route:"));
        assert!(!text.contains("Content-Length:"));
        assert!(!text.contains("tag="));
    }

    #[test]
    fn test_tag_of() {
        assert_eq!(
            tag_of("<sip:a@b>;tag=abc123").as_deref(),
            Some("abc123")
        );
        assert_eq!(tag_of("<sip:a@b>"), None);
    }
}
