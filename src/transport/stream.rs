//! Message framing for streaming transports: a header block terminated by
//! CRLFCRLF followed by exactly `Content-Length` body bytes. Stray CRLF
//! between messages (keep-alives) is skipped.

use crate::{Error, Result};
use bytes::BytesMut;
use super::{MAX_BODY_BYTES, MAX_HEADER_BYTES};

/// Incremental decoder over a growing receive buffer.
pub struct StreamDecoder {
    buf: BytesMut,
}

impl StreamDecoder {
    pub fn new() -> Self {
        StreamDecoder {
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Try to take one complete raw message off the buffer.
    ///
    /// `Ok(None)` means more bytes are needed. A header block larger than
    /// 16 KiB or a declared body larger than 128 KiB is a protocol error;
    /// the caller must drop the connection.
    pub fn decode(&mut self) -> Result<Option<Vec<u8>>> {
        // keep-alive CRLF sequences between messages
        while self.buf.starts_with(b"\r\n") {
            let _ = self.buf.split_to(2);
        }
        if self.buf.is_empty() {
            return Ok(None);
        }

        let header_end = match find_crlfcrlf(&self.buf) {
            Some(pos) => pos,
            None => {
                if self.buf.len() > MAX_HEADER_BYTES {
                    return Err(Error::Error(format!(
                        "header block exceeds {} bytes",
                        MAX_HEADER_BYTES
                    )));
                }
                return Ok(None);
            }
        };
        if header_end > MAX_HEADER_BYTES {
            return Err(Error::Error(format!(
                "header block exceeds {} bytes",
                MAX_HEADER_BYTES
            )));
        }

        let content_length = content_length(&self.buf[..header_end])?;
        if content_length > MAX_BODY_BYTES {
            return Err(Error::Error(format!(
                "body of {} bytes exceeds {} bytes",
                content_length, MAX_BODY_BYTES
            )));
        }

        let total = header_end + 4 + content_length;
        if self.buf.len() < total {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(total).to_vec()))
    }
}

fn find_crlfcrlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Scan the header block for `Content-Length` (or its compact form `l`).
/// A missing header means no body.
fn content_length(headers: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(headers)
        .map_err(|_| Error::Error("non-utf8 header block".to_string()))?;
    for line in text.split("\r\n").skip(1) {
        let mut parts = line.splitn(2, ':');
        let (name, value) = match (parts.next(), parts.next()) {
            (Some(name), Some(value)) => (name.trim(), value.trim()),
            _ => continue,
        };
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value
                .parse()
                .map_err(|_| Error::Error(format!("bad content-length: {}", value)));
        }
    }
    Ok(0)
}
