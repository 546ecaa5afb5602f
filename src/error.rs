use crate::dialog::DialogId;
use crate::transaction::key::TransactionKey;
use crate::transport::SipAddr;

#[derive(Debug)]
pub enum Error {
    Error(String),
    SipMessageError(String),
    TransportLayerError(String, SipAddr),
    TransactionError(String, TransactionKey),
    DialogError(String, DialogId),
    DnsResolutionError(String),
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Error(e) => write!(f, "{}", e),
            Error::SipMessageError(e) => write!(f, "sip message error: {}", e),
            Error::TransportLayerError(e, addr) => {
                write!(f, "transport error: {} remote={}", e, addr)
            }
            Error::TransactionError(e, key) => write!(f, "transaction error: {} key={}", e, key),
            Error::DialogError(e, id) => write!(f, "dialog error: {} id={}", e, id),
            Error::DnsResolutionError(e) => write!(f, "dns resolution error: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::SipMessageError(e.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(e: std::net::AddrParseError) -> Self {
        Error::Error(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
