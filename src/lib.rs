//! # gemwire
//!
//! gemwire speaks the Gemini protocol over TLS, from both ends: a [`Dialer`]
//! that sends a request line and hands back the parsed [`ResponseHeader`]
//! with a connection positioned at the body, and a [`Server`] that accepts
//! connections, reads request lines and passes each one to a handler.
//!
//! The protocol is described at [gemini://geminiprotocol.net/docs/protocol-specification.gmi](gemini://geminiprotocol.net/docs/protocol-specification.gmi).
//! Bodies are passed through as raw bytes; nothing here interprets gemtext.

#![warn(missing_docs)]
#![warn(unused_imports)]

pub mod client;
mod deadline;
pub mod header;
pub mod line;
pub mod server;
pub mod status;
pub mod tls;
mod url;

#[cfg(test)]
mod tests;

pub use client::{
    ClientConnection,
    ClientError,
    Dialer,
    dial,
    request::Request,
    tofu::{TofuError, TofuStore},
};
pub use header::{GEMTEXT, HeaderError, ResponseHeader};
pub use server::{
    HandshakeError,
    Server,
    WriteFinisher,
    connection::ServerConnection,
    listen,
    response::ResponseWriter,
};
pub use status::{Status, StatusClass};
pub use tls::{ServerVerification, SessionInfo, TlsProtocolVersion};
pub use url::{DEFAULT_PORT, DEFAULT_SCHEME, Host, URL, URLBuilder, UrlError};
