//! The response header line: `<status> <meta>\r\n`.

use std::{io, str::FromStr, time::Duration};

use nom::{
    Parser,
    character::complete::digit1,
    combinator::{all_consuming, map_res},
};
use thiserror::Error;

use crate::{server::WriteFinisher, status::Status};

/// The content type assumed when a handler writes a body without a header.
pub const GEMTEXT: &str = "text/gemini";

/// A response header line could not be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    /// The line has no space between the status and the meta.
    #[error("invalid response header")]
    MissingSeparator,
    /// The status prefix is not a number below 100.
    #[error("invalid status code: {0:?}")]
    InvalidStatus(String),
}

/// The status line that starts every response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    /// The status code.
    pub status: Status,
    /// Content type on success, target URL on redirect, a human readable
    /// message otherwise.
    pub meta: String,
}

fn checked(status: Status, in_class: bool, meta: impl Into<String>) -> ResponseHeader {
    assert!(in_class, "status {} used with the wrong header class", status.code());
    ResponseHeader::new(status, meta)
}

impl ResponseHeader {
    /// A header with any status. Range checks happen when it is encoded.
    pub fn new(status: Status, meta: impl Into<String>) -> Self {
        Self { status, meta: meta.into() }
    }

    /// An input header.
    ///
    /// # Panics
    ///
    /// If `status` is not in 10-19.
    pub fn for_input(status: Status, prompt: impl Into<String>) -> Self {
        checked(status, status.is_input(), prompt)
    }

    /// A success header.
    ///
    /// # Panics
    ///
    /// If `status` is not in 20-29.
    pub fn for_success(status: Status, content_type: impl Into<String>) -> Self {
        checked(status, status.is_success(), content_type)
    }

    /// A redirect header.
    ///
    /// # Panics
    ///
    /// If `status` is not in 30-39.
    pub fn for_redirect(status: Status, location: impl Into<String>) -> Self {
        checked(status, status.is_redirect(), location)
    }

    /// A temporary failure header.
    ///
    /// # Panics
    ///
    /// If `status` is not in 40-49.
    pub fn for_temporary_failure(status: Status, reason: impl Into<String>) -> Self {
        checked(status, status.is_temporary_failure(), reason)
    }

    /// A permanent failure header.
    ///
    /// # Panics
    ///
    /// If `status` is not in 50-59.
    pub fn for_permanent_failure(status: Status, reason: impl Into<String>) -> Self {
        checked(status, status.is_permanent_failure(), reason)
    }

    /// A client certificate header.
    ///
    /// # Panics
    ///
    /// If `status` is not in 60-69.
    pub fn for_client_certificate_required(status: Status, reason: impl Into<String>) -> Self {
        checked(status, status.is_client_certificate_required(), reason)
    }

    /// `10 <prompt>`
    pub fn input(prompt: impl Into<String>) -> Self {
        Self::for_input(Status::INPUT, prompt)
    }

    /// `11 <prompt>`
    pub fn sensitive_input(prompt: impl Into<String>) -> Self {
        Self::for_input(Status::SENSITIVE_INPUT, prompt)
    }

    /// `20 <content type>`
    pub fn success(content_type: impl Into<String>) -> Self {
        Self::for_success(Status::SUCCESS, content_type)
    }

    /// `30 <location>`
    pub fn temporary_redirect(location: impl Into<String>) -> Self {
        Self::for_redirect(Status::TEMPORARY_REDIRECT, location)
    }

    /// `31 <location>`
    pub fn permanent_redirect(location: impl Into<String>) -> Self {
        Self::for_redirect(Status::PERMANENT_REDIRECT, location)
    }

    /// `40 <reason>`
    pub fn temporary_failure(reason: impl Into<String>) -> Self {
        Self::for_temporary_failure(Status::TEMPORARY_FAILURE, reason)
    }

    /// `41 server unavailable`
    pub fn server_unavailable() -> Self {
        Status::SERVER_UNAVAILABLE.header()
    }

    /// `42 CGI error`
    pub fn cgi_error() -> Self {
        Status::CGI_ERROR.header()
    }

    /// `43 proxy error`
    pub fn proxy_error() -> Self {
        Status::PROXY_ERROR.header()
    }

    /// `44 <seconds>`, asking the client to wait at least one whole second.
    pub fn slow_down(wait: Duration) -> Self {
        let seconds = wait.as_secs().max(1);
        Self::for_temporary_failure(Status::SLOW_DOWN, seconds.to_string())
    }

    /// `50 <reason>`
    pub fn permanent_failure(reason: impl Into<String>) -> Self {
        Self::for_permanent_failure(Status::PERMANENT_FAILURE, reason)
    }

    /// `51 not found`
    pub fn not_found() -> Self {
        Status::NOT_FOUND.header()
    }

    /// `52 gone`
    pub fn gone() -> Self {
        Status::GONE.header()
    }

    /// `53 proxy request refused`
    pub fn proxy_request_refused() -> Self {
        Status::PROXY_REQUEST_REFUSED.header()
    }

    /// `59 bad request`
    pub fn bad_request() -> Self {
        Status::BAD_REQUEST.header()
    }

    /// `60 client certificate required`
    pub fn client_certificate_required() -> Self {
        Status::CLIENT_CERTIFICATE_REQUIRED.header()
    }

    /// `61 certificate not authorized`
    pub fn certificate_not_authorized() -> Self {
        Status::CERTIFICATE_NOT_AUTHORIZED.header()
    }

    /// `62 certificate not valid`
    pub fn certificate_not_valid() -> Self {
        Status::CERTIFICATE_NOT_VALID.header()
    }

    /// Render the wire line, `\r\n` included.
    ///
    /// # Panics
    ///
    /// If the status is 100 or above, or the meta contains a line feed.
    ///
    /// A carriage return on its own is let through so that every decoded
    /// header encodes back to its original line. The protocol forbids both
    /// `\r` and `\n` in meta, so conforming callers never send one.
    pub fn encode(&self) -> String {
        assert!(self.status.is_valid(), "invalid status code {}", self.status.code());
        assert!(!self.meta.contains('\n'), "invalid meta string {:?}", self.meta);

        format!("{:02} {}\r\n", self.status.code(), self.meta)
    }

    /// [`encode`](Self::encode) as bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }

    /// Decode a header line whose `\r\n` has already been stripped.
    ///
    /// The status is only checked to be below 100; whether it belongs to a
    /// known class is up to the caller.
    pub fn decode(line: &str) -> Result<Self, HeaderError> {
        let (prefix, meta) = line.split_once(' ').ok_or(HeaderError::MissingSeparator)?;
        let invalid = || HeaderError::InvalidStatus(prefix.to_string());

        let (_, code) = all_consuming(map_res(digit1, |digits: &str| digits.parse::<u8>()))
            .parse(prefix)
            .map_err(|_: nom::Err<nom::error::Error<&str>>| invalid())?;

        let status = Status::new(code);
        if !status.is_valid() {
            return Err(invalid());
        }

        Ok(Self::new(status, meta))
    }

    /// Send the header as the whole response and finish the connection
    /// cleanly.
    ///
    /// # Panics
    ///
    /// If `writer` is a [`ResponseWriter`](crate::ResponseWriter) that has
    /// already sent a header.
    pub async fn finish_to<W: WriteFinisher>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_header(self).await?;
        writer.finish().await
    }
}

impl FromStr for ResponseHeader {
    type Err = HeaderError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        Self::decode(line)
    }
}
