//! Response status codes and the classes they fall into.

use std::fmt;

use crate::header::ResponseHeader;

/// The semantic class a status code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    /// 10-19: the server wants input from the user.
    Input,
    /// 20-29: the request succeeded and a body follows.
    Success,
    /// 30-39: the resource lives somewhere else.
    Redirect,
    /// 40-49: the request failed, but may succeed if retried later.
    TemporaryFailure,
    /// 50-59: the request failed and should not be retried.
    PermanentFailure,
    /// 60-69: a client certificate is needed.
    ClientCertificateRequired,
    /// 0-9 and 70-99: encodable on the wire, but without defined meaning.
    Unassigned,
    /// 100 and above: cannot be encoded.
    Invalid,
}

/// A two-digit response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Status(u8);

impl Status {
    /// Input (10).
    pub const INPUT: Status = Status(10);
    /// Sensitive input (11).
    pub const SENSITIVE_INPUT: Status = Status(11);
    /// Success (20).
    pub const SUCCESS: Status = Status(20);
    /// Temporary redirect (30).
    pub const TEMPORARY_REDIRECT: Status = Status(30);
    /// Permanent redirect (31).
    pub const PERMANENT_REDIRECT: Status = Status(31);
    /// Temporary failure (40).
    pub const TEMPORARY_FAILURE: Status = Status(40);
    /// Server unavailable (41).
    pub const SERVER_UNAVAILABLE: Status = Status(41);
    /// CGI error (42).
    pub const CGI_ERROR: Status = Status(42);
    /// Proxy error (43).
    pub const PROXY_ERROR: Status = Status(43);
    /// Slow down (44). The meta holds the number of seconds to wait.
    pub const SLOW_DOWN: Status = Status(44);
    /// Permanent failure (50).
    pub const PERMANENT_FAILURE: Status = Status(50);
    /// Not found (51).
    pub const NOT_FOUND: Status = Status(51);
    /// Gone (52).
    pub const GONE: Status = Status(52);
    /// Proxy request refused (53).
    pub const PROXY_REQUEST_REFUSED: Status = Status(53);
    /// Bad request (59).
    pub const BAD_REQUEST: Status = Status(59);
    /// Client certificate required (60).
    pub const CLIENT_CERTIFICATE_REQUIRED: Status = Status(60);
    /// Certificate not authorized (61).
    pub const CERTIFICATE_NOT_AUTHORIZED: Status = Status(61);
    /// Certificate not valid (62).
    pub const CERTIFICATE_NOT_VALID: Status = Status(62);

    /// Wrap a raw code. No range check happens here; codes of 100 and above
    /// classify as [`StatusClass::Invalid`] and panic when encoded.
    pub const fn new(code: u8) -> Self {
        Self(code)
    }

    /// The numeric code.
    pub const fn code(self) -> u8 {
        self.0
    }

    /// Classify the code into its ten-wide range.
    pub const fn class(self) -> StatusClass {
        match self.0 {
            10..=19 => StatusClass::Input,
            20..=29 => StatusClass::Success,
            30..=39 => StatusClass::Redirect,
            40..=49 => StatusClass::TemporaryFailure,
            50..=59 => StatusClass::PermanentFailure,
            60..=69 => StatusClass::ClientCertificateRequired,
            0..=99 => StatusClass::Unassigned,
            _ => StatusClass::Invalid,
        }
    }

    /// Whether the code fits in the two digits of a header line.
    pub const fn is_valid(self) -> bool {
        self.0 < 100
    }

    /// 10-19.
    pub const fn is_input(self) -> bool {
        matches!(self.0, 10..=19)
    }

    /// 20-29.
    pub const fn is_success(self) -> bool {
        matches!(self.0, 20..=29)
    }

    /// 30-39.
    pub const fn is_redirect(self) -> bool {
        matches!(self.0, 30..=39)
    }

    /// 40-49.
    pub const fn is_temporary_failure(self) -> bool {
        matches!(self.0, 40..=49)
    }

    /// 50-59.
    pub const fn is_permanent_failure(self) -> bool {
        matches!(self.0, 50..=59)
    }

    /// 60-69.
    pub const fn is_client_certificate_required(self) -> bool {
        matches!(self.0, 60..=69)
    }

    /// A human readable name for the well-known codes, `None` for the rest.
    pub const fn description(self) -> Option<&'static str> {
        let description = match self {
            Self::INPUT => "input",
            Self::SENSITIVE_INPUT => "sensitive input",
            Self::SUCCESS => "success",
            Self::TEMPORARY_REDIRECT => "temporary redirect",
            Self::PERMANENT_REDIRECT => "permanent redirect",
            Self::TEMPORARY_FAILURE => "temporary failure",
            Self::SERVER_UNAVAILABLE => "server unavailable",
            Self::CGI_ERROR => "CGI error",
            Self::PROXY_ERROR => "proxy error",
            Self::SLOW_DOWN => "slow down",
            Self::PERMANENT_FAILURE => "permanent failure",
            Self::NOT_FOUND => "not found",
            Self::GONE => "gone",
            Self::PROXY_REQUEST_REFUSED => "proxy request refused",
            Self::BAD_REQUEST => "bad request",
            Self::CLIENT_CERTIFICATE_REQUIRED => "client certificate required",
            Self::CERTIFICATE_NOT_AUTHORIZED => "certificate not authorized",
            Self::CERTIFICATE_NOT_VALID => "certificate not valid",
            _ => return None,
        };

        Some(description)
    }

    /// A header carrying this status, with the description as its meta.
    pub fn header(self) -> ResponseHeader {
        ResponseHeader::new(self, self.description().unwrap_or_default())
    }
}

impl From<u8> for Status {
    fn from(code: u8) -> Self {
        Self(code)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.description() {
            Some(description) => f.write_str(description),
            None => write!(f, "{}", self.0),
        }
    }
}
