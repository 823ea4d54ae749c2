//! The request line a client sends.

use std::fmt;

use crate::url::URL;

/// Longest URL a request may carry, in bytes.
pub const MAX_URL_LENGTH: usize = 1024;

/// A request to a given URL.
#[derive(Debug, Clone)]
pub struct Request(pub URL);

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n", self.0)
    }
}

impl Request {
    /// The length of the URL on the wire, in bytes.
    pub fn url_length(&self) -> usize {
        self.0.to_string().len()
    }

    /// Check if the request is valid (less than or equal to 1024 bytes).
    pub fn is_valid_length(&self) -> bool {
        self.url_length() <= MAX_URL_LENGTH
    }
}
