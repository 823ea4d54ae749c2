use std::{fmt, str::FromStr};

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt, recognize, rest},
    sequence::{delimited, preceded, terminated},
};
use thiserror::Error;

/// The port used when a URL does not name one.
pub const DEFAULT_PORT: u16 = 1965;
/// The only scheme this crate speaks.
pub const DEFAULT_SCHEME: &str = "gemini";
const DEFAULT_PATH: &str = "/";

/// A URL could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    /// The text is not an absolute URL.
    #[error("malformed URL: {0:?}")]
    Malformed(String),
    /// Whitespace or control characters.
    #[error("URL contains whitespace or control characters")]
    InvalidCharacter,
    /// `user@host` authorities are not allowed.
    #[error("URL must not contain user info")]
    UserInfo,
    /// The host or port could not be parsed.
    #[error("invalid authority: {0:?}")]
    InvalidAuthority(String),
}

/// The authority part of a URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Hostname or IP literal, without brackets.
    pub name: String,
    /// The port, if the URL names one.
    pub port: Option<u16>,
}

impl Host {
    /// The port to connect to.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// `host:port` suitable for a socket connect, with the default port
    /// filled in.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bracketed_name(), self.port_or_default())
    }

    fn bracketed_name(&self) -> String {
        if self.name.contains(':') {
            format!("[{}]", self.name)
        } else {
            self.name.clone()
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}", self.bracketed_name())?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// An absolute URL, as sent on a request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct URL {
    scheme: String,
    /// The authority, absent for URLs like `mailto:x`.
    pub host: Option<Host>,
    path: String,
    query: Option<String>,
}

impl URL {
    /// The lower-cased scheme.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The path, possibly empty.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The query without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// The hostname, if any.
    pub fn hostname(&self) -> Option<&str> {
        self.host.as_ref().map(|host| host.name.as_str())
    }

    /// The explicit port, or the default one.
    pub fn port_or_default(&self) -> u16 {
        self.host.as_ref().map_or(DEFAULT_PORT, Host::port_or_default)
    }

    /// Whether the scheme is `gemini`.
    pub fn is_gemini(&self) -> bool {
        self.scheme == DEFAULT_SCHEME
    }

    /// Replace an empty path with `/`.
    pub fn with_default_path(mut self) -> Self {
        if self.path.is_empty() {
            self.path = DEFAULT_PATH.to_string();
        }
        self
    }
}

impl fmt::Display for URL {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;

        if let Some(host) = &self.host {
            write!(f, "{host}")?;
            if self.path.is_empty() {
                f.write_str(DEFAULT_PATH)?;
            }
        }
        f.write_str(&self.path)?;

        if let Some(query) = &self.query {
            write!(f, "?{query}")?;
        }

        Ok(())
    }
}

struct Parts<'a> {
    scheme: &'a str,
    authority: Option<&'a str>,
    path: &'a str,
    query: Option<&'a str>,
}

fn scheme(input: &str) -> IResult<&str, &str> {
    recognize((
        take_while1(|c: char| c.is_ascii_alphabetic()),
        take_while(|c: char| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')),
    ))
    .parse(input)
}

fn parts(input: &str) -> IResult<&str, Parts<'_>> {
    let (input, scheme) = terminated(scheme, char(':')).parse(input)?;
    let (input, authority) =
        opt(preceded(tag("//"), take_while(|c: char| !matches!(c, '/' | '?' | '#')))).parse(input)?;
    let (input, path) = take_while(|c: char| !matches!(c, '?' | '#')).parse(input)?;
    let (input, query) = opt(preceded(char('?'), take_while(|c: char| c != '#'))).parse(input)?;
    let (input, _fragment) = opt(preceded(char('#'), rest)).parse(input)?;

    Ok((input, Parts { scheme, authority, path, query }))
}

fn host_port(input: &str) -> IResult<&str, (&str, Option<u16>)> {
    let name = alt((
        delimited(char('['), take_while1(|c: char| c != ']'), char(']')),
        take_while(|c: char| c != ':'),
    ));
    let port = preceded(char(':'), map_res(digit1, |digits: &str| digits.parse::<u16>()));

    (name, opt(port)).parse(input)
}

fn parse_host(authority: &str) -> Result<Option<Host>, UrlError> {
    if authority.contains('@') {
        return Err(UrlError::UserInfo);
    }

    let (_, (name, port)) = all_consuming(host_port)
        .parse(authority)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| UrlError::InvalidAuthority(authority.to_string()))?;

    if name.is_empty() {
        return Ok(None);
    }

    Ok(Some(Host { name: name.to_string(), port }))
}

impl FromStr for URL {
    type Err = UrlError;

    /// Parse an absolute URL. The fragment, if any, is dropped: it is never
    /// sent to a server.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(UrlError::InvalidCharacter);
        }

        let (_, parts) = all_consuming(parts)
            .parse(input)
            .map_err(|_: nom::Err<nom::error::Error<&str>>| UrlError::Malformed(input.to_string()))?;

        let host = match parts.authority {
            Some(authority) => parse_host(authority)?,
            None => None,
        };

        Ok(Self {
            scheme: parts.scheme.to_ascii_lowercase(),
            host,
            path: parts.path.to_string(),
            query: parts.query.map(str::to_string),
        })
    }
}

/// Builds a [`URL`] piece by piece, defaulting to `gemini://` and `/`.
#[derive(Debug, Default)]
pub struct URLBuilder<'a> {
    scheme: Option<&'a str>,
    hostname: Option<&'a str>,
    port: Option<u16>,
    path: Option<&'a str>,
    query: Option<&'a str>,
}

impl<'a> URLBuilder<'a> {
    /// An empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scheme.
    pub fn scheme(mut self, scheme: &'a str) -> Self {
        self.scheme = Some(scheme);
        self
    }

    /// Set the hostname.
    pub fn hostname(mut self, hostname: &'a str) -> Self {
        self.hostname = Some(hostname);
        self
    }

    /// Set an explicit port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the path.
    pub fn path(mut self, path: &'a str) -> Self {
        self.path = Some(path);
        self
    }

    /// Set the query, without the leading `?`.
    pub fn query(mut self, query: &'a str) -> Self {
        self.query = Some(query);
        self
    }

    fn host(&self) -> Option<Host> {
        self.hostname.map(|hostname| Host {
            name: hostname.to_string(),
            port: self.port,
        })
    }

    /// Build the URL.
    pub fn build(&self) -> URL {
        URL {
            scheme: self.scheme.unwrap_or(DEFAULT_SCHEME).to_ascii_lowercase(),
            host: self.host(),
            path: self.path.unwrap_or(DEFAULT_PATH).to_string(),
            query: self.query.map(str::to_string),
        }
    }
}
