//! POP3 protocol types and parsers
//!
//! The wire-level building blocks the proxy engine consumes: the
//! command vocabulary ([`Verb`]), parsed client commands ([`Request`]),
//! the incremental request and response parsers, and the multi-line
//! terminator scanner shared with the transformation pipeline.

pub mod multi;
pub mod request;
pub mod response;

use std::fmt;

/// A POP3 command verb (RFC 1939).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    User,
    Pass,
    Capa,
    Stat,
    List,
    Retr,
    Dele,
    Noop,
    Rset,
    Top,
    Uidl,
    Quit,
}

impl Verb {
    /// Decode a lowercased 3- or 4-byte verb, zero-padded to 4.
    #[must_use]
    pub(crate) fn decode(bytes: &[u8; 4]) -> Option<Self> {
        match bytes {
            b"user" => Some(Self::User),
            b"pass" => Some(Self::Pass),
            b"capa" => Some(Self::Capa),
            b"stat" => Some(Self::Stat),
            b"list" => Some(Self::List),
            b"retr" => Some(Self::Retr),
            b"dele" => Some(Self::Dele),
            b"noop" => Some(Self::Noop),
            b"rset" => Some(Self::Rset),
            b"top\0" => Some(Self::Top),
            b"uidl" => Some(Self::Uidl),
            b"quit" => Some(Self::Quit),
            _ => None,
        }
    }

    /// Canonical wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Pass => "PASS",
            Self::Capa => "CAPA",
            Self::Stat => "STAT",
            Self::List => "LIST",
            Self::Retr => "RETR",
            Self::Dele => "DELE",
            Self::Noop => "NOOP",
            Self::Rset => "RSET",
            Self::Top => "TOP",
            Self::Uidl => "UIDL",
            Self::Quit => "QUIT",
        }
    }

    /// Whether a successful response to this verb is multi-line.
    ///
    /// LIST and UIDL are multi-line only in their argument-less
    /// listing form.
    #[must_use]
    pub fn is_multiline(self, has_arg: bool) -> bool {
        match self {
            Self::Capa | Self::Retr | Self::Top => true,
            Self::List | Self::Uidl => !has_arg,
            _ => false,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed client command: verb plus the raw argument text, if any.
///
/// Argument arity is not validated here; the origin is the authority
/// on whether `USER` without a name is an error, and the proxy relays
/// its verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: Verb,
    pub args: Option<String>,
}

impl Request {
    #[must_use]
    pub fn new(verb: Verb, args: Option<String>) -> Self {
        Self { verb, args }
    }

    /// Whether the response to this request is multi-line when OK.
    #[must_use]
    pub fn expects_multiline(&self) -> bool {
        self.verb.is_multiline(self.args.is_some())
    }

    /// Render the canonical wire form, `VERB[ args]\r\n`.
    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.args.as_ref().map_or(0, String::len));
        out.extend_from_slice(self.verb.as_str().as_bytes());
        if let Some(args) = &self.args {
            out.push(b' ');
            out.extend_from_slice(args.as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.args {
            Some(args) => write!(f, "{} {}", self.verb, args),
            None => self.verb.fmt(f),
        }
    }
}
