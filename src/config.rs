//! Proxy configuration
//!
//! One process-wide record holding every runtime knob: where to listen,
//! which origin to relay to, the management credentials, and the
//! external-transformation settings. Sessions read it on each use;
//! management connections mutate it in place behind the shared lock.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Shared handle to the live configuration. Sessions take short read
/// locks; only management handlers write.
pub type SharedConfig = Arc<RwLock<Config>>;

/// Process-wide configuration record.
#[derive(Debug, Clone)]
pub struct Config {
    /// Client-side bind address.
    pub listen_address: String,
    /// Client-side bind port.
    pub port: u16,
    /// Upstream POP3 server host name or address.
    pub origin_server: String,
    /// Upstream POP3 server port.
    pub origin_port: u16,
    /// Management channel bind address.
    pub management_address: String,
    /// Management channel bind port.
    pub management_port: u16,
    /// Body substituted by the filter when a part matches.
    pub replacement_msg: String,
    /// MIME types the filter removes.
    pub filtered_media_types: MediaTypeSet,
    /// Whether retrieved mails are piped through the filter.
    pub et_activated: bool,
    /// Shell command run once per retrieved mail.
    pub filter_command: Option<String>,
    /// File the filter's stderr is appended to.
    pub error_file: String,
    /// Version string exported to the filter.
    pub version: String,
    /// Management channel credentials.
    pub user: String,
    pub pass: String,
}

impl Config {
    /// Management credentials from the environment.
    ///
    /// Reads from `.env` if present. `POPGUARD_USER` and
    /// `POPGUARD_PASS` are required when no credentials were given on
    /// the command line.
    pub fn credentials_from_env() -> Result<(String, String)> {
        dotenvy::dotenv().ok();

        let user = env::var("POPGUARD_USER")
            .map_err(|_| Error::Config("POPGUARD_USER not set".into()))?;
        let pass = env::var("POPGUARD_PASS")
            .map_err(|_| Error::Config("POPGUARD_PASS not set".into()))?;
        Ok((user, pass))
    }

    /// The `host:port` pair sessions resolve and connect to.
    #[must_use]
    pub fn origin_target(&self) -> (String, u16) {
        (self.origin_server.clone(), self.origin_port)
    }
}

/// A MIME `type/subtype` pair. A `*` subtype matches every subtype of
/// its type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MediaType {
    pub kind: String,
    pub subtype: String,
}

impl MediaType {
    /// Parse `type/subtype`, lowercasing both halves.
    pub fn parse(s: &str) -> Result<Self> {
        let (kind, subtype) = s
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("not a media type: {s}")))?;
        if kind.is_empty() || subtype.is_empty() || subtype.contains('/') {
            return Err(Error::Config(format!("not a media type: {s}")));
        }
        Ok(Self {
            kind: kind.to_ascii_lowercase(),
            subtype: subtype.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.subtype)
    }
}

/// The set of MIME types subject to filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaTypeSet {
    entries: BTreeSet<MediaType>,
}

impl MediaTypeSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a type. Returns false if it was already present.
    pub fn insert(&mut self, media: MediaType) -> bool {
        self.entries.insert(media)
    }

    /// Remove a type. Returns false if it was not present.
    pub fn remove(&mut self, media: &MediaType) -> bool {
        self.entries.remove(media)
    }

    /// Whether `type/subtype` is filtered, honoring `*` wildcards.
    #[must_use]
    pub fn matches(&self, kind: &str, subtype: &str) -> bool {
        self.entries.iter().any(|m| {
            m.kind.eq_ignore_ascii_case(kind)
                && (m.subtype == "*" || m.subtype.eq_ignore_ascii_case(subtype))
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries joined by `sep`, in stable order. This is the form
    /// handed to the filter via `FILTER_MEDIAS` and to management
    /// `LIST` replies.
    #[must_use]
    pub fn join(&self, sep: char) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            if !out.is_empty() {
                out.push(sep);
            }
            out.push_str(&entry.to_string());
        }
        out
    }
}
