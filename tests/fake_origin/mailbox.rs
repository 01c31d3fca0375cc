//! Test data model for the fake origin server
//!
//! Builder-style construction of the origin's scripted state:
//!
//! ```rust
//! let origin = OriginBuilder::new()
//!     .greeting("+OK hi")
//!     .capability("PIPELINING")
//!     .mail("Hello\r\n")
//!     .build();
//! ```

/// Scripted origin state: the greeting line, the CAPA body, and the
/// maildrop contents.
#[derive(Debug, Clone)]
pub struct Origin {
    /// Greeting status line, without the trailing CRLF.
    pub greeting: String,
    /// Capability list lines for the CAPA body.
    pub capabilities: Vec<String>,
    /// Message bodies, CRLF line endings, no terminator. Message
    /// numbers are 1-based indices into this list.
    pub mails: Vec<String>,
    /// When set, the CAPA response is written in two chunks split in
    /// the middle of the terminator.
    pub split_capa: bool,
}

pub struct OriginBuilder {
    origin: Origin,
}

impl OriginBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Origin {
                greeting: "+OK POP3 origin ready".to_string(),
                capabilities: Vec::new(),
                mails: Vec::new(),
                split_capa: false,
            },
        }
    }

    /// Override the greeting status line (no CRLF).
    pub fn greeting(mut self, line: &str) -> Self {
        self.origin.greeting = line.to_string();
        self
    }

    /// Add one capability line to the CAPA body.
    pub fn capability(mut self, capability: &str) -> Self {
        self.origin.capabilities.push(capability.to_string());
        self
    }

    /// Add a message. The body must use CRLF line endings and carry
    /// no terminator.
    pub fn mail(mut self, body: &str) -> Self {
        self.origin.mails.push(body.to_string());
        self
    }

    /// Write the CAPA response in two chunks, split mid-terminator.
    pub fn split_capa(mut self) -> Self {
        self.origin.split_capa = true;
        self
    }

    #[must_use]
    pub fn build(self) -> Origin {
        self.origin
    }
}
