//! Incremental POP3 response parser
//!
//! Two-phase: the status line first, then -- for multi-line verbs that
//! answered `+OK` -- a body phase delimited by the terminator scanner.
//! The parser deliberately stops right after the status line so the
//! session can inspect the status and divert the remainder (the RETR
//! transformation path) before any body byte is forwarded.
//!
//! Relay is byte-transparent: stuffed lines pass through unchanged, and
//! the caller forwards exactly the consumed bytes. The parser can also
//! collect the body, which the CAPA paths use to test and rewrite the
//! capability list.

use super::multi::TerminatorScanner;
use crate::error::{Error, Result};

/// Cap on the status line, per RFC 2449's 512-octet response limit.
const MAX_FIRST_LINE: usize = 512;

const PIPELINING: &[u8] = b"PIPELINING";

/// First-line status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Err,
}

#[derive(Debug)]
enum State {
    FirstLine,
    Body(TerminatorScanner),
    Done,
}

/// Outcome of one [`ResponseParser::consume`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumed {
    /// Bytes of the input that belong to this response.
    pub used: usize,
    /// Whether the response is now complete.
    pub done: bool,
}

#[derive(Debug)]
pub struct ResponseParser {
    multiline: bool,
    collect_body: bool,
    state: State,
    status: Option<Status>,
    first_line: Vec<u8>,
    body: Vec<u8>,
}

impl ResponseParser {
    /// Parser for a response that relays without inspection.
    #[must_use]
    pub fn new(multiline: bool) -> Self {
        Self {
            multiline,
            collect_body: false,
            state: State::FirstLine,
            status: None,
            first_line: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Parser that additionally retains the body (CAPA handling).
    #[must_use]
    pub fn collecting(multiline: bool) -> Self {
        Self {
            collect_body: true,
            ..Self::new(multiline)
        }
    }

    #[must_use]
    pub fn first_line_done(&self) -> bool {
        !matches!(self.state, State::FirstLine)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    #[must_use]
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// The raw status line, terminator included.
    #[must_use]
    pub fn first_line(&self) -> &[u8] {
        &self.first_line
    }

    /// The collected body (empty unless constructed with
    /// [`ResponseParser::collecting`]).
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Consume bytes from `input`. Stops after the status line
    /// completes and again when the response ends; call repeatedly on
    /// the remaining input to continue.
    pub fn consume(&mut self, input: &[u8]) -> Result<Consumed> {
        match &mut self.state {
            State::FirstLine => {
                for (i, &byte) in input.iter().enumerate() {
                    if self.first_line.len() >= MAX_FIRST_LINE {
                        return Err(Error::Protocol("response status line too long".into()));
                    }
                    self.first_line.push(byte);
                    if byte == b'\n' {
                        let status = parse_status(&self.first_line)?;
                        self.status = Some(status);
                        let done = !self.multiline || status == Status::Err;
                        self.state = if done {
                            State::Done
                        } else {
                            State::Body(TerminatorScanner::new())
                        };
                        return Ok(Consumed { used: i + 1, done });
                    }
                }
                Ok(Consumed {
                    used: input.len(),
                    done: false,
                })
            }
            State::Body(scanner) => {
                let (used, done) = match scanner.find_end(input) {
                    Some(end) => (end, true),
                    None => (input.len(), false),
                };
                if self.collect_body {
                    self.body.extend_from_slice(&input[..used]);
                }
                if done {
                    self.state = State::Done;
                }
                Ok(Consumed { used, done })
            }
            State::Done => Ok(Consumed {
                used: 0,
                done: true,
            }),
        }
    }

    /// Whether the collected capability list already advertises
    /// pipelining.
    #[must_use]
    pub fn advertises_pipelining(&self) -> bool {
        contains_ignore_case(&self.body, PIPELINING)
    }

    /// The full client-bound CAPA response, with `PIPELINING` injected
    /// before the terminator when the origin's list lacks it.
    #[must_use]
    pub fn capa_with_pipelining(&self) -> Vec<u8> {
        let mut out = self.first_line.clone();
        if self.body.is_empty() || self.advertises_pipelining() {
            out.extend_from_slice(&self.body);
            return out;
        }
        // The body ends with `.\r\n`; splice the capability in ahead
        // of it.
        let cut = self.body.len().saturating_sub(3);
        out.extend_from_slice(&self.body[..cut]);
        out.extend_from_slice(PIPELINING);
        out.extend_from_slice(b"\r\n.\r\n");
        out
    }
}

fn parse_status(line: &[u8]) -> Result<Status> {
    if line.starts_with(b"+OK") {
        Ok(Status::Ok)
    } else if line.starts_with(b"-ERR") {
        Ok(Status::Err)
    } else {
        Err(Error::Protocol(format!(
            "malformed response status line: {:?}",
            String::from_utf8_lossy(line)
        )))
    }
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}
