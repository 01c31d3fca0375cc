//! Incremental POP3 request parser
//!
//! Consumes client bytes one at a time and yields a [`Request`] per
//! complete line, or a [`Reject`] describing why the line was refused.
//! Partial input is never an error: the parser keeps its state across
//! chunks and reports [`ParseError::NeedsMoreData`] at the end of each
//! one, so a command split across two reads parses identically to the
//! single-packet form.

use super::{Request, Verb};

/// Longest accepted verb, in bytes.
const MAX_VERB_LEN: usize = 4;
/// Longest accepted argument text, in bytes.
const MAX_ARG_LEN: usize = 40;

/// Why a client line was refused. Carries the exact wire reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    UnknownCommand,
    CommandTooLong,
    ParameterTooLong,
}

impl Reject {
    /// The `-ERR` line sent back to the client.
    #[must_use]
    pub fn wire_reply(self) -> &'static [u8] {
        match self {
            Self::UnknownCommand => b"-ERR Unknown command. (POPG)\r\n",
            Self::CommandTooLong => b"-ERR Command too long.\r\n",
            Self::ParameterTooLong => b"-ERR Parameter too long.\r\n",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The current chunk ended mid-command.
    NeedsMoreData,
    /// The line was malformed; the parser has already discarded it.
    Rejected(Reject),
}

#[derive(Debug, Default)]
enum State {
    /// Skipping leading whitespace before a verb.
    #[default]
    Init,
    /// Accumulating the verb (at most four bytes, lowercased).
    Verb { buf: [u8; 4], len: usize },
    /// Accumulating argument text after the verb.
    Args { verb: Verb, args: Vec<u8> },
    /// Discarding the rest of a malformed line.
    Error { reject: Reject },
}

/// Resettable incremental parser for client command lines.
///
/// Lines end at `\n`; a preceding `\r` is accepted and ignored, so
/// bare-LF clients still parse.
#[derive(Debug, Default)]
pub struct RequestParser {
    state: State,
}

impl RequestParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.state = State::Init;
    }

    /// Parse as many bytes as needed to produce one result, leaving
    /// the iterator at the first unconsumed byte.
    pub fn parse(&mut self, bytes: &mut std::slice::Iter<'_, u8>) -> Result<Request, ParseError> {
        for &byte in bytes {
            match &mut self.state {
                State::Init => match byte {
                    b' ' | b'\t' | b'\r' | b'\n' => {}
                    _ => {
                        self.state = State::Verb {
                            buf: [byte.to_ascii_lowercase(), 0, 0, 0],
                            len: 1,
                        };
                    }
                },
                State::Verb { buf, len } => match byte {
                    b' ' | b'\t' => match Verb::decode(buf) {
                        Some(verb) => {
                            self.state = State::Args {
                                verb,
                                args: Vec::new(),
                            };
                        }
                        None => {
                            self.state = State::Error {
                                reject: Reject::UnknownCommand,
                            };
                        }
                    },
                    b'\r' => {}
                    b'\n' => {
                        let result = match Verb::decode(buf) {
                            Some(verb) => Ok(Request::new(verb, None)),
                            None => Err(ParseError::Rejected(Reject::UnknownCommand)),
                        };
                        self.state = State::Init;
                        return result;
                    }
                    _ if *len < MAX_VERB_LEN => {
                        buf[*len] = byte.to_ascii_lowercase();
                        *len += 1;
                    }
                    _ => {
                        self.state = State::Error {
                            reject: Reject::CommandTooLong,
                        };
                    }
                },
                State::Args { verb, args } => match byte {
                    b'\r' => {}
                    b'\n' => {
                        let verb = *verb;
                        let mut args = std::mem::take(args);
                        while args.last().is_some_and(|&b| b == b' ' || b == b'\t') {
                            args.pop();
                        }
                        self.state = State::Init;
                        return match String::from_utf8(args) {
                            Ok(args) if args.is_empty() => Ok(Request::new(verb, None)),
                            Ok(args) => Ok(Request::new(verb, Some(args))),
                            Err(_) => Err(ParseError::Rejected(Reject::UnknownCommand)),
                        };
                    }
                    _ if args.len() < MAX_ARG_LEN => {
                        // Leading separators fold away; interior
                        // whitespace is argument text.
                        if !(args.is_empty() && (byte == b' ' || byte == b'\t')) {
                            args.push(byte);
                        }
                    }
                    _ => {
                        self.state = State::Error {
                            reject: Reject::ParameterTooLong,
                        };
                    }
                },
                State::Error { reject } => {
                    if byte == b'\n' {
                        let reject = *reject;
                        self.state = State::Init;
                        return Err(ParseError::Rejected(reject));
                    }
                }
            }
        }

        Err(ParseError::NeedsMoreData)
    }
}
