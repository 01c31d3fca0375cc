//! Per-connection proxy state machine
//!
//! Every client connection runs one [`Session`] through a closed set
//! of states:
//!
//! ```text
//!   OriginResolv -> Connecting -> Hello -> Capa -> Request
//!        Request <-> Response <-> ExternalTransformation
//!        any -> Done | Error
//! ```
//!
//! The session resolves and connects to the origin, relays its
//! greeting behind the proxy banner, probes `CAPA` to learn whether
//! the origin pipelines, and then alternates between reading client
//! requests and relaying origin responses. Requests are queued in wire
//! order and responses are matched positionally; when the origin does
//! not pipeline, only the queue head is on the wire at a time. `RETR`
//! responses may be diverted into the external-transformation pipeline
//! after their status line.

use crate::config::SharedConfig;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::pool::SessionBuffers;
use crate::protocol::request::{ParseError, RequestParser};
use crate::protocol::response::{ResponseParser, Status};
use crate::protocol::{Request, Verb};
use crate::proxy::transform::{self, FilterContext};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

const BANNER: &[u8] = b"+OK Proxy server POP3 ready.\r\n";
const ERR_INVALID_DOMAIN: &[u8] = b"-ERR Invalid domain.\r\n";
const ERR_CONNECTION_REFUSED: &[u8] = b"-ERR Connection refused.\r\n";
const ERR_TOO_MANY_INVALID: &[u8] = b"-ERR Too many invalid commands. (POPG)\n";

/// Consecutive invalid commands tolerated before closing the session.
const MAX_CONSECUTIVE_INVALID: u32 = 3;

/// POP3 session lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Authorization,
    Transaction,
    Update,
}

/// The session state. Scratch data a state needs travels in its
/// variant.
#[derive(Debug)]
enum State {
    OriginResolv,
    Connecting(SocketAddr),
    Hello,
    Capa,
    Request,
    Response(Request),
    ExternalTransformation {
        request: Request,
        /// Origin bytes read past the status line, not yet framed.
        leftover: Vec<u8>,
    },
    Done,
    Error,
}

pub(crate) struct Session {
    client: TcpStream,
    client_addr: SocketAddr,
    origin: Option<TcpStream>,
    origin_addr: Option<SocketAddr>,
    buffers: SessionBuffers,
    parser: RequestParser,
    /// Requests awaiting their response, in wire order.
    queue: VecDeque<Request>,
    /// How many queued requests are already on the origin wire.
    sent: usize,
    pipelining: bool,
    phase: Phase,
    user: Option<String>,
    invalid_streak: u32,
    config: SharedConfig,
    metrics: Arc<Metrics>,
}

impl Session {
    pub(crate) fn new(
        client: TcpStream,
        client_addr: SocketAddr,
        buffers: SessionBuffers,
        config: SharedConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            client_addr,
            origin: None,
            origin_addr: None,
            buffers,
            parser: RequestParser::new(),
            queue: VecDeque::new(),
            sent: 0,
            pipelining: false,
            phase: Phase::Authorization,
            user: None,
            invalid_streak: 0,
            config,
            metrics,
        }
    }

    /// Drive the state machine until a terminal state, then tear down.
    /// Returns the I/O buffers so the acceptor can pool them.
    pub(crate) async fn run(mut self) -> SessionBuffers {
        let mut state = State::OriginResolv;

        loop {
            let result = match state {
                State::OriginResolv => self.resolve_origin().await,
                State::Connecting(addr) => self.connect_origin(addr).await,
                State::Hello => self.relay_greeting().await,
                State::Capa => self.probe_capabilities().await,
                State::Request => self.handle_requests().await,
                State::Response(request) => self.relay_response(request).await,
                State::ExternalTransformation { request, leftover } => {
                    self.transform_mail(request, leftover).await
                }
                State::Done | State::Error => break,
            };

            state = match result {
                Ok(next) => next,
                Err(err) => {
                    warn!("session {} failed: {}", self.client_addr, err);
                    State::Error
                }
            };
        }

        self.teardown();
        self.buffers
    }

    fn teardown(&mut self) {
        self.metrics.connection_closed();
        if let Some(origin_addr) = self.origin_addr {
            info!(
                "connection closed: client {} origin {} phase {:?}",
                self.client_addr, origin_addr, self.phase
            );
        }
    }

    // -- ORIGIN_RESOLV --

    /// Resolve the origin host. `lookup_host` runs the blocking
    /// `getaddrinfo` on the runtime's worker pool, keeping this task
    /// suspended rather than the whole process.
    async fn resolve_origin(&mut self) -> Result<State> {
        let (host, port) = self.config.read().expect("config poisoned").origin_target();

        let addr = match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(mut addrs) => addrs.next(),
            Err(_) => None,
        };
        match addr {
            Some(addr) => Ok(State::Connecting(addr)),
            None => {
                self.client.write_all(ERR_INVALID_DOMAIN).await.ok();
                Err(Error::Resolve(format!("no addresses for {host}")))
            }
        }
    }

    // -- CONNECTING --

    async fn connect_origin(&mut self, addr: SocketAddr) -> Result<State> {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                info!(
                    "connection established: client {} origin {}",
                    self.client_addr, addr
                );
                self.origin = Some(stream);
                self.origin_addr = Some(addr);
                self.phase = Phase::Authorization;
                Ok(State::Hello)
            }
            Err(err) => {
                self.client.write_all(ERR_CONNECTION_REFUSED).await.ok();
                Err(Error::Connect(format!("{addr}: {err}")))
            }
        }
    }

    // -- HELLO --

    /// Read the origin greeting and forward it behind the proxy
    /// banner.
    async fn relay_greeting(&mut self) -> Result<State> {
        let line_len = loop {
            if let Some(pos) = self.buffers.origin.read_slice().iter().position(|&b| b == b'\n') {
                break pos + 1;
            }
            if self.fill_from_origin().await? == 0 {
                return Err(Error::Protocol("origin closed before greeting".into()));
            }
        };

        let mut hello = Vec::with_capacity(BANNER.len() + line_len);
        hello.extend_from_slice(BANNER);
        hello.extend_from_slice(&self.buffers.origin.read_slice()[..line_len]);
        self.client.write_all(&hello).await?;
        self.buffers.origin.advance_read(line_len);

        Ok(State::Capa)
    }

    // -- CAPA --

    /// Probe the origin's capabilities before the client gets a word
    /// in. The reply never reaches the client; its only purpose is the
    /// pipelining flag.
    async fn probe_capabilities(&mut self) -> Result<State> {
        let origin = self
            .origin
            .as_mut()
            .ok_or_else(|| Error::Protocol("origin not connected".into()))?;
        origin.write_all(b"CAPA\r\n").await?;

        let mut parser = ResponseParser::collecting(true);
        loop {
            if !self.buffers.origin.can_read() && self.fill_from_origin().await? == 0 {
                return Err(Error::Protocol("origin closed during CAPA".into()));
            }
            let consumed = parser.consume(self.buffers.origin.read_slice())?;
            self.buffers.origin.advance_read(consumed.used);
            if consumed.done {
                break;
            }
        }

        self.pipelining = parser.advertises_pipelining();
        debug!("origin pipelining: {}", self.pipelining);
        Ok(State::Request)
    }

    // -- REQUEST --

    /// Parse client requests, answer invalid ones, and flush valid
    /// ones to the origin.
    async fn handle_requests(&mut self) -> Result<State> {
        // Queued requests the origin has not seen yet take priority
        // over reading more from the client (the non-pipelined
        // continuation path).
        if self.sent == 0 && !self.queue.is_empty() {
            return self.flush_requests().await;
        }

        loop {
            if !self.buffers.client.can_read() {
                let n = self
                    .client
                    .read(self.buffers.client.write_slice())
                    .await?;
                if n == 0 {
                    debug!("client {} closed", self.client_addr);
                    return Ok(State::Error);
                }
                self.buffers.client.advance_write(n);
            }

            if let Some(terminal) = self.parse_client_bytes().await? {
                return Ok(terminal);
            }

            if !self.queue.is_empty() {
                return self.flush_requests().await;
            }
        }
    }

    /// Run the request parser over everything buffered. Returns a
    /// terminal state when the abuse limit trips.
    async fn parse_client_bytes(&mut self) -> Result<Option<State>> {
        let mut replies: Vec<&'static [u8]> = Vec::new();
        let mut terminal = None;

        {
            let slice = self.buffers.client.read_slice();
            let mut iter = slice.iter();
            loop {
                match self.parser.parse(&mut iter) {
                    Ok(request) => {
                        debug!("client {} request: {}", self.client_addr, request);
                        self.invalid_streak = 0;
                        self.queue.push_back(request);
                    }
                    Err(ParseError::Rejected(reject)) => {
                        replies.push(reject.wire_reply());
                        self.invalid_streak += 1;
                        if self.invalid_streak >= MAX_CONSECUTIVE_INVALID {
                            replies.push(ERR_TOO_MANY_INVALID);
                            terminal = Some(State::Done);
                            break;
                        }
                    }
                    Err(ParseError::NeedsMoreData) => break,
                }
            }
            let consumed = slice.len() - iter.as_slice().len();
            self.buffers.client.advance_read(consumed);
        }

        for reply in replies {
            self.client.write_all(reply).await?;
        }
        if terminal.is_some() {
            warn!("client {} exceeded invalid command limit", self.client_addr);
        }
        Ok(terminal)
    }

    /// Marshal queued requests to the origin: the whole queue when it
    /// pipelines, only the head otherwise.
    async fn flush_requests(&mut self) -> Result<State> {
        let origin = self
            .origin
            .as_mut()
            .ok_or_else(|| Error::Protocol("origin not connected".into()))?;

        let to_send = if self.pipelining { self.queue.len() } else { 1 };
        let mut wire = Vec::new();
        for request in self.queue.iter().take(to_send) {
            wire.extend_from_slice(&request.marshal());
        }
        origin.write_all(&wire).await?;
        self.sent = to_send;

        Ok(self.next_response_state())
    }

    /// Bind the queue head to a Response state. Callers guarantee at
    /// least one request is on the wire.
    fn next_response_state(&mut self) -> State {
        match self.queue.pop_front() {
            Some(request) if self.sent > 0 => {
                self.sent -= 1;
                State::Response(request)
            }
            Some(request) => {
                self.queue.push_front(request);
                State::Request
            }
            None => State::Request,
        }
    }

    // -- RESPONSE --

    /// Stream one origin response to the client. CAPA responses are
    /// withheld and rewritten to advertise pipelining; qualifying RETR
    /// responses divert into the transformation pipeline after their
    /// status line.
    async fn relay_response(&mut self, request: Request) -> Result<State> {
        let is_capa = request.verb == Verb::Capa;
        let is_retr = request.verb == Verb::Retr;
        let divert = is_retr && {
            let config = self.config.read().expect("config poisoned");
            config.et_activated && config.filter_command.is_some()
        };

        let mut parser = if is_capa {
            ResponseParser::collecting(request.expects_multiline())
        } else {
            ResponseParser::new(request.expects_multiline())
        };

        loop {
            if !self.buffers.origin.can_read() && self.fill_from_origin().await? == 0 {
                return Err(Error::Protocol("origin closed mid-response".into()));
            }

            let consumed = parser.consume(self.buffers.origin.read_slice())?;

            if is_capa || divert {
                // Withheld: CAPA until the full list is known, divert
                // candidates until the status decides their fate. The
                // parser retains the status line.
                self.buffers.origin.advance_read(consumed.used);
                if divert && parser.first_line_done() && parser.status() == Some(Status::Ok) {
                    // Drop the origin status line; the transformation
                    // pipeline synthesizes its own, and everything
                    // already buffered past it belongs to the mail
                    // body.
                    let leftover = self.buffers.origin.take();
                    return Ok(State::ExternalTransformation { request, leftover });
                }
            } else {
                self.client
                    .write_all(&self.buffers.origin.read_slice()[..consumed.used])
                    .await?;
                if is_retr {
                    self.metrics.add_transferred(consumed.used as u64);
                }
                self.buffers.origin.advance_read(consumed.used);
            }

            if consumed.done {
                break;
            }
        }

        if is_capa {
            // Invariant: the client-visible capability list always
            // advertises PIPELINING, whatever the origin said.
            self.client.write_all(&parser.capa_with_pipelining()).await?;
        } else if divert {
            // Only reachable when the origin answered -ERR: the
            // withheld status line is the whole response.
            self.client.write_all(parser.first_line()).await?;
        }
        if is_retr {
            self.metrics.message_retrieved();
        }

        debug!(
            "response relayed: client {} request {} status {:?}",
            self.client_addr,
            request,
            parser.status()
        );
        self.finish_response(&request, parser.status())
    }

    /// Apply verb side effects after a completed response and pick the
    /// next state.
    fn finish_response(&mut self, request: &Request, status: Option<Status>) -> Result<State> {
        match request.verb {
            Verb::Quit => {
                self.phase = Phase::Update;
                return Ok(State::Done);
            }
            Verb::User => {
                self.user = request.args.clone();
            }
            Verb::Pass if status == Some(Status::Ok) => {
                self.phase = Phase::Transaction;
                debug!("client {} entered transaction phase", self.client_addr);
            }
            _ => {}
        }

        if self.queue.is_empty() {
            Ok(State::Request)
        } else if self.pipelining {
            Ok(self.next_response_state())
        } else {
            Ok(State::Request)
        }
    }

    // -- EXTERNAL_TRANSFORMATION --

    async fn transform_mail(&mut self, request: Request, leftover: Vec<u8>) -> Result<State> {
        let ctx = {
            let config = self.config.read().expect("config poisoned");
            FilterContext {
                command: config.filter_command.clone().unwrap_or_default(),
                medias: config.filtered_media_types.join(','),
                replacement_msg: config.replacement_msg.clone(),
                version: config.version.clone(),
                user: self.user.clone().unwrap_or_default(),
                origin_server: config.origin_server.clone(),
                error_file: config.error_file.clone(),
            }
        };

        let origin = self
            .origin
            .as_mut()
            .ok_or_else(|| Error::Protocol("origin not connected".into()))?;

        let excess = transform::run(origin, &mut self.client, leftover, &ctx, &self.metrics).await?;
        if !excess.is_empty() {
            // Bytes past the mail terminator belong to the next
            // pipelined response; put them back in front of it.
            self.buffers.origin.write_slice()[..excess.len()].copy_from_slice(&excess);
            self.buffers.origin.advance_write(excess.len());
        }

        debug!("transformation finished: client {} {}", self.client_addr, request);
        self.finish_response(&request, Some(Status::Ok))
    }

    // -- helpers --

    /// Read origin bytes into the origin buffer, returning the count.
    async fn fill_from_origin(&mut self) -> Result<usize> {
        let origin = self
            .origin
            .as_mut()
            .ok_or_else(|| Error::Protocol("origin not connected".into()))?;
        let n = origin.read(self.buffers.origin.write_slice()).await?;
        self.buffers.origin.advance_write(n);
        Ok(n)
    }
}
