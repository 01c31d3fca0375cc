//! External-transformation pipeline
//!
//! Pipes one retrieved mail through the configured filter command.
//! The mail body (terminator stripped) feeds the child's stdin while
//! the child's stdout streams back to the client behind a synthesized
//! status line; the two directions run as independent one-way streams
//! and the state is left only when both are finished.
//!
//! ```text
//!   origin ── body minus \r\n.\r\n ──> /bin/sh -c <filter> ──> client
//!                                      (stderr >> error_file)
//! ```

use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::protocol::multi::TerminatorScanner;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

const PREFACE: &[u8] = b"+OK sending mail.\r\n";
const ERR_SPAWN: &[u8] = b"-ERR could not open external transformation.\r\n";
const TERMINATOR: &[u8] = b"\r\n.\r\n";

const CHUNK: usize = 2048;

/// Everything the filter child needs from the configuration, captured
/// once at diversion time so a concurrent management change cannot
/// tear a half-spawned pipeline.
pub(crate) struct FilterContext {
    pub command: String,
    pub medias: String,
    pub replacement_msg: String,
    pub version: String,
    pub user: String,
    pub origin_server: String,
    pub error_file: String,
}

/// Run one transformation. `leftover` holds origin bytes already read
/// past the response status line.
///
/// Client-visible outcomes:
/// - filter produced output: `+OK sending mail.\r\n` + output, with a
///   terminator appended unless the filter emitted its own;
/// - filter produced nothing (including exec failure inside the
///   shell): `-ERR could not open external transformation.\r\n`
///   followed by a bare terminator, and the session continues.
///
/// Origin-side failures are session-fatal and propagate as errors.
/// Returns origin bytes read past the mail terminator; they belong to
/// the next pipelined response.
pub(crate) async fn run(
    origin: &mut TcpStream,
    client: &mut TcpStream,
    leftover: Vec<u8>,
    ctx: &FilterContext,
    metrics: &Metrics,
) -> Result<Vec<u8>> {
    let mut child = match spawn_filter(ctx) {
        Ok(child) => child,
        Err(err) => {
            warn!("spawning filter {:?} failed: {}", ctx.command, err);
            // The origin already committed to sending the mail; drain
            // it so the next response lines up with the next request.
            let excess = drain_body(origin, &leftover).await?;
            client.write_all(ERR_SPAWN).await?;
            client.write_all(TERMINATOR).await?;
            metrics.add_transferred((ERR_SPAWN.len() + TERMINATOR.len()) as u64);
            return Ok(excess);
        }
    };

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Transform("filter stdin unavailable".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Transform("filter stdout unavailable".into()))?;

    let (fed, delivered) = tokio::join!(
        feed_child(origin, stdin, leftover),
        deliver_output(stdout, client, metrics),
    );

    // Exit status is not inspected; waiting just reaps the child.
    child.wait().await.ok();

    if !delivered? {
        client.write_all(ERR_SPAWN).await?;
        client.write_all(TERMINATOR).await?;
        metrics.add_transferred((ERR_SPAWN.len() + TERMINATOR.len()) as u64);
    } else {
        metrics.message_retrieved();
    }

    fed
}

fn spawn_filter(ctx: &FilterContext) -> std::io::Result<Child> {
    let stderr = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&ctx.error_file)?;

    Command::new("/bin/sh")
        .arg("-c")
        .arg(&ctx.command)
        .env("FILTER_MEDIAS", &ctx.medias)
        .env("FILTER_MSG", &ctx.replacement_msg)
        .env("POP3_FILTER_VERSION", &ctx.version)
        .env("POP3_USERNAME", &ctx.user)
        .env("POP3_SERVER", &ctx.origin_server)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true)
        .spawn()
}

/// Origin -> child stdin. Streams the mail body into the child with
/// the trailing `\r\n.\r\n` stripped, then closes stdin. A child that
/// stops reading early does not abort the stream: the body is still
/// drained from the origin to keep the wire in sync. Returns the
/// bytes read past the terminator.
async fn feed_child(
    origin: &mut TcpStream,
    mut stdin: ChildStdin,
    leftover: Vec<u8>,
) -> Result<Vec<u8>> {
    let mut stripper = FrameStripper::new();
    let mut content = Vec::with_capacity(CHUNK);
    let mut buf = vec![0u8; CHUNK];
    let mut broken = false;
    let mut excess = Vec::new();

    let mut done = match stripper.feed(&leftover, &mut content) {
        Some(end) => {
            excess.extend_from_slice(&leftover[end..]);
            true
        }
        None => false,
    };
    loop {
        if !content.is_empty() {
            if !broken && stdin.write_all(&content).await.is_err() {
                debug!("filter stopped reading; draining mail body");
                broken = true;
            }
            content.clear();
        }
        if done {
            break;
        }

        let n = origin.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::Protocol("origin closed mid-mail".into()));
        }
        if let Some(end) = stripper.feed(&buf[..n], &mut content) {
            excess.extend_from_slice(&buf[end..n]);
            done = true;
        }
    }

    stdin.shutdown().await.ok();
    drop(stdin);
    Ok(excess)
}

/// Child stdout -> client. The synthesized status line goes out ahead
/// of the first output byte; a child-emitted terminator ends the
/// stream as-is, and EOF without one gets a terminator appended.
/// Returns whether any output was delivered.
async fn deliver_output(
    mut stdout: ChildStdout,
    client: &mut TcpStream,
    metrics: &Metrics,
) -> Result<bool> {
    let mut scanner = TerminatorScanner::new();
    let mut buf = vec![0u8; CHUNK];
    let mut wrote = false;

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                debug!("filter stdout read failed: {}", err);
                0
            }
        };

        if n == 0 {
            if wrote {
                client.write_all(TERMINATOR).await?;
                metrics.add_transferred(TERMINATOR.len() as u64);
            }
            return Ok(wrote);
        }

        if !wrote {
            client.write_all(PREFACE).await?;
            metrics.add_transferred(PREFACE.len() as u64);
            wrote = true;
        }

        match scanner.find_end(&buf[..n]) {
            Some(end) => {
                client.write_all(&buf[..end]).await?;
                metrics.add_transferred(end as u64);
                return Ok(true);
            }
            None => {
                client.write_all(&buf[..n]).await?;
                metrics.add_transferred(n as u64);
            }
        }
    }
}

/// Consume and discard the pending mail body after a spawn failure.
/// Returns the bytes read past the terminator.
async fn drain_body(origin: &mut TcpStream, leftover: &[u8]) -> Result<Vec<u8>> {
    let mut scanner = TerminatorScanner::new();
    if let Some(end) = scanner.find_end(leftover) {
        return Ok(leftover[end..].to_vec());
    }

    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = origin.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::Protocol("origin closed mid-mail".into()));
        }
        if let Some(end) = scanner.find_end(&buf[..n]) {
            return Ok(buf[end..n].to_vec());
        }
    }
}

/// Splits a mail stream at the multi-line terminator, yielding content
/// with the terminator excluded even when it straddles chunk
/// boundaries. Bytes that might begin the terminator are withheld
/// until disambiguated.
struct FrameStripper {
    scanner: TerminatorScanner,
    held: Vec<u8>,
}

impl FrameStripper {
    fn new() -> Self {
        Self {
            scanner: TerminatorScanner::new(),
            held: Vec::with_capacity(4),
        }
    }

    /// Feed a chunk, appending content bytes to `out`. Once the
    /// terminator completes, returns the number of chunk bytes
    /// consumed; the terminator bytes themselves never reach `out`.
    fn feed(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Option<usize> {
        for (i, &byte) in chunk.iter().enumerate() {
            let before = self.scanner.matched_len();
            if self.scanner.push(byte) {
                self.held.clear();
                return Some(i + 1);
            }
            if self.scanner.matched_len() == before + 1 {
                self.held.push(byte);
            } else {
                // The withheld bytes turned out to be content.
                out.append(&mut self.held);
                if self.scanner.matched_len() > 0 {
                    self.held.push(byte);
                } else {
                    out.push(byte);
                }
            }
        }
        None
    }
}
