//! TCP listener and command loop for the fake origin
//!
//! Binds `127.0.0.1:0` and answers POP3 commands from the scripted
//! [`Origin`] state. Every received command line is recorded so tests
//! can assert on the exact order the proxy put them on the wire.

use super::mailbox::Origin;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

/// A fake POP3 origin on localhost with an OS-assigned port.
pub struct FakeOriginServer {
    port: u16,
    received: Arc<Mutex<Vec<String>>>,
    /// Handle to the background task so it lives as long as the server.
    _handle: tokio::task::JoinHandle<()>,
}

impl FakeOriginServer {
    /// Start the server. It accepts connections until dropped.
    pub async fn start(origin: Origin) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = received.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let origin = origin.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, origin, log).await;
                });
            }
        });

        Self {
            port,
            received,
            _handle: handle,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Every command line received so far, in wire order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

async fn handle_connection(
    stream: TcpStream,
    origin: Origin,
    log: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    writer
        .write_all(format!("{}\r\n", origin.greeting).as_bytes())
        .await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        log.lock().unwrap().push(trimmed.to_string());

        let mut parts = trimmed.splitn(2, ' ');
        let verb = parts.next().unwrap_or_default().to_uppercase();
        let arg = parts.next();

        match verb.as_str() {
            "CAPA" => send_capa(&mut writer, &origin).await?,
            "USER" | "PASS" | "NOOP" | "RSET" | "DELE" => {
                writer.write_all(b"+OK\r\n").await?;
            }
            "QUIT" => {
                writer.write_all(b"+OK\r\n").await?;
                return Ok(());
            }
            "STAT" => {
                let total: usize = origin.mails.iter().map(String::len).sum();
                writer
                    .write_all(format!("+OK {} {}\r\n", origin.mails.len(), total).as_bytes())
                    .await?;
            }
            "LIST" => {
                writer.write_all(b"+OK scan listing follows\r\n").await?;
                for (i, mail) in origin.mails.iter().enumerate() {
                    writer
                        .write_all(format!("{} {}\r\n", i + 1, mail.len()).as_bytes())
                        .await?;
                }
                writer.write_all(b".\r\n").await?;
            }
            "RETR" => send_retr(&mut writer, &origin, arg).await?,
            _ => {
                writer.write_all(b"-ERR unknown command\r\n").await?;
            }
        }
    }
}

async fn send_capa(writer: &mut OwnedWriteHalf, origin: &Origin) -> std::io::Result<()> {
    let mut response = String::from("+OK\r\n");
    for capability in &origin.capabilities {
        response.push_str(capability);
        response.push_str("\r\n");
    }
    response.push_str(".\r\n");

    if origin.split_capa {
        // Cut inside the terminator to exercise cross-read parsing.
        let split = response.len() - 2;
        writer.write_all(&response.as_bytes()[..split]).await?;
        writer.flush().await?;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        writer.write_all(&response.as_bytes()[split..]).await?;
    } else {
        writer.write_all(response.as_bytes()).await?;
    }
    Ok(())
}

async fn send_retr(
    writer: &mut OwnedWriteHalf,
    origin: &Origin,
    arg: Option<&str>,
) -> std::io::Result<()> {
    let mail = arg
        .and_then(|n| n.trim().parse::<usize>().ok())
        .and_then(|n| origin.mails.get(n.checked_sub(1)?));

    match mail {
        Some(body) => {
            writer
                .write_all(format!("+OK {} octets\r\n", body.len()).as_bytes())
                .await?;
            writer.write_all(body.as_bytes()).await?;
            writer.write_all(b".\r\n").await?;
        }
        None => {
            writer.write_all(b"-ERR no such message\r\n").await?;
        }
    }
    Ok(())
}
