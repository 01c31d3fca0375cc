//! Management channel
//!
//! A second listener speaking a small line-based protocol for live
//! reconfiguration and metrics. Each connection walks
//! `Helo -> User -> Pass -> Config`; only authenticated peers reach
//! the configuration commands:
//!
//! | command            | effect                                   |
//! |--------------------|------------------------------------------|
//! | `CMD`              | toggle external transformation           |
//! | `CMD <shell>`      | replace the filter command               |
//! | `MSG <text>`       | replace the replacement message          |
//! | `LIST`             | show the filtered media types            |
//! | `BAN <type/sub>`   | add a media type to the filter set       |
//! | `UNBAN <type/sub>` | remove a media type from the filter set  |
//! | `STATS`            | show the four proxy counters             |
//! | `QUIT`             | close the connection                     |

use crate::config::{MediaType, SharedConfig};
use crate::error::Result;
use crate::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const GREETING: &[u8] = b"POP3 Proxy Management Server.\n";

/// Authentication progress of one management connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    User,
    Pass,
    Config,
}

pub struct ManagementServer {
    listener: TcpListener,
    config: SharedConfig,
    metrics: Arc<Metrics>,
}

impl ManagementServer {
    pub async fn bind(
        addr: impl tokio::net::ToSocketAddrs,
        config: SharedConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("management listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            config,
            metrics,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("management accept failed: {}", err);
                    continue;
                }
            };
            info!("management connection from {}", peer);

            let config = self.config.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, config, metrics).await {
                    debug!("management connection {} ended: {}", peer, err);
                }
                info!("management connection {} closed", peer);
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    config: SharedConfig,
    metrics: Arc<Metrics>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(GREETING).await?;

    let mut stage = Stage::User;
    let mut pending_user: Option<String> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let argv: Vec<&str> = line.split_whitespace().collect();
        if argv.is_empty() {
            continue;
        }

        // QUIT is honored at any stage.
        if argv.len() == 1 && argv[0].eq_ignore_ascii_case("QUIT") {
            send_ok(&mut write_half, "Goodbye.").await?;
            return Ok(());
        }

        stage = match stage {
            Stage::User => handle_user(&mut write_half, &argv, &mut pending_user).await?,
            Stage::Pass => {
                handle_pass(&mut write_half, &argv, &mut pending_user, &config).await?
            }
            Stage::Config => {
                handle_config(&mut write_half, &argv, &config, &metrics).await?;
                Stage::Config
            }
        };
    }
}

async fn handle_user(
    writer: &mut OwnedWriteHalf,
    argv: &[&str],
    pending_user: &mut Option<String>,
) -> Result<Stage> {
    if argv.len() == 2 && argv[0].eq_ignore_ascii_case("USER") {
        *pending_user = Some(argv[1].to_string());
        send_ok(writer, "Welcome.").await?;
        Ok(Stage::Pass)
    } else {
        send_err(writer, "command not recognized.").await?;
        Ok(Stage::User)
    }
}

async fn handle_pass(
    writer: &mut OwnedWriteHalf,
    argv: &[&str],
    pending_user: &mut Option<String>,
    config: &SharedConfig,
) -> Result<Stage> {
    if argv.len() != 2 || !argv[0].eq_ignore_ascii_case("PASS") {
        send_err(writer, "command not recognized.").await?;
        return Ok(Stage::Pass);
    }

    let authorized = {
        let config = config.read().expect("config poisoned");
        pending_user.as_deref() == Some(config.user.as_str()) && argv[1] == config.pass
    };
    *pending_user = None;

    if authorized {
        send_ok(writer, "Logged in.").await?;
        Ok(Stage::Config)
    } else {
        send_err(writer, "Authentication failed. Try again.").await?;
        Ok(Stage::User)
    }
}

async fn handle_config(
    writer: &mut OwnedWriteHalf,
    argv: &[&str],
    config: &SharedConfig,
    metrics: &Metrics,
) -> Result<()> {
    let cmd = argv[0].to_ascii_uppercase();
    match (cmd.as_str(), argv.len()) {
        ("CMD", 1) => {
            let activated = {
                let mut config = config.write().expect("config poisoned");
                config.et_activated = !config.et_activated;
                config.et_activated
            };
            if activated {
                send_ok(writer, "External transformations activated.").await
            } else {
                send_ok(writer, "External transformations deactivated.").await
            }
        }
        ("CMD", 2) => {
            config.write().expect("config poisoned").filter_command = Some(argv[1].to_string());
            send_ok(writer, "Done.").await
        }
        ("MSG", 2) => {
            config.write().expect("config poisoned").replacement_msg = argv[1].to_string();
            send_ok(writer, "Done.").await
        }
        ("LIST", 1) => {
            let listing = config
                .read()
                .expect("config poisoned")
                .filtered_media_types
                .join('\n');
            send_ok(writer, &listing).await
        }
        ("BAN", 2) => match MediaType::parse(argv[1]) {
            Ok(media) => {
                let added = config
                    .write()
                    .expect("config poisoned")
                    .filtered_media_types
                    .insert(media);
                if added {
                    send_ok(writer, "type banned.").await
                } else {
                    send_err(writer, "could not ban type.").await
                }
            }
            Err(_) => send_err(writer, "wrong media type.").await,
        },
        ("UNBAN", 2) => match MediaType::parse(argv[1]) {
            Ok(media) => {
                let removed = config
                    .write()
                    .expect("config poisoned")
                    .filtered_media_types
                    .remove(&media);
                if removed {
                    send_ok(writer, "type unbanned.").await
                } else {
                    send_err(writer, "could not unban type.").await
                }
            }
            Err(_) => send_err(writer, "wrong media type.").await,
        },
        ("STATS", 1) => {
            let snap = metrics.snapshot();
            let report = format!(
                "\nMetrics\n\
                 Concurrent connections: {}\n\
                 Historical Access: {}\n\
                 Transferred Bytes: {}\n\
                 Retrieved Messages: {}",
                snap.concurrent_connections,
                snap.historical_accesses,
                snap.transferred_bytes,
                snap.retrieved_messages,
            );
            send_ok(writer, &report).await
        }
        ("CMD" | "MSG" | "LIST" | "BAN" | "UNBAN" | "STATS", _) => {
            send_err(writer, "wrong command or wrong number of arguments.").await
        }
        _ => send_err(writer, "command not recognized.").await,
    }
}

async fn send_ok(writer: &mut OwnedWriteHalf, message: &str) -> Result<()> {
    writer
        .write_all(format!("+OK {message}\n").as_bytes())
        .await?;
    Ok(())
}

async fn send_err(writer: &mut OwnedWriteHalf, message: &str) -> Result<()> {
    writer
        .write_all(format!("-ERR {message}\n").as_bytes())
        .await?;
    Ok(())
}
