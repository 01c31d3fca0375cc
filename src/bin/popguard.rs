#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

//! POP3 proxy daemon

use clap::Parser;
use popguard::{Config, ManagementServer, MediaType, MediaTypeSet, Metrics, ProxyServer};
use std::sync::{Arc, RwLock};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "popguard")]
#[command(about = "Transparent POP3 proxy with external mail transformation")]
struct Args {
    /// Origin POP3 server host name or address
    origin_server: String,

    /// Origin POP3 server port
    #[arg(long, default_value = "110")]
    origin_port: u16,

    /// Client-side listen address
    #[arg(short = 'l', long, default_value = "0.0.0.0")]
    listen_address: String,

    /// Client-side listen port
    #[arg(short = 'p', long, default_value = "1110")]
    port: u16,

    /// Management channel listen address
    #[arg(short = 'L', long, default_value = "127.0.0.1")]
    management_address: String,

    /// Management channel listen port
    #[arg(short = 'o', long, default_value = "9090")]
    management_port: u16,

    /// Message substituted for filtered mail parts
    #[arg(short = 'M', long, default_value = "Part replaced.")]
    replacement_msg: String,

    /// MIME type/subtype to filter (repeatable, e.g. -m image/png)
    #[arg(short = 'm', long = "media-type")]
    media_types: Vec<String>,

    /// Shell command run over each retrieved mail
    #[arg(short = 't', long)]
    filter_command: Option<String>,

    /// File the filter's stderr is appended to
    #[arg(short = 'e', long, default_value = "/dev/null")]
    error_file: String,

    /// Management user name (falls back to POPGUARD_USER)
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Management password (falls back to POPGUARD_PASS)
    #[arg(short = 'w', long)]
    pass: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Arc::new(RwLock::new(build_config(args)?));
    let metrics = Arc::new(Metrics::new());

    let (proxy_addr, management_addr) = {
        let config = config.read().expect("config poisoned");
        (
            format!("{}:{}", config.listen_address, config.port),
            format!("{}:{}", config.management_address, config.management_port),
        )
    };

    let proxy = ProxyServer::bind(proxy_addr, config.clone(), metrics.clone()).await?;
    let management = ManagementServer::bind(management_addr, config, metrics).await?;

    tokio::select! {
        result = proxy.run() => result?,
        result = management.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}

fn build_config(args: Args) -> anyhow::Result<Config> {
    let (user, pass) = match (args.user, args.pass) {
        (Some(user), Some(pass)) => (user, pass),
        _ => Config::credentials_from_env()?,
    };

    let mut filtered_media_types = MediaTypeSet::new();
    for raw in &args.media_types {
        filtered_media_types.insert(MediaType::parse(raw)?);
    }

    Ok(Config {
        listen_address: args.listen_address,
        port: args.port,
        origin_server: args.origin_server,
        origin_port: args.origin_port,
        management_address: args.management_address,
        management_port: args.management_port,
        replacement_msg: args.replacement_msg,
        filtered_media_types,
        et_activated: args.filter_command.is_some(),
        filter_command: args.filter_command,
        error_file: args.error_file,
        version: env!("CARGO_PKG_VERSION").to_string(),
        user,
        pass,
    })
}
