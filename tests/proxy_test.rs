//! Integration tests for the proxy engine using the fake origin.
//!
//! Each test scripts an origin (`OriginBuilder`), starts a
//! `ProxyServer` on a random port pointed at it, connects a raw TCP
//! client, and asserts on the exact bytes each side observed.

mod fake_origin;

use fake_origin::{FakeOriginServer, OriginBuilder};
use popguard::{Config, MediaTypeSet, Metrics, ProxyServer, SharedConfig};
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const BANNER: &str = "+OK Proxy server POP3 ready.\r\n";

fn config_for(origin_port: u16) -> Config {
    Config {
        listen_address: "127.0.0.1".to_string(),
        port: 0,
        origin_server: "127.0.0.1".to_string(),
        origin_port,
        management_address: "127.0.0.1".to_string(),
        management_port: 0,
        replacement_msg: "Part replaced.".to_string(),
        filtered_media_types: MediaTypeSet::new(),
        et_activated: false,
        filter_command: None,
        error_file: "/dev/null".to_string(),
        version: "test".to_string(),
        user: "admin".to_string(),
        pass: "secret".to_string(),
    }
}

async fn start_proxy(config: Config) -> (SocketAddr, SharedConfig, Arc<Metrics>) {
    let shared: SharedConfig = Arc::new(RwLock::new(config));
    let metrics = Arc::new(Metrics::new());
    let server = ProxyServer::bind("127.0.0.1:0", shared.clone(), metrics.clone())
        .await
        .expect("bind proxy");
    let addr = server.local_addr().expect("proxy address");
    tokio::spawn(server.run());
    (addr, shared, metrics)
}

/// Connect, send the whole client script, and read until the proxy
/// closes the connection.
async fn converse(addr: SocketAddr, script: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect to proxy");
    stream
        .write_all(script.as_bytes())
        .await
        .expect("send script");
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.expect("read to end");
    String::from_utf8_lossy(&out).into_owned()
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn happy_user_pass_quit() {
    let origin = FakeOriginServer::start(
        OriginBuilder::new()
            .greeting("+OK hi")
            .capability("PIPELINING")
            .build(),
    )
    .await;
    let (addr, _config, _metrics) = start_proxy(config_for(origin.port())).await;

    let output = converse(addr, "USER a\r\nPASS b\r\nQUIT\r\n").await;

    assert_eq!(
        output,
        format!("{BANNER}+OK hi\r\n+OK\r\n+OK\r\n+OK\r\n")
    );
    assert_eq!(origin.received(), vec!["CAPA", "USER a", "PASS b", "QUIT"]);
}

#[tokio::test]
async fn no_pipelining_serializes_requests() {
    let origin = FakeOriginServer::start(
        OriginBuilder::new()
            .greeting("+OK hi")
            .capability("USER")
            .capability("TOP")
            .build(),
    )
    .await;
    let (addr, _config, _metrics) = start_proxy(config_for(origin.port())).await;

    let output = converse(addr, "CAPA\r\nUSER a\r\nPASS b\r\nQUIT\r\n").await;

    // Requests reach the origin one at a time, in client order, with
    // the proxy's own probe first.
    assert_eq!(
        origin.received(),
        vec!["CAPA", "CAPA", "USER a", "PASS b", "QUIT"]
    );
    // The client-visible capability list always advertises
    // pipelining, although the origin's does not.
    assert!(output.contains("PIPELINING\r\n.\r\n"), "{output:?}");
    assert!(output.contains("USER\r\nTOP\r\n"), "{output:?}");
}

#[tokio::test]
async fn capa_terminator_split_across_reads() {
    let origin = FakeOriginServer::start(
        OriginBuilder::new()
            .capability("USER")
            .split_capa()
            .build(),
    )
    .await;
    let (addr, _config, _metrics) = start_proxy(config_for(origin.port())).await;

    let output = converse(addr, "CAPA\r\nQUIT\r\n").await;

    assert!(output.contains("USER\r\nPIPELINING\r\n.\r\n"), "{output:?}");
}

#[tokio::test]
async fn retr_without_transformation_relays_verbatim() {
    let origin = FakeOriginServer::start(
        OriginBuilder::new()
            .capability("PIPELINING")
            .mail("Hello\r\n")
            .build(),
    )
    .await;
    let (addr, _config, metrics) = start_proxy(config_for(origin.port())).await;

    let output = converse(addr, "RETR 1\r\nQUIT\r\n").await;

    assert!(output.contains("+OK 7 octets\r\nHello\r\n.\r\n"), "{output:?}");
    let snap = metrics.snapshot();
    assert_eq!(snap.retrieved_messages, 1);
    assert!(snap.transferred_bytes >= 7);
}

#[tokio::test]
async fn retr_with_cat_filter_substitutes_body() {
    let origin = FakeOriginServer::start(
        OriginBuilder::new()
            .capability("PIPELINING")
            .mail("Hi\r\n")
            .build(),
    )
    .await;
    let mut config = config_for(origin.port());
    config.et_activated = true;
    config.filter_command = Some("cat".to_string());
    let (addr, _config, metrics) = start_proxy(config).await;

    let output = converse(addr, "RETR 1\r\nQUIT\r\n").await;

    assert!(
        output.contains("+OK sending mail.\r\nHi\r\n.\r\n"),
        "{output:?}"
    );
    // The origin's own status line never reaches the client.
    assert!(!output.contains("octets"), "{output:?}");
    assert_eq!(metrics.snapshot().retrieved_messages, 1);
}

#[tokio::test]
async fn filter_rewrites_body() {
    let origin = FakeOriginServer::start(
        OriginBuilder::new()
            .capability("PIPELINING")
            .mail("lowercase body\r\n")
            .build(),
    )
    .await;
    let mut config = config_for(origin.port());
    config.et_activated = true;
    config.filter_command = Some("tr a-z A-Z".to_string());
    let (addr, _config, _metrics) = start_proxy(config).await;

    let output = converse(addr, "RETR 1\r\nQUIT\r\n").await;

    assert!(
        output.contains("+OK sending mail.\r\nLOWERCASE BODY\r\n.\r\n"),
        "{output:?}"
    );
}

#[tokio::test]
async fn filter_spawn_failure_keeps_session_alive() {
    let origin = FakeOriginServer::start(
        OriginBuilder::new()
            .capability("PIPELINING")
            .mail("Hello\r\n")
            .build(),
    )
    .await;
    let mut config = config_for(origin.port());
    config.et_activated = true;
    config.filter_command = Some("/does/not/exist".to_string());
    let (addr, _config, _metrics) = start_proxy(config).await;

    let output = converse(addr, "RETR 1\r\nNOOP\r\nQUIT\r\n").await;

    let failure = "-ERR could not open external transformation.\r\n\r\n.\r\n";
    assert!(output.contains(failure), "{output:?}");
    // The session survives: NOOP and QUIT still answer.
    let after = &output[output.find(failure).unwrap() + failure.len()..];
    assert_eq!(after, "+OK\r\n+OK\r\n");
}

#[tokio::test]
async fn three_invalid_commands_close_the_session() {
    let origin = FakeOriginServer::start(OriginBuilder::new().greeting("+OK hi").build()).await;
    let (addr, _config, _metrics) = start_proxy(config_for(origin.port())).await;

    let output = converse(addr, "@@@\r\n@@@\r\n@@@\r\n").await;

    assert_eq!(
        output,
        format!(
            "{BANNER}+OK hi\r\n\
             -ERR Unknown command. (POPG)\r\n\
             -ERR Unknown command. (POPG)\r\n\
             -ERR Unknown command. (POPG)\r\n\
             -ERR Too many invalid commands. (POPG)\n"
        )
    );
}

#[tokio::test]
async fn valid_command_resets_the_invalid_streak() {
    let origin = FakeOriginServer::start(OriginBuilder::new().build()).await;
    let (addr, _config, _metrics) = start_proxy(config_for(origin.port())).await;

    let output = converse(addr, "@@@\r\n@@@\r\nNOOP\r\n@@@\r\n@@@\r\nQUIT\r\n").await;

    assert_eq!(output.matches("-ERR Unknown command. (POPG)\r\n").count(), 4);
    assert!(!output.contains("Too many invalid commands"), "{output:?}");
    // NOOP and QUIT both relayed.
    assert_eq!(output.matches("+OK\r\n").count(), 2);
}

#[tokio::test]
async fn overlong_commands_get_specific_errors() {
    let origin = FakeOriginServer::start(OriginBuilder::new().build()).await;
    let (addr, _config, _metrics) = start_proxy(config_for(origin.port())).await;

    let long_arg = "a".repeat(60);
    let script = format!("RETRIEVE 1\r\nUSER {long_arg}\r\nQUIT\r\n");
    let output = converse(addr, &script).await;

    assert!(output.contains("-ERR Command too long.\r\n"), "{output:?}");
    assert!(output.contains("-ERR Parameter too long.\r\n"), "{output:?}");
}

#[tokio::test]
async fn origin_refusing_connections_reports_to_client() {
    // Grab a port that nothing listens on.
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (addr, _config, _metrics) = start_proxy(config_for(closed_port)).await;

    let output = converse(addr, "").await;

    assert_eq!(output, "-ERR Connection refused.\r\n");
}

#[tokio::test]
async fn metrics_track_connection_lifecycle() {
    let origin = FakeOriginServer::start(OriginBuilder::new().build()).await;
    let (addr, _config, metrics) = start_proxy(config_for(origin.port())).await;

    let _ = converse(addr, "QUIT\r\n").await;

    let snap = metrics.snapshot();
    assert_eq!(snap.historical_accesses, 1);
    assert_eq!(snap.concurrent_connections, 0);
}

#[tokio::test]
async fn toggling_et_off_restores_verbatim_relay() {
    let origin = FakeOriginServer::start(
        OriginBuilder::new()
            .capability("PIPELINING")
            .mail("Body\r\n")
            .build(),
    )
    .await;
    let mut config = config_for(origin.port());
    config.et_activated = true;
    config.filter_command = Some("cat".to_string());
    let (addr, shared, _metrics) = start_proxy(config).await;

    // Management-style toggle: sessions read the live record.
    shared.write().unwrap().et_activated = false;

    let output = converse(addr, "RETR 1\r\nQUIT\r\n").await;
    assert!(output.contains("+OK 6 octets\r\nBody\r\n.\r\n"), "{output:?}");
    assert!(!output.contains("sending mail"), "{output:?}");
}
