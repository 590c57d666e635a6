use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use jsonrpc_duplex::jsonrpc::{
    Connection, ErrorObject, NotificationMethod, NotificationRegistry, PeerPair, RawCodec, Reply,
    RequestMethod, RequestRegistry, ShutdownReason, TransportConfig, Vocabulary,
};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// JSON-RPC echo peer over stdio with Content-Length framing
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Largest accepted inbound frame in bytes
    #[arg(long, default_value_t = TransportConfig::default().max_frame_bytes)]
    max_frame_bytes: usize,

    /// Milliseconds shutdown waits for queued outbound frames
    #[arg(long, default_value_t = TransportConfig::default().drain_timeout_ms)]
    drain_timeout_ms: u64,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddParams {
    a: f64,
    b: f64,
}

/// Methods this peer serves
struct EchoVocabulary {
    vocabulary: Vocabulary,
    echo: RequestMethod<Value, Value>,
    ping: RequestMethod<(), String>,
    add: RequestMethod<AddParams, f64>,
    log: NotificationMethod<Value>,
}

/// Methods the connected client is expected to serve
struct ClientVocabulary {
    vocabulary: Vocabulary,
    status: NotificationMethod<Value>,
}

fn echo_vocabulary() -> anyhow::Result<EchoVocabulary> {
    let mut requests = RequestRegistry::builder();
    let echo = requests.register("echo", RawCodec, RawCodec)?;
    let ping = requests.register_json("ping")?;
    let add = requests.register_json("add")?;

    let mut notifications = NotificationRegistry::builder();
    let log = notifications.register("log", RawCodec)?;

    Ok(EchoVocabulary {
        vocabulary: Vocabulary::new(requests.build(), notifications.build()),
        echo,
        ping,
        add,
        log,
    })
}

fn client_vocabulary() -> anyhow::Result<ClientVocabulary> {
    let mut notifications = NotificationRegistry::builder();
    let status = notifications.register("status", RawCodec)?;

    Ok(ClientVocabulary {
        vocabulary: Vocabulary::new(RequestRegistry::builder().build(), notifications.build()),
        status,
    })
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let own = echo_vocabulary().context("failed to build echo vocabulary")?;
    let client = client_vocabulary().context("failed to build client vocabulary")?;
    let side = PeerPair::new(own.vocabulary.clone(), client.vocabulary.clone()).side_a();

    let requests = side
        .request_server()
        .handle(&own.echo, |params| async move { Reply::Success(params) })
        .handle(&own.ping, |_| async { Reply::Success("pong".to_string()) })
        .handle(&own.add, |p: AddParams| async move {
            let sum = p.a + p.b;
            if sum.is_finite() {
                Reply::Success(sum)
            } else {
                Reply::Error(ErrorObject::custom(1, "sum is not finite", Some(json!([p.a, p.b]))))
            }
        });
    let notifications = side
        .notification_server()
        .handle(&own.log, |params| info!("Log: {}", params));
    let inbound = side
        .inbound(requests, notifications)
        .context("failed to build dispatchers")?;

    let config = TransportConfig {
        max_frame_bytes: cli.max_frame_bytes,
        drain_timeout_ms: cli.drain_timeout_ms,
    };
    let connection = Connection::spawn(
        tokio::io::stdin(),
        tokio::io::stdout(),
        config,
        inbound.requests,
        inbound.notifications,
    );

    let remote = side.remote(Arc::new(connection.engine().clone()));
    remote
        .notifications
        .notify(&client.status, json!({"state": "ready"}))
        .context("failed to announce readiness")?;
    info!("Echo peer ready: echo, ping, add; notifications: log");

    match connection.closed().await {
        ShutdownReason::Eof | ShutdownReason::Requested => {
            debug!("Connection closed");
            Ok(())
        }
        ShutdownReason::ReadFailed(e) | ShutdownReason::WriteFailed(e) => {
            warn!("Connection failed: {}", e);
            Err(anyhow::anyhow!("connection failed: {}", e))
        }
    }
}
