use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use signal_bus::Subscription;
use tracing::{info, warn};
use voice_room_core::config::{Config, normalize_localhost};
use voice_room_core::negotiation::protocol::{
    GET_ROUTER_RTP_CAPABILITIES, ROUTER_RTP_CAPABILITIES, reject_negative,
};
use voice_room_core::signaling::app_events::{
    SOCKET_AUTH_ERROR, SOCKET_CONNECT_ERROR, SOCKET_INSUFFICIENT_FUNDS,
};
use voice_room_core::signaling::{AppEvents, EVENT_CONNECT, SignalingClient};
use voice_room_core::telemetry::logging::{self, LogConfig, LogLevel};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "voice-room", about = "Voice room signaling diagnostics")]
struct Cli {
    #[arg(long, value_enum, default_value_t = LogLevel::Warn, help = "Log verbosity")]
    log_level: LogLevel,

    #[arg(long, help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[arg(long, env = "VOICE_ROOM_SOCKET_URL", help = "Signaling server base URL")]
    url: Option<String>,

    #[arg(long, env = "VOICE_ROOM_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the signaling server and report whether the handshake is accepted
    Probe,
    /// Print the router RTP capabilities of a room
    Capabilities {
        #[arg(long)]
        room: String,
    },
}

enum ConnectOutcome {
    Connected,
    Rejected { event: String, reason: String },
    TimedOut,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    if let Err(err) = logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    }) {
        eprintln!("⚠️  {err}");
    }

    let mut config = Config::from_env();
    if let Some(url) = cli.url.as_deref() {
        config.socket_url = normalize_localhost(url);
    }
    if cli.token.is_some() {
        config.auth_token = cli.token.clone().filter(|token| !token.trim().is_empty());
    }

    match run(cli.command, &config).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("❌ {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &Config) -> anyhow::Result<ExitCode> {
    let app_events = AppEvents::new();
    let mut failures = FailureWatch::new(&app_events);
    let client = SignalingClient::connect(config.signaling_config(), app_events);
    let outcome = await_connect(&client, &mut failures).await;

    let code = match (command, outcome) {
        (_, ConnectOutcome::Rejected { event, reason }) => {
            eprintln!("❌ handshake rejected ({event}): {reason}");
            ExitCode::from(2)
        }
        (_, ConnectOutcome::TimedOut) => {
            eprintln!("❌ no handshake from {} within {PROBE_TIMEOUT:?}", config.socket_url);
            ExitCode::from(3)
        }
        (Command::Probe, ConnectOutcome::Connected) => {
            println!("✅ connected to {}", config.socket_url);
            ExitCode::SUCCESS
        }
        (Command::Capabilities { room }, ConnectOutcome::Connected) => {
            let capabilities = fetch_capabilities(&client, &room, config.match_timeout).await?;
            println!("{}", serde_json::to_string_pretty(&capabilities)?);
            ExitCode::SUCCESS
        }
    };
    client.disconnect();
    Ok(code)
}

/// App-event subscriptions taken before connecting, so no rejection is missed.
struct FailureWatch {
    auth: Subscription,
    funds: Subscription,
    generic: Subscription,
}

impl FailureWatch {
    fn new(app_events: &AppEvents) -> Self {
        Self {
            auth: app_events.subscribe(SOCKET_AUTH_ERROR),
            funds: app_events.subscribe(SOCKET_INSUFFICIENT_FUNDS),
            generic: app_events.subscribe(SOCKET_CONNECT_ERROR),
        }
    }

    async fn next(&mut self) -> Option<(String, String)> {
        let event = tokio::select! {
            event = self.auth.recv() => event,
            event = self.funds.recv() => event,
            event = self.generic.recv() => event,
        };
        let event = event.ok()?;
        let reason = event
            .payload
            .get("reason")
            .and_then(|reason| reason.as_str())
            .unwrap_or("unknown")
            .to_string();
        Some((event.name, reason))
    }
}

async fn await_connect(client: &SignalingClient, failures: &mut FailureWatch) -> ConnectOutcome {
    let mut connected = client.on(EVENT_CONNECT);
    if client.is_connected() {
        return ConnectOutcome::Connected;
    }
    let settle = async {
        tokio::select! {
            _ = connected.recv() => ConnectOutcome::Connected,
            failure = failures.next() => match failure {
                Some((event, reason)) => ConnectOutcome::Rejected { event, reason },
                None => ConnectOutcome::TimedOut,
            },
        }
    };
    match tokio::time::timeout(PROBE_TIMEOUT, settle).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(timeout = ?PROBE_TIMEOUT, "handshake did not settle");
            ConnectOutcome::TimedOut
        }
    }
}

async fn fetch_capabilities(
    client: &SignalingClient,
    room: &str,
    timeout: Duration,
) -> anyhow::Result<serde_json::Value> {
    if room.trim().is_empty() {
        bail!("room id must not be empty");
    }
    let pending = client.once(ROUTER_RTP_CAPABILITIES).with_timeout(timeout);
    let reply = client
        .request(
            GET_ROUTER_RTP_CAPABILITIES,
            serde_json::json!({ "roomId": room }),
            pending,
        )
        .await
        .context("requesting router capabilities")?;
    reject_negative(ROUTER_RTP_CAPABILITIES, &reply)?;
    info!(room, "router capabilities received");
    Ok(reply)
}
