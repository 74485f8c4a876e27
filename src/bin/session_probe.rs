//! Session Probe CLI
//!
//! Exercises the REST side of a watchlist without opening a channel: fetch an access token,
//! look up streaming endpoints, or print the effective configuration.
//!
//! Usage:
//!   cargo run --bin session-probe -- --config watchlist.toml token
//!   cargo run --bin session-probe -- discover --transport tcp --format rwf
//!   cargo run --bin session-probe -- discover --access-token "$TOKEN"
//!   cargo run --bin session-probe -- config --write watchlist.toml
//!
//! Token credentials come from the `[token]` table or `OMM_CLIENT_ID` / `OMM_CLIENT_SECRET` /
//! `OMM_TOKEN_URL`. A `.env` file is honoured.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use omm_session::rest::discovery::{DataFormat, DiscoveryTransport};
use omm_session::rest::{AuthTokenEvent, ReqwestExchange, ServiceDiscoveryEvent};
use omm_session::session::TransportError;
use omm_session::watchlist::msg::OutboundMsg;
use omm_session::{
    ChannelEvent, ChannelTransport, HostDescriptor, SystemClock, Watchlist, WatchlistCallback,
    WatchlistConfig, WatchlistError,
};

#[derive(Parser, Debug)]
#[command(name = "session-probe")]
#[command(about = "Probe token renewal and service discovery for a watchlist configuration")]
struct Args {
    /// Watchlist TOML; defaults to OMM_WATCHLIST_CONFIG or ./watchlist.toml
    #[arg(long, env = "OMM_WATCHLIST_CONFIG")]
    config: Option<String>,

    /// Give up after this many seconds
    #[arg(long, default_value = "20")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch one access token with the configured credentials
    Token,

    /// Look up streaming endpoints
    Discover {
        /// tcp or websocket
        #[arg(long)]
        transport: Option<String>,

        /// rwf or tr_json2
        #[arg(long)]
        format: Option<String>,

        /// Use this token instead of fetching one
        #[arg(long, env = "OMM_ACCESS_TOKEN")]
        access_token: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Also write it to this path
        #[arg(long)]
        write: Option<String>,
    },
}

// =============================================================================
// PROBE PLUMBING
// =============================================================================

/// The probe never opens a channel.
struct OfflineTransport;

impl ChannelTransport for OfflineTransport {
    fn connect(
        &mut self,
        host: &HostDescriptor,
        _auth_token: Option<&str>,
    ) -> Result<(), TransportError> {
        Err(TransportError::Connect(format!(
            "session-probe does not connect to {}",
            host
        )))
    }

    fn write(&mut self, _msg: &OutboundMsg) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// Prints what dispatch delivers and remembers how the probe ended.
#[derive(Default)]
struct ProbeOutput {
    token: Option<Result<(), WatchlistError>>,
    discovery: Option<Result<usize, WatchlistError>>,
}

impl WatchlistCallback for ProbeOutput {
    fn on_channel_event(&mut self, event: &ChannelEvent) {
        info!(from = %event.from, to = %event.to, reason = %event.reason, "channel_event");
    }

    fn on_auth_token(&mut self, event: &AuthTokenEvent) {
        match event {
            AuthTokenEvent::Renewed {
                token_type,
                expires_at,
            } => {
                println!("token: {} (expires_at_ns={})", token_type, expires_at);
                self.token = Some(Ok(()));
            }
            AuthTokenEvent::Retrying {
                attempt,
                retry_at,
                reason,
            } => {
                warn!(attempt, retry_at, reason = %reason, "token_retrying");
            }
            AuthTokenEvent::Failed(e) => {
                self.token = Some(Err(e.clone()));
            }
        }
    }

    fn on_service_discovery(&mut self, event: &ServiceDiscoveryEvent) {
        match &event.result {
            Ok(endpoints) => {
                println!("{} endpoint(s):", endpoints.len());
                for ep in endpoints {
                    println!(
                        "  {}:{}  transport={} formats={} locations={}",
                        ep.endpoint,
                        ep.port,
                        ep.transport,
                        ep.data_format.join(","),
                        ep.location.join(",")
                    );
                }
                self.discovery = Some(Ok(endpoints.len()));
            }
            Err(e) => self.discovery = Some(Err(e.clone())),
        }
    }

    fn on_error(&mut self, error: &WatchlistError) {
        warn!(kind = %error.kind(), error = %error, "watchlist_error");
    }

    fn on_warning(&mut self, message: &str) {
        warn!(warning = %message, "watchlist_warning");
    }
}

/// Dispatch until `done` holds or the deadline passes.
async fn pump(
    wl: &Watchlist,
    out: &mut ProbeOutput,
    timeout: Duration,
    done: impl Fn(&ProbeOutput) -> bool,
) -> Result<()> {
    let started = Instant::now();
    while !done(out) {
        if started.elapsed() > timeout {
            bail!("no answer within {:?}", timeout);
        }
        wl.dispatch(out).context("dispatch failed")?;
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    Ok(())
}

fn parse_transport(value: &str) -> Result<DiscoveryTransport> {
    match value.to_ascii_lowercase().as_str() {
        "tcp" => Ok(DiscoveryTransport::Tcp),
        "websocket" | "ws" => Ok(DiscoveryTransport::Websocket),
        other => bail!("unknown transport '{}'", other),
    }
}

fn parse_format(value: &str) -> Result<DataFormat> {
    match value.to_ascii_lowercase().as_str() {
        "rwf" => Ok(DataFormat::Rwf),
        "tr_json2" | "json" => Ok(DataFormat::TrJson2),
        other => bail!("unknown data format '{}'", other),
    }
}

fn load_config(path: Option<&str>) -> Result<WatchlistConfig> {
    match path {
        Some(path) => {
            let mut config = WatchlistConfig::load(path)
                .with_context(|| format!("Failed to load watchlist config: {}", path))?;
            config.apply_env();
            Ok(config)
        }
        None => Ok(WatchlistConfig::from_env()),
    }
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("omm_session=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    let timeout = Duration::from_secs(args.timeout_secs);

    if let Commands::Config { write } = &args.command {
        let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
        println!("{}", rendered);
        if let Some(path) = write {
            config
                .save(path)
                .with_context(|| format!("Failed to write config: {}", path))?;
            info!(path = %path, "config_written");
        }
        return Ok(());
    }

    if let Commands::Discover {
        transport, format, ..
    } = &args.command
    {
        if let Some(t) = transport {
            config.discovery.transport = Some(parse_transport(t)?);
        }
        if let Some(f) = format {
            config.discovery.data_format = Some(parse_format(f)?);
        }
    }

    let has_credentials = config.token.token_url.is_some() && config.token.client_id.is_some();
    let rest = Arc::new(ReqwestExchange::current(timeout)?);
    let wl = Watchlist::new(
        config,
        Box::new(OfflineTransport),
        rest,
        Arc::new(SystemClock::new()),
    );
    let mut out = ProbeOutput::default();

    match args.command {
        Commands::Token => {
            if !has_credentials {
                bail!("token needs token_url and client_id (config [token] or OMM_* env)");
            }
            pump(&wl, &mut out, timeout, |o| o.token.is_some()).await?;
            if let Some(Err(e)) = out.token.take() {
                bail!("token request failed: {}", e);
            }
        }
        Commands::Discover { access_token, .. } => {
            match access_token {
                Some(token) => wl.install_token(&token, 3_600),
                None if has_credentials => {
                    pump(&wl, &mut out, timeout, |o| o.token.is_some()).await?;
                    if let Some(Err(e)) = out.token.take() {
                        bail!("token request failed: {}", e);
                    }
                }
                None => warn!("discovering without an access token"),
            }
            let request_id = wl.discover_services();
            info!(request_id, "discovery_submitted");
            pump(&wl, &mut out, timeout, |o| o.discovery.is_some()).await?;
            if let Some(Err(e)) = out.discovery.take() {
                bail!("service discovery failed: {}", e);
            }
        }
        Commands::Config { .. } => {}
    }

    wl.shutdown();
    Ok(())
}
