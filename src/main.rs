use std::path::PathBuf;
use std::time::Duration;

use color_eyre::{
    eyre::{bail, eyre},
    Result,
};
use eraser_relay::gateway::HttpBridge;
use eraser_relay::relay::DeviceWatch;
use eraser_relay::{DeviceId, Relay, RelayConfig, Verb};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const USAGE: &str = "\
usage:
  eraser-relay [run] [CONFIG]
  eraser-relay send <DEVICE> <VERB> [CONFIG]
  eraser-relay http <VERB> [ENDPOINT] [CONFIG]
  eraser-relay motor [ENDPOINT] [CONFIG]";

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("run");
    let rest = args.get(1..).unwrap_or_default();

    match command {
        "run" => run(load_config(rest.first()).await?).await,
        "send" => {
            let [device, verb, tail @ ..] = rest else {
                bail!("{USAGE}");
            };
            let config = load_config(tail.first()).await?;
            send(config, device.parse()?, verb.parse()?).await
        }
        "http" => {
            let [verb, tail @ ..] = rest else {
                bail!("{USAGE}");
            };
            let config = load_config(tail.get(1)).await?;
            let verb: Verb = verb.parse()?;
            let bridge = http_bridge(&config)?;
            let endpoint = tail.first().unwrap_or(&config.http_bridge.base_url);
            let result = bridge.send_http_command(endpoint, verb).await?;
            info!("Bridge answered {}: {}", verb, result);
            Ok(())
        }
        "motor" => {
            let config = load_config(rest.get(1)).await?;
            let bridge = http_bridge(&config)?;
            let endpoint = rest.first().unwrap_or(&config.http_bridge.base_url);
            let result = bridge.run_motor(endpoint).await?;
            info!("Bridge answered runMotor: {}", result);
            Ok(())
        }
        _ => Err(eyre!("{USAGE}")),
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

async fn load_config(path: Option<&String>) -> Result<RelayConfig> {
    let path = match path {
        Some(path) => PathBuf::from(path),
        None => {
            let path = RelayConfig::default_path();
            RelayConfig::ensure_default(&path).await?;
            path
        }
    };
    info!("Using configuration {}", path.display());
    Ok(RelayConfig::load(&path).await?)
}

fn http_bridge(config: &RelayConfig) -> Result<HttpBridge> {
    Ok(HttpBridge::new(Duration::from_millis(
        config.http_bridge.timeout_ms,
    ))?)
}

async fn run(config: RelayConfig) -> Result<()> {
    let relay = Relay::start(config).await?;

    let mut followers = JoinSet::new();
    for id in &relay.config().devices.watch {
        followers.spawn(follow(relay.watch(id.as_str())?));
    }
    if followers.is_empty() {
        warn!("No devices listed under [devices] watch, only the broker link is monitored");
    }

    let mut link = relay.link_status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = link.changed() => {
                if changed.is_err() {
                    break;
                }
                debug!("Broker link is {:?}", *link.borrow_and_update());
            }
        }
    }

    info!("Interrupted, stopping");
    followers.shutdown().await;
    relay.shutdown().await;
    Ok(())
}

/// Logs every response and log line of one device until its watch ends
async fn follow(mut watch: DeviceWatch) {
    let mut seen = watch.snapshot();
    while let Some(session) = watch.changed().await {
        if session.last_response != seen.last_response {
            if let Some(response) = &session.last_response {
                info!("Device {} responded: {}", watch.device(), response);
            }
        }
        if session.recent_logs != seen.recent_logs {
            if let Some(line) = session.latest_log() {
                info!("Device {} log: {}", watch.device(), line);
            }
        }
        seen = session;
    }
}

async fn send(config: RelayConfig, device: DeviceId, verb: Verb) -> Result<()> {
    let relay = Relay::start(config).await?;
    let wait = relay.config().command_timeout();

    let mut watch = relay.watch(device.clone())?;
    let result: Result<_> = if watch.wait_until_online(wait).await {
        relay.send_command(&device, verb).await.map_err(Into::into)
    } else {
        Err(eyre!("Device {} did not report online within {:?}", device, wait))
    };
    drop(watch);
    relay.shutdown().await;

    let result = result?;
    info!("Device {} answered {}: {}", device, verb, result);
    Ok(())
}
