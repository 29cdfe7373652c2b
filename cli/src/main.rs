mod commands;
mod render;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use strchat_core::{
    ChatCore, DisplayEvent, EngineSettings, MemoryNetwork, Transport, UserAction,
    resolve_config_dir,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const DEFAULT_LOG_FILTER: &str = "strchat_core=info,strchat=info,warn";

#[derive(Debug, Parser)]
#[command(name = "strchat", version)]
#[command(about = "Terminal chat over Nostr geohash and named channels")]
struct Cli {
    /// Directory for config.json, relays.json, the georelay cache and the log
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Read UserAction JSON lines on stdin, write DisplayEvent JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Use an in-process loopback relay network instead of the internet
    #[arg(long)]
    offline: bool,

    /// Log to stderr instead of <config_dir>/strchat.log
    #[arg(long)]
    log_stderr: bool,
}

fn init_logging(config_dir: &Path, to_stderr: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    if to_stderr {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
        return Ok(());
    }
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("create config dir {}", config_dir.display()))?;
    let path = config_dir.join("strchat.log");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file {}", path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

fn print_event(ev: &DisplayEvent, json: bool) {
    let line = if json {
        match serde_json::to_string(ev) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!("encode display event: {err}");
                return;
            }
        }
    } else {
        match render::render(ev) {
            Some(line) => line,
            None => return,
        }
    };
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

fn parse_input(line: &str, json: bool) -> Result<Option<UserAction>, String> {
    if !json {
        return commands::parse_line(line);
    }
    if line.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|err| format!("Invalid action: {err}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_dir = resolve_config_dir(cli.config_dir.clone())?;
    init_logging(&config_dir, cli.log_stderr)?;
    strchat_core::init_rustls_crypto_provider();

    let mut settings = EngineSettings::from_env();
    let transport = if cli.offline {
        settings.georelays_url.clear();
        Transport::Memory(MemoryNetwork::new())
    } else {
        Transport::Nostr
    };
    tracing::info!(config_dir = %config_dir.display(), offline = cli.offline, json = cli.json, "starting strchat");

    let handle = ChatCore::start(&config_dir, settings, transport)
        .with_context(|| format!("start chat core in {}", config_dir.display()))?;
    let cancel = handle.cancel_token();

    let updates = handle.updates();
    let json = cli.json;
    let printer = tokio::spawn(async move {
        while let Ok(ev) = updates.recv_async().await {
            print_event(&ev, json);
            if ev == DisplayEvent::Shutdown {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => match parse_input(&line, json) {
                Ok(Some(action)) => {
                    let quit = action == UserAction::Quit;
                    handle.dispatch(action);
                    if quit {
                        break;
                    }
                }
                Ok(None) => {}
                Err(message) => print_event(&DisplayEvent::error(message), json),
            },
            Ok(None) => break,
            Err(err) => {
                tracing::warn!("reading stdin failed: {err}");
                break;
            }
        }
    }

    handle.dispatch(UserAction::Quit);
    handle.join().await;
    if let Err(err) = printer.await {
        tracing::warn!("printer task ended abnormally: {err}");
    }
    Ok(())
}
