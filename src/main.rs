mod config;
mod dashboard;
mod error;
mod fetcher;
mod field_path;
mod json_paths;
mod live_channel;
mod paginate;
mod poller;
mod store;
mod timeseries;
mod utils;
mod views;
mod widget;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;

use crate::{
    config::Settings,
    dashboard::DashboardState,
    fetcher::{parse_body, Fetcher},
    live_channel::ChannelManager,
    poller::Poller,
    store::{DashboardStore, SqliteStore},
    timeseries::FieldMapping,
};

#[derive(Debug, Parser)]
#[command(name = "finboard", version, about = "Widget dashboard backend for JSON finance APIs")]
struct Cli {
    /// Override DASHBOARD_HOST
    #[arg(long, global = true)]
    host: Option<String>,
    /// Override DASHBOARD_PORT
    #[arg(long, global = true)]
    port: Option<u16>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP API, pollers and live channel (default)
    Serve,
    /// List the field paths of a sample document (URL or file)
    Paths {
        source: String,
        #[arg(long)]
        max_depth: Option<usize>,
    },
    /// Print the chart series derived from a document (URL or file)
    Normalize {
        source: String,
        #[arg(long)]
        x: Option<String>,
        #[arg(long)]
        y: Option<String>,
    },
    /// Write the saved dashboard to a file
    Export { file: PathBuf },
    /// Load a dashboard file, replacing the saved one unless --merge is given
    Import {
        file: PathBuf,
        #[arg(long)]
        merge: bool,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(h) = cli.host {
        settings.dashboard_host = h;
    }
    if let Some(p) = cli.port {
        settings.dashboard_port = p;
    }
    settings.validate()?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings).await,
        Command::Paths { source, max_depth } => {
            let sample = load_source(&settings, &source).await?;
            let fields = json_paths::extract_paths(&sample, max_depth.unwrap_or(settings.sample_max_depth));
            println!("{}", serde_json::to_string_pretty(&fields)?);
            Ok(())
        }
        Command::Normalize { source, x, y } => {
            let payload = load_source(&settings, &source).await?;
            let mapping = FieldMapping::new(x.as_deref(), y.as_deref());
            let points = timeseries::normalize(&payload, mapping.is_active().then_some(&mapping));
            println!("{}", serde_json::to_string_pretty(&points)?);
            Ok(())
        }
        Command::Export { file } => {
            let store = open_store(&settings)?;
            std::fs::write(&file, store.export_config()?)
                .with_context(|| format!("write {}", file.display()))?;
            log::info!("app.export file={} widgets={}", file.display(), store.widgets().len());
            Ok(())
        }
        Command::Import { file, merge } => {
            let store = open_store(&settings)?;
            let text = std::fs::read_to_string(&file).with_context(|| format!("read {}", file.display()))?;
            let state = store.import_config(&text, merge)?;
            log::info!(
                "app.import file={} merge={} widgets={} theme={:?}",
                file.display(),
                merge,
                state.widgets.len(),
                state.theme
            );
            Ok(())
        }
    }
}

fn open_store(settings: &Settings) -> Result<DashboardStore> {
    let db = SqliteStore::new(&settings.sqlite_path)?;
    DashboardStore::open(db, &settings.state_key)
}

/// Reads a document from an http(s) URL or a local file.
async fn load_source(settings: &Settings, source: &str) -> Result<JsonValue> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let fetcher = Fetcher::new(settings.fetch_timeout(), settings.proxy_url.clone())?;
        return Ok(fetcher.fetch_json(source).await?);
    }
    let text = std::fs::read_to_string(source).with_context(|| format!("read {source}"))?;
    Ok(parse_body(&text))
}

async fn serve(settings: Settings) -> Result<()> {
    let store = open_store(&settings)?;
    let channels = Arc::new(ChannelManager::websocket(settings.ws_reconnect_delay()));
    let fetcher = Fetcher::new(settings.fetch_timeout(), Some(settings.effective_proxy_url()))?;
    let poller = Poller::new(
        fetcher,
        channels.clone(),
        &settings.ws_url,
        settings.live_series_cap,
        settings.polling_enabled,
    );

    log::info!(
        "app.start sqlite={} widgets={} ws={} proxy={} polling={}",
        store.path(),
        store.widgets().len(),
        settings.ws_url,
        settings.effective_proxy_url(),
        settings.polling_enabled
    );
    poller.sync(&store.widgets());

    if settings.dashboard_open_browser {
        let url = format!("http://{}:{}/api/state", settings.dashboard_host, settings.dashboard_port);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(650)).await;
            let _ = std::process::Command::new("xdg-open").arg(&url).spawn();
        });
    }

    let state = DashboardState {
        settings,
        store,
        poller: poller.clone(),
        channels: channels.clone(),
    };

    let result = tokio::select! {
        r = dashboard::serve_dashboard(state) => r,
        _ = tokio::signal::ctrl_c() => {
            log::info!("app.signal ctrl_c");
            Ok(())
        }
    };

    poller.shutdown();
    channels.shutdown();
    if let Err(e) = &result {
        log::error!("dashboard.error {:#}", e);
    }
    result
}
