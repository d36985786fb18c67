use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sandbox_bridge::{
    message_channel, HostEndpoint, HostStore, SandboxConfig, SandboxSession, ScriptFetcher,
};
use tracing_subscriber::EnvFilter;
use url::Url;

const USAGE: &str = "usage: sandbox-bridge <entry.html> [content-id]";

fn main() {
    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
    if subscriber_result.is_err() {
        // tracing was already initialised; continue silently
    }

    let mut args = std::env::args().skip(1);
    let Some(entry) = args.next().map(PathBuf::from) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };
    let content_id = args.next().unwrap_or_else(|| default_content_id(&entry));

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| {
            eprintln!("Failed to start async runtime: {err}");
            std::process::exit(1);
        });

    match rt.block_on(run(&entry, content_id)) {
        Ok(html) => println!("{html}"),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    }
}

async fn run(entry: &Path, content_id: String) -> Result<String> {
    let config = SandboxConfig::from_env().context("failed to load sandbox configuration")?;

    let entry = entry
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", entry.display()))?;
    let html = tokio::fs::read_to_string(&entry)
        .await
        .with_context(|| format!("failed to read {}", entry.display()))?;
    let base_url =
        Url::from_file_path(&entry).map_err(|_| anyhow!("{} is not a valid file URL", entry.display()))?;

    let store = Arc::new(HostStore::new().context("failed to open host store")?);
    let (context_port, host_port) = message_channel();
    let (endpoint, mut signals) = HostEndpoint::new(content_id.clone(), store, host_port);
    let host = tokio::spawn(endpoint.serve());

    let fetcher = Rc::new(ScriptFetcher::new(base_url, config.fetch_timeout()));
    let mut session = SandboxSession::bootstrap(&html, Some(context_port), fetcher, &config).await?;
    session.run().await;
    let report = session.settle(config.settle()).await;
    let html = session.document_html();

    tracing::info!(
        target: "sandbox::cli",
        content = %content_id,
        executed = report.executed,
        errored = report.errored,
        async_errors = report.async_errors,
        degraded = report.degraded.as_deref().unwrap_or("no"),
        "session finished"
    );

    // Closing the context lets the host drain whatever is still queued.
    drop(session);
    let handled = host.await.context("host endpoint task failed")?;
    tracing::debug!(target: "sandbox::cli", handled, "host endpoint drained");
    while let Ok(command) = signals.commands.try_recv() {
        tracing::info!(target: "sandbox::cli", name = %command.name, payload = %command.payload, "content command");
    }

    Ok(html)
}

fn default_content_id(entry: &Path) -> String {
    entry
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("content")
        .to_string()
}
