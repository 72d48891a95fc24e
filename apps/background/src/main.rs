mod config;
mod script;

use std::{
    io::{self, Read, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use channel::MemoryHost;
use clap::Parser;
use controllers::{kinds::register_all, Registry, Services};
use crypto::PassthroughCrypto;
use keyring::InMemoryKeyStore;
use messaging::EventHandler;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::load_settings,
    script::{parse, Console},
};

/// Runs the extension background routing core against an in-process host and
/// drives it from a script of UI-side commands.
#[derive(Parser, Debug)]
struct Args {
    /// TOML settings file; `APP__*` environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Script of JSON commands, one per line. Read from stdin when omitted.
    #[arg(long)]
    script: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(args.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let source = match &args.script {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script '{}'", path.display()))?,
        None => {
            let mut source = String::new();
            io::stdin()
                .read_to_string(&mut source)
                .context("failed to read script from stdin")?;
            source
        }
    };
    let commands = parse(&source)?;

    let (host, incoming) = MemoryHost::new();
    let services = Services::new(
        Arc::new(PassthroughCrypto::new()),
        Arc::new(InMemoryKeyStore::new()),
        host.clone(),
    )
    .with_password_ttl(Duration::from_secs(settings.password_cache_ttl_seconds))
    .with_watch_list(settings.watch_list.clone())
    .with_version(settings.app_version.clone());

    let registry = Registry::new(services);
    register_all(&registry, &settings.policies)?;
    let server = tokio::spawn(registry.clone().serve(incoming));
    info!(
        policy_overrides = settings.policies.len(),
        main = %settings.main_endpoint,
        "background started"
    );

    // The main content script is a singleton that lives as long as the background.
    let main_cs = EventHandler::connect(&*host, &settings.main_endpoint)?;

    let (mut console, mut observations) = Console::new(host);
    let printer = tokio::spawn(async move {
        let stdout = io::stdout();
        while let Some(observation) = observations.recv().await {
            match serde_json::to_string(&observation) {
                Ok(line) => {
                    let _ = writeln!(stdout.lock(), "{line}");
                }
                Err(err) => warn!(error = %err, "unprintable observation"),
            }
        }
    });

    let outcome = console.run(commands).await;

    console.close();
    main_cs.disconnect();
    registry.reset();
    server.abort();
    drop(console);
    // Subscribers of closed endpoints may still hold a sender; don't wait on them forever.
    let _ = tokio::time::timeout(Duration::from_millis(200), printer).await;

    info!(live = registry.len(), "background stopped");
    outcome
}
