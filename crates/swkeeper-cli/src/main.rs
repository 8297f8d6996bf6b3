//! swkeeper - operator tool for the offline cache and update state.
//!
//! Drives the core library against the on-disk cache directory and the real
//! network: inspect generations, route a request through the worker, run a
//! version check, or recover from a stuck update.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use swkeeper_core::cache::DiskBackend;
use swkeeper_core::config::STATE_FILE;
use swkeeper_core::http::HttpNetwork;
use swkeeper_core::update::{KeyValueStore, UpdateSessionState};
use swkeeper_core::worker::LifecycleController;
use swkeeper_core::{
    CacheStorage, Config, HttpVersionSource, JsonFileStore, MemoryStore, Reloader, Request,
    SystemClock, UpdateController, VersionNegotiator, WorkerHandle, WorkerRuntime,
};

// ============================================================================
// Constants
// ============================================================================

/// File name prefix for the rolling log written when `SWKEEPER_LOG_DIR` is set.
const LOG_FILE_PREFIX: &str = "swkeeper.log";

const USAGE: &str = "\
Usage: swkeeper <command>

Commands:
  status              Show the active generation and update state
  caches              List every cache name
  check [--apply]     Check the server for a new version (optionally apply it)
  fetch <url> [--navigate]
                      Route a request through the worker and print the body
  install             Install and activate a fresh generation
  clear               Delete every cache of this app
  reset               Clear update counters and markers
  config [--save]     Print the effective configuration (optionally write it)";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var("SWKEEPER_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

/// Reloading in a terminal means telling the operator to restart their client.
struct LogReloader;

impl Reloader for LogReloader {
    fn reload(&self) {
        info!("Reload requested");
        eprintln!("Update activated; reload the application to pick it up.");
    }
}

/// Everything a command needs, opened against the real cache directory.
struct App {
    config: Config,
    storage: CacheStorage,
    durable: Arc<JsonFileStore>,
    worker: WorkerHandle,
}

impl App {
    async fn open() -> Result<Self> {
        let config = Config::load()?;
        let cache_dir = config.cache_dir()?;
        let backend = DiskBackend::new(cache_dir.clone())
            .with_context(|| format!("Failed to open cache directory: {}", cache_dir.display()))?;
        let storage = CacheStorage::new(config.app_name.clone(), Arc::new(backend));

        let state_path = config.data_dir()?.join(STATE_FILE);
        let durable = JsonFileStore::open(&state_path)
            .with_context(|| format!("Failed to open update state: {}", state_path.display()))?;

        let network = HttpNetwork::new().context("Failed to create HTTP client")?;
        let mut lifecycle =
            LifecycleController::new(&config, storage.clone(), Arc::new(network), Arc::new(SystemClock));
        lifecycle.restore().context("Failed to restore active generation")?;
        let (worker, _) = WorkerRuntime::spawn(lifecycle);

        Ok(Self {
            config,
            storage,
            durable: Arc::new(durable),
            worker,
        })
    }

    fn update_controller(&self) -> Result<UpdateController> {
        let url = self
            .config
            .version_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("No version endpoint configured (set SWKEEPER_VERSION_URL)"))?;
        let source = HttpVersionSource::new(url).context("Failed to create version client")?;
        let negotiator = VersionNegotiator::new(
            Arc::new(source),
            self.durable.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(SystemClock),
            self.config.check_interval(),
        );
        Ok(UpdateController::new(
            &self.config,
            self.worker.clone(),
            negotiator,
            Arc::new(LogReloader),
            Arc::new(SystemClock),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        println!("{}", USAGE);
        return Ok(());
    }
    if args[1] == "config" {
        return config(args.iter().any(|a| a == "--save"));
    }

    let ctx = App::open().await?;
    info!(app = %ctx.config.app_name, command = %args[1], "swkeeper starting");

    match args[1].as_str() {
        "status" => status(&ctx).await,
        "caches" => caches(&ctx).await,
        "check" => check(&ctx, args.iter().any(|a| a == "--apply")).await,
        "fetch" => {
            let target = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("fetch requires a URL"))?;
            fetch(&ctx, target, args.iter().any(|a| a == "--navigate")).await
        }
        "install" => install(&ctx).await,
        "clear" => clear(&ctx).await,
        "reset" => reset(&ctx),
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

async fn status(ctx: &App) -> Result<()> {
    let active = ctx.worker.version_check().await?;
    let generations = ctx.storage.list_generations()?;
    let read = |key: &str| ctx.durable.get(key).ok().flatten();

    println!("App:                {}", ctx.config.app_name);
    println!("Origin:             {}", ctx.config.origin);
    println!(
        "Active generation:  {}",
        active.as_deref().unwrap_or("(none)")
    );
    println!("Stored generations: {}", generations.len());
    println!(
        "Current version:    {}",
        read("currentVersion").as_deref().unwrap_or("(unknown)")
    );
    println!(
        "Pending target:     {}",
        read("pendingTargetVersion").as_deref().unwrap_or("(none)")
    );
    println!(
        "Update attempts:    {}",
        read("updateAttempts").as_deref().unwrap_or("0")
    );
    Ok(())
}

async fn caches(ctx: &App) -> Result<()> {
    let names = ctx.worker.cache_names().await?;
    if names.is_empty() {
        eprintln!("No caches.");
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

async fn check(ctx: &App, apply: bool) -> Result<()> {
    let mut controller = ctx.update_controller()?;
    let available = controller.force_check_for_updates().await;

    if available && apply && !controller.status().is_updating {
        controller.apply_update().await?;
    }

    let status = serde_json::to_string_pretty(&controller.status())?;
    println!("{}", status);
    Ok(())
}

async fn fetch(ctx: &App, target: &str, navigate: bool) -> Result<()> {
    let url = match Url::parse(target) {
        Ok(url) => url,
        Err(_) => ctx
            .config
            .origin
            .join(target)
            .with_context(|| format!("Invalid URL: {}", target))?,
    };
    let request = if navigate {
        Request::navigate(url)
    } else {
        Request::get(url)
    };

    let response = ctx.worker.fetch(request).await?;
    eprintln!(
        "{} ({} bytes, {})",
        response.status,
        response.body.len(),
        if response.from_cache { "cache" } else { "network" }
    );
    io::stdout().write_all(&response.body)?;
    Ok(())
}

async fn install(ctx: &App) -> Result<()> {
    let generation = ctx.worker.install().await?;
    let active = ctx.worker.version_check().await?;
    println!("Installed generation {}", generation);
    if active.as_deref() != Some(generation.to_string().as_str()) {
        println!("Generation is waiting for activation.");
    }
    Ok(())
}

async fn clear(ctx: &App) -> Result<()> {
    let removed = ctx.worker.clear_caches().await?;
    println!("Removed {} caches.", removed);
    Ok(())
}

/// Works without a version endpoint: only stored state is touched.
fn reset(ctx: &App) -> Result<()> {
    // Processed versions are per session; a fresh run starts with none.
    let session = MemoryStore::new();
    let mut state = UpdateSessionState::load(ctx.durable.as_ref(), &session)
        .context("Failed to read update state")?;
    state.reset();
    state
        .persist(ctx.durable.as_ref(), &session)
        .context("Failed to write update state")?;
    info!("Update state reset");
    println!("Update state reset.");
    Ok(())
}

fn config(save: bool) -> Result<()> {
    let config = Config::load()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    if save {
        config.save().context("Failed to write config file")?;
        eprintln!("Configuration saved.");
    }
    Ok(())
}
