mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use filmstrip_av::{MediaProbe, ToolRegistry};
use filmstrip_core::config::Config;
use filmstrip_core::{AssetId, Filmstrip, PriorityWindow, SourceRef};
use filmstrip_engine::{
    probe_from_config, Decoders, FilmstripCallback, FilmstripRequest, FilmstripService,
};
use filmstrip_store::{BlobStore, FsBlobStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Config files tried, in order, when `--config` is not given.
const DEFAULT_CONFIG_PATHS: &[&str] = &["./filmstrip.toml", "~/.config/filmstrip/config.toml"];

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand(path));
    }
    DEFAULT_CONFIG_PATHS
        .iter()
        .map(|p| expand(Path::new(p)))
        .find(|p| p.is_file())
}

fn load_config(explicit: Option<&Path>) -> Config {
    let path = resolve_config_path(explicit);
    let mut config = Config::load_or_default(path.as_deref());
    config.store.root = expand(&config.store.root);
    config
}

fn open_store(config: &Config) -> Arc<FsBlobStore> {
    tracing::debug!("Using store at {}", config.store.root.display());
    Arc::new(FsBlobStore::new(config.store.root.clone()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "filmstrip=trace,filmstrip_engine=trace,filmstrip_av=debug,filmstrip_store=debug,filmstrip_core=debug".to_string()
        } else {
            "filmstrip=info,filmstrip_engine=info,filmstrip_av=warn,filmstrip_store=warn,filmstrip_core=warn".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Extract {
            source,
            asset_id,
            duration,
            priority,
            json,
        } => {
            let config = load_config(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(extract(config, source, asset_id, duration, priority, json))
        }
        Commands::Status { asset_id } => {
            let config = load_config(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(status(&config, &AssetId::new(asset_id)))
        }
        Commands::Clear { asset_id, all } => {
            let config = load_config(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(clear(&config, asset_id.map(AssetId::new), all))
        }
        Commands::Probe { file, json } => {
            let config = load_config(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&config, &file, json))
        }
        Commands::CheckTools => {
            let config = load_config(cli.config.as_deref());
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(check_tools(&config))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("filmstrip {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn source_ref(source: &str) -> SourceRef {
    if source.contains("://") {
        SourceRef::Url(source.to_string())
    } else {
        SourceRef::Path(expand(Path::new(source)))
    }
}

fn default_asset_id(source: &SourceRef) -> String {
    match source {
        SourceRef::Path(p) => p
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| p.to_string_lossy().into_owned()),
        SourceRef::Url(u) => u
            .rsplit('/')
            .find(|s| !s.is_empty())
            .and_then(|s| s.split('.').next())
            .unwrap_or(u.as_str())
            .to_string(),
    }
}

async fn extract(
    config: Config,
    source: String,
    asset_id: Option<String>,
    duration: Option<f64>,
    priority: Option<PriorityWindow>,
    json: bool,
) -> Result<()> {
    let source = source_ref(&source);
    if let SourceRef::Path(ref p) = source {
        if !p.exists() {
            anyhow::bail!("Source does not exist: {}", p.display());
        }
    }
    let asset_id = asset_id.unwrap_or_else(|| default_asset_id(&source));

    let duration = match duration {
        Some(d) => d,
        None => {
            let SourceRef::Path(ref path) = source else {
                anyhow::bail!("--duration is required for URL sources");
            };
            let registry = ToolRegistry::discover(&config.tools);
            let info = MediaProbe::from_registry(&registry)?
                .probe(path)
                .await
                .context("probing source duration")?;
            tracing::debug!("Probed {}: {:.3}s", path.display(), info.duration_secs);
            info.duration_secs
        }
    };

    tracing::info!(asset = %asset_id, source = %source, duration, "Extracting filmstrip");

    let store = open_store(&config);
    let decoders = Decoders::ffmpeg(&config.tools);
    let probe = probe_from_config(&config.memory);
    let service = FilmstripService::start(config, store, decoders, probe);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: FilmstripCallback = Arc::new(move |strip: Arc<Filmstrip>| {
        let _ = tx.send(strip);
    });
    // A persistent subscriber keeps the extraction from being deferred.
    let subscription = service.subscribe(asset_id.as_str(), callback).await?;

    let mut request = FilmstripRequest::new(asset_id.as_str(), source, duration);
    if let Some(window) = priority {
        request = request.with_priority(window);
    }

    let mut strip = service.get_filmstrip(request).await?;
    let mut last_progress = None;
    while strip.is_extracting {
        if last_progress != Some(strip.progress) {
            last_progress = Some(strip.progress);
            if !json {
                eprintln!("  {:>3}% ({} frames)", strip.progress, strip.len());
            }
        }
        tokio::select! {
            next = rx.recv() => match next {
                Some(next) => strip = next,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("Interrupted; aborting extraction");
                if let Some(partial) = service.abort(asset_id.as_str()).await? {
                    strip = partial;
                }
                break;
            }
        }
    }
    drop(subscription);

    let metrics = service.metrics_snapshot().await?;
    let record = metrics
        .samples
        .iter()
        .find(|m| m.asset_id.as_str() == asset_id);
    service.dispose().await?;

    if json {
        let summary = serde_json::json!({
            "assetId": asset_id,
            "isComplete": strip.is_complete,
            "progress": strip.progress,
            "frameCount": strip.len(),
            "bytes": strip.size_bytes(),
            "indices": strip.indices().collect::<Vec<_>>(),
            "metrics": record,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Asset: {}", asset_id);
        println!("Frames: {} ({} bytes)", strip.len(), strip.size_bytes());
        println!("Complete: {}", strip.is_complete);
        if let Some(record) = record {
            println!("Outcome: {:?} in {} ms", record.outcome, record.duration_ms);
            println!("Workers: {}", record.worker_count);
            let paths: Vec<String> = record.decode_paths.iter().map(|p| p.to_string()).collect();
            println!("Decode paths: {}", paths.join(" -> "));
            if let Some(ref error) = record.error {
                println!("Error: {}", error);
            }
        }
    }

    if !strip.is_complete {
        anyhow::bail!("Filmstrip for {} is incomplete", asset_id);
    }
    Ok(())
}

async fn status(config: &Config, asset_id: &AssetId) -> Result<()> {
    let store = open_store(config);
    let meta = store.read_meta(asset_id).await?;
    let frames = store.list_frames(asset_id).await?;

    println!("Asset: {}", asset_id);
    println!("Location: {}", store.asset_dir(asset_id).display());
    match meta {
        Some(meta) => {
            println!("Frame size: {}x{}", meta.width, meta.height);
            println!("Complete: {}", meta.is_complete);
            println!("Recorded frames: {}", meta.frame_count);
        }
        None => println!("No metadata stored"),
    }
    println!("Stored frames: {}", frames.len());
    if let (Some(first), Some(last)) = (frames.first(), frames.last()) {
        println!("Index range: {}..={}", first, last);
    }
    Ok(())
}

async fn clear(config: &Config, asset_id: Option<AssetId>, all: bool) -> Result<()> {
    let store = open_store(config);
    if all {
        store.clear().await?;
        println!("Cleared {}", store.root().display());
    } else if let Some(asset_id) = asset_id {
        store.delete_asset(&asset_id).await?;
        println!("Cleared {}", asset_id);
    }
    Ok(())
}

async fn probe_file(config: &Config, file: &Path, json: bool) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let registry = ToolRegistry::discover(&config.tools);
    let info = MediaProbe::from_registry(&registry)?.probe(file).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("File: {}", info.path.display());
        if let Some(ref container) = info.container {
            println!("Container: {}", container);
        }
        let secs = info.duration_secs as u64;
        let mins = secs / 60;
        let hours = mins / 60;
        println!("Duration: {:02}:{:02}:{:02}", hours, mins % 60, secs % 60);
        if info.has_video() {
            print!("Video: {}x{}", info.width, info.height);
            if let Some(ref codec) = info.video_codec {
                print!(" {}", codec);
            }
            println!(" @ {:.3} fps", info.frame_rate);
        } else {
            println!("Video: none");
        }
    }

    Ok(())
}

async fn check_tools(config: &Config) -> Result<()> {
    println!("Checking external tools...\n");

    let tools = ToolRegistry::discover(&config.tools).check_all().await;
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {} [{}]", status, tool.name, tool.purpose);

        if let Some(ref version) = tool.version {
            print!(" ({})", version.lines().next().unwrap_or(""));
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Install them to enable extraction.");
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match resolve_config_path(path) {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let contents = std::fs::read_to_string(&p)
                .with_context(|| format!("reading {}", p.display()))?;
            let config = Config::from_toml(&contents)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            Config::default()
        }
    };

    println!("  Store: {}", config.store.root.display());
    println!("  Sampling: {} frames/s", config.sampling.frame_rate);
    println!("  Frame size: {}", config.extraction.frame_size());
    println!(
        "  Memory limits: soft {} / hard {} bytes",
        config.memory.soft_limit_bytes, config.memory.hard_limit_bytes
    );
    println!("  Idle eviction: {} ms", config.cache.idle_eviction_ms);

    let warnings = config.validate();
    if warnings.is_empty() {
        println!("  No warnings");
    } else {
        println!("  Warnings: {}", warnings.len());
        for warning in &warnings {
            println!("    - {}", warning);
        }
    }

    Ok(())
}
