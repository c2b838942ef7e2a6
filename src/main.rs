mod cli;

use filmstrip::{config, ManifestSource, RenditionId, StreamSource};
use filmstrip_media::{parse_init, parse_media_segment, GopStructure};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "filmstrip=trace,filmstrip_media=debug".to_string()
        } else {
            "filmstrip=info,filmstrip_media=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Probe { init, json } => probe_init(&init, json),
        Commands::Gop {
            init,
            segments,
            json,
        } => print_gops(&init, &segments, json),
        Commands::Catalog {
            manifest,
            rendition,
            json,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(list_catalog(&manifest, rendition, json))
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

fn read_file(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        anyhow::bail!("File does not exist: {:?}", path);
    }
    std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))
}

fn probe_init(path: &Path, json: bool) -> Result<()> {
    let bytes = read_file(path)?;
    let config = parse_init(&bytes).with_context(|| format!("Failed to parse {:?}", path))?;

    if json {
        let value = serde_json::json!({
            "codec": config.codec,
            "width": config.width,
            "height": config.height,
            "track_id": config.track_id,
            "timescale": config.timescale,
            "encrypted": config.encrypted,
            "description": hex::encode(&config.description),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("File: {}", path.display());
        println!("Codec: {}", config.codec);
        println!("Resolution: {}x{}", config.width, config.height);
        println!("Track: {} (timescale {})", config.track_id, config.timescale);
        println!("Encrypted: {}", config.encrypted);
        println!("Description: {} bytes", config.description.len());
    }

    Ok(())
}

fn print_gops(init: &Path, segments: &[PathBuf], json: bool) -> Result<()> {
    let config = parse_init(&read_file(init)?)
        .with_context(|| format!("Failed to parse init segment {:?}", init))?;

    let mut gops = Vec::with_capacity(segments.len());
    for (index, path) in segments.iter().enumerate() {
        let bytes = Bytes::from(read_file(path)?);
        match parse_media_segment(&bytes, &config) {
            Ok(frames) => gops.push(GopStructure::new(index, &frames)),
            Err(e) => {
                tracing::warn!(segment = index, error = %e, "Skipping unparseable segment");
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&gops)?);
        return Ok(());
    }

    for gop in &gops {
        println!(
            "[{}] {} frames, {} bytes: {}",
            gop.segment_index,
            gop.entries.len(),
            gop.total_bytes(),
            gop.pattern()
        );
    }

    Ok(())
}

async fn list_catalog(manifest: &str, rendition: Option<String>, json: bool) -> Result<()> {
    let source = ManifestSource::open(manifest)
        .await
        .with_context(|| format!("Failed to load manifest {}", manifest))?;

    let rendition = match rendition {
        Some(id) => RenditionId::new(id),
        None => source
            .renditions()
            .next()
            .cloned()
            .context("Manifest has no renditions")?,
    };

    let catalog = source.segment_catalog(&rendition).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&catalog)?);
        return Ok(());
    }

    println!("Rendition: {}", rendition);
    println!("Init: {}", catalog.init.url);
    println!("Duration: {:.3}s", catalog.duration());
    println!("\nSegments: {}", catalog.len());
    for (i, segment) in catalog.iter().enumerate() {
        print!(
            "  [{}] {:>9.3} - {:>9.3}  {}",
            i, segment.start_time, segment.end_time, segment.url
        );
        if let Some(range) = segment.byte_range() {
            print!(" ({})", range.header_value());
        }
        println!();
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            config
        }
        None => {
            println!("No config file specified, using defaults");
            config::EngineConfig::default()
        }
    };

    println!("  Throttle: {}ms", config.coordinator.throttle_ms);
    println!("  Span multiplier: {}", config.cache.span_multiplier);
    println!("  One-shot timeout: {}s", config.decode.one_shot_timeout_secs);
    println!("  Command capacity: {}", config.decode.command_capacity);
    println!("  Thumbnail width: {}px", config.layout.thumbnail_width);

    Ok(())
}
