use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "filmstrip")]
#[command(author, version, about = "Segmented decode and thumbnail cache inspector")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse an init segment and display the decoder configuration
    Probe {
        /// Init segment (or whole MP4 file)
        #[arg(required = true)]
        init: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Classify the frames of media segments without decoding them
    Gop {
        /// Init segment the media segments belong to
        #[arg(required = true)]
        init: PathBuf,

        /// Media segments, in timeline order
        #[arg(required = true)]
        segments: Vec<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the segments of a manifest rendition
    Catalog {
        /// Manifest path or http(s) url
        #[arg(required = true)]
        manifest: String,

        /// Rendition to list (defaults to the first one)
        #[arg(short, long)]
        rendition: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
