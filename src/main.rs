//! # dcm-infer
//!
//! A command-line client for DICOM model inference endpoints.
//!
//! ## Features
//!
//! - Load DICOM files (raster images are converted to Secondary Capture)
//! - Order slices along the slice normal and split multi-timepoint series
//! - Send the study as a `multipart/related` request with a SHA-256 digest
//! - Render probability masks, heatmaps and bounding boxes onto the images
//!
//! ## Usage
//!
//! ```bash
//! dcm-infer send --in <input> --out <output> --segmentation
//! dcm-infer send --in <input> --out <output> -b --host models.local --port 9000
//! dcm-infer render --in <input> --response <body> --content-type <header> --out <output>
//! dcm-infer order --in <input>
//! ```
//!
//! Logging is controlled with `RUST_LOG` (default `info`).

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use commands::{order, render, send};

#[derive(Parser, Debug)]
#[command(name = "dcm-infer")]
#[command(about = "Send DICOM studies to an inference endpoint and render the results")]
struct CliArgs {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send images for inference and render the response
    Send {
        #[command(flatten)]
        args: send::SendArgs,
    },
    /// Render a previously saved response onto its images
    Render {
        #[command(flatten)]
        args: render::RenderArgs,
    },
    /// Show how the images of a folder are grouped and ordered
    Order {
        #[command(flatten)]
        args: order::OrderArgs,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let args = CliArgs::parse();

    match args.command {
        Commands::Send { args } => send::run(&args),
        Commands::Render { args } => render::run(&args),
        Commands::Order { args } => order::run(&args),
    }
}
