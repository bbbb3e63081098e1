//! Offline compositing of a saved response.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use dcm_infer::protocol::InferenceResponse;
use dcm_infer::render::render_response;

use super::{load_ordered, prepare_output, print_report};

/// CLI arguments for the `render` subcommand.
#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Input folder holding the images the response was computed for
    #[arg(long = "in")]
    pub input: PathBuf,

    /// File with the raw multipart response body
    #[arg(long)]
    pub response: PathBuf,

    /// Content-Type header the response was received with
    #[arg(long)]
    pub content_type: String,

    #[arg(long = "out")]
    pub output: PathBuf,

    /// Clean a non-empty output folder without asking
    #[arg(long, short = 'f')]
    pub force: bool,
}

pub fn run(args: &RenderArgs) -> Result<()> {
    let body = fs::read(&args.response)
        .with_context(|| format!("Failed to read response body: {:?}", args.response))?;
    let response = InferenceResponse::decode(&body, args.content_type.trim())
        .with_context(|| format!("Failed to decode response: {:?}", args.response))?;
    if let Some(pair) = &response.digest {
        println!("Response digests: {pair}");
    }

    let (_study, images) = load_ordered(&args.input)?;
    prepare_output(&args.output, args.force)?;

    let report = render_response(&images, &response, &args.output)
        .with_context(|| format!("Failed to render into {:?}", args.output))?;
    print_report(&report);
    Ok(())
}
