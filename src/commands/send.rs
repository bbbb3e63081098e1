//! Full round trip against a running inference endpoint.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{field, info_span};

use dcm_infer::client::{ClientConfig, InferenceClient};
use dcm_infer::protocol::build_request;
use dcm_infer::protocol::manifest::{InferenceCommand, ModelKind, RequestManifest};
use dcm_infer::render::render_response;
use dcm_infer::utils::validate_attachments;

use super::{load_ordered, prepare_output, print_report};

/// Raw response body, written when `--save-response` is given.
pub const SAVED_BODY_FILE: &str = "response.multipart";
/// Content-Type header of the saved response body.
pub const SAVED_CONTENT_TYPE_FILE: &str = "response.content-type";

/// CLI arguments for the `send` subcommand.
#[derive(Args, Debug)]
pub struct SendArgs {
    /// Input folder containing DICOM files or raster images
    #[arg(long = "in")]
    pub input: PathBuf,

    /// Output folder for overlays, masks and the response manifest
    #[arg(long = "out")]
    pub output: PathBuf,

    /// Host of the inference endpoint
    #[arg(long, env = "DCM_INFER_HOST", default_value = "localhost")]
    pub host: String,

    /// Port of the inference endpoint
    #[arg(long, env = "DCM_INFER_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Route the request is posted to
    #[arg(long, default_value = "/")]
    pub route: String,

    /// Ask for a probability mask (2-D or 3-D depending on the images)
    #[arg(long, short = 's', conflicts_with = "bounding_box")]
    pub segmentation: bool,

    /// Ask for 2-D bounding boxes
    #[arg(long, short = 'b')]
    pub bounding_box: bool,

    /// Extra files sent ahead of the images
    #[arg(long = "attachment", short = 'a', num_args = 1..)]
    pub attachments: Vec<PathBuf>,

    /// Health check attempts before giving up
    #[arg(long, default_value_t = 30)]
    pub healthcheck_attempts: u32,

    /// Pause between health check attempts, in milliseconds
    #[arg(long = "healthcheck-interval-ms", default_value_t = 1000)]
    pub healthcheck_interval_ms: u64,

    /// Overall timeout of one HTTP call, in seconds
    #[arg(long = "timeout-secs", default_value_t = 600)]
    pub timeout_secs: u64,

    /// Clean a non-empty output folder without asking
    #[arg(long, short = 'f')]
    pub force: bool,

    /// Also write the raw response body and its Content-Type
    #[arg(long)]
    pub save_response: bool,
}

impl SendArgs {
    pub fn model_kind(&self) -> ModelKind {
        if self.segmentation {
            ModelKind::Segmentation
        } else if self.bounding_box {
            ModelKind::BoundingBox
        } else {
            ModelKind::Other
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            host: self.host.clone(),
            port: self.port,
            route: self.route.clone(),
            healthcheck_attempts: self.healthcheck_attempts,
            healthcheck_interval: Duration::from_millis(self.healthcheck_interval_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Send the images under `--in` for inference and render the answer.
pub fn run(args: &SendArgs) -> Result<()> {
    validate_attachments(&args.attachments)?;
    let (_study, images) = load_ordered(&args.input)?;
    prepare_output(&args.output, args.force)?;

    let command = InferenceCommand::select(args.model_kind(), images.first());
    let manifest = RequestManifest::new(&args.route, command);
    let request = build_request(&manifest, &args.attachments, &images)
        .context("Failed to build the inference request")?;
    println!(
        "Request: {} image(s), {} attachment(s), {} bytes",
        images.len(),
        args.attachments.len(),
        request.body.len()
    );

    let client = InferenceClient::new(args.client_config())?;
    let span = info_span!(
        "exchange",
        input_hash = %request.digest,
        output_hash = field::Empty
    );
    let _guard = span.enter();

    let attempts = client
        .wait_until_ready()
        .with_context(|| format!("Endpoint {}:{} is not reachable", args.host, args.port))?;
    println!("✓ Endpoint ready after {attempts} attempt(s)");

    let raw = client
        .post(&request)
        .with_context(|| format!("Inference request to route {:?} failed", args.route))?;
    if args.save_response {
        let body_path = args.output.join(SAVED_BODY_FILE);
        fs::write(&body_path, &raw.body)
            .with_context(|| format!("Failed to save response body: {body_path:?}"))?;
        let header_path = args.output.join(SAVED_CONTENT_TYPE_FILE);
        fs::write(&header_path, &raw.content_type)
            .with_context(|| format!("Failed to save response Content-Type: {header_path:?}"))?;
        println!("✓ Saved raw response to {body_path:?}");
    }

    let response = raw.decode().context("Failed to decode the inference response")?;
    span.record("output_hash", field::display(response.output_digest()));

    let report = render_response(&images, &response, &args.output)
        .with_context(|| format!("Failed to render into {:?}", args.output))?;
    print_report(&report);
    Ok(())
}
