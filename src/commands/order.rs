//! Print how a folder of images will be ordered for inference.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use dcm_infer::loader::load_image_data;
use dcm_infer::ordering::order_series;
use dcm_infer::utils::validate_input_folder;

/// CLI arguments for the `order` subcommand.
#[derive(Args, Debug)]
pub struct OrderArgs {
    /// Input folder containing DICOM files or raster images
    #[arg(long = "in")]
    pub input: PathBuf,
}

pub fn run(args: &OrderArgs) -> Result<()> {
    validate_input_folder(&args.input)?;

    let study = load_image_data(&args.input)
        .with_context(|| format!("Failed to load input folder: {:?}", args.input))?;
    if study.instances.is_empty() {
        println!("No images found in {:?}", args.input);
        return Ok(());
    }
    let total = study.instances.len();
    let series = order_series(study.instances).context("Failed to order the loaded images")?;

    println!("{total} image(s) in {} series\n", series.len());
    let mut first = 0;
    for s in &series {
        println!(
            "Series {}: {} instance(s), {} timepoint(s), {} slice(s) per timepoint",
            s.uid,
            s.instances.len(),
            s.timepoints,
            s.slices_per_timepoint()
        );
        for (i, instance) in s.instances.iter().enumerate() {
            let timepoint = instance
                .timepoint
                .map_or_else(|| "-".to_string(), |t| t.to_string());
            let number = instance
                .instance_number
                .map_or_else(|| "-".to_string(), |n| n.to_string());
            let position = instance.position.map_or_else(
                || "-".to_string(),
                |[x, y, z]| format!("({x:.2}, {y:.2}, {z:.2})"),
            );
            println!(
                "  {:>4}  t={timepoint:<3} #{number:<5} {position:<28} {}",
                first + i,
                instance.file_name()
            );
        }
        first += s.instances.len();
        println!();
    }
    Ok(())
}
