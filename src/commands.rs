//! Subcommands of the `dcm-infer` binary and the steps they share.

pub mod order;
pub mod render;
pub mod send;

use std::io;
use std::path::Path;

use anyhow::{Context, Result};

use dcm_infer::loader::{ImageInstance, LoadedStudy, load_image_data};
use dcm_infer::ordering::sort_images;
use dcm_infer::render::RenderReport;
use dcm_infer::utils::{
    is_folder_empty, prepare_output_folder, prompt_to_cleanup, validate_input_folder,
};

/// Load every instance under `input` and return them in rendering order.
///
/// The returned study owns the scratch folder of converted raster images and
/// must outlive any use of the instances.
pub fn load_ordered(input: &Path) -> Result<(LoadedStudy, Vec<ImageInstance>)> {
    validate_input_folder(input)?;

    let mut study = load_image_data(input)
        .with_context(|| format!("Failed to load input folder: {input:?}"))?;
    if study.instances.is_empty() {
        anyhow::bail!("No images found in {input:?}");
    }
    println!(
        "Loaded {} image(s) from {input:?} ({} converted from raster)",
        study.instances.len(),
        study.converted
    );

    let images = sort_images(std::mem::take(&mut study.instances))
        .context("Failed to order the loaded images")?;
    Ok((study, images))
}

/// Create the output folder. An existing non-empty folder is cleaned when
/// `force` is set, otherwise the user is asked.
pub fn prepare_output(output: &Path, force: bool) -> Result<()> {
    let should_clean = if output.is_dir() && !is_folder_empty(output)? {
        force || prompt_to_cleanup(output, &mut io::stdin().lock())?.should_clean()
    } else {
        false
    };
    prepare_output_folder(output, should_clean)
}

pub fn print_report(report: &RenderReport) {
    for path in &report.overlays {
        println!("  ✓ {}", path.display());
    }
    if !report.masks.is_empty() {
        println!("  ✓ {} mask buffer(s) saved", report.masks.len());
    }
    for path in &report.datasets {
        println!("  ✓ {}", path.display());
    }
    if let Some(path) = &report.manifest_copy {
        println!("  ✓ {}", path.display());
    }
    for dropped in &report.dropped {
        println!(
            "  ✗ part {} ({}) skipped: {}",
            dropped.index, dropped.label, dropped.reason
        );
    }
    println!("\nDone! {} overlay(s) written", report.overlays.len());
}
