//! Folder validation, output preparation, and file name sanitizing for the CLI.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// What to do with an output folder that already has content.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CleanupChoice {
    /// Remove the folder contents before writing.
    Clean,
    /// Keep the contents; files with matching names are overwritten.
    Keep,
}

impl CleanupChoice {
    pub fn should_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    /// Interpret a prompt answer. Anything unrecognized keeps the folder.
    pub fn from_answer(answer: &str) -> Self {
        match answer.trim().to_lowercase().as_str() {
            "y" | "yes" => Self::Clean,
            _ => Self::Keep,
        }
    }
}

/// Ask on stdout whether to clean `folder_path`, reading the answer from `input`.
pub fn prompt_to_cleanup(folder_path: &Path, input: &mut impl BufRead) -> Result<CleanupChoice> {
    println!("Output folder is not empty: {folder_path:?}");
    print!("Cleanup? [y]es / [N]o: ");
    io::stdout().flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(CleanupChoice::from_answer(&answer))
}

/// Validate that the input folder exists and is a directory.
pub fn validate_input_folder(input: &Path) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input folder does not exist: {input:?}");
    }
    if !input.is_dir() {
        anyhow::bail!("Input path is not a directory: {input:?}");
    }
    Ok(())
}

/// Validate that every attachment is a readable regular file.
pub fn validate_attachments(attachments: &[PathBuf]) -> Result<()> {
    for path in attachments {
        if !path.is_file() {
            anyhow::bail!("Attachment is not a file: {path:?}");
        }
    }
    Ok(())
}

/// Sanitize a string for use as a file name.
/// Replaces invalid characters with underscores.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_ascii_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Make sure `path` exists as a folder, cleaning it first when `should_clean`.
pub fn prepare_output_folder(path: &Path, should_clean: bool) -> Result<()> {
    if path.is_file() {
        anyhow::bail!("Output path is a file: {path:?}");
    }
    if should_clean && path.is_dir() && !is_folder_empty(path)? {
        fs::remove_dir_all(path)
            .with_context(|| format!("Failed to clean output folder: {path:?}"))?;
        println!("Cleaned output folder: {path:?}");
    }
    fs::create_dir_all(path).with_context(|| format!("Failed to create output folder: {path:?}"))
}

/// Check if a folder is empty.
pub fn is_folder_empty(path: &Path) -> Result<bool> {
    let mut entries =
        fs::read_dir(path).with_context(|| format!("Failed to read directory: {path:?}"))?;
    Ok(entries.next().is_none())
}

// =============================================================================
// Unit Tests for utils module
// =============================================================================
