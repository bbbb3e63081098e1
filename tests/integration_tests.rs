//! Integration tests for the dcm-infer CLI.
//!
//! These tests run the compiled binary against synthetic DICOM folders.
//!
//! ## Output Structure
//!
//! `send` and `render` write into `--out`:
//! - `{index}_{source file}.png` per ordered input image
//! - `output_masks_{n}.npy` per mask buffer, `sc_{i}.dcm` per DICOM buffer
//! - `response.json` with the response manifest

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;

use dcm_infer::loader::SyntheticInstance;
use dcm_infer::protocol::build_response;
use dcm_infer::protocol::manifest::{BinaryType, ManifestPart, ResponseManifest, Shape};
use tempfile::TempDir;

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_dcm-infer"))
}

fn run_cli(args: &[&str]) -> Output {
    Command::new(binary_path())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute command")
}

/// Write `positions.len()` 4x4 axial slices of one series into `dir`.
fn write_series(dir: &Path, positions: &[f64]) {
    fs::create_dir_all(dir).unwrap();
    for (i, z) in positions.iter().enumerate() {
        SyntheticInstance::new(4, 4, vec![40; 16])
            .series_uid("1.2.3.999")
            .position([0.0, 0.0, *z])
            .orientation([1.0, 0.0, 0.0, 0.0, 1.0, 0.0])
            .instance_number(i as i32 + 1)
            .write_to(&dir.join(format!("slice_{i}.dcm")))
            .unwrap();
    }
}

fn count_files_with_extension(dir: &Path, ext: &str) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().is_some_and(|x| x == ext))
                .count()
        })
        .unwrap_or(0)
}

/// A response covering a two-slice volume with one probability mask.
fn mask_response() -> (String, Vec<u8>) {
    let manifest = ResponseManifest {
        parts: vec![
            ManifestPart::new("organ", BinaryType::ProbabilityMask)
                .with_shape(Shape::new(4, 4, 2, 1)),
        ],
        ..ResponseManifest::default()
    };
    let encoded = build_response(&manifest, &[vec![255u8; 32]], &"0".repeat(64), None).unwrap();
    (encoded.content_type.header_value(), encoded.body)
}

// =============================================================================
// CLI Arguments Tests
// =============================================================================

mod cli_args {
    use super::*;

    #[test]
    fn help_lists_subcommands() {
        let output = run_cli(&["--help"]);
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        for subcommand in ["send", "render", "order"] {
            assert!(stdout.contains(subcommand), "missing {subcommand}");
        }
    }

    #[test]
    fn missing_input_arg_shows_error() {
        let output = run_cli(&["send", "--out", "/tmp/out"]);
        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("--in"));
    }

    #[test]
    fn missing_output_arg_shows_error() {
        let output = run_cli(&["send", "--in", "/tmp"]);
        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("--out"));
    }

    #[test]
    fn segmentation_conflicts_with_bounding_box() {
        let output = run_cli(&["send", "--in", "/tmp", "--out", "/tmp/out", "-s", "-b"]);
        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("cannot be used with"));
    }

    #[test]
    fn nonexistent_input_folder_fails() {
        let temp_dir = TempDir::new().unwrap();
        let output_path = temp_dir.path().join("output");

        let output = run_cli(&[
            "send",
            "--in",
            "/nonexistent/folder/that/does/not/exist",
            "--out",
            output_path.to_str().unwrap(),
        ]);

        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
    }

    #[test]
    fn missing_attachment_fails() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("in");
        write_series(&input, &[0.0]);

        let output = run_cli(&[
            "send",
            "--in",
            input.to_str().unwrap(),
            "--out",
            temp_dir.path().join("out").to_str().unwrap(),
            "-a",
            temp_dir.path().join("missing.xml").to_str().unwrap(),
        ]);

        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("Attachment is not a file"));
    }
}

// =============================================================================
// Order Tests
// =============================================================================

mod order {
    use super::*;

    #[test]
    fn prints_series_and_timepoints() {
        let temp_dir = TempDir::new().unwrap();
        write_series(temp_dir.path(), &[20.0, 0.0, 10.0, 0.0, 10.0, 20.0]);

        let output = run_cli(&["order", "--in", temp_dir.path().to_str().unwrap()]);
        assert!(output.status.success());
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("6 image(s) in 1 series"));
        assert!(stdout.contains("2 timepoint(s), 3 slice(s) per timepoint"));
        assert!(stdout.contains("t=1"));
    }

    #[test]
    fn empty_folder_reports_no_images() {
        let temp_dir = TempDir::new().unwrap();
        let output = run_cli(&["order", "--in", temp_dir.path().to_str().unwrap()]);
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("No images found"));
    }
}

// =============================================================================
// Render Tests
// =============================================================================

mod render {
    use super::*;

    #[test]
    fn renders_saved_response() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("in");
        let out = temp_dir.path().join("out");
        write_series(&input, &[0.0, 5.0]);

        let (content_type, body) = mask_response();
        let body_path = temp_dir.path().join("response.multipart");
        fs::write(&body_path, body).unwrap();

        let output = run_cli(&[
            "render",
            "--in",
            input.to_str().unwrap(),
            "--response",
            body_path.to_str().unwrap(),
            "--content-type",
            &content_type,
            "--out",
            out.to_str().unwrap(),
        ]);

        assert!(
            output.status.success(),
            "stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        assert_eq!(count_files_with_extension(&out, "png"), 2);
        assert!(out.join("0_slice_0.dcm.png").exists());
        assert!(out.join("output_masks_1.npy").exists());
        assert!(out.join("response.json").exists());
    }

    #[test]
    fn force_cleans_previous_output() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("in");
        let out = temp_dir.path().join("out");
        write_series(&input, &[0.0, 5.0]);
        fs::create_dir_all(&out).unwrap();
        fs::write(out.join("stale.png"), "old").unwrap();

        let (content_type, body) = mask_response();
        let body_path = temp_dir.path().join("response.multipart");
        fs::write(&body_path, body).unwrap();

        let output = run_cli(&[
            "render",
            "--in",
            input.to_str().unwrap(),
            "--response",
            body_path.to_str().unwrap(),
            "--content-type",
            &content_type,
            "--out",
            out.to_str().unwrap(),
            "--force",
        ]);

        assert!(output.status.success());
        assert!(!out.join("stale.png").exists());
        assert_eq!(count_files_with_extension(&out, "png"), 2);
    }

    #[test]
    fn rejects_non_multipart_content_type() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("in");
        write_series(&input, &[0.0]);
        let body_path = temp_dir.path().join("body");
        fs::write(&body_path, "{}").unwrap();

        let output = run_cli(&[
            "render",
            "--in",
            input.to_str().unwrap(),
            "--response",
            body_path.to_str().unwrap(),
            "--content-type",
            "application/json",
            "--out",
            temp_dir.path().join("out").to_str().unwrap(),
        ]);

        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to decode response"));
    }
}

// =============================================================================
// Send Tests
// =============================================================================

mod send {
    use super::*;

    /// Answer `count` HTTP requests with `content_type` and `body`.
    fn serve(count: usize, content_type: String, body: Vec<u8>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        thread::spawn(move || {
            for stream in listener.incoming().take(count) {
                let mut stream = stream.unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut content_length = 0usize;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    if let Some((key, value)) = line.split_once(':')
                        && key.eq_ignore_ascii_case("content-length")
                    {
                        content_length = value.trim().parse().unwrap();
                    }
                }
                let mut request_body = vec![0u8; content_length];
                reader.read_exact(&mut request_body).unwrap();

                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                stream.write_all(head.as_bytes()).unwrap();
                stream.write_all(&body).unwrap();
            }
        });
        port
    }

    #[test]
    fn unreachable_endpoint_fails() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("in");
        write_series(&input, &[0.0]);
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let output = run_cli(&[
            "send",
            "--in",
            input.to_str().unwrap(),
            "--out",
            temp_dir.path().join("out").to_str().unwrap(),
            "--host",
            "127.0.0.1",
            "--port",
            &port.to_string(),
            "--healthcheck-attempts",
            "1",
        ]);

        assert!(!output.status.success());
        assert!(String::from_utf8_lossy(&output.stderr).contains("is not reachable"));
    }

    #[test]
    fn round_trip_renders_and_saves_response() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("in");
        let out = temp_dir.path().join("out");
        write_series(&input, &[0.0, 5.0]);

        let (content_type, body) = mask_response();
        // Health check, then the inference call.
        let port = serve(2, content_type.clone(), body.clone());

        let output = run_cli(&[
            "send",
            "--in",
            input.to_str().unwrap(),
            "--out",
            out.to_str().unwrap(),
            "--host",
            "127.0.0.1",
            "--port",
            &port.to_string(),
            "--segmentation",
            "--save-response",
        ]);

        assert!(
            output.status.success(),
            "stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("Endpoint ready"));
        assert_eq!(count_files_with_extension(&out, "png"), 2);
        assert_eq!(fs::read(out.join("response.multipart")).unwrap(), body);
        assert_eq!(
            fs::read_to_string(out.join("response.content-type")).unwrap(),
            content_type
        );
    }
}
