use image::{Rgb, RgbImage};
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn bubble_clean(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_bubble-clean"))
        .args(args)
        .env_remove("RUST_LOG")
        .env("BUBBLE_CLEAN_NO_COLOR", "1")
        .output()
        .expect("Failed to execute bubble-clean")
}

fn write_fixture(dir: &Path) -> (String, String) {
    let image = dir.join("page.png");
    RgbImage::from_pixel(48, 48, Rgb([10, 10, 10]))
        .save(&image)
        .unwrap();

    let regions = dir.join("page_regions.json");
    std::fs::write(
        &regions,
        r#"{"width": 48, "height": 48,
            "regions": [{"class": "bubble", "points": [[8, 8], [40, 8], [40, 40], [8, 40]]}]}"#,
    )
    .unwrap();

    (
        image.to_string_lossy().to_string(),
        regions.to_string_lossy().to_string(),
    )
}

#[test]
fn test_version_command() {
    let output = bubble_clean(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains(env!("CARGO_PKG_VERSION")), "{stdout}");
    assert!(stdout.contains("modelev1"), "{stdout}");
}

#[test]
fn test_apply_writes_clean_image() {
    let temp_dir = TempDir::new().unwrap();
    let (image, regions) = write_fixture(temp_dir.path());

    let output = bubble_clean(&["apply", &image, "--regions", &regions]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let cleaned = image::open(temp_dir.path().join("page_clean.png"))
        .unwrap()
        .to_rgb8();
    assert_eq!(*cleaned.get_pixel(24, 24), Rgb([255, 255, 255]));
    assert_eq!(*cleaned.get_pixel(2, 2), Rgb([10, 10, 10]));
}

#[test]
fn test_apply_with_fill_color_and_output_dir() {
    let temp_dir = TempDir::new().unwrap();
    let (image, regions) = write_fixture(temp_dir.path());
    let out_dir = temp_dir.path().join("out");

    let output = bubble_clean(&[
        "apply",
        &image,
        "--regions",
        &regions,
        "--fill-color",
        "250,240,200",
        "--output-dir",
        out_dir.to_str().unwrap(),
    ]);
    assert!(output.status.success());

    let cleaned = image::open(out_dir.join("page.png")).unwrap().to_rgb8();
    assert_eq!(*cleaned.get_pixel(24, 24), Rgb([250, 240, 200]));
}

#[test]
fn test_apply_refuses_to_overwrite_without_force() {
    let temp_dir = TempDir::new().unwrap();
    let (image, regions) = write_fixture(temp_dir.path());
    std::fs::write(temp_dir.path().join("page_clean.png"), b"previous").unwrap();

    let output = bubble_clean(&["apply", &image, "--regions", &regions]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--force"), "stderr: {stderr}");

    let output = bubble_clean(&["apply", &image, "--regions", &regions, "--force"]);
    assert!(output.status.success());
}

#[test]
fn test_apply_rejects_bad_document() {
    let temp_dir = TempDir::new().unwrap();
    let (image, _) = write_fixture(temp_dir.path());
    let bad = temp_dir.path().join("bad.json");
    std::fs::write(&bad, r#"{"width": 48, "height": 48, "regions": [{"class": "panel", "points": []}]}"#)
        .unwrap();

    let output = bubble_clean(&["apply", &image, "--regions", bad.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid region document"), "stderr: {stderr}");
}

#[test]
fn test_conflicting_model_arguments() {
    let temp_dir = TempDir::new().unwrap();
    let (image, _) = write_fixture(temp_dir.path());

    let output = bubble_clean(&[
        "clean",
        &image,
        "--model-path",
        "/some/model.onnx",
        "--model-url",
        "https://example.com/model.onnx",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Cannot specify both"), "stderr: {stderr}");
}

#[test]
fn test_missing_model_path_fails() {
    let temp_dir = TempDir::new().unwrap();
    let (image, _) = write_fixture(temp_dir.path());

    let output = bubble_clean(&["polygons", &image, "--model-path", "/non/existent/model.onnx"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not exist"), "stderr: {stderr}");
    assert!(!temp_dir.path().join("page_regions.json").exists());
}

#[test]
fn test_apply_reports_out_of_range_vertices() {
    let temp_dir = TempDir::new().unwrap();
    let (image, _) = write_fixture(temp_dir.path());
    let wild = temp_dir.path().join("wild.json");
    std::fs::write(
        &wild,
        r#"{"width": 48, "height": 48,
            "regions": [{"class": "bubble", "points": [[0, -3000000000], [10, 3000000000], [20, 0]]}]}"#,
    )
    .unwrap();

    let output = bubble_clean(&["apply", &image, "--regions", wild.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("far outside"), "stderr: {stderr}");
}
