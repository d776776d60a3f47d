// CLI integration tests for one-shot pipeline commands.
use std::process::Command;

use serde_json::Value;

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_streamgate");
    Command::new(exe)
}

fn parse_json(value: &str) -> Value {
    serde_json::from_str(value).expect("valid json")
}

fn sample_text(lines: usize) -> String {
    (0..lines)
        .map(|i| format!("line {i}: the quick brown fox jumps over the lazy dog\n"))
        .collect()
}

#[test]
fn compress_then_decompress_restores_input() {
    let temp = tempfile::tempdir().expect("tempdir");
    let src = temp.path().join("large.txt");
    let text = sample_text(20_000);
    std::fs::write(&src, &text).expect("write");

    let compress = cmd()
        .args(["compress", src.to_str().unwrap()])
        .output()
        .expect("compress");
    assert!(compress.status.success());
    let compress_json = parse_json(std::str::from_utf8(&compress.stdout).expect("utf8"));
    let gz = temp.path().join("large.txt.gz");
    assert_eq!(compress_json["dest"], gz.to_str().unwrap());
    assert_eq!(compress_json["report"]["bytes_in"], text.len() as u64);
    let compressed = std::fs::read(&gz).expect("read gz");
    assert_eq!(&compressed[..2], &[0x1f, 0x8b]);
    assert!(compressed.len() < text.len());

    let restored = temp.path().join("restored.txt");
    let decompress = cmd()
        .args(["decompress", gz.to_str().unwrap(), restored.to_str().unwrap()])
        .output()
        .expect("decompress");
    assert!(decompress.status.success());
    assert_eq!(std::fs::read_to_string(&restored).expect("read"), text);
}

#[test]
fn decompress_of_truncated_input_fails_without_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let src = temp.path().join("large.txt");
    std::fs::write(&src, sample_text(2_000)).expect("write");
    let status = cmd()
        .args(["compress", src.to_str().unwrap()])
        .status()
        .expect("compress");
    assert!(status.success());

    let gz = temp.path().join("large.txt.gz");
    let mut bytes = std::fs::read(&gz).expect("read");
    bytes.truncate(bytes.len() / 2);
    std::fs::write(&gz, &bytes).expect("truncate");

    let dest = temp.path().join("restored.txt");
    let output = cmd()
        .args(["decompress", gz.to_str().unwrap(), dest.to_str().unwrap()])
        .output()
        .expect("decompress");
    assert_eq!(output.status.code().unwrap(), 5);
    let err = parse_json(std::str::from_utf8(&output.stderr).expect("utf8").trim());
    assert_eq!(err["error"]["kind"], "Pipeline");
    assert!(!dest.exists());
    let staged = std::fs::read_dir(temp.path())
        .expect("read dir")
        .filter(|entry| {
            entry
                .as_ref()
                .expect("entry")
                .file_name()
                .to_string_lossy()
                .ends_with(".partial")
        })
        .count();
    assert_eq!(staged, 0);
}

#[test]
fn ingest_reports_inserted_and_rejected_rows() {
    let temp = tempfile::tempdir().expect("tempdir");
    let csv = temp.path().join("sample.csv");
    std::fs::write(
        &csv,
        "id,name,email,age\n1,A,a@x,30\n2,,b@x,40\n1,A again,a2@x,31\n3,C,c@x,\n",
    )
    .expect("write");
    let store = temp.path().join("users.db");

    let output = cmd()
        .args([
            "ingest",
            csv.to_str().unwrap(),
            "--store",
            store.to_str().unwrap(),
        ])
        .output()
        .expect("ingest");
    assert!(output.status.success());
    let value = parse_json(std::str::from_utf8(&output.stdout).expect("utf8"));
    assert_eq!(value["rows"], 4);
    assert_eq!(value["inserted"], 2);
    assert_eq!(value["ignored"], 1);
    assert_eq!(value["rejected"], 1);
    assert_eq!(value["failures"][0]["row"], 3);
    assert_eq!(value["failures"][0]["kind"], "RowRejected");
    assert_eq!(value["stored_users"], 2);

    let again = cmd()
        .args([
            "ingest",
            csv.to_str().unwrap(),
            "--store",
            store.to_str().unwrap(),
        ])
        .output()
        .expect("ingest again");
    assert!(again.status.success());
    let value = parse_json(std::str::from_utf8(&again.stdout).expect("utf8"));
    assert_eq!(value["inserted"], 0);
    assert_eq!(value["stored_users"], 2);
}

#[test]
fn ingest_defaults_store_under_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    let csv = temp.path().join("sample.csv");
    std::fs::write(&csv, "name,email\nA,a@x\n").expect("write");

    let output = cmd()
        .args([
            "--root",
            temp.path().to_str().unwrap(),
            "ingest",
            csv.to_str().unwrap(),
        ])
        .output()
        .expect("ingest");
    assert!(output.status.success());
    assert!(temp.path().join("data.db").exists());
}

#[test]
fn not_found_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let missing = temp.path().join("missing.txt");
    let output = cmd()
        .args(["compress", missing.to_str().unwrap()])
        .output()
        .expect("compress");
    assert_eq!(output.status.code().unwrap(), 3);
    let err = parse_json(std::str::from_utf8(&output.stderr).expect("utf8").trim());
    assert_eq!(err["error"]["kind"], "NotFound");
}

#[test]
fn usage_exit_code() {
    let output = cmd().args(["serve", "--bogus"]).output().expect("serve");
    assert_eq!(output.status.code().unwrap(), 2);
    let err = parse_json(std::str::from_utf8(&output.stderr).expect("utf8").trim());
    assert_eq!(err["error"]["kind"], "Usage");
}

#[test]
fn non_loopback_serve_requires_opt_in() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = cmd()
        .args([
            "--root",
            temp.path().to_str().unwrap(),
            "serve",
            "--bind",
            "0.0.0.0:0",
        ])
        .output()
        .expect("serve");
    assert_eq!(output.status.code().unwrap(), 2);
}
