use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

use pdfword_merge::MergedWord;

fn write_run(base: &std::path::Path) {
    let input = base.join("input");
    fs::create_dir_all(&input).unwrap();
    fs::write(
        input.join("Scan One.json"),
        r#"[
            {"pageNum": 0, "x": 5.5, "y": 0, "width": 5, "height": 10, "str": "lo"},
            {"pageNum": 0, "x": 0, "y": 0, "width": 5, "height": 10, "str": "Hel"},
            {"pageNum": 0, "x": 20, "y": 0, "width": 5, "height": 10, "str": "there"}
        ]"#,
    )
    .unwrap();
    fs::write(
        base.join("merge.yaml"),
        format!(
            "id: cli\ninputs:\n  path: {}/input/**/*.json\noutputs:\n  dir: {}/out\n",
            base.display(),
            base.display()
        ),
    )
    .unwrap();
}

#[test]
fn merges_inputs_and_writes_outputs() {
    let td = tempfile::tempdir().unwrap();
    write_run(td.path());

    Command::cargo_bin("pdfword-merge")
        .unwrap()
        .current_dir(td.path())
        .assert()
        .success()
        .stderr(predicate::str::contains("\"tool\":\"emit_files\""));

    let doc_dir = td.path().join("out/scan-one");
    let words: Vec<MergedWord> =
        serde_json::from_str(&fs::read_to_string(doc_dir.join("scan-one.words.json")).unwrap()).unwrap();
    let texts: Vec<&str> = words.iter().map(|w| w.text.as_str()).collect();
    assert_eq!(texts, vec!["Hello", "there"]);
    assert_eq!(fs::read_to_string(doc_dir.join("scan-one.txt")).unwrap(), "Hello there");

    let meta: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(doc_dir.join("scan-one.meta.json")).unwrap()).unwrap();
    assert_eq!(meta["stats"]["merged_fragments"], 1);
    let source = fs::read(td.path().join("input/Scan One.json")).unwrap();
    assert_eq!(meta["source_sha256"], pdfword_merge::sha256_hex(&source));
    assert!(meta["meta_fingerprint"].is_string());
}

#[test]
fn distance_override_and_flat_output() {
    let td = tempfile::tempdir().unwrap();
    write_run(td.path());

    Command::cargo_bin("pdfword-merge")
        .unwrap()
        .current_dir(td.path())
        .args(["--distance-limit", "20", "--per-doc-dir", "off", "--text", "off", "--sequential"])
        .assert()
        .success();

    let words: Vec<MergedWord> =
        serde_json::from_str(&fs::read_to_string(td.path().join("out/scan-one.words.json")).unwrap()).unwrap();
    assert_eq!(words.len(), 1);
    assert_eq!(words[0].text, "Hellothere");
    assert!(!td.path().join("out/scan-one.txt").exists());
}

#[test]
fn invalid_override_exits_with_config_code() {
    let td = tempfile::tempdir().unwrap();
    write_run(td.path());

    Command::cargo_bin("pdfword-merge")
        .unwrap()
        .current_dir(td.path())
        .args(["--distance-limit=-1"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("InvalidConfig"));
}

#[test]
fn negative_extent_exits_with_merge_code() {
    let td = tempfile::tempdir().unwrap();
    write_run(td.path());
    fs::write(
        td.path().join("input/Scan One.json"),
        r#"[{"page": 0, "x": 0, "y": 0, "width": -2, "height": 10, "text": "bad"}]"#,
    )
    .unwrap();

    Command::cargo_bin("pdfword-merge")
        .unwrap()
        .current_dir(td.path())
        .assert()
        .code(5)
        .stderr(predicate::str::contains("InvalidFragment"));
}

#[test]
fn missing_inputs_print_guidance() {
    let td = tempfile::tempdir().unwrap();
    fs::write(
        td.path().join("merge.yaml"),
        format!("id: empty\ninputs:\n  path: {}/nothing/*.json\n", td.path().display()),
    )
    .unwrap();

    Command::cargo_bin("pdfword-merge")
        .unwrap()
        .current_dir(td.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("NoFilesFound"));
}
