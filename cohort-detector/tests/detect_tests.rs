//! Parameterised capability detection tests for `cohort-detector`.
//!
//! Each `#[case]` gets an isolated `TempDir`.

use cohort_detector::{detect, detect_capabilities, Confidence, DetectError};
use rstest::rstest;
use std::fs;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

fn make_dir() -> TempDir {
    TempDir::new().expect("tempdir")
}

fn write(dir: &TempDir, filename: &str, content: &str) {
    let path = dir.path().join(filename);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("mkdir");
    }
    fs::write(path, content).expect("write fixture");
}

fn mkdir(dir: &TempDir, rel: &str) {
    fs::create_dir_all(dir.path().join(rel)).expect("mkdir");
}

// ---------------------------------------------------------------------------
// Directory probes
// ---------------------------------------------------------------------------

#[rstest]
#[case("backend", "backend")]
#[case("server", "backend")]
#[case("src/api", "backend")]
#[case("frontend", "frontend")]
#[case("src/components", "frontend")]
#[case("tests", "tests")]
#[case("__tests__", "tests")]
#[case("docs", "docs")]
#[case(".github/workflows", "infra")]
#[case("android", "mobile")]
fn directory_implies_capability(#[case] rel: &str, #[case] capability: &str) {
    let dir = make_dir();
    mkdir(&dir, rel);
    let caps = detect_capabilities(dir.path()).expect("detect");
    assert!(caps.contains(capability), "{rel} should imply {capability}, got {caps:?}");
}

#[test]
fn plain_file_named_like_a_probe_is_ignored() {
    let dir = make_dir();
    write(&dir, "tests", "not a directory");
    assert!(detect_capabilities(dir.path()).expect("detect").is_empty());
}

#[test]
fn empty_tree_has_no_capabilities() {
    let dir = make_dir();
    assert!(detect_capabilities(dir.path()).expect("detect").is_empty());
}

// ---------------------------------------------------------------------------
// Manifest hints
// ---------------------------------------------------------------------------

#[rstest]
#[case("react", "frontend")]
#[case("@angular/core", "frontend")]
#[case("express", "backend")]
#[case("@nestjs/core", "backend")]
#[case("vitest", "tests")]
fn package_json_dependency_implies_capability(#[case] dep: &str, #[case] capability: &str) {
    let dir = make_dir();
    write(&dir, "package.json", &format!(r#"{{"dependencies": {{"{dep}": "^1.0"}}}}"#));
    let found = detect(dir.path()).expect("detect");
    let hit = found
        .iter()
        .find(|d| d.capability == capability)
        .unwrap_or_else(|| panic!("{dep} should imply {capability}, got {found:?}"));
    assert_eq!(hit.confidence, Confidence::High);
}

#[rstest]
#[case("[dependencies]\naxum = \"0.7\"\n", "backend")]
#[case("[dependencies]\nleptos = { version = \"0.6\" }\n", "frontend")]
fn cargo_manifest_hints(#[case] manifest: &str, #[case] capability: &str) {
    let dir = make_dir();
    write(&dir, "Cargo.toml", manifest);
    assert!(detect_capabilities(dir.path()).expect("detect").contains(capability));
}

#[rstest]
#[case("requirements.txt", "django>=4\n", "backend")]
#[case("requirements.txt", "torch==2.2\n", "ml")]
#[case("pyproject.toml", "[project]\ndependencies = [\"fastapi\", \"pytest\"]\n", "tests")]
fn python_manifest_hints(#[case] file: &str, #[case] content: &str, #[case] capability: &str) {
    let dir = make_dir();
    write(&dir, file, content);
    assert!(detect_capabilities(dir.path()).expect("detect").contains(capability));
}

#[test]
fn manifest_evidence_outranks_directory() {
    let dir = make_dir();
    mkdir(&dir, "web");
    write(&dir, "package.json", r#"{"devDependencies": {"vue": "3"}}"#);
    let found = detect(dir.path()).expect("detect");
    let frontend = found.iter().find(|d| d.capability == "frontend").expect("frontend");
    assert_eq!(frontend.confidence, Confidence::High);
    assert!(frontend.evidence.ends_with("package.json"));
    assert_eq!(found.iter().filter(|d| d.capability == "frontend").count(), 1);
}

#[test]
fn malformed_package_json_is_a_parse_error() {
    let dir = make_dir();
    write(&dir, "package.json", "{ not json");
    let err = detect(dir.path()).unwrap_err();
    assert!(matches!(err, DetectError::ParseError { .. }), "got: {err}");
    assert!(err.to_string().contains("package.json"));
}

#[test]
fn combined_tree_reports_sorted_capabilities() {
    let dir = make_dir();
    mkdir(&dir, "server");
    mkdir(&dir, "client");
    mkdir(&dir, "tests");
    let caps: Vec<_> = detect_capabilities(dir.path()).expect("detect").into_iter().collect();
    assert_eq!(caps, vec!["backend", "frontend", "tests"]);
}
