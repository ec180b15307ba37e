//! Capability detection for `cohort-detector`.
//!
//! `detect_capabilities(root)` probes a working tree and reports which kinds
//! of work an instance started there is likely to do (`backend`, `frontend`,
//! `tests`, ...). Two sources of evidence are combined:
//!
//! 1. well-known subdirectories (medium confidence)
//! 2. dependency hints in manifest files at the root (high confidence)
//!
//! The result is a plain set of capability names; [`detect`] also returns the
//! evidence behind each one.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

pub const BACKEND: &str = "backend";
pub const FRONTEND: &str = "frontend";
pub const TESTS: &str = "tests";
pub const DOCS: &str = "docs";
pub const INFRA: &str = "infra";
pub const MOBILE: &str = "mobile";
pub const ML: &str = "ml";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How strongly a piece of evidence implies its capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// A directory with a conventional name exists.
    Medium,
    /// A manifest declares a dependency that implies the capability.
    High,
}

/// One detected capability and the strongest evidence seen for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub capability: String,
    pub evidence: PathBuf,
    pub confidence: Confidence,
}

/// Errors from capability detection.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    ParseError { path: PathBuf, message: String },
}

fn io_err(path: &Path, source: std::io::Error) -> DetectError {
    DetectError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Probe tables
// ---------------------------------------------------------------------------

const DIRECTORY_PROBES: &[(&str, &[&str])] = &[
    (BACKEND, &["backend", "server", "api", "services", "src/api", "src/server"]),
    (FRONTEND, &["frontend", "client", "web", "ui", "src/components", "src/pages", "public"]),
    (TESTS, &["tests", "test", "__tests__", "spec", "e2e"]),
    (DOCS, &["docs", "doc"]),
    (INFRA, &["infra", "deploy", "terraform", "k8s", ".github/workflows"]),
    (MOBILE, &["ios", "android", "mobile"]),
];

const JS_FRONTEND: &[&str] = &[
    "react", "vue", "next", "nuxt", "svelte", "@sveltejs/kit", "@angular/core", "astro", "solid-js",
];
const JS_BACKEND: &[&str] = &["express", "fastify", "koa", "@nestjs/core", "@hapi/hapi", "hono"];
const JS_TESTS: &[&str] = &["jest", "vitest", "mocha", "@playwright/test", "cypress"];

const RUST_BACKEND: &[&str] = &["axum", "actix-web", "rocket", "warp", "tonic", "poem"];
const RUST_FRONTEND: &[&str] = &["leptos", "yew", "dioxus", "tauri"];

const PY_BACKEND: &[&str] = &["fastapi", "django", "flask", "starlette", "litestar"];
const PY_ML: &[&str] = &["torch", "tensorflow", "scikit-learn", "keras", "transformers"];
const PY_TESTS: &[&str] = &["pytest", "hypothesis"];

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Capability names detected under `root`. A missing root yields an empty set.
pub fn detect_capabilities(root: &Path) -> Result<BTreeSet<String>, DetectError> {
    Ok(detect(root)?.into_iter().map(|d| d.capability).collect())
}

/// Every detected capability with its strongest evidence, sorted by name.
pub fn detect(root: &Path) -> Result<Vec<Detection>, DetectError> {
    if !root.is_dir() {
        return Ok(vec![]);
    }

    let mut found: BTreeMap<String, Detection> = BTreeMap::new();
    let mut note = |capability: &str, evidence: PathBuf, confidence: Confidence| {
        let entry = found.entry(capability.to_string()).or_insert_with(|| Detection {
            capability: capability.to_string(),
            evidence: evidence.clone(),
            confidence,
        });
        if confidence > entry.confidence {
            entry.evidence = evidence;
            entry.confidence = confidence;
        }
    };

    for (capability, dirs) in DIRECTORY_PROBES {
        if let Some(dir) = dirs.iter().map(|d| root.join(d)).find(|p| p.is_dir()) {
            note(*capability, dir, Confidence::Medium);
        }
    }

    for (capability, manifest) in manifest_hints(root)? {
        note(capability, manifest, Confidence::High);
    }

    Ok(found.into_values().collect())
}

// ---------------------------------------------------------------------------
// Manifest hints
// ---------------------------------------------------------------------------

fn manifest_hints(root: &Path) -> Result<Vec<(&'static str, PathBuf)>, DetectError> {
    let mut hints = Vec::new();

    let package_json = root.join("package.json");
    if package_json.is_file() {
        let content = fs::read_to_string(&package_json).map_err(|e| io_err(&package_json, e))?;
        let json: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| DetectError::ParseError {
                path: package_json.clone(),
                message: e.to_string(),
            })?;
        let deps = collect_package_json_deps(&json);
        push_if_any(&mut hints, &deps, JS_FRONTEND, FRONTEND, &package_json);
        push_if_any(&mut hints, &deps, JS_BACKEND, BACKEND, &package_json);
        push_if_any(&mut hints, &deps, JS_TESTS, TESTS, &package_json);
    }

    let cargo_toml = root.join("Cargo.toml");
    if cargo_toml.is_file() {
        let deps = manifest_words(&cargo_toml)?;
        push_if_any(&mut hints, &deps, RUST_FRONTEND, FRONTEND, &cargo_toml);
        push_if_any(&mut hints, &deps, RUST_BACKEND, BACKEND, &cargo_toml);
    }

    for name in ["pyproject.toml", "requirements.txt", "Pipfile"] {
        let manifest = root.join(name);
        if !manifest.is_file() {
            continue;
        }
        let deps = manifest_words(&manifest)?;
        push_if_any(&mut hints, &deps, PY_BACKEND, BACKEND, &manifest);
        push_if_any(&mut hints, &deps, PY_ML, ML, &manifest);
        push_if_any(&mut hints, &deps, PY_TESTS, TESTS, &manifest);
        break;
    }

    Ok(hints)
}

fn push_if_any(
    hints: &mut Vec<(&'static str, PathBuf)>,
    deps: &HashSet<String>,
    wanted: &[&str],
    capability: &'static str,
    manifest: &Path,
) {
    if wanted.iter().any(|w| deps.contains(*w)) {
        hints.push((capability, manifest.to_path_buf()));
    }
}

fn collect_package_json_deps(json: &serde_json::Value) -> HashSet<String> {
    let mut deps = HashSet::new();
    for key in &["dependencies", "devDependencies", "peerDependencies"] {
        if let Some(obj) = json.get(key).and_then(|v| v.as_object()) {
            for k in obj.keys() {
                deps.insert(k.clone());
            }
        }
    }
    deps
}

/// Dependency-like identifiers in a TOML or requirements-style manifest.
///
/// Lowercased tokens split on anything that cannot appear in a package name;
/// good enough for presence checks without a TOML parser.
fn manifest_words(path: &Path) -> Result<HashSet<String>, DetectError> {
    let content = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    Ok(content
        .to_lowercase()
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '@' || c == '/'))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_root_is_empty_not_an_error() {
        let caps = detect_capabilities(Path::new("/definitely/not/here")).unwrap();
        assert!(caps.is_empty());
    }

    #[test]
    fn manifest_words_splits_versions_and_quotes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("requirements.txt");
        fs::write(&path, "FastAPI==0.110\ntorch>=2\n").unwrap();
        let words = manifest_words(&path).unwrap();
        assert!(words.contains("fastapi"));
        assert!(words.contains("torch"));
    }
}
