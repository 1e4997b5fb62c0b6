// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Data extraction stage
//!
//! Fetches a CSV file from a versioned repository:
//! - local directory or `file://` URL: read from disk
//! - GitHub repository URL: raw content endpoint at a revision
//! - any other http(s) URL: `<repo>/<path>`
//!
//! Any fetch failure falls back to the bundled Iris dataset unless strict
//! mode is requested.

use crate::iris;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const GITHUB_PREFIX: &str = "https://github.com/";
const GITHUB_RAW_PREFIX: &str = "https://raw.githubusercontent.com/";

/// Configuration for the extraction stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    pub repo_url: String,
    pub data_path: String,
    /// Git revision to read from (branch, tag or commit); `HEAD` when unset
    pub revision: Option<String>,
    /// Hex SHA-256 the fetched file must match
    pub expected_sha256: Option<String>,
    /// Substitute the reference dataset when the fetch fails
    pub allow_fallback: bool,
    pub timeout_secs: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            repo_url: "https://github.com/D3aThNdDeMiSe/mlops-kubeflow-assignment.git".to_string(),
            data_path: "data/iris.csv".to_string(),
            revision: None,
            expected_sha256: None,
            allow_fallback: true,
            timeout_secs: 30,
        }
    }
}

/// Reasons a fetch can fail
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported repository location '{0}'")]
    UnsupportedRepository(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server answered {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fetched content is not a CSV table: {0}")]
    InvalidCsv(String),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Where a repository file is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Local(PathBuf),
    Http(String),
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Local(path) => write!(f, "{}", path.display()),
            Source::Http(url) => write!(f, "{}", url),
        }
    }
}

/// How the dataset artifact was produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractOutcome {
    Remote { source: String },
    Fallback { reason: String },
}

/// Result of the extraction stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractReport {
    pub outcome: ExtractOutcome,
    pub rows: usize,
    pub columns: Vec<String>,
}

impl ExtractReport {
    pub fn used_fallback(&self) -> bool {
        matches!(self.outcome, ExtractOutcome::Fallback { .. })
    }
}

/// Map a repository location and in-repo path to a fetchable source
pub fn resolve_source(repo_url: &str, data_path: &str, revision: Option<&str>) -> Result<Source, FetchError> {
    let data_path = data_path.trim_start_matches('/');

    if let Some(local) = repo_url.strip_prefix("file://") {
        return Ok(Source::Local(Path::new(local).join(data_path)));
    }

    if let Some(rest) = repo_url.strip_prefix(GITHUB_PREFIX) {
        let repo = rest.trim_end_matches('/').trim_end_matches(".git");
        let mut parts = repo.splitn(3, '/');
        return match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => Ok(Source::Http(format!(
                "{}{}/{}/{}/{}",
                GITHUB_RAW_PREFIX,
                owner,
                name,
                revision.unwrap_or("HEAD"),
                data_path
            ))),
            _ => Err(FetchError::UnsupportedRepository(repo_url.to_string())),
        };
    }

    if repo_url.starts_with("http://") || repo_url.starts_with("https://") {
        let base = repo_url.trim_end_matches('/').trim_end_matches(".git");
        return Ok(Source::Http(format!("{}/{}", base, data_path)));
    }

    if repo_url.contains("://") || repo_url.is_empty() {
        return Err(FetchError::UnsupportedRepository(repo_url.to_string()));
    }

    Ok(Source::Local(Path::new(repo_url).join(data_path)))
}

fn download(url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
    tracing::info!("Downloading from: {}", url);

    let response = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()?
        .get(url)
        .send()?;

    if !response.status().is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let pb = ProgressBar::new(response.content_length().unwrap_or(0));
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }

    let content = response.bytes()?;
    pb.set_position(content.len() as u64);
    pb.finish_with_message("Downloaded");

    Ok(content.to_vec())
}

fn read_local(path: &Path) -> Result<Vec<u8>, FetchError> {
    tracing::info!("Reading from: {}", path.display());
    let mut bytes = Vec::new();
    std::fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|source| FetchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(bytes)
}

/// Hex-encoded SHA-256 of the content
pub fn sha256_hex(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Check the content reads as CSV with a header; returns (rows, columns)
fn inspect_csv(content: &[u8]) -> Result<(usize, Vec<String>), FetchError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(content);

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| FetchError::InvalidCsv(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if columns.iter().all(|c| c.is_empty()) {
        return Err(FetchError::InvalidCsv("missing header row".to_string()));
    }

    let mut rows = 0;
    for record in reader.records() {
        record.map_err(|e| FetchError::InvalidCsv(e.to_string()))?;
        rows += 1;
    }

    Ok((rows, columns))
}

/// Fetch the configured file and validate it; does not fall back
pub fn fetch(config: &ExtractConfig) -> Result<(Source, Vec<u8>), FetchError> {
    let source = resolve_source(&config.repo_url, &config.data_path, config.revision.as_deref())?;

    let content = match &source {
        Source::Local(path) => read_local(path)?,
        Source::Http(url) => download(url, Duration::from_secs(config.timeout_secs))?,
    };

    if let Some(expected) = &config.expected_sha256 {
        let actual = sha256_hex(&content);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(FetchError::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        tracing::info!("Checksum verified: {}", actual);
    }

    Ok((source, content))
}

/// Run the extraction stage, writing the dataset artifact to `output`
pub fn run_extraction(config: &ExtractConfig, output: &Path) -> Result<ExtractReport> {
    tracing::info!("Fetching versioned dataset");
    tracing::info!("  Repo: {}", config.repo_url);
    tracing::info!("  Path: {}", config.data_path);

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let fetched = fetch(config).and_then(|(source, content)| {
        let (rows, columns) = inspect_csv(&content)?;
        Ok((source, content, rows, columns))
    });

    let report = match fetched {
        Ok((source, content, rows, columns)) => {
            tracing::info!("Data fetched successfully from {}", source);
            tracing::info!("  Shape: ({}, {})", rows, columns.len());
            tracing::info!("  Columns: {:?}", columns);
            std::fs::write(output, &content)
                .with_context(|| format!("Failed to write dataset: {}", output.display()))?;
            ExtractReport {
                outcome: ExtractOutcome::Remote {
                    source: source.to_string(),
                },
                rows,
                columns,
            }
        }
        Err(e) if config.allow_fallback => {
            tracing::warn!("Could not fetch versioned dataset: {}", e);
            tracing::warn!("Falling back to bundled Iris dataset");
            let table = iris::load();
            table.write_csv(output)?;
            let (rows, _) = table.shape();
            tracing::info!("Using fallback data. Shape: {:?}", table.shape());
            ExtractReport {
                outcome: ExtractOutcome::Fallback { reason: e.to_string() },
                rows,
                columns: table.columns,
            }
        }
        Err(e) => {
            return Err(anyhow::Error::new(e).context(format!(
                "Failed to fetch {} from {}",
                config.data_path, config.repo_url
            )));
        }
    };

    tracing::info!("Data extraction complete: {}", output.display());
    Ok(report)
}
