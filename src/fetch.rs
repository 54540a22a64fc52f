//! Repository acquisition.
//!
//! A [`RepoFetcher`] turns a URL into the set of source files the rest of
//! the pipeline works on. [`GitFetcher`] shallow-clones remote repositories
//! into a cache directory with the `git` client; [`LocalFetcher`] reads an
//! existing checkout (a plain path or a `file://` URL). Both walk the tree
//! with the same filters:
//!
//! - hidden directories and `node_modules`, `__pycache__`, `build`, `dist`,
//!   `target` are skipped
//! - `fetch.include_globs` / `fetch.exclude_globs` apply to relative paths
//! - files over `fetch.max_file_bytes` or not valid UTF-8 are recorded as
//!   errors and skipped
//! - at most `fetch.max_files` files are returned, in path order

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use walkdir::{DirEntry, WalkDir};

use codequest_core::models::{language_for_path, RepositoryRef, SourceFile};

use crate::config::FetchConfig;

const SKIP_DIRS: &[&str] = &["node_modules", "__pycache__", "build", "dist", "target"];

/// Manifests and docs read even though they are not source code.
pub const KEY_FILES: &[&str] = &[
    "package.json",
    "requirements.txt",
    "Pipfile",
    "pyproject.toml",
    "Cargo.toml",
    "go.mod",
    "pom.xml",
    "build.gradle",
    "Dockerfile",
    "docker-compose.yml",
    "README.md",
];

/// Files read from one repository, plus per-file problems.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub repo: RepositoryRef,
    pub root: PathBuf,
    pub files: Vec<SourceFile>,
    pub errors: Vec<String>,
}

impl FetchOutcome {
    /// Errors with nothing usable means the fetch failed outright.
    pub fn is_fatal(&self) -> bool {
        self.files.is_empty() && !self.errors.is_empty()
    }
}

#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchOutcome>;
}

/// Derive the stable `owner/name` id for a repository URL or path.
///
/// ```text
/// https://github.com/tokio-rs/axum.git → tokio-rs/axum
/// git@github.com:tokio-rs/axum.git    → tokio-rs/axum
/// /home/me/src/demo                    → local/demo
/// ```
pub fn repo_id_from_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);

    if is_local(trimmed) {
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repo".to_string());
        return format!("local/{name}");
    }

    let path_part = match trimmed.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, p)| p).unwrap_or(""),
        None => trimmed.split_once(':').map(|(_, p)| p).unwrap_or(trimmed),
    };
    let segments: Vec<&str> = path_part.split('/').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        [] => trimmed.to_string(),
        [name] => (*name).to_string(),
        [.., owner, name] => format!("{owner}/{name}"),
    }
}

fn is_local(url: &str) -> bool {
    url.starts_with("file://") || url.starts_with('/') || url.starts_with('.')
}

/// Clones remote repositories, delegating local paths to [`LocalFetcher`].
///
/// The clone directory is derived from the URL alone, so runs fetching the
/// same URL take that directory's lock for the whole clone and walk.
pub struct GitFetcher {
    config: FetchConfig,
    clone_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl GitFetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self {
            config,
            clone_locks: Mutex::new(HashMap::new()),
        }
    }

    fn clone_lock(&self, dest: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.clone_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(dest.to_path_buf()).or_default().clone()
    }

    fn clone_dir(&self, url: &str) -> PathBuf {
        let id = repo_id_from_url(url).replace('/', "__");
        self.config
            .cache_dir
            .join(format!("{}-{}", id, short_hash(url)))
    }

    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        if dest.exists() {
            tokio::fs::remove_dir_all(dest)
                .await
                .with_context(|| format!("Failed to clear clone directory: {}", dest.display()))?;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create cache directory: {}", parent.display()))?;
        }

        tracing::info!(url, dest = %dest.display(), "cloning repository");
        let mut cmd = tokio::process::Command::new("git");
        cmd.args(["clone", "--depth", "1", "--quiet"])
            .arg(url)
            .arg(dest)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        let timeout = Duration::from_secs(self.config.timeout_secs);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("git clone timed out after {}s", timeout.as_secs()))?
            .with_context(|| "Failed to execute 'git clone'. Is git installed?")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git clone failed: {}", stderr.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl RepoFetcher for GitFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchOutcome> {
        if is_local(url.trim()) {
            return LocalFetcher::new(self.config.clone()).fetch(url).await;
        }
        let dest = self.clone_dir(url);
        let lock = self.clone_lock(&dest);
        let _held = lock.lock().await;
        self.clone_repo(url, &dest).await?;
        let repo = RepositoryRef {
            id: repo_id_from_url(url),
            url: url.to_string(),
        };
        walk_blocking(self.config.clone(), repo, dest).await
    }
}

/// Reads a repository that is already on disk.
pub struct LocalFetcher {
    config: FetchConfig,
}

impl LocalFetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RepoFetcher for LocalFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchOutcome> {
        let path = url.trim().strip_prefix("file://").unwrap_or(url.trim());
        let root = PathBuf::from(path);
        if !root.is_dir() {
            bail!("Repository path does not exist: {}", root.display());
        }
        let repo = RepositoryRef {
            id: repo_id_from_url(url),
            url: url.to_string(),
        };
        walk_blocking(self.config.clone(), repo, root).await
    }
}

async fn walk_blocking(config: FetchConfig, repo: RepositoryRef, root: PathBuf) -> Result<FetchOutcome> {
    tokio::task::spawn_blocking(move || walk_repository(&config, repo, root))
        .await
        .context("repository walk task failed")?
}

/// Walk `root` and read every eligible file.
pub fn walk_repository(config: &FetchConfig, repo: RepositoryRef, root: PathBuf) -> Result<FetchOutcome> {
    let include_set = build_globset(&config.include_globs)?;
    let exclude_set = build_globset(&config.exclude_globs)?;

    let mut candidates: Vec<(PathBuf, String)> = Vec::new();
    let mut errors = Vec::new();

    let walker = WalkDir::new(&root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped_dir(e));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                errors.push(e.to_string());
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        let selected = if config.include_globs.is_empty() {
            is_source_file(&rel_str)
        } else {
            include_set.is_match(&rel_str)
        };
        if selected {
            candidates.push((path.to_path_buf(), rel_str));
        }
    }

    candidates.sort_by(|a, b| a.1.cmp(&b.1));

    let mut files = Vec::new();
    for (path, rel_str) in candidates {
        if files.len() >= config.max_files {
            tracing::debug!(max_files = config.max_files, "file limit reached");
            break;
        }
        match read_source(&path, config.max_file_bytes) {
            Ok(content) => files.push(SourceFile::new(rel_str, content)),
            Err(e) => errors.push(format!("{rel_str}: {e}")),
        }
    }

    tracing::info!(repo = %repo.id, files = files.len(), errors = errors.len(), "repository read");
    Ok(FetchOutcome {
        repo,
        root,
        files,
        errors,
    })
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref())
}

fn is_source_file(rel_path: &str) -> bool {
    let name = rel_path.rsplit('/').next().unwrap_or(rel_path);
    KEY_FILES.contains(&name) || !matches!(language_for_path(rel_path), "text" | "json")
}

fn read_source(path: &Path, max_bytes: u64) -> Result<String> {
    let size = std::fs::metadata(path)?.len();
    if size > max_bytes {
        bail!("skipped, {size} bytes exceeds limit of {max_bytes}");
    }
    let bytes = std::fs::read(path)?;
    String::from_utf8(bytes).map_err(|_| anyhow::anyhow!("skipped, not valid UTF-8"))
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {pattern}"))?);
    }
    Ok(builder.build()?)
}
