//! Filesystem artifact store for commis output
//!
//! Each commis owns a directory under the configured root:
//!
//! ```text
//! {base}/
//!   index.json
//!   2026-08-01T12-30-05_calculate-x_a1b2c3/
//!     metadata.json
//!     thread.jsonl
//!     result.txt
//!     metrics.jsonl
//!     tool_calls/001_http_request.txt
//!     diff.patch
//! ```
//!
//! Commis directories have a single writer (the dispatcher task that
//! owns the job), so only the root index needs locking: read-modify-
//! writes hold both a process-local mutex keyed by the index path and
//! an OS advisory lock on the file itself.

use crate::db::CommisConfig;
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("commis not found: {0}")]
    NotFound(String),
    #[error("commis already exists: {0}")]
    AlreadyExists(String),
    #[error("access denied to commis {0}")]
    AccessDenied(String),
    #[error("invalid relative path: {0}")]
    InvalidPath(String),
    #[error("invalid search pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("invalid file glob: {0}")]
    Glob(#[from] globset::Error),
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// Commis lifecycle status as recorded in metadata.json
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Created,
    Running,
    Success,
    Failed,
    Timeout,
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactStatus::Created => write!(f, "created"),
            ArtifactStatus::Running => write!(f, "running"),
            ArtifactStatus::Success => write!(f, "success"),
            ArtifactStatus::Failed => write!(f, "failed"),
            ArtifactStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Contents of a commis `metadata.json`, also mirrored into the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommisMetadata {
    pub commis_id: String,
    pub task: String,
    pub config: CommisConfig,
    pub status: ArtifactStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_meta: Option<serde_json::Value>,
}

/// One regex hit from `search`
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub commis_id: String,
    pub file: String,
    pub line: usize,
    pub content: String,
}

/// Filters for `list`
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub limit: usize,
    pub status: Option<ArtifactStatus>,
    pub since: Option<DateTime<Utc>>,
    pub owner_id: Option<i64>,
}

/// Filesystem-backed artifact store rooted at a data directory
#[derive(Clone)]
pub struct ArtifactStore {
    base_path: PathBuf,
}

/// Process-local locks keyed by absolute index path, so two stores
/// opened on the same root in one process still serialize.
fn index_locks() -> &'static Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

impl ArtifactStore {
    /// Open or create the store at the given root
    pub fn new(base_path: impl Into<PathBuf>) -> ArtifactResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        let store = Self { base_path };
        if !store.index_path().exists() {
            store.with_index(|_| {})?;
        }
        Ok(store)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn index_path(&self) -> PathBuf {
        self.base_path.join("index.json")
    }

    fn commis_dir(&self, commis_id: &str) -> PathBuf {
        self.base_path.join(commis_id)
    }

    // ==================== Index ====================

    /// Read-modify-write the index under the process and file locks.
    /// A corrupt index is rebuilt as empty rather than poisoning writes.
    fn with_index<F: FnOnce(&mut Vec<CommisMetadata>)>(&self, mutate: F) -> ArtifactResult<()> {
        let key = self.index_path();
        let local = {
            let mut locks = index_locks().lock().unwrap();
            locks.entry(key.clone()).or_default().clone()
        };
        let _guard = local.lock().unwrap();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&key)?;
        file.lock_exclusive()?;
        let result = (|| -> ArtifactResult<()> {
            let mut raw = String::new();
            file.read_to_string(&mut raw)?;
            let mut index: Vec<CommisMetadata> = if raw.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&raw).unwrap_or_else(|e| {
                    tracing::warn!(path = %key.display(), error = %e, "corrupt artifact index, rebuilding");
                    Vec::new()
                })
            };
            mutate(&mut index);
            let serialized = serde_json::to_string_pretty(&index)?;
            file.set_len(0)?;
            file.rewind()?;
            file.write_all(serialized.as_bytes())?;
            Ok(())
        })();
        let _ = FileExt::unlock(&file);
        result
    }

    fn read_index(&self) -> ArtifactResult<Vec<CommisMetadata>> {
        let raw = fs::read_to_string(self.index_path())?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }

    fn upsert_index_entry(&self, metadata: &CommisMetadata) -> ArtifactResult<()> {
        let entry = metadata.clone();
        self.with_index(move |index| {
            match index.iter_mut().find(|m| m.commis_id == entry.commis_id) {
                Some(existing) => *existing = entry,
                None => index.push(entry),
            }
        })
    }

    // ==================== Lifecycle ====================

    /// Create the directory structure for a new commis
    pub fn create(&self, task: &str, config: &CommisConfig) -> ArtifactResult<String> {
        self.create_with_id(task, config, &generate_commis_id(task))
    }

    /// Create a commis under a caller-chosen id (workspace jobs use
    /// `ws-{job_id}-{8hex}`)
    pub fn create_with_id(
        &self,
        task: &str,
        config: &CommisConfig,
        commis_id: &str,
    ) -> ArtifactResult<String> {
        let commis_id = commis_id.to_string();
        let dir = self.commis_dir(&commis_id);
        if dir.exists() {
            return Err(ArtifactError::AlreadyExists(commis_id));
        }
        fs::create_dir_all(dir.join("tool_calls"))?;

        let metadata = CommisMetadata {
            commis_id: commis_id.clone(),
            task: task.to_string(),
            config: config.clone(),
            status: ArtifactStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            error: None,
            summary: None,
            summary_meta: None,
        };
        self.write_metadata(&metadata)?;
        self.upsert_index_entry(&metadata)?;
        tracing::info!(commis_id, "created commis directory");
        Ok(commis_id)
    }

    /// Mark the commis running
    pub fn start(&self, commis_id: &str) -> ArtifactResult<()> {
        let mut metadata = self.get_metadata(commis_id, None)?;
        metadata.status = ArtifactStatus::Running;
        metadata.started_at = Some(Utc::now());
        self.write_metadata(&metadata)?;
        self.upsert_index_entry(&metadata)
    }

    /// Mark the commis terminal, computing duration from started_at
    pub fn complete(
        &self,
        commis_id: &str,
        status: ArtifactStatus,
        error: Option<&str>,
    ) -> ArtifactResult<()> {
        let mut metadata = self.get_metadata(commis_id, None)?;
        let now = Utc::now();
        metadata.status = status;
        metadata.finished_at = Some(now);
        metadata.error = error.map(String::from);
        if let Some(started) = metadata.started_at {
            metadata.duration_ms = Some((now - started).num_milliseconds());
        }
        self.write_metadata(&metadata)?;
        self.upsert_index_entry(&metadata)?;
        tracing::info!(commis_id, %status, "completed commis");
        Ok(())
    }

    /// Attach a derived summary. Summaries are recomputable; the
    /// canonical record stays result.txt.
    pub fn update_summary(
        &self,
        commis_id: &str,
        summary: &str,
        summary_meta: serde_json::Value,
    ) -> ArtifactResult<()> {
        let mut metadata = self.get_metadata(commis_id, None)?;
        metadata.summary = Some(summary.to_string());
        metadata.summary_meta = Some(summary_meta);
        self.write_metadata(&metadata)?;
        self.upsert_index_entry(&metadata)
    }

    // ==================== Writers ====================

    fn write_metadata(&self, metadata: &CommisMetadata) -> ArtifactResult<()> {
        let path = self.commis_dir(&metadata.commis_id).join("metadata.json");
        fs::write(path, serde_json::to_string_pretty(metadata)?)?;
        Ok(())
    }

    /// Append one message to thread.jsonl
    pub fn save_message(&self, commis_id: &str, message: &serde_json::Value) -> ArtifactResult<()> {
        let path = self.commis_dir(commis_id).join("thread.jsonl");
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(serde_json::to_string(message)?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    /// Save numbered tool output; returns the relative path
    pub fn save_tool_output(
        &self,
        commis_id: &str,
        tool_name: &str,
        output: &str,
        sequence: u32,
    ) -> ArtifactResult<String> {
        let filename = format!("{sequence:03}_{tool_name}.txt");
        let path = self.commis_dir(commis_id).join("tool_calls").join(&filename);
        fs::write(path, output)?;
        Ok(format!("tool_calls/{filename}"))
    }

    /// Write the canonical final result
    pub fn save_result(&self, commis_id: &str, result: &str) -> ArtifactResult<()> {
        fs::write(self.commis_dir(commis_id).join("result.txt"), result)?;
        Ok(())
    }

    /// Save an arbitrary artifact (e.g. diff.patch)
    pub fn save_artifact(
        &self,
        commis_id: &str,
        filename: &str,
        content: &str,
    ) -> ArtifactResult<PathBuf> {
        validate_relative(filename)?;
        let path = self.commis_dir(commis_id).join(filename);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Append one metric record to metrics.jsonl
    pub fn save_metric(&self, commis_id: &str, metric: &serde_json::Value) -> ArtifactResult<()> {
        let path = self.commis_dir(commis_id).join("metrics.jsonl");
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(serde_json::to_string(metric)?.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    // ==================== Readers ====================

    /// Read metadata, optionally enforcing ownership
    pub fn get_metadata(
        &self,
        commis_id: &str,
        owner_id: Option<i64>,
    ) -> ArtifactResult<CommisMetadata> {
        let path = self.commis_dir(commis_id).join("metadata.json");
        let raw = fs::read_to_string(&path)
            .map_err(|_| ArtifactError::NotFound(commis_id.to_string()))?;
        let metadata: CommisMetadata = serde_json::from_str(&raw)?;
        if let (Some(requester), Some(owner)) = (owner_id, metadata.config.owner_id) {
            if requester != owner {
                return Err(ArtifactError::AccessDenied(commis_id.to_string()));
            }
        }
        Ok(metadata)
    }

    /// Read the canonical result text
    pub fn get_result(&self, commis_id: &str) -> ArtifactResult<String> {
        fs::read_to_string(self.commis_dir(commis_id).join("result.txt"))
            .map_err(|_| ArtifactError::NotFound(commis_id.to_string()))
    }

    /// Read any file within a commis directory. Traversal is rejected
    /// both syntactically and after resolution.
    pub fn read_file(&self, commis_id: &str, relative_path: &str) -> ArtifactResult<String> {
        validate_relative(relative_path)?;
        let dir = self.commis_dir(commis_id);
        let path = dir.join(relative_path);

        let resolved = path
            .canonicalize()
            .map_err(|_| ArtifactError::NotFound(format!("{commis_id}/{relative_path}")))?;
        let dir_resolved = dir
            .canonicalize()
            .map_err(|_| ArtifactError::NotFound(commis_id.to_string()))?;
        if !resolved.starts_with(&dir_resolved) {
            return Err(ArtifactError::InvalidPath(relative_path.to_string()));
        }
        Ok(fs::read_to_string(resolved)?)
    }

    /// List commis from the index, newest first
    pub fn list(&self, filter: &ListFilter) -> ArtifactResult<Vec<CommisMetadata>> {
        let mut entries = self.read_index()?;
        entries.retain(|m| {
            filter.owner_id.is_none_or(|owner| m.config.owner_id == Some(owner))
                && filter.status.is_none_or(|s| m.status == s)
                && filter.since.is_none_or(|since| m.created_at >= since)
        });
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        entries.truncate(limit);
        Ok(entries)
    }

    /// Regex search across commis artifacts.
    ///
    /// `file_glob` matches paths relative to each commis directory, so
    /// `*.txt` hits top-level files and `tool_calls/*.txt` hits tool
    /// output. Unreadable files are skipped.
    pub fn search(
        &self,
        pattern: &str,
        file_glob: &str,
        commis_ids: Option<&[String]>,
    ) -> ArtifactResult<Vec<SearchMatch>> {
        let re = regex::Regex::new(pattern)?;
        let glob = globset::GlobBuilder::new(file_glob)
            .literal_separator(true)
            .build()?
            .compile_matcher();

        let mut scope = self.list(&ListFilter {
            limit: 1000,
            ..Default::default()
        })?;
        if let Some(ids) = commis_ids {
            scope.retain(|m| ids.contains(&m.commis_id));
        }

        let mut matches = Vec::new();
        for entry in scope {
            let dir = self.commis_dir(&entry.commis_id);
            for file in ignore::WalkBuilder::new(&dir)
                .standard_filters(false)
                .build()
                .flatten()
            {
                if !file.file_type().is_some_and(|t| t.is_file()) {
                    continue;
                }
                let Ok(rel) = file.path().strip_prefix(&dir) else {
                    continue;
                };
                if !glob.is_match(rel) {
                    continue;
                }
                let Ok(contents) = fs::read_to_string(file.path()) else {
                    continue;
                };
                for (line_idx, line) in contents.lines().enumerate() {
                    if re.is_match(line) {
                        matches.push(SearchMatch {
                            commis_id: entry.commis_id.clone(),
                            file: rel.to_string_lossy().to_string(),
                            line: line_idx + 1,
                            content: line.trim().to_string(),
                        });
                    }
                }
            }
        }
        Ok(matches)
    }
}

/// Reject absolute paths and any `..` segment
fn validate_relative(relative_path: &str) -> ArtifactResult<()> {
    let path = Path::new(relative_path);
    if path.is_absolute() {
        return Err(ArtifactError::InvalidPath(relative_path.to_string()));
    }
    for component in path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArtifactError::InvalidPath(relative_path.to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// `{ISO8601_ts}_{slug}_{6hex}` directory name
fn generate_commis_id(task: &str) -> String {
    let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S");
    let slug = slugify(task, 30);
    let suffix: String = {
        let mut rng = rand::thread_rng();
        (0..6)
            .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
            .collect()
    };
    format!("{timestamp}_{slug}_{suffix}")
}

/// Lowercase kebab-case slug, capped at `max_length`
fn slugify(text: &str, max_length: usize) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_hyphen = true;
    for c in text.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_hyphen = false;
        } else if !last_hyphen {
            slug.push('-');
            last_hyphen = true;
        }
    }
    let slug = slug.trim_matches('-');
    let truncated: String = slug.chars().take(max_length).collect();
    let truncated = truncated.trim_matches('-').to_string();
    if truncated.is_empty() {
        "task".to_string()
    } else {
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, ArtifactStore) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn owned_config(owner_id: i64) -> CommisConfig {
        CommisConfig {
            owner_id: Some(owner_id),
            ..Default::default()
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Calculate X for me!", 30), "calculate-x-for-me");
        assert_eq!(slugify("  weird__under_scores  ", 30), "weird-under-scores");
        assert_eq!(slugify("", 30), "task");
        assert_eq!(slugify("日本語のみ", 30), "task");
        assert!(slugify(&"a very long task description that keeps going".repeat(3), 30).len() <= 30);
    }

    #[test]
    fn test_commis_id_shape() {
        let id = generate_commis_id("Calculate X");
        let parts: Vec<&str> = id.rsplitn(2, '_').collect();
        assert_eq!(parts[0].len(), 6);
        assert!(parts[1].ends_with("calculate-x"));
    }

    #[test]
    fn test_create_start_complete_lifecycle() {
        let (_dir, store) = store();
        let id = store.create("calculate x", &owned_config(1)).unwrap();

        let meta = store.get_metadata(&id, None).unwrap();
        assert_eq!(meta.status, ArtifactStatus::Created);
        assert!(meta.started_at.is_none());

        store.start(&id).unwrap();
        store.save_result(&id, "42").unwrap();
        store.complete(&id, ArtifactStatus::Success, None).unwrap();

        let meta = store.get_metadata(&id, None).unwrap();
        assert_eq!(meta.status, ArtifactStatus::Success);
        assert!(meta.duration_ms.is_some());
        assert_eq!(store.get_result(&id).unwrap(), "42");
    }

    #[test]
    fn test_tool_outputs_are_numbered() {
        let (_dir, store) = store();
        let id = store.create("task", &CommisConfig::default()).unwrap();

        let first = store.save_tool_output(&id, "http_request", "ok", 1).unwrap();
        let second = store.save_tool_output(&id, "get_time", "12:00", 2).unwrap();
        assert_eq!(first, "tool_calls/001_http_request.txt");
        assert_eq!(second, "tool_calls/002_get_time.txt");
        assert_eq!(store.read_file(&id, &first).unwrap(), "ok");
    }

    #[test]
    fn test_thread_jsonl_appends() {
        let (_dir, store) = store();
        let id = store.create("task", &CommisConfig::default()).unwrap();

        store
            .save_message(&id, &serde_json::json!({"role": "user", "content": "hi"}))
            .unwrap();
        store
            .save_message(&id, &serde_json::json!({"role": "assistant", "content": "hello"}))
            .unwrap();

        let raw = store.read_file(&id, "thread.jsonl").unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("assistant"));
    }

    #[test]
    fn test_read_file_rejects_traversal() {
        let (_dir, store) = store();
        let id = store.create("task", &CommisConfig::default()).unwrap();

        let err = store.read_file(&id, "../index.json").unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidPath(_)));
        let err = store.read_file(&id, "tool_calls/../../index.json").unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidPath(_)));
        let err = store.read_file(&id, "/etc/hostname").unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidPath(_)));
    }

    #[test]
    fn test_owner_enforcement() {
        let (_dir, store) = store();
        let id = store.create("task", &owned_config(7)).unwrap();

        assert!(store.get_metadata(&id, Some(7)).is_ok());
        let err = store.get_metadata(&id, Some(8)).unwrap_err();
        assert!(matches!(err, ArtifactError::AccessDenied(_)));
        // Ownerless readers (internal paths) are unrestricted
        assert!(store.get_metadata(&id, None).is_ok());
    }

    #[test]
    fn test_list_filters() {
        let (_dir, store) = store();
        let a = store.create("alpha", &owned_config(1)).unwrap();
        let b = store.create("beta", &owned_config(2)).unwrap();
        store.start(&a).unwrap();
        store.complete(&a, ArtifactStatus::Success, None).unwrap();

        let all = store.list(&ListFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let owner1 = store
            .list(&ListFilter {
                owner_id: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(owner1.len(), 1);
        assert_eq!(owner1[0].commis_id, a);

        let succeeded = store
            .list(&ListFilter {
                status: Some(ArtifactStatus::Success),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(succeeded.len(), 1);

        let none = store
            .list(&ListFilter {
                owner_id: Some(2),
                status: Some(ArtifactStatus::Success),
                ..Default::default()
            })
            .unwrap();
        assert!(none.is_empty());
        let _ = b;
    }

    #[test]
    fn test_search_scopes_and_globs() {
        let (_dir, store) = store();
        let a = store.create("alpha", &CommisConfig::default()).unwrap();
        let b = store.create("beta", &CommisConfig::default()).unwrap();
        store.save_result(&a, "the answer is 42").unwrap();
        store.save_result(&b, "nothing here").unwrap();
        store.save_tool_output(&a, "calc", "answer: 42", 1).unwrap();

        let hits = store.search("answer", "*.txt", None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].commis_id, a);
        assert_eq!(hits[0].file, "result.txt");
        assert_eq!(hits[0].line, 1);

        let tool_hits = store.search("answer", "tool_calls/*.txt", None).unwrap();
        assert_eq!(tool_hits.len(), 1);
        assert_eq!(tool_hits[0].file, "tool_calls/001_calc.txt");

        let scoped = store
            .search("answer", "*.txt", Some(&[b.clone()]))
            .unwrap();
        assert!(scoped.is_empty());
    }

    #[test]
    fn test_summary_mirrors_to_index() {
        let (_dir, store) = store();
        let id = store.create("task", &CommisConfig::default()).unwrap();
        store
            .update_summary(&id, "did the thing", serde_json::json!({"source": "result_head"}))
            .unwrap();

        let entries = store.list(&ListFilter::default()).unwrap();
        assert_eq!(entries[0].summary.as_deref(), Some("did the thing"));
        let meta = store.get_metadata(&id, None).unwrap();
        assert_eq!(meta.summary.as_deref(), Some("did the thing"));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_slug_is_filesystem_safe(task in ".{0,120}") {
                let slug = slugify(&task, 30);
                prop_assert!(slug.chars().count() <= 30);
                prop_assert!(!slug.is_empty());
                prop_assert!(slug.chars().all(|c| c.is_ascii_lowercase()
                    || c.is_ascii_digit()
                    || c == '-'));
                prop_assert!(!slug.starts_with('-'));
                prop_assert!(!slug.ends_with('-'));
            }

            #[test]
            fn prop_parent_segments_always_rejected(
                prefix in "[a-z]{0,8}",
                suffix in "[a-z]{0,8}"
            ) {
                let path = format!("{prefix}/../{suffix}");
                prop_assert!(validate_relative(&path).is_err());
            }
        }
    }

    #[test]
    fn test_corrupt_index_recovers() {
        let (_dir, store) = store();
        store.create("task", &CommisConfig::default()).unwrap();
        fs::write(store.index_path(), "{not json").unwrap();

        // Next write rebuilds rather than failing
        let id = store.create("another", &CommisConfig::default()).unwrap();
        let entries = store.list(&ListFilter::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].commis_id, id);
    }
}
