//! Persistence of case bundles, report versions and processing status.

use crate::error::{StoreError, StoreResult};
use crate::models::{AnalysisStatus, CapabilityFailure, InitialAnalysisBundle};
use crate::session::ReportVersion;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

const BUNDLE_FILE: &str = "bundle.json";
const STATUS_FILE: &str = "status.json";
const REPORT_PREFIX: &str = "report_v";

/// Durable processing status of a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: AnalysisStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capability_failures: Vec<CapabilityFailure>,
}

impl StatusRecord {
    pub fn new(status: AnalysisStatus) -> Self {
        Self {
            status,
            updated_at: Utc::now(),
            error: None,
            capability_failures: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(AnalysisStatus::Failed)
        }
    }

    pub fn with_failures(mut self, failures: Vec<CapabilityFailure>) -> Self {
        self.capability_failures = failures;
        self
    }
}

/// Storage for everything a case produces.
///
/// Report versions are append-only: saving a version that already exists
/// is an error, and prior versions are never removed.
#[async_trait]
pub trait CaseStore: Send + Sync {
    async fn save_bundle(&self, case_id: &str, bundle: &InitialAnalysisBundle) -> StoreResult<()>;

    async fn load_bundle(&self, case_id: &str) -> StoreResult<InitialAnalysisBundle>;

    async fn save_report(&self, case_id: &str, version: &ReportVersion) -> StoreResult<()>;

    /// The highest stored report version, if any.
    async fn latest_report(&self, case_id: &str) -> StoreResult<Option<ReportVersion>>;

    /// Record a status change. A terminal status may only be followed by a
    /// new `Processing` run.
    async fn set_status(&self, case_id: &str, record: StatusRecord) -> StoreResult<()>;

    async fn status(&self, case_id: &str) -> StoreResult<Option<StatusRecord>>;
}

fn check_transition(
    case_id: &str,
    current: Option<&StatusRecord>,
    next: AnalysisStatus,
) -> StoreResult<()> {
    match current {
        Some(record) if record.status.is_terminal() && next != AnalysisStatus::Processing => {
            Err(StoreError::TerminalStatus {
                case_id: case_id.to_string(),
                status: record.status,
            })
        }
        _ => Ok(()),
    }
}

fn check_case_id(case_id: &str) -> StoreResult<()> {
    let valid = !case_id.is_empty()
        && case_id != "."
        && case_id != ".."
        && case_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidCaseId(case_id.to_string()))
    }
}

fn report_file_name(version: u32) -> String {
    format!("{}{:04}.json", REPORT_PREFIX, version)
}

fn parse_report_version(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix(REPORT_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// JSON files under `<root>/<case_id>/`.
#[derive(Debug, Clone)]
pub struct FileCaseStore {
    root: PathBuf,
}

impl FileCaseStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn case_dir(&self, case_id: &str) -> StoreResult<PathBuf> {
        check_case_id(case_id)?;
        Ok(self.root.join(case_id))
    }

    async fn ensure_case_dir(&self, case_id: &str) -> StoreResult<PathBuf> {
        let dir = self.case_dir(case_id)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CaseStore for FileCaseStore {
    async fn save_bundle(&self, case_id: &str, bundle: &InitialAnalysisBundle) -> StoreResult<()> {
        let path = self.ensure_case_dir(case_id).await?.join(BUNDLE_FILE);
        tokio::fs::write(&path, serde_json::to_vec_pretty(bundle)?).await?;
        debug!(case_id, path = %path.display(), "Saved bundle");
        Ok(())
    }

    async fn load_bundle(&self, case_id: &str) -> StoreResult<InitialAnalysisBundle> {
        let path = self.case_dir(case_id)?.join(BUNDLE_FILE);
        Self::read_json(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(case_id.to_string()))
    }

    async fn save_report(&self, case_id: &str, version: &ReportVersion) -> StoreResult<()> {
        let path = self
            .ensure_case_dir(case_id)
            .await?
            .join(report_file_name(version.version));

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(&serde_json::to_vec_pretty(version)?).await?;
        file.flush().await?;

        debug!(case_id, version = version.version, "Saved report version");
        Ok(())
    }

    async fn latest_report(&self, case_id: &str) -> StoreResult<Option<ReportVersion>> {
        let dir = self.case_dir(case_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut latest: Option<u32> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(version) = name.to_str().and_then(parse_report_version) {
                latest = Some(latest.map_or(version, |v| v.max(version)));
            }
        }

        match latest {
            Some(version) => Self::read_json(&dir.join(report_file_name(version))).await,
            None => Ok(None),
        }
    }

    async fn set_status(&self, case_id: &str, record: StatusRecord) -> StoreResult<()> {
        let path = self.ensure_case_dir(case_id).await?.join(STATUS_FILE);
        let current: Option<StatusRecord> = Self::read_json(&path).await?;
        check_transition(case_id, current.as_ref(), record.status)?;

        tokio::fs::write(&path, serde_json::to_vec_pretty(&record)?).await?;
        debug!(case_id, status = %record.status, "Status updated");
        Ok(())
    }

    async fn status(&self, case_id: &str) -> StoreResult<Option<StatusRecord>> {
        let path = self.case_dir(case_id)?.join(STATUS_FILE);
        Self::read_json(&path).await
    }
}

/// In-memory store for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryCaseStore {
    cases: std::sync::Mutex<std::collections::HashMap<String, MemoryCase>>,
    reject_reports: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
#[derive(Debug, Default, Clone)]
struct MemoryCase {
    bundle: Option<InitialAnalysisBundle>,
    reports: Vec<ReportVersion>,
    statuses: Vec<StatusRecord>,
}

#[cfg(test)]
impl MemoryCaseStore {
    /// Make every later `save_report` fail.
    pub fn reject_report_saves(&self) {
        self.reject_reports
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Every status recorded for a case, oldest first.
    pub fn status_history(&self, case_id: &str) -> Vec<AnalysisStatus> {
        self.cases
            .lock()
            .unwrap()
            .get(case_id)
            .map(|c| c.statuses.iter().map(|s| s.status).collect())
            .unwrap_or_default()
    }

    pub fn report_count(&self, case_id: &str) -> usize {
        self.cases
            .lock()
            .unwrap()
            .get(case_id)
            .map(|c| c.reports.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn save_bundle(&self, case_id: &str, bundle: &InitialAnalysisBundle) -> StoreResult<()> {
        let mut cases = self.cases.lock().unwrap();
        cases.entry(case_id.to_string()).or_default().bundle = Some(bundle.clone());
        Ok(())
    }

    async fn load_bundle(&self, case_id: &str) -> StoreResult<InitialAnalysisBundle> {
        self.cases
            .lock()
            .unwrap()
            .get(case_id)
            .and_then(|c| c.bundle.clone())
            .ok_or_else(|| StoreError::NotFound(case_id.to_string()))
    }

    async fn save_report(&self, case_id: &str, version: &ReportVersion) -> StoreResult<()> {
        if self.reject_reports.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "report storage is read-only",
            )));
        }
        let mut cases = self.cases.lock().unwrap();
        let case = cases.entry(case_id.to_string()).or_default();
        if case.reports.iter().any(|r| r.version == version.version) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("report version {} already exists", version.version),
            )));
        }
        case.reports.push(version.clone());
        Ok(())
    }

    async fn latest_report(&self, case_id: &str) -> StoreResult<Option<ReportVersion>> {
        Ok(self
            .cases
            .lock()
            .unwrap()
            .get(case_id)
            .and_then(|c| c.reports.iter().max_by_key(|r| r.version).cloned()))
    }

    async fn set_status(&self, case_id: &str, record: StatusRecord) -> StoreResult<()> {
        let mut cases = self.cases.lock().unwrap();
        let case = cases.entry(case_id.to_string()).or_default();
        check_transition(case_id, case.statuses.last(), record.status)?;
        case.statuses.push(record);
        Ok(())
    }

    async fn status(&self, case_id: &str) -> StoreResult<Option<StatusRecord>> {
        Ok(self
            .cases
            .lock()
            .unwrap()
            .get(case_id)
            .and_then(|c| c.statuses.last().cloned()))
    }
}
