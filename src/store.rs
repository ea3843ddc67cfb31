//! Run ledger: every scored training run, shared by every search process.
//!
//! The ledger is the only shared state between processes. Each search round
//! re-reads it in full, so a run appended by another process shows up in the
//! next surrogate fit without any coordination.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::hypers::FlatRecord;

/// One persisted training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub agent: String,
    /// Network family; history is partitioned by it
    pub net: String,
    pub flat: FlatRecord,
    pub score: f64,
    #[serde(default)]
    pub advantages: Vec<f64>,
    #[serde(default)]
    pub uniques: Vec<f64>,
    #[serde(default)]
    pub prices: Vec<f64>,
    #[serde(default)]
    pub signals: Vec<f64>,
}

/// Everything about a run except its identity.
#[derive(Clone, Debug, Default)]
pub struct NewRun {
    pub agent: String,
    pub net: String,
    pub flat: FlatRecord,
    pub score: f64,
    pub advantages: Vec<f64>,
    pub uniques: Vec<f64>,
    pub prices: Vec<f64>,
    pub signals: Vec<f64>,
}

impl NewRun {
    fn into_run(self) -> Run {
        Run {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            agent: self.agent,
            net: self.net,
            flat: self.flat,
            score: self.score,
            advantages: self.advantages,
            uniques: self.uniques,
            prices: self.prices,
            signals: self.signals,
        }
    }
}

pub trait RunStore: Send + Sync {
    /// Appends a run and returns its generated id.
    fn insert(&self, run: NewRun) -> StoreResult<String>;

    /// All runs for one network family, in insertion order.
    fn select_all(&self, net: &str) -> StoreResult<Vec<Run>>;

    fn select_by_id(&self, id: &str) -> StoreResult<Run>;
}

// ---------------------------------------------------------------------------
// JsonlRunStore
// ---------------------------------------------------------------------------

/// Newline-delimited JSON file, one run per line.
///
/// Each insert is a single `write_all` on a file opened in append mode, so
/// concurrent writers never interleave within a line. Readers skip lines
/// that fail to parse.
#[derive(Clone, Debug)]
pub struct JsonlRunStore {
    path: PathBuf,
}

impl JsonlRunStore {
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every parseable run in the file, regardless of family.
    pub fn load(&self) -> StoreResult<Vec<Run>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        // raw bytes: a torn multi-byte write must not fail the whole read
        for (lineno, line) in BufReader::new(file).split(b'\n').enumerate() {
            let line = line?;
            if line.trim_ascii().is_empty() {
                continue;
            }
            match serde_json::from_slice::<Run>(&line) {
                Ok(run) => runs.push(run),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "skipping unreadable run"
                ),
            }
        }
        Ok(runs)
    }
}

impl RunStore for JsonlRunStore {
    fn insert(&self, run: NewRun) -> StoreResult<String> {
        let run = run.into_run();
        let mut line = serde_json::to_string(&run)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(run.id)
    }

    fn select_all(&self, net: &str) -> StoreResult<Vec<Run>> {
        Ok(self.load()?.into_iter().filter(|r| r.net == net).collect())
    }

    fn select_by_id(&self, id: &str) -> StoreResult<Run> {
        self.load()?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }
}

// ---------------------------------------------------------------------------
// MemoryRunStore
// ---------------------------------------------------------------------------

/// In-process ledger backed by a `Vec<Run>`.
#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<Vec<Run>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Run>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RunStore for MemoryRunStore {
    fn insert(&self, run: NewRun) -> StoreResult<String> {
        let run = run.into_run();
        let id = run.id.clone();
        self.lock().push(run);
        Ok(id)
    }

    fn select_all(&self, net: &str) -> StoreResult<Vec<Run>> {
        Ok(self.lock().iter().filter(|r| r.net == net).cloned().collect())
    }

    fn select_by_id(&self, id: &str) -> StoreResult<Run> {
        self.lock()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Writes runs as CSV: `id, created_at, agent, net, score`, then the union of
/// flat keys across all runs, sorted. Missing keys are empty cells.
pub fn export_csv<W: Write>(runs: &[Run], writer: W) -> StoreResult<()> {
    let keys: BTreeSet<&str> = runs
        .iter()
        .flat_map(|r| r.flat.keys().map(String::as_str))
        .collect();

    let mut wtr = csv::Writer::from_writer(writer);
    let mut header = vec!["id", "created_at", "agent", "net", "score"];
    header.extend(keys.iter().copied());
    wtr.write_record(&header)?;

    for run in runs {
        let mut row = vec![
            run.id.clone(),
            run.created_at.to_rfc3339(),
            run.agent.clone(),
            run.net.clone(),
            run.score.to_string(),
        ];
        for key in &keys {
            row.push(match run.flat.get(*key) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
            });
        }
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_run(net: &str, score: f64) -> NewRun {
        let mut flat = FlatRecord::new();
        flat.insert("net.width".into(), json!(6));
        flat.insert("step_optimizer.type".into(), json!("adam"));
        NewRun {
            agent: "ppo_agent".into(),
            net: net.into(),
            flat,
            score,
            ..NewRun::default()
        }
    }

    #[test]
    fn jsonl_insert_and_select() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlRunStore::open(dir.path().join("runs.jsonl")).unwrap();
        assert!(store.select_all("conv2d").unwrap().is_empty());

        let a = store.insert(new_run("conv2d", 1.5)).unwrap();
        store.insert(new_run("lstm", -2.0)).unwrap();
        store.insert(new_run("conv2d", 3.0)).unwrap();

        let conv = store.select_all("conv2d").unwrap();
        assert_eq!(conv.len(), 2);
        assert_eq!(conv[0].id, a);
        assert_eq!(conv[1].score, 3.0);

        let run = store.select_by_id(&a).unwrap();
        assert_eq!(run.flat["step_optimizer.type"], json!("adam"));
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store = MemoryRunStore::new();
        let err = store.select_by_id("missing").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn torn_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let store = JsonlRunStore::open(&path).unwrap();
        store.insert(new_run("conv2d", 1.0)).unwrap();

        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"id\":\"half-writ").unwrap();
        drop(f);

        assert_eq!(store.select_all("conv2d").unwrap().len(), 1);
    }

    #[test]
    fn non_utf8_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let store = JsonlRunStore::open(&path).unwrap();
        store.insert(new_run("conv2d", 1.0)).unwrap();

        // truncated in the middle of a three-byte character
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"id\":\"\xe2\x82\n").unwrap();
        drop(f);
        store.insert(new_run("conv2d", 2.0)).unwrap();

        let runs = store.select_all("conv2d").unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].score, 2.0);
    }

    #[test]
    fn memory_store_filters_by_net() {
        let store = MemoryRunStore::new();
        store.insert(new_run("conv2d", 1.0)).unwrap();
        store.insert(new_run("lstm", 2.0)).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.select_all("lstm").unwrap().len(), 1);
    }

    #[test]
    fn csv_export_unions_flat_keys() {
        let mut a = new_run("conv2d", 1.0).into_run();
        a.flat.insert("gae_lambda".into(), Value::Null);
        let mut b = new_run("conv2d", 2.0).into_run();
        b.flat.insert("baseline_mode".into(), json!(false));

        let mut out = Vec::new();
        export_csv(&[a, b], &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "id,created_at,agent,net,score,baseline_mode,gae_lambda,net.width,step_optimizer.type"
        );
        let first: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(&first[4..], &["1", "", "", "6", "adam"]);
        let second: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(&second[4..], &["2", "false", "", "6", "adam"]);
    }
}
