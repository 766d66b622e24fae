//! Keel persistence: a local SQLite journal of reconcile runs.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use keel_core::{ChangeSet, Instance};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One reconcile run as recorded locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub instance: String,
    pub namespace: String,
    pub source: String,
    pub version: String,
    /// Seconds since epoch.
    pub ts: i64,
    /// `ok`, or the failed step and error.
    pub outcome: String,
    pub changes: ChangeSet,
}

impl RunRecord {
    pub fn new(instance: &Instance, source: &str, version: &str, outcome: impl Into<String>, changes: ChangeSet) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            instance: instance.name.clone(),
            namespace: instance.namespace.clone(),
            source: source.to_string(),
            version: version.to_string(),
            ts: now_ts(),
            outcome: outcome.into(),
            changes,
        }
    }
}

pub trait Journal {
    fn record(&self, rec: &RunRecord) -> Result<()>;
    /// Newest first.
    fn history(&self, instance: &Instance, limit: Option<usize>) -> Result<Vec<RunRecord>>;
}

/// SQLite-backed journal. Simple, synchronous; written once per run.
pub struct SqliteJournal {
    db: std::sync::Mutex<rusqlite::Connection>,
    keep: usize,
}

impl SqliteJournal {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        let keep = std::env::var("KEEL_HISTORY_KEEP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(10);
        Self::open(&path, keep)
    }

    pub fn open(path: &str, keep: usize) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                run_id    TEXT PRIMARY KEY,
                instance  TEXT NOT NULL,
                namespace TEXT NOT NULL,
                source    TEXT NOT NULL,
                version   TEXT NOT NULL,
                ts        INTEGER NOT NULL,
                outcome   TEXT NOT NULL,
                changes   BLOB NOT NULL
            )",
            [],
        )
        .context("creating runs table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_runs_instance_ts ON runs(namespace, instance, ts DESC)", []).ok();
        let me = Self { db: std::sync::Mutex::new(db), keep: keep.max(1) };
        histogram!("journal_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }
}

impl Journal for SqliteJournal {
    fn record(&self, rec: &RunRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let changes = encode_changes(&rec.changes)?;
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO runs(run_id, instance, namespace, source, version, ts, outcome, changes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            (&rec.run_id, &rec.instance, &rec.namespace, &rec.source, &rec.version, rec.ts, &rec.outcome, changes),
        )?;
        // Keep the latest `keep` runs per instance
        tx.execute(
            "DELETE FROM runs
             WHERE namespace = ?1 AND instance = ?2
               AND rowid NOT IN (
                   SELECT rowid FROM runs WHERE namespace = ?1 AND instance = ?2
                   ORDER BY ts DESC, rowid DESC LIMIT ?3
               )",
            (&rec.namespace, &rec.instance, self.keep as i64),
        )?;
        tx.commit()?;
        histogram!("journal_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("journal_put_total", 1u64);
        debug!(run_id = %rec.run_id, instance = %rec.instance, "journal entry recorded");
        Ok(())
    }

    fn history(&self, instance: &Instance, limit: Option<usize>) -> Result<Vec<RunRecord>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(self.keep);
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT run_id, source, version, ts, outcome, changes FROM runs
             WHERE namespace = ?1 AND instance = ?2 ORDER BY ts DESC, rowid DESC LIMIT ?3",
        )?;
        let mut rows = stmt.query((&instance.namespace, &instance.name, cap as i64))?;
        let mut out: Vec<RunRecord> = Vec::new();
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(5)?;
            let changes = decode_changes(&blob)?;
            out.push(RunRecord {
                run_id: row.get(0)?,
                instance: instance.name.clone(),
                namespace: instance.namespace.clone(),
                source: row.get(1)?,
                version: row.get(2)?,
                ts: row.get(3)?,
                outcome: row.get(4)?,
                changes,
            });
        }
        histogram!("journal_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

/// `~/.keel/keel.db`, or `./keel.db` without a home directory.
fn default_db_path() -> String {
    let dir = std::env::var_os("HOME").map(|h| std::path::PathBuf::from(h).join(".keel"));
    match dir {
        Some(dir) if std::fs::create_dir_all(&dir).is_ok() => dir.join("keel.db").to_string_lossy().into_owned(),
        _ => "keel.db".to_string(),
    }
}

/// Seconds since the epoch.
pub fn now_ts() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or_default()
}

/// JSON change set, zstd-framed when the `zstd` feature is on (`KEEL_ZSTD_LEVEL`, default 3).
fn encode_changes(changes: &ChangeSet) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(changes).context("encoding change set")?;
    #[cfg(feature = "zstd")]
    {
        let level: i32 = std::env::var("KEEL_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(json.as_slice(), level).context("compressing change set");
    }
    #[allow(unreachable_code)]
    Ok(json)
}

/// Plain and zstd-framed rows both decode.
fn decode_changes(blob: &[u8]) -> Result<ChangeSet> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(plain) = zstd::decode_all(blob) {
            return serde_json::from_slice(&plain).context("decoding change set");
        }
    }
    serde_json::from_slice(blob).context("decoding change set")
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{Action, ObjectId};

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("keel-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn changes(n: usize) -> ChangeSet {
        let mut cs = ChangeSet::new();
        cs.add(ObjectId::new("", "v1", "ConfigMap", Some("web"), format!("cfg-{}", n)), Action::Created);
        cs
    }

    #[test]
    fn record_history_rotate() {
        let path = temp_db();
        let j = SqliteJournal::open(&path, 3).unwrap();
        let api = Instance::new("api", "web");
        for i in 0..5 {
            let mut rec = RunRecord::new(&api, "./module", &format!("1.0.{}", i), "ok", changes(i));
            rec.ts = i as i64;
            j.record(&rec).unwrap();
        }
        j.record(&RunRecord::new(&Instance::new("db", "web"), "./db", "1.0.0", "ok", changes(9))).unwrap();

        let rows = j.history(&api, None).unwrap();
        let versions: Vec<&str> = rows.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["1.0.4", "1.0.3", "1.0.2"]);
        assert_eq!(rows[0].changes, changes(4));
        assert_eq!(j.history(&Instance::new("db", "web"), Some(5)).unwrap().len(), 1);
    }

    #[test]
    fn change_sets_survive_encoding() {
        let cs = changes(7);
        assert_eq!(decode_changes(&encode_changes(&cs).unwrap()).unwrap(), cs);
        assert_eq!(decode_changes(serde_json::to_string(&cs).unwrap().as_bytes()).unwrap(), cs);
        assert!(decode_changes(b"not json").is_err());
    }

    #[test]
    fn run_ids_are_unique() {
        let api = Instance::new("api", "web");
        let a = RunRecord::new(&api, "m", "v", "ok", ChangeSet::new());
        let b = RunRecord::new(&api, "m", "v", "ok", ChangeSet::new());
        assert_ne!(a.run_id, b.run_id);
        assert!(uuid::Uuid::parse_str(&a.run_id).is_ok());
    }
}
