use crate::error::EngineError;
use crate::publisher::SnapshotSink;
use crate::snapshot::{MetricSnapshot, SnapshotKind};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Writes each snapshot kind to its own JSON file under one directory.
///
/// Files are replaced atomically through a `.json.tmp` sibling. Kinds that
/// require a backup have the previous file copied to `.json.bak` first.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, kind: SnapshotKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    fn write(&self, kind: SnapshotKind, snapshot: &MetricSnapshot, requires_backup: bool) -> Result<()> {
        let path = self.path_for(kind);
        let json = serde_json::to_string_pretty(snapshot).context("encode snapshot")?;

        if requires_backup && path.exists() {
            let backup = path.with_extension("json.bak");
            fs::copy(&path, &backup).context("write backup copy")?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).context("write snapshot tmp")?;
        fs::rename(&tmp, &path).context("rename snapshot")?;
        Ok(())
    }
}

impl SnapshotSink for JsonFileSink {
    fn persist(
        &self,
        kind: SnapshotKind,
        snapshot: &MetricSnapshot,
        requires_backup: bool,
    ) -> Result<(), EngineError> {
        self.write(kind, snapshot, requires_backup)
            .map_err(|err| EngineError::PersistenceFailure {
                kind: kind.to_string(),
                reason: format!("{err:#}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::LineState;
    use crate::snapshot::{MeterTotals, SnapshotBody};
    use chrono::Utc;
    use tempfile::TempDir;

    fn meters(impulses: u64) -> MetricSnapshot {
        MetricSnapshot::new(
            SnapshotKind::Meters,
            Utc::now(),
            Vec::new(),
            Vec::new(),
            SnapshotBody::Meters(MeterTotals {
                meters: Vec::new(),
                impulses,
                rotations: impulses as f64 / 8.0,
                cycles_closed: 0,
                state: LineState::Idle,
            }),
        )
    }

    fn read_impulses(path: &Path) -> u64 {
        let raw = fs::read_to_string(path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        value["body"]["impulses"].as_u64().unwrap()
    }

    #[test]
    fn writes_replace_file_without_leaving_tmp() {
        let dir = TempDir::new().unwrap();
        let sink = JsonFileSink::new(dir.path()).unwrap();
        sink.persist(SnapshotKind::Meters, &meters(8), false).unwrap();
        sink.persist(SnapshotKind::Meters, &meters(16), false).unwrap();

        let path = dir.path().join("meters.json");
        assert_eq!(read_impulses(&path), 16);
        assert!(!dir.path().join("meters.json.tmp").exists());
        assert!(!dir.path().join("meters.json.bak").exists());
    }

    #[test]
    fn backup_holds_previous_contents() {
        let dir = TempDir::new().unwrap();
        let sink = JsonFileSink::new(dir.path()).unwrap();
        let first = meters(8);
        let second = meters(24);
        sink.persist(SnapshotKind::Oee, &first, true).unwrap();
        assert!(!dir.path().join("oee.json.bak").exists());

        sink.persist(SnapshotKind::Oee, &second, true).unwrap();
        assert_eq!(read_impulses(&dir.path().join("oee.json")), 24);
        assert_eq!(read_impulses(&dir.path().join("oee.json.bak")), 8);
    }

    #[test]
    fn missing_directory_is_reported_as_persistence_failure() {
        let dir = TempDir::new().unwrap();
        let sink = JsonFileSink::new(dir.path().join("snapshots")).unwrap();
        fs::remove_dir_all(sink.dir()).unwrap();

        let err = sink
            .persist(SnapshotKind::Flow, &meters(1), false)
            .unwrap_err();
        assert!(matches!(err, EngineError::PersistenceFailure { ref kind, .. } if kind == "flow"));
    }
}
