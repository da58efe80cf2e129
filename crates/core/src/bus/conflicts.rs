//! Conflict records: persistence, listing, resolution.

use chrono::Utc;
use tracing::{debug, info};

use super::{json_files, read_json, write_json_atomic, Bus};
use crate::conflict::ConflictDetector;
use crate::errors::BusError;
use crate::models::{Conflict, Diff, MergeStrategy};

impl Bus {
    fn conflict_path(&self, id: &str) -> std::path::PathBuf {
        self.conflicts_dir().join(format!("{}.json", id))
    }

    /// Persist `conflict` unless a record with its id already exists.
    ///
    /// Returns `true` when a new record was written. Existing records keep
    /// their resolution state.
    pub fn record_conflict(&self, conflict: &Conflict) -> Result<bool, BusError> {
        self.ensure_initialized()?;
        let _lock = self.lock_record(&conflict.id)?;
        let path = self.conflict_path(&conflict.id);
        if path.is_file() {
            return Ok(false);
        }
        write_json_atomic(&path, conflict)?;
        debug!(conflict_id = %conflict.id, kind = %conflict.conflict_type, "conflict recorded");
        Ok(true)
    }

    pub fn get_conflict(&self, id: &str) -> Result<Option<Conflict>, BusError> {
        let path = self.conflict_path(id);
        if !path.is_file() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// All conflicts ordered by detection time, optionally filtered by
    /// their resolved flag.
    pub fn list_conflicts(&self, resolved: Option<bool>) -> Result<Vec<Conflict>, BusError> {
        let mut conflicts = Vec::new();
        for path in json_files(&self.conflicts_dir())? {
            let conflict: Conflict = read_json(&path)?;
            if resolved.map_or(true, |want| conflict.resolved == want) {
                conflicts.push(conflict);
            }
        }
        conflicts.sort_by(|a, b| a.detected_at.cmp(&b.detected_at).then(a.id.cmp(&b.id)));
        Ok(conflicts)
    }

    pub fn unresolved_conflict_count(&self) -> Result<usize, BusError> {
        Ok(self.list_conflicts(Some(false))?.len())
    }

    /// Mark a conflict resolved with the chosen strategy.
    pub fn resolve_conflict(
        &self,
        id: &str,
        strategy: MergeStrategy,
        resolution: &str,
    ) -> Result<Conflict, BusError> {
        self.ensure_initialized()?;
        let _lock = self.lock_record(id)?;
        let path = self.conflict_path(id);
        if !path.is_file() {
            return Err(BusError::ConflictNotFound(id.to_string()));
        }

        let mut conflict: Conflict = read_json(&path)?;
        conflict.resolved = true;
        conflict.suggested_strategy = strategy;
        conflict.resolution = Some(resolution.to_string());
        conflict.resolved_at = Some(Utc::now());
        write_json_atomic(&path, &conflict)?;

        info!(conflict_id = %id, %strategy, "conflict resolved");
        Ok(conflict)
    }

    /// Pairwise scan over `diffs` (pending and verified when `None`), persisting
    /// every newly found conflict. Returns all conflicts found in this scan.
    pub fn detect_conflicts(
        &self,
        detector: &ConflictDetector,
        diffs: Option<Vec<Diff>>,
    ) -> Result<Vec<Conflict>, BusError> {
        let diffs = match diffs {
            Some(diffs) => diffs,
            None => {
                let mut all = self.list_pending()?;
                all.extend(self.list_verified()?);
                all
            }
        };

        let mut found = Vec::new();
        for analysis in detector.analyze_all(&diffs) {
            self.record_conflict(&analysis.conflict)?;
            found.push(analysis.conflict);
        }
        Ok(found)
    }
}
