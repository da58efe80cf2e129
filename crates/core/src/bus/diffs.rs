//! Diff submission, lookup, listing and status transitions.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{json_files, read_json, write_json_atomic, Bus, RecordLock};
use crate::errors::BusError;
use crate::models::{CausalChain, Diff, DiffStatus, Partition, VerificationResult};

/// Optional payload recorded alongside a status change.
#[derive(Debug, Clone, Default)]
pub struct TransitionPayload {
    pub verification: Option<VerificationResult>,
    pub error: Option<String>,
    /// Replaces the stored chain when set.
    pub causal_chain: Option<CausalChain>,
    /// Refuse the transition unless the stored version still matches.
    pub expected_version: Option<u64>,
}

impl TransitionPayload {
    pub fn verified(result: VerificationResult) -> Self {
        Self {
            verification: Some(result),
            ..Self::default()
        }
    }

    pub fn rejected(result: VerificationResult, error: impl Into<String>) -> Self {
        Self {
            verification: Some(result),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_causal_chain(mut self, chain: CausalChain) -> Self {
        self.causal_chain = Some(chain);
        self
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// A diff this handle moved to `verifying`.
///
/// The claim lock is held until the value is dropped. Other processes
/// treat a `verifying` record whose claim lock is free as abandoned.
#[derive(Debug)]
pub struct Claim {
    pub diff: Diff,
    _lock: RecordLock,
}

impl Bus {
    /// Store a diff in the pending partition and return its id.
    ///
    /// Resubmitting identical content yields the same id. A pending record is
    /// overwritten; a record that already left pending is left untouched.
    pub fn submit(&self, diff: Diff) -> Result<String, BusError> {
        self.ensure_initialized()?;
        let _lock = self.lock_record(&diff.id)?;

        if let Some((partition, _)) = self.locate(&diff.id) {
            if partition != Partition::Pending {
                debug!(
                    diff_id = %diff.id,
                    %partition,
                    "resubmission ignored, diff already processed"
                );
                return Ok(diff.id);
            }
        }

        let mut diff = diff;
        diff.status = DiffStatus::Pending;
        write_json_atomic(&self.diff_path(Partition::Pending, &diff.id), &diff)?;
        info!(
            diff_id = %diff.id,
            work_id = %diff.work_id,
            producer = %diff.producer_id,
            "diff submitted"
        );
        Ok(diff.id)
    }

    /// Parse `patch` and submit it.
    pub fn submit_patch(
        &self,
        work_id: &str,
        producer_id: &str,
        patch: &str,
        description: &str,
        causal_chain: Option<CausalChain>,
    ) -> Result<String, BusError> {
        let mut diff = Diff::from_patch(work_id, producer_id, patch, description);
        if let Some(mut chain) = causal_chain {
            chain.diff_id = diff.id.clone();
            diff = diff.with_causal_chain(chain);
        }
        self.submit(diff)
    }

    /// Find a diff in pending, verified, rejected, then merged.
    pub fn get(&self, id: &str) -> Result<Option<Diff>, BusError> {
        match self.locate(id) {
            Some((_, path)) => read_json(&path).map(Some),
            None => Ok(None),
        }
    }

    /// Every record stored in `partition`.
    ///
    /// Pending is ordered by submission time, verified by verification time,
    /// the rest by submission time.
    pub fn list(&self, partition: Partition) -> Result<Vec<Diff>, BusError> {
        self.ensure_initialized()?;
        let mut diffs = Vec::new();
        for path in json_files(&self.partition_dir(partition))? {
            match read_json::<Diff>(&path) {
                Ok(diff) => diffs.push(diff),
                // A record renamed away between listing and reading.
                Err(BusError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        match partition {
            Partition::Verified => diffs.sort_by(|a, b| {
                a.verified_at
                    .cmp(&b.verified_at)
                    .then(a.submitted_at.cmp(&b.submitted_at))
                    .then(a.id.cmp(&b.id))
            }),
            _ => diffs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id))),
        }
        Ok(diffs)
    }

    pub fn list_pending(&self) -> Result<Vec<Diff>, BusError> {
        Ok(self
            .list(Partition::Pending)?
            .into_iter()
            .filter(|d| d.status == DiffStatus::Pending)
            .collect())
    }

    /// Verified diffs eligible for merge. `Conflicted` records share the
    /// partition but are excluded.
    pub fn list_verified(&self) -> Result<Vec<Diff>, BusError> {
        Ok(self
            .list(Partition::Verified)?
            .into_iter()
            .filter(|d| d.status == DiffStatus::Verified)
            .collect())
    }

    /// Change a diff's status, relocating it to the matching partition.
    ///
    /// The stored status must be one of `from`, the move must be an edge of
    /// [`DiffStatus::can_become`], and when the payload names a version the
    /// stored record must still carry it. Any mismatch is
    /// [`BusError::StaleTransition`] and leaves the record untouched.
    ///
    /// Under the record lock: the updated record is first written in place
    /// (temp file + rename), then renamed into the target partition. A crash
    /// between the two renames leaves a record whose status disagrees with
    /// its directory, which [`Bus::open`] repairs.
    pub fn transition(
        &self,
        id: &str,
        from: &[DiffStatus],
        status: DiffStatus,
        payload: TransitionPayload,
    ) -> Result<Diff, BusError> {
        self.ensure_initialized()?;
        let _lock = self.lock_record(id)?;

        let (current, current_path) = self
            .locate(id)
            .ok_or_else(|| BusError::DiffNotFound(id.to_string()))?;
        let mut diff: Diff = read_json(&current_path)?;
        let previous = diff.status;

        if !from.contains(&previous) {
            let expected: Vec<String> = from.iter().map(ToString::to_string).collect();
            return Err(BusError::StaleTransition {
                id: id.to_string(),
                expected: expected.join("|"),
                actual: previous.to_string(),
            });
        }
        if let Some(version) = payload.expected_version {
            if diff.version != version {
                return Err(BusError::StaleTransition {
                    id: id.to_string(),
                    expected: format!("version {}", version),
                    actual: format!("version {}", diff.version),
                });
            }
        }
        if !previous.can_become(status) {
            return Err(BusError::InvalidTransition {
                id: id.to_string(),
                from: previous,
                to: status,
            });
        }

        diff.status = status;
        diff.version += 1;
        if let Some(result) = payload.verification {
            diff.verification = Some(result);
        }
        if let Some(error) = payload.error {
            diff.verification_error = Some(error);
        }
        if let Some(chain) = payload.causal_chain {
            diff.causal_chain = Some(chain);
        }
        match status {
            DiffStatus::Verified => diff.verified_at = Some(Utc::now()),
            DiffStatus::Merged => diff.merged_at = Some(Utc::now()),
            _ => {}
        }

        write_json_atomic(&current_path, &diff)?;

        let target = status.partition();
        if target != current {
            fs::create_dir_all(self.partition_dir(target))?;
            fs::rename(&current_path, self.diff_path(target, id))?;
        }

        debug!(
            diff_id = %id,
            from = %previous,
            to = %status,
            version = diff.version,
            "diff transitioned"
        );
        Ok(diff)
    }

    /// Move a diff to `verifying` for this caller, or `None` if someone else
    /// holds it or it already left the pending partition.
    ///
    /// A `verifying` record is reclaimed only when no live claim lock
    /// guards it, i.e. its previous owner exited mid-verification.
    pub fn claim(&self, id: &str) -> Result<Option<Claim>, BusError> {
        self.ensure_initialized()?;
        let Some(lock) = RecordLock::try_acquire(&self.claim_lock_path(id))? else {
            debug!(diff_id = %id, "diff is claimed elsewhere");
            return Ok(None);
        };

        let abandoned = self
            .get(id)?
            .is_some_and(|d| d.status == DiffStatus::Verifying);
        let from = [DiffStatus::Pending, DiffStatus::Verifying];
        match self.transition(id, &from, DiffStatus::Verifying, TransitionPayload::default()) {
            Ok(diff) => {
                if abandoned {
                    warn!(diff_id = %id, "reclaimed abandoned verification");
                }
                Ok(Some(Claim { diff, _lock: lock }))
            }
            Err(BusError::StaleTransition { .. }) | Err(BusError::DiffNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Move records whose stored status disagrees with their partition.
    ///
    /// When the same id is present in two partitions, the copy with the
    /// higher version wins.
    pub fn repair(&self) -> Result<usize, BusError> {
        self.ensure_initialized()?;
        let mut repaired = 0;

        for partition in Partition::ALL {
            for path in json_files(&self.partition_dir(partition))? {
                let diff: Diff = match read_json(&path) {
                    Ok(diff) => diff,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable record");
                        continue;
                    }
                };
                let target = diff.status.partition();
                if target == partition {
                    continue;
                }

                let _lock = self.lock_record(&diff.id)?;
                let target_path = self.diff_path(target, &diff.id);
                if target_path.exists() {
                    let other: Diff = read_json(&target_path)?;
                    if other.version >= diff.version {
                        fs::remove_file(&path)?;
                        repaired += 1;
                        continue;
                    }
                }
                fs::create_dir_all(self.partition_dir(target))?;
                fs::rename(&path, &target_path)?;
                info!(diff_id = %diff.id, from = %partition, to = %target, "record refiled");
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    fn locate(&self, id: &str) -> Option<(Partition, PathBuf)> {
        Partition::ALL.into_iter().find_map(|partition| {
            let path = self.diff_path(partition, id);
            path.is_file().then_some((partition, path))
        })
    }
}
