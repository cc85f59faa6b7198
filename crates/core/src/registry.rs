//! Concurrent job registry keyed by client-supplied job id.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::job::{Job, JobSnapshot, JobStatus};

/// Outcome of the atomic check-and-create performed at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A fresh QUEUED record was stored; the caller must enqueue its id.
    Created,
    /// An active record already exists for this id; nothing was stored.
    Duplicate(JobStatus),
}

/// Every mutation goes through a DashMap shard write guard, so readers see
/// either the previous record or the fully updated one.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Job>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn get(&self, id: &str) -> Option<JobSnapshot> {
        self.jobs.get(id).map(|job| job.snapshot())
    }

    /// Read-modify-write under the entry's shard lock. Returns `None` when
    /// the id is unknown.
    pub fn update<R>(&self, id: &str, mutator: impl FnOnce(&mut Job) -> R) -> Option<R> {
        self.jobs.get_mut(id).map(|mut job| mutator(job.value_mut()))
    }

    /// Stores `job` unless an active record with the same id exists.
    /// Terminal or unknown ids are overwritten with the fresh record.
    pub fn admit(&self, job: Job) -> Admission {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(existing) if existing.get().status.is_active() => {
                Admission::Duplicate(existing.get().status)
            }
            Entry::Occupied(mut existing) => {
                existing.insert(job);
                Admission::Created
            }
            Entry::Vacant(slot) => {
                slot.insert(job);
                Admission::Created
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drops the oldest terminal records until at most `keep` remain and
    /// returns the removed records. Active records and `spare` are never
    /// touched; `spare` always counts as one of the kept records.
    pub fn evict_finished(&self, keep: usize, spare: &str) -> Vec<Job> {
        let mut finished: Vec<(String, chrono::DateTime<chrono::Utc>)> = self
            .jobs
            .iter()
            .filter(|job| job.status.is_terminal() && job.id != spare)
            .map(|job| (job.id.clone(), job.updated_at))
            .collect();

        let spare_is_finished = self
            .jobs
            .get(spare)
            .is_some_and(|job| job.status.is_terminal());
        let budget = if spare_is_finished {
            keep.saturating_sub(1)
        } else {
            keep
        };
        if finished.len() <= budget {
            return Vec::new();
        }

        finished.sort_by_key(|(_, updated_at)| *updated_at);
        let excess = finished.len() - budget;

        finished
            .into_iter()
            .take(excess)
            .filter_map(|(id, _)| {
                // A resubmission may have revived the id since the scan.
                self.jobs
                    .remove_if(&id, |_, job| job.status.is_terminal())
                    .map(|(_, job)| job)
            })
            .collect()
    }
}
