use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Origin;
use crate::error::JobError;
use crate::job::Job;

/// Authoritative job map: active (scheduled), disabled (present but not
/// scheduled) and a bounded ring of recently removed jobs kept for the read
/// model.
///
/// The three collections are pairwise disjoint per name, and a name is
/// unique across active+disabled at all times. Reads are concurrent; all
/// mutations serialize on one write lock.
pub struct Registry {
    removed_cap: usize,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    active: HashMap<String, Arc<Job>>,
    disabled: HashMap<String, Arc<Job>>,
    removed: VecDeque<Arc<Job>>,
}

impl Registry {
    pub fn new(removed_cap: usize) -> Registry {
        Registry {
            removed_cap: removed_cap.max(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Insert a job into the active set. Names must be unique across
    /// active and disabled.
    pub fn add(&self, job: Arc<Job>) -> Result<(), JobError> {
        let mut inner = self.inner.write();
        let name = job.name().to_string();
        if inner.active.contains_key(&name) || inner.disabled.contains_key(&name) {
            return Err(JobError::ConfigInvalid(format!(
                "job name {name:?} already registered"
            )));
        }
        inner.active.insert(name, job);
        Ok(())
    }

    /// Insert a job directly into the disabled set.
    pub fn add_disabled(&self, job: Arc<Job>) -> Result<(), JobError> {
        let mut inner = self.inner.write();
        let name = job.name().to_string();
        if inner.active.contains_key(&name) || inner.disabled.contains_key(&name) {
            return Err(JobError::ConfigInvalid(format!(
                "job name {name:?} already registered"
            )));
        }
        inner.disabled.insert(name, job);
        Ok(())
    }

    /// Drop a job from active or disabled, retaining it on the removed
    /// ring. In-flight executions of the job are left to finish; their
    /// results land in the removed entry's history.
    pub fn remove(&self, name: &str) -> Option<Arc<Job>> {
        let mut inner = self.inner.write();
        let job = match inner.active.remove(name) {
            Some(job) => job,
            None => inner.disabled.remove(name)?,
        };
        inner.removed.push_back(job.clone());
        while inner.removed.len() > self.removed_cap {
            inner.removed.pop_front();
        }
        Some(job)
    }

    /// Move a job from active to disabled.
    pub fn disable(&self, name: &str) -> Result<Arc<Job>, JobError> {
        let mut inner = self.inner.write();
        let job = inner
            .active
            .remove(name)
            .ok_or_else(|| JobError::Runtime(format!("no active job named {name:?}")))?;
        inner.disabled.insert(name.to_string(), job.clone());
        Ok(job)
    }

    /// Move a job from disabled back to active.
    pub fn enable(&self, name: &str) -> Result<Arc<Job>, JobError> {
        let mut inner = self.inner.write();
        let job = inner
            .disabled
            .remove(name)
            .ok_or_else(|| JobError::Runtime(format!("no disabled job named {name:?}")))?;
        inner.active.insert(name.to_string(), job.clone());
        Ok(job)
    }

    /// Swap the job registered under `name` for a new snapshot, in place,
    /// whichever set currently holds it.
    pub fn replace(&self, name: &str, job: Arc<Job>) -> Result<(), JobError> {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.active.get_mut(name) {
            *slot = job;
            return Ok(());
        }
        if let Some(slot) = inner.disabled.get_mut(name) {
            *slot = job;
            return Ok(());
        }
        Err(JobError::Runtime(format!("no job named {name:?} to replace")))
    }

    /// Look a job up in active or disabled.
    pub fn get(&self, name: &str) -> Option<Arc<Job>> {
        let inner = self.inner.read();
        inner
            .active
            .get(name)
            .or_else(|| inner.disabled.get(name))
            .cloned()
    }

    /// Look a job up in the active set only.
    pub fn active(&self, name: &str) -> Option<Arc<Job>> {
        self.inner.read().active.get(name).cloned()
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.inner.read().disabled.contains_key(name)
    }

    /// Active jobs, optionally filtered by origin.
    pub fn list(&self, origin: Option<Origin>) -> Vec<Arc<Job>> {
        self.inner
            .read()
            .active
            .values()
            .filter(|job| origin.is_none_or(|o| job.origin() == o))
            .cloned()
            .collect()
    }

    pub fn disabled_jobs(&self) -> Vec<Arc<Job>> {
        self.inner.read().disabled.values().cloned().collect()
    }

    /// Recently removed jobs, oldest first.
    pub fn removed_jobs(&self) -> Vec<Arc<Job>> {
        self.inner.read().removed.iter().cloned().collect()
    }

    /// Names across active and disabled carrying the given origin; this is
    /// the candidate set for reconcile removals.
    pub fn names_with_origin(&self, origin: Origin) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .active
            .values()
            .chain(inner.disabled.values())
            .filter(|job| job.origin() == origin)
            .map(|job| job.name().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobConfig, JobKind};
    use crate::middleware::Chain;

    fn job(name: &str, origin: Origin) -> Arc<Job> {
        let config = JobConfig {
            name: name.into(),
            kind: JobKind::Local,
            schedule: "@every 1m".into(),
            command: "true".into(),
            ..JobConfig::default()
        };
        let backend = crate::backend::build(&config, None).unwrap();
        Job::new(config, origin, backend, Chain::new(Vec::new())).unwrap()
    }

    #[test]
    fn names_are_unique_across_active_and_disabled() {
        let registry = Registry::new(10);
        registry.add(job("a", Origin::File)).unwrap();
        assert!(registry.add(job("a", Origin::Label)).is_err());
        assert!(registry.add_disabled(job("a", Origin::File)).is_err());

        registry.add_disabled(job("b", Origin::File)).unwrap();
        assert!(registry.add(job("b", Origin::File)).is_err());
    }

    #[test]
    fn disable_enable_move_between_sets() {
        let registry = Registry::new(10);
        registry.add(job("a", Origin::File)).unwrap();

        registry.disable("a").unwrap();
        assert!(registry.active("a").is_none());
        assert!(registry.is_disabled("a"));
        assert!(registry.get("a").is_some());

        registry.enable("a").unwrap();
        assert!(registry.active("a").is_some());
        assert!(!registry.is_disabled("a"));

        assert!(registry.disable("missing").is_err());
    }

    #[test]
    fn remove_retains_on_capped_ring() {
        let registry = Registry::new(3);
        for i in 0..5 {
            let name = format!("job-{i}");
            registry.add(job(&name, Origin::Label)).unwrap();
            registry.remove(&name).unwrap();
        }
        let removed = registry.removed_jobs();
        assert_eq!(removed.len(), 3);
        assert_eq!(removed[0].name(), "job-2");
        assert_eq!(removed[2].name(), "job-4");
        // Removed entries are no longer reachable by name.
        assert!(registry.get("job-4").is_none());
    }

    #[test]
    fn removed_job_can_be_re_added() {
        let registry = Registry::new(10);
        registry.add(job("a", Origin::Label)).unwrap();
        registry.remove("a").unwrap();
        registry.add(job("a", Origin::Label)).unwrap();
        assert!(registry.active("a").is_some());
    }

    #[test]
    fn list_filters_by_origin() {
        let registry = Registry::new(10);
        registry.add(job("f1", Origin::File)).unwrap();
        registry.add(job("f2", Origin::File)).unwrap();
        registry.add(job("l1", Origin::Label)).unwrap();

        assert_eq!(registry.list(None).len(), 3);
        assert_eq!(registry.list(Some(Origin::File)).len(), 2);
        assert_eq!(registry.list(Some(Origin::Label)).len(), 1);
        assert_eq!(registry.names_with_origin(Origin::Label), vec!["l1"]);
    }

    #[test]
    fn replace_swaps_in_place() {
        let registry = Registry::new(10);
        registry.add(job("a", Origin::File)).unwrap();
        let replacement = job("a", Origin::File);
        registry.replace("a", replacement.clone()).unwrap();
        assert!(Arc::ptr_eq(&registry.active("a").unwrap(), &replacement));
        assert!(registry.replace("missing", job("missing", Origin::File)).is_err());
    }
}
