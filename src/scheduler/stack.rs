use std::collections::HashSet;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::scheduler::job::{Job, JobStatus};

/// The ordered backlog of jobs.
///
/// Front to back is priority order for placement. Jobs only leave by
/// explicit removal or purge.
#[derive(Debug, Clone, Default)]
pub struct JobStack {
    jobs: Vec<Job>,
}

impl JobStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        Self { jobs }
    }

    pub fn push(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == *id)
    }

    pub fn get_mut(&mut self, id: &Uuid) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == *id)
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Job> {
        let idx = self.jobs.iter().position(|j| j.id == *id)?;
        Some(self.jobs.remove(idx))
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.jobs.iter().map(|j| j.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.iter_mut()
    }

    /// Ids of jobs in `status`, front to back.
    pub fn ids_with_status(&self, status: JobStatus) -> Vec<Uuid> {
        self.jobs
            .iter()
            .filter(|j| j.status == status)
            .map(|j| j.id)
            .collect()
    }

    pub fn jobs_for_resource(&self, resource_id: &Uuid) -> Vec<&Job> {
        self.jobs
            .iter()
            .filter(|j| j.assigned_resource.as_ref() == Some(resource_id))
            .collect()
    }

    pub fn has_running(&self) -> bool {
        self.jobs.iter().any(|j| j.status == JobStatus::Running)
    }

    /// Check that `order` is a permutation of the current ids.
    pub fn validate_order(&self, order: &[Uuid]) -> Result<(), String> {
        if order.len() != self.jobs.len() {
            return Err(format!(
                "expected {} ids, got {}",
                self.jobs.len(),
                order.len()
            ));
        }

        let mut seen = HashSet::with_capacity(order.len());
        for id in order {
            if !seen.insert(*id) {
                return Err(format!("duplicate id {}", id));
            }
            if self.get(id).is_none() {
                return Err(format!("unknown id {}", id));
            }
        }
        Ok(())
    }

    /// Rebuild the stack in `order`. Call [`JobStack::validate_order`] first.
    pub fn reorder(&mut self, order: &[Uuid]) -> Result<(), String> {
        self.validate_order(order)?;
        let mut old = std::mem::take(&mut self.jobs);
        for id in order {
            if let Some(idx) = old.iter().position(|j| j.id == *id) {
                self.jobs.push(old.swap_remove(idx));
            }
        }
        Ok(())
    }

    /// Drop terminal jobs whose purge time has passed. Returns their ids.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut purged = Vec::new();
        self.jobs.retain(|job| {
            let expired = job.status.is_terminal() && job.purge_time.is_some_and(|t| t <= now);
            if expired {
                purged.push(job.id);
            }
            !expired
        });
        purged
    }

    pub fn to_vec(&self) -> Vec<Job> {
        self.jobs.clone()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration;

    use super::*;

    fn stack_of(n: usize) -> JobStack {
        let mut stack = JobStack::new();
        for i in 0..n {
            stack.push(Job::new(Uuid::new_v4(), format!("job{}", i), "me", BTreeMap::new()));
        }
        stack
    }

    #[test]
    fn reorder_accepts_a_permutation() {
        let mut stack = stack_of(3);
        let mut ids = stack.ids();
        ids.reverse();
        stack.reorder(&ids).unwrap();
        assert_eq!(stack.ids(), ids);
    }

    #[test]
    fn reorder_rejects_missing_extra_and_duplicate_ids() {
        let mut stack = stack_of(3);
        let before = stack.ids();

        assert!(stack.reorder(&before[..2]).is_err());

        let mut extra = before.clone();
        extra.push(Uuid::new_v4());
        assert!(stack.reorder(&extra).is_err());

        let dup = vec![before[0], before[0], before[1]];
        assert!(stack.reorder(&dup).is_err());

        let mut foreign = before.clone();
        foreign[2] = Uuid::new_v4();
        assert!(stack.reorder(&foreign).is_err());

        assert_eq!(stack.ids(), before);
    }

    #[test]
    fn purge_only_drops_expired_terminal_jobs() {
        let mut stack = stack_of(3);
        let ids = stack.ids();
        let now = Utc::now();

        let old = stack.get_mut(&ids[0]).unwrap();
        old.status = JobStatus::Done;
        old.purge_time = Some(now - Duration::hours(1));

        let fresh = stack.get_mut(&ids[1]).unwrap();
        fresh.status = JobStatus::Quit;
        fresh.purge_time = Some(now + Duration::hours(1));

        // Not terminal, so kept even with a past purge time.
        stack.get_mut(&ids[2]).unwrap().purge_time = Some(now - Duration::hours(1));

        assert_eq!(stack.purge_expired(now), vec![ids[0]]);
        assert_eq!(stack.ids(), ids[1..].to_vec());
    }

    #[test]
    fn jobs_for_resource_filters_by_assignment() {
        let mut stack = stack_of(2);
        let resource = Uuid::new_v4();
        let first = stack.ids()[0];
        stack.get_mut(&first).unwrap().assigned_resource = Some(resource);
        let found = stack.jobs_for_resource(&resource);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, first);
    }
}
