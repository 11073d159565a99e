//! Per-task bookkeeping of recently used tool families.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::task::TaskId;

use super::taxonomy::ToolFamily;

/// One validator decision about a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolUse {
    pub step: u32,
    pub family: ToolFamily,
    pub accepted: bool,
}

/// Tool usage keyed by task. Entries live only as long as the task runs.
#[derive(Debug, Default)]
pub struct DiversityTracker {
    uses: RwLock<HashMap<TaskId, Vec<ToolUse>>>,
}

impl DiversityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, task_id: TaskId, step: u32, family: ToolFamily, accepted: bool) {
        let mut uses = self.uses.write().unwrap_or_else(|e| e.into_inner());
        uses.entry(task_id).or_default().push(ToolUse {
            step,
            family,
            accepted,
        });
    }

    /// The last `window` accepted families, oldest first.
    pub fn recent(&self, task_id: TaskId, window: usize) -> Vec<ToolFamily> {
        let uses = self.uses.read().unwrap_or_else(|e| e.into_inner());
        let Some(list) = uses.get(&task_id) else {
            return Vec::new();
        };
        let mut recent: Vec<ToolFamily> = list
            .iter()
            .rev()
            .filter(|u| u.accepted)
            .take(window)
            .map(|u| u.family)
            .collect();
        recent.reverse();
        recent
    }

    /// Family last accepted for each of the `window` steps immediately before
    /// `step`, oldest first. Stops at the first preceding step with no
    /// accepted command, so the result only covers a contiguous run.
    pub fn preceding_steps(&self, task_id: TaskId, step: u32, window: usize) -> Vec<ToolFamily> {
        let uses = self.uses.read().unwrap_or_else(|e| e.into_inner());
        let Some(list) = uses.get(&task_id) else {
            return Vec::new();
        };

        let mut families = Vec::with_capacity(window);
        for previous in (1..step).rev().take(window) {
            let last = list
                .iter()
                .rev()
                .find(|u| u.step == previous && u.accepted)
                .map(|u| u.family);
            match last {
                Some(family) => families.push(family),
                None => break,
            }
        }
        families.reverse();
        families
    }

    /// Forget a task once it completes or fails.
    pub fn reset(&self, task_id: TaskId) {
        let mut uses = self.uses.write().unwrap_or_else(|e| e.into_inner());
        uses.remove(&task_id);
    }

    pub fn tracked_tasks(&self) -> usize {
        self.uses.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_only_counts_accepted() {
        let tracker = DiversityTracker::new();
        let id = TaskId::new();
        tracker.record(id, 1, ToolFamily::Scanner, true);
        tracker.record(id, 2, ToolFamily::ExploitDb, false);
        tracker.record(id, 2, ToolFamily::HttpClient, true);
        assert_eq!(tracker.recent(id, 2), vec![ToolFamily::Scanner, ToolFamily::HttpClient]);
        assert_eq!(tracker.recent(id, 1), vec![ToolFamily::HttpClient]);
    }

    #[test]
    fn test_preceding_steps_window() {
        let tracker = DiversityTracker::new();
        let id = TaskId::new();
        tracker.record(id, 1, ToolFamily::Scanner, true);
        tracker.record(id, 2, ToolFamily::Scanner, true);
        tracker.record(id, 3, ToolFamily::Scanner, false);

        assert_eq!(tracker.preceding_steps(id, 3, 2), vec![ToolFamily::Scanner, ToolFamily::Scanner]);
        assert_eq!(tracker.preceding_steps(id, 2, 2), vec![ToolFamily::Scanner]);
        // Step 3 had nothing accepted, so step 4 sees an empty run
        assert!(tracker.preceding_steps(id, 4, 2).is_empty());
    }

    #[test]
    fn test_tasks_are_isolated_and_reset() {
        let tracker = DiversityTracker::new();
        let a = TaskId::new();
        let b = TaskId::new();
        tracker.record(a, 1, ToolFamily::Scanner, true);
        assert!(tracker.recent(b, 2).is_empty());
        tracker.reset(a);
        assert!(tracker.recent(a, 2).is_empty());
        assert_eq!(tracker.tracked_tasks(), 0);
    }
}
