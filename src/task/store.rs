//! File-backed task store.
//!
//! All task records live in a single YAML file (`.takt/tasks.yaml`).
//! Operations take an internal async mutex around the read-modify-write,
//! so concurrent callers in one process observe each mutation atomically;
//! the file itself is replaced via write-tempfile-then-rename, so a crash
//! never leaves a torn file. Cross-process locking is out of scope, but
//! the single chokepoint below is where advisory file locking would go.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, TaktError};
use crate::utils::fs::write_atomic;
use crate::utils::time;

use super::{validate_task_name, TaskFailure, TaskRecord, TaskSeed, TaskStatus};

/// Durable list of task records with atomic claim/complete/fail/requeue
pub struct TaskStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl TaskStore {
    /// Open a store backed by the given YAML file (created on first write)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// The backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<TaskRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_yaml::from_str(&contents).map_err(|e| TaktError::Store {
            message: format!("failed to parse {}", self.path.display()),
            source: Some(Box::new(e)),
        })
    }

    fn save(&self, tasks: &[TaskRecord]) -> Result<()> {
        let yaml = serde_yaml::to_string(tasks).map_err(|e| TaktError::Store {
            message: "failed to serialize task records".to_string(),
            source: Some(Box::new(e)),
        })?;
        write_atomic(&self.path, &yaml)
    }

    /// Create a new pending task. Names are unique within the store.
    pub async fn add_task(
        &self,
        name: &str,
        content: &str,
        seed: TaskSeed,
    ) -> Result<TaskRecord> {
        validate_task_name(name)?;
        let _guard = self.lock.lock().await;

        let mut tasks = self.load()?;
        if tasks.iter().any(|t| t.name == name) {
            return Err(TaktError::task(name, "a task with this name already exists"));
        }

        let record = TaskRecord::new(name, content, seed);
        tasks.push(record.clone());
        self.save(&tasks)?;
        info!("Added task '{}'", name);
        Ok(record)
    }

    /// Claim up to `count` pending tasks in FIFO creation order, flipping
    /// them to running in one atomic step. A task is never returned twice.
    pub async fn claim_next_tasks(&self, count: usize) -> Result<Vec<TaskRecord>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.lock.lock().await;

        let mut tasks = self.load()?;
        let mut pending: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status == TaskStatus::Pending)
            .map(|(i, _)| i)
            .collect();
        pending.sort_by(|&a, &b| tasks[a].created_at.cmp(&tasks[b].created_at));
        pending.truncate(count);

        let mut claimed = Vec::with_capacity(pending.len());
        for index in pending {
            let task = &mut tasks[index];
            task.status = TaskStatus::Running;
            task.started_at = Some(time::now());
            claimed.push(task.clone());
        }

        if !claimed.is_empty() {
            self.save(&tasks)?;
            debug!(
                "Claimed {} task(s): {:?}",
                claimed.len(),
                claimed.iter().map(|t| t.name.as_str()).collect::<Vec<_>>()
            );
        }
        Ok(claimed)
    }

    /// Transition a running task to completed
    pub async fn complete_task(&self, name: &str, response: Option<String>) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut tasks = self.load()?;
        let task = find_mut(&mut tasks, name)?;
        if task.status != TaskStatus::Running {
            return Err(TaktError::task(
                name,
                format!("cannot complete from status {:?}", task.status),
            ));
        }

        task.status = TaskStatus::Completed;
        task.completed_at = Some(time::now());
        task.response = response;
        task.failure = None;
        self.save(&tasks)?;
        info!("Task '{}' completed", name);
        Ok(())
    }

    /// Transition a running task to failed
    pub async fn fail_task(&self, name: &str, failure: TaskFailure) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut tasks = self.load()?;
        let task = find_mut(&mut tasks, name)?;
        if task.status != TaskStatus::Running {
            return Err(TaktError::task(
                name,
                format!("cannot fail from status {:?}", task.status),
            ));
        }

        task.status = TaskStatus::Failed;
        task.completed_at = Some(time::now());
        task.failure = Some(failure);
        self.save(&tasks)?;
        info!("Task '{}' failed", name);
        Ok(())
    }

    /// Requeue a task from any of `from_statuses` back to pending.
    ///
    /// A new retry note concatenates onto an existing one with a blank
    /// line, preserving the full retry trail.
    pub async fn requeue_task(
        &self,
        name: &str,
        from_statuses: &[TaskStatus],
        start_movement: Option<String>,
        retry_note: Option<String>,
    ) -> Result<TaskRecord> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.load()?;
        let record = Self::reset_for_retry(
            &mut tasks,
            name,
            from_statuses,
            start_movement,
            retry_note,
            TaskStatus::Pending,
        )?;
        self.save(&tasks)?;
        info!("Task '{}' requeued", name);
        Ok(record)
    }

    /// Like [`TaskStore::requeue_task`] but flips straight to running and
    /// returns the record, for interactive re-execution.
    pub async fn start_re_execution(
        &self,
        name: &str,
        from_statuses: &[TaskStatus],
        start_movement: Option<String>,
        retry_note: Option<String>,
    ) -> Result<TaskRecord> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.load()?;
        let record = Self::reset_for_retry(
            &mut tasks,
            name,
            from_statuses,
            start_movement,
            retry_note,
            TaskStatus::Running,
        )?;
        self.save(&tasks)?;
        info!("Task '{}' re-executing", name);
        Ok(record)
    }

    fn reset_for_retry(
        tasks: &mut [TaskRecord],
        name: &str,
        from_statuses: &[TaskStatus],
        start_movement: Option<String>,
        retry_note: Option<String>,
        to_status: TaskStatus,
    ) -> Result<TaskRecord> {
        let task = find_mut(tasks, name)?;
        if !from_statuses.contains(&task.status) {
            return Err(TaktError::task(
                name,
                format!(
                    "cannot retry from status {:?} (allowed: {:?})",
                    task.status, from_statuses
                ),
            ));
        }

        task.status = to_status;
        task.started_at = match to_status {
            TaskStatus::Running => Some(time::now()),
            _ => None,
        };
        task.completed_at = None;
        task.failure = None;
        task.response = None;
        if start_movement.is_some() {
            task.start_movement = start_movement;
        }
        if let Some(note) = retry_note {
            task.retry_note = Some(match &task.retry_note {
                Some(existing) => format!("{}\n\n{}", existing, note),
                None => note,
            });
        }
        Ok(task.clone())
    }

    /// Revert tasks stuck in running (e.g. after a crash) back to pending.
    /// Returns how many were recovered.
    pub async fn recover_interrupted_running_tasks(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;

        let mut tasks = self.load()?;
        let mut recovered = 0;
        for task in tasks.iter_mut() {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                recovered += 1;
            }
        }

        if recovered > 0 {
            self.save(&tasks)?;
            info!("Recovered {} interrupted running task(s)", recovered);
        }
        Ok(recovered)
    }

    /// All records, in file (creation) order
    pub async fn list(&self) -> Result<Vec<TaskRecord>> {
        let _guard = self.lock.lock().await;
        self.load()
    }

    /// One record by name
    pub async fn get(&self, name: &str) -> Result<Option<TaskRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.load()?.into_iter().find(|t| t.name == name))
    }

    /// Delete a record by name
    pub async fn remove_task(&self, name: &str) -> Result<()> {
        let _guard = self.lock.lock().await;

        let mut tasks = self.load()?;
        let before = tasks.len();
        tasks.retain(|t| t.name != name);
        if tasks.len() == before {
            return Err(TaktError::task(name, "no such task"));
        }
        self.save(&tasks)?;
        info!("Removed task '{}'", name);
        Ok(())
    }
}

fn find_mut<'a>(tasks: &'a mut [TaskRecord], name: &str) -> Result<&'a mut TaskRecord> {
    tasks
        .iter_mut()
        .find(|t| t.name == name)
        .ok_or_else(|| TaktError::task(name, "no such task"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store_in(dir: &tempfile::TempDir) -> TaskStore {
        TaskStore::new(dir.path().join("tasks.yaml"))
    }

    #[tokio::test]
    async fn test_add_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.add_task("a", "task a", TaskSeed::default()).await.unwrap();
        store.add_task("b", "task b", TaskSeed::default()).await.unwrap();

        let tasks = store.list().await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name, "a");
        assert_eq!(tasks[0].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_add_duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.add_task("a", "first", TaskSeed::default()).await.unwrap();
        let err = store.add_task("a", "second", TaskSeed::default()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_add_invalid_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store
            .add_task("bad name!", "x", TaskSeed::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_claim_fifo_order_and_no_double_claim() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        for name in ["a", "b", "c"] {
            store.add_task(name, name, TaskSeed::default()).await.unwrap();
        }

        let first = store.claim_next_tasks(2).await.unwrap();
        assert_eq!(
            first.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(first.iter().all(|t| t.status == TaskStatus::Running));
        assert!(first.iter().all(|t| t.started_at.is_some()));

        let second = store.claim_next_tasks(2).await.unwrap();
        assert_eq!(
            second.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["c"]
        );

        assert!(store.claim_next_tasks(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store_in(&dir));

        for i in 0..10 {
            store
                .add_task(&format!("task-{}", i), "work", TaskSeed::default())
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..5 {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.claim_next_tasks(3).await },
            ));
        }

        let mut all_names = Vec::new();
        for handle in handles {
            let claimed = handle.await.unwrap().unwrap();
            all_names.extend(claimed.into_iter().map(|t| t.name));
        }

        let unique: std::collections::HashSet<_> = all_names.iter().collect();
        assert_eq!(unique.len(), all_names.len(), "claims must be disjoint");
        assert_eq!(all_names.len(), 10);
    }

    #[tokio::test]
    async fn test_complete_requires_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.add_task("a", "x", TaskSeed::default()).await.unwrap();
        assert!(store.complete_task("a", None).await.is_err());

        store.claim_next_tasks(1).await.unwrap();
        store
            .complete_task("a", Some("done".to_string()))
            .await
            .unwrap();

        let task = store.get("a").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.response.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_fail_records_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.add_task("a", "x", TaskSeed::default()).await.unwrap();
        store.claim_next_tasks(1).await.unwrap();
        store
            .fail_task(
                "a",
                TaskFailure {
                    movement: Some("review".to_string()),
                    error: Some("agent_error".to_string()),
                    last_message: Some("tail".to_string()),
                },
            )
            .await
            .unwrap();

        let task = store.get("a").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.failure.as_ref().unwrap().movement.as_deref(),
            Some("review")
        );
    }

    #[tokio::test]
    async fn test_requeue_concatenates_retry_notes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.add_task("a", "x", TaskSeed::default()).await.unwrap();
        store.claim_next_tasks(1).await.unwrap();
        store
            .fail_task("a", TaskFailure::default_for_test())
            .await
            .unwrap();

        store
            .requeue_task(
                "a",
                &[TaskStatus::Failed],
                Some("review".to_string()),
                Some("first note".to_string()),
            )
            .await
            .unwrap();

        store.claim_next_tasks(1).await.unwrap();
        store
            .fail_task("a", TaskFailure::default_for_test())
            .await
            .unwrap();

        let task = store
            .requeue_task(
                "a",
                &[TaskStatus::Failed],
                None,
                Some("second note".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(
            task.retry_note.as_deref(),
            Some("first note\n\nsecond note")
        );
        assert_eq!(task.start_movement.as_deref(), Some("review"));
        assert!(task.failure.is_none());
    }

    #[tokio::test]
    async fn test_requeue_rejects_wrong_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.add_task("a", "x", TaskSeed::default()).await.unwrap();
        let err = store
            .requeue_task("a", &[TaskStatus::Failed], None, None)
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_start_re_execution_flips_to_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.add_task("a", "x", TaskSeed::default()).await.unwrap();
        store.claim_next_tasks(1).await.unwrap();
        store
            .fail_task("a", TaskFailure::default_for_test())
            .await
            .unwrap();

        let task = store
            .start_re_execution("a", &[TaskStatus::Failed], None, None)
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn test_recover_interrupted_running_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        for name in ["a", "b", "c"] {
            store.add_task(name, name, TaskSeed::default()).await.unwrap();
        }
        store.claim_next_tasks(2).await.unwrap();

        let recovered = store.recover_interrupted_running_tasks().await.unwrap();
        assert_eq!(recovered, 2);

        let tasks = store.list().await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
    }

    #[tokio::test]
    async fn test_store_round_trip_preserves_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.yaml");

        let store = TaskStore::new(&path);
        store
            .add_task(
                "a",
                "content",
                TaskSeed {
                    piece: Some("default".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let original = store.list().await.unwrap();

        // A fresh store over the same file sees identical records
        let reopened = TaskStore::new(&path);
        let reloaded = reopened.list().await.unwrap();
        assert_eq!(original, reloaded);
    }

    #[tokio::test]
    async fn test_remove_task() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.add_task("a", "x", TaskSeed::default()).await.unwrap();
        store.remove_task("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.remove_task("a").await.is_err());
    }

    impl TaskFailure {
        fn default_for_test() -> Self {
            Self {
                movement: None,
                error: Some("boom".to_string()),
                last_message: None,
            }
        }
    }
}
