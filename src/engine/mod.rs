//! Guarded execution engine.
//!
//! Owns the registry of tasks and exposes the control surface: `start`,
//! `resume` and `cancel`. Each task is driven by one spawned driver at a time
//! (see `runner`); the per-task `drive` lock makes that exclusive, the `task`
//! lock only guards short state mutations so readers never wait on a command.

mod events;
mod runner;
mod store;

pub use events::{EngineEvent, EventKind, PlannedStepInfo};
pub use store::{FileTaskStore, InMemoryTaskStore, TaskStore};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

use crate::audit::AuditSink;
use crate::config::EngineConfig;
use crate::context::ContextBuilder;
use crate::exec::CommandRunner;
use crate::planner::Planner;
use crate::target::is_valid_target;
use crate::task::{Task, TaskError, TaskId, TaskStatus};
use crate::validator::{CommandValidator, DiversityTracker, SafetyPolicy};

use events::EventLog;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    #[error("Checkpoint for task {0} was already consumed")]
    CheckpointConsumed(TaskId),

    #[error("Task {0} is not paused for target selection")]
    NotPaused(TaskId),

    #[error("Task {0} already finished")]
    AlreadyFinished(TaskId),

    #[error("Cannot resume from step {requested}; valid range is 1..={max}")]
    InvalidResumeStep { requested: u32, max: u32 },

    #[error("Invalid target '{0}': expected an IP address or hostname")]
    InvalidTarget(String),

    #[error("Invalid engine configuration: {0}")]
    Config(String),

    #[error("Task store error: {0}")]
    Store(String),

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// External collaborators the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub planner: Arc<dyn Planner>,
    pub runner: Arc<dyn CommandRunner>,
    pub store: Arc<dyn TaskStore>,
    pub audit: Arc<dyn AuditSink>,
    pub context: ContextBuilder,
}

/// Registry entry for one task.
pub(crate) struct TaskHandle {
    pub(crate) task: Mutex<Task>,
    /// Held by whoever drives the task
    pub(crate) drive: Arc<Mutex<()>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) status_tx: watch::Sender<TaskStatus>,
    pub(crate) events: EventLog,
}

impl TaskHandle {
    fn new(task: Task, events_tx: broadcast::Sender<EngineEvent>) -> Self {
        let (status_tx, _) = watch::channel(task.status().clone());
        Self {
            events: EventLog::new(task.id(), events_tx),
            task: Mutex::new(task),
            drive: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
            status_tx,
        }
    }

    pub(crate) fn publish_status(&self, status: &TaskStatus) {
        self.status_tx.send_replace(status.clone());
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) planner: Arc<dyn Planner>,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) context: ContextBuilder,
    pub(crate) validator: CommandValidator,
    tasks: RwLock<HashMap<TaskId, Arc<TaskHandle>>>,
    events_tx: broadcast::Sender<EngineEvent>,
}

impl EngineInner {
    /// Persist a task. Failures are logged; the in-memory state stays authoritative.
    pub(crate) async fn persist(&self, task: &Task) {
        if let Err(e) = self.store.save(task).await {
            tracing::warn!(task_id = %task.id(), "Failed to persist task: {}", e);
        }
    }
}

/// Cheaply clonable engine handle.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig, parts: Collaborators) -> Result<Self, EngineError> {
        let safety = SafetyPolicy::new(&config.extra_forbidden_patterns)
            .map_err(|e| EngineError::Config(format!("bad forbidden pattern: {}", e)))?;
        if config.max_attempts == 0 {
            return Err(EngineError::Config("max_attempts must be at least 1".to_string()));
        }
        let validator = CommandValidator::new(
            safety,
            Arc::new(DiversityTracker::new()),
            parts.audit,
            config.diversity_window,
        );
        let (events_tx, _) = broadcast::channel(1024);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                planner: parts.planner,
                runner: parts.runner,
                store: parts.store,
                context: parts.context,
                validator,
                tasks: RwLock::new(HashMap::new()),
                events_tx,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Create a task for `objective` and start driving it.
    pub async fn start(&self, objective: &str, bypass: bool) -> Result<TaskId, EngineError> {
        let task = Task::new(objective.trim(), bypass)?;
        let id = task.id();
        self.inner
            .store
            .save(&task)
            .await
            .map_err(EngineError::Store)?;

        let handle = Arc::new(TaskHandle::new(task, self.inner.events_tx.clone()));
        let guard = handle.drive.clone().lock_owned().await;
        self.inner.tasks.write().await.insert(id, handle.clone());

        if bypass {
            tracing::warn!(task_id = %id, "Task started with safety bypass enabled");
        }
        tracing::info!(task_id = %id, "Task started: {}", objective.trim());

        self.spawn_driver(handle, guard, 1);
        Ok(id)
    }

    /// Resume a task paused for target selection.
    ///
    /// Returns the step execution continues at. Validation failures leave the
    /// checkpoint untouched.
    pub async fn resume(
        &self,
        id: TaskId,
        selected_target: &str,
        resume_from_step: Option<u32>,
    ) -> Result<u32, EngineError> {
        let handle = self.handle(id).await?;
        let target = selected_target.trim();

        {
            let task = handle.task.lock().await;
            if *task.status() != TaskStatus::PausedForTarget {
                return Err(match task.checkpoint() {
                    Some(cp) if cp.is_consumed() => EngineError::CheckpointConsumed(id),
                    _ => EngineError::NotPaused(id),
                });
            }
        }
        if !is_valid_target(target) {
            return Err(EngineError::InvalidTarget(selected_target.to_string()));
        }

        // A pausing driver releases this right after publishing the pause
        let guard = handle.drive.clone().lock_owned().await;
        let mut task = handle.task.lock().await;
        let from = task.resume(target, resume_from_step).map_err(|e| match e {
            TaskError::CheckpointConsumed => EngineError::CheckpointConsumed(id),
            TaskError::NoCheckpoint | TaskError::InvalidTransition { .. } => EngineError::NotPaused(id),
            TaskError::InvalidResumeStep { requested, max } => {
                EngineError::InvalidResumeStep { requested, max }
            }
            other => EngineError::Task(other),
        })?;

        self.inner.persist(&task).await;
        handle.events.emit(
            Some(from),
            EventKind::TargetConfirmed {
                target: target.to_string(),
                confidence: None,
                manual: true,
            },
        );
        handle.events.emit(Some(from), EventKind::TaskResumed { resume_from_step: from });
        handle.publish_status(task.status());
        drop(task);

        tracing::info!(task_id = %id, step = from, "Task resumed with target {}", target);
        self.spawn_driver(handle, guard, from);
        Ok(from)
    }

    /// Cancel a task.
    ///
    /// A paused task fails immediately and its checkpoint is discarded; a
    /// running task is failed by its driver at the next boundary, or at once if
    /// a command is in flight.
    pub async fn cancel(&self, id: TaskId) -> Result<(), EngineError> {
        let handle = self.handle(id).await?;
        let mut task = handle.task.lock().await;
        match task.status() {
            TaskStatus::Completed | TaskStatus::Failed { .. } => Err(EngineError::AlreadyFinished(id)),
            TaskStatus::PausedForTarget => {
                handle.cancel.cancel();
                task.fail("cancelled")?;
                self.inner.persist(&task).await;
                self.inner.validator.tracker().reset(id);
                handle.events.emit(
                    None,
                    EventKind::TaskFailed {
                        reason: "cancelled".to_string(),
                    },
                );
                handle.publish_status(task.status());
                tracing::info!(task_id = %id, "Paused task cancelled");
                Ok(())
            }
            TaskStatus::Running => {
                handle.cancel.cancel();
                tracing::info!(task_id = %id, "Cancellation requested");
                Ok(())
            }
        }
    }

    /// Snapshot of a task.
    pub async fn get(&self, id: TaskId) -> Result<Task, EngineError> {
        let handle = self.handle(id).await?;
        let task = handle.task.lock().await;
        Ok(task.clone())
    }

    /// All known tasks, newest first.
    pub async fn list(&self) -> Vec<Task> {
        let handles: Vec<Arc<TaskHandle>> = self.inner.tasks.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(handles.len());
        for handle in handles {
            tasks.push(handle.task.lock().await.clone());
        }
        tasks.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        tasks
    }

    /// Event history of a task.
    pub async fn events(&self, id: TaskId) -> Result<Vec<EngineEvent>, EngineError> {
        Ok(self.handle(id).await?.events.snapshot())
    }

    /// Live events of every task.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Wait until the task is no longer running.
    pub async fn wait(&self, id: TaskId) -> Result<TaskStatus, EngineError> {
        let handle = self.handle(id).await?;
        let mut rx = handle.status_tx.subscribe();
        let status = rx
            .wait_for(|s| *s != TaskStatus::Running)
            .await
            .map(|s| s.clone())
            .map_err(|_| EngineError::TaskNotFound(id))?;
        Ok(status)
    }

    /// Reload persisted tasks after a restart.
    ///
    /// Paused tasks become resumable again. Tasks that were running when the
    /// process stopped are failed as interrupted. Returns how many tasks were
    /// loaded.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let stored = self.inner.store.list().await.map_err(EngineError::Store)?;
        let mut loaded = 0;

        for mut task in stored {
            let id = task.id();
            if self.inner.tasks.read().await.contains_key(&id) {
                continue;
            }
            if *task.status() == TaskStatus::Running {
                task.fail("interrupted")?;
                self.inner.persist(&task).await;
                tracing::warn!(task_id = %id, "Marked interrupted task as failed");
            }
            let handle = Arc::new(TaskHandle::new(task, self.inner.events_tx.clone()));
            self.inner.tasks.write().await.insert(id, handle);
            loaded += 1;
        }

        if loaded > 0 {
            tracing::info!("Recovered {} tasks from the store", loaded);
        }
        Ok(loaded)
    }

    async fn handle(&self, id: TaskId) -> Result<Arc<TaskHandle>, EngineError> {
        self.inner
            .tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::TaskNotFound(id))
    }

    fn spawn_driver(&self, handle: Arc<TaskHandle>, guard: OwnedMutexGuard<()>, from_step: u32) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            runner::drive(inner, handle, from_step).await;
            drop(guard);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::audit::{AuditEvent, ChannelAudit, Decision};
    use crate::context::{HostDiscovery, PlanningContext};
    use crate::exec::{CommandOutput, ExecError, FailureCategory};
    use crate::planner::{CommandRequest, PlannedStep, PlannerError};
    use crate::target::DiscoveredHost;
    use crate::task::{ContextSnapshot, ExecutionCheckpoint, Step, StepStatus};

    const DISCOVER: &str = "Discover live hosts on the local network";
    const BANNER: &str = "curl -sI http://TARGET_IP/";

    struct ScriptedPlanner {
        steps: Result<Vec<PlannedStep>, PlannerError>,
        commands: StdMutex<VecDeque<String>>,
        fallback: Option<String>,
        requests: StdMutex<Vec<CommandRequest>>,
    }

    impl ScriptedPlanner {
        fn new(steps: &[&str]) -> Self {
            Self {
                steps: Ok(steps.iter().map(|s| PlannedStep::new(*s)).collect()),
                commands: StdMutex::new(VecDeque::new()),
                fallback: None,
                requests: StdMutex::new(Vec::new()),
            }
        }

        fn failing(error: PlannerError) -> Self {
            Self {
                steps: Err(error),
                ..Self::new(&[])
            }
        }

        fn with_commands(self, commands: &[&str]) -> Self {
            *self.commands.lock().unwrap() = commands.iter().map(|c| c.to_string()).collect();
            self
        }

        fn with_fallback(mut self, command: &str) -> Self {
            self.fallback = Some(command.to_string());
            self
        }

        fn requests(&self) -> Vec<CommandRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Planner for ScriptedPlanner {
        async fn generate_steps(&self, _context: &PlanningContext) -> Result<Vec<PlannedStep>, PlannerError> {
            self.steps.clone()
        }

        async fn regenerate_command(&self, request: &CommandRequest) -> Result<String, PlannerError> {
            self.requests.lock().unwrap().push(request.clone());
            match self.commands.lock().unwrap().pop_front() {
                Some(command) => Ok(command),
                None => self
                    .fallback
                    .clone()
                    .ok_or_else(|| PlannerError::Unavailable("script exhausted".to_string())),
            }
        }
    }

    #[derive(Default)]
    struct ScriptedRunner {
        outputs: StdMutex<VecDeque<CommandOutput>>,
        commands: StdMutex<Vec<String>>,
        always_fail: bool,
        hang: bool,
    }

    impl ScriptedRunner {
        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, command: &str, _timeout: Duration) -> Result<CommandOutput, ExecError> {
            self.commands.lock().unwrap().push(command.to_string());
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.always_fail {
                return Ok(CommandOutput {
                    exit_status: Some(1),
                    stdout: String::new(),
                    stderr: "Failed to resolve host".to_string(),
                });
            }
            Ok(self.outputs.lock().unwrap().pop_front().unwrap_or(CommandOutput {
                exit_status: Some(0),
                stdout: "ok".to_string(),
                stderr: String::new(),
            }))
        }
    }

    struct FixedHosts(Vec<DiscoveredHost>);

    #[async_trait]
    impl HostDiscovery for FixedHosts {
        async fn discover(&self) -> anyhow::Result<Vec<DiscoveredHost>> {
            Ok(self.0.clone())
        }
    }

    struct StalledDiscovery;

    #[async_trait]
    impl HostDiscovery for StalledDiscovery {
        async fn discover(&self) -> anyhow::Result<Vec<DiscoveredHost>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Vec::new())
        }
    }

    struct Harness {
        engine: Engine,
        planner: Arc<ScriptedPlanner>,
        runner: Arc<ScriptedRunner>,
        audit: UnboundedReceiver<AuditEvent>,
    }

    fn harness_with_store(
        planner: ScriptedPlanner,
        runner: ScriptedRunner,
        hosts: Vec<DiscoveredHost>,
        store: Arc<dyn TaskStore>,
    ) -> Harness {
        let context = ContextBuilder::new().with_discovery(Arc::new(FixedHosts(hosts)));
        harness_with(planner, runner, context, store)
    }

    fn harness_with(
        planner: ScriptedPlanner,
        runner: ScriptedRunner,
        context: ContextBuilder,
        store: Arc<dyn TaskStore>,
    ) -> Harness {
        let planner = Arc::new(planner);
        let runner = Arc::new(runner);
        let (audit, rx) = ChannelAudit::new();
        let engine = Engine::new(
            EngineConfig::default(),
            Collaborators {
                planner: planner.clone(),
                runner: runner.clone(),
                store,
                audit: Arc::new(audit),
                context,
            },
        )
        .unwrap();
        Harness {
            engine,
            planner,
            runner,
            audit: rx,
        }
    }

    fn harness(planner: ScriptedPlanner, runner: ScriptedRunner, hosts: Vec<DiscoveredHost>) -> Harness {
        harness_with_store(planner, runner, hosts, Arc::new(InMemoryTaskStore::new()))
    }

    fn names(events: &[EngineEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.event_name()).collect()
    }

    fn lobby_camera() -> Vec<DiscoveredHost> {
        vec![DiscoveredHost::new("10.0.0.5")
            .with_hostname("cam-lobby")
            .with_ports([554])]
    }

    /// Pauses at step 2 with a single candidate scored 5.
    async fn paused_task() -> (Harness, TaskId) {
        let h = harness(
            ScriptedPlanner::new(&[DISCOVER, BANNER]).with_fallback("nmap -sn 10.0.0.0/24"),
            ScriptedRunner::default(),
            lobby_camera(),
        );
        let id = h
            .engine
            .start("Assess the Hikvision camera over rtsp", false)
            .await
            .unwrap();
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::PausedForTarget);
        (h, id)
    }

    #[tokio::test]
    async fn test_confident_target_is_bound_autonomously() {
        let hosts = vec![
            DiscoveredHost::new("10.0.0.6").with_hostname("cam-2"),
            DiscoveredHost::new("10.0.0.5")
                .with_hostname("hikvision-cam")
                .with_vendor("Hangzhou Hikvision Digital Technology"),
        ];
        let h = harness(
            ScriptedPlanner::new(&[DISCOVER, BANNER]).with_commands(&["nmap -sn 10.0.0.0/24"]),
            ScriptedRunner::default(),
            hosts,
        );
        let id = h
            .engine
            .start("Assess the Hikvision camera for known weaknesses", false)
            .await
            .unwrap();
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::Completed);

        let task = h.engine.get(id).await.unwrap();
        assert_eq!(task.bound_target(), Some("10.0.0.5"));
        assert_eq!(task.step(2).unwrap().bound_target(), Some("10.0.0.5"));
        assert!(task.checkpoint().is_none());
        assert_eq!(
            h.runner.commands(),
            vec!["nmap -sn 10.0.0.0/24".to_string(), "curl -sI http://10.0.0.5/".to_string()]
        );

        let events = h.engine.events(id).await.unwrap();
        let confirmed = events
            .iter()
            .find_map(|e| match &e.kind {
                EventKind::TargetConfirmed {
                    target,
                    confidence,
                    manual,
                } => Some((target.clone(), *confidence, *manual)),
                _ => None,
            })
            .unwrap();
        assert_eq!(confirmed, ("10.0.0.5".to_string(), Some(9), false));
        assert_eq!(names(&events).last(), Some(&"steps_completed"));
    }

    #[tokio::test]
    async fn test_low_confidence_pauses_and_manual_target_wins() {
        let (h, id) = paused_task().await;

        let task = h.engine.get(id).await.unwrap();
        let checkpoint = task.pending_checkpoint().unwrap();
        assert_eq!(checkpoint.resume_from_step, 2);
        assert_eq!(checkpoint.confidence, 5);
        assert_eq!(checkpoint.candidates[0].ip, "10.0.0.5");
        assert_eq!(task.step(1).unwrap().status(), StepStatus::Completed);
        assert_eq!(task.step(2).unwrap().status(), StepStatus::Pending);
        // Nothing ran against a guessed target
        assert_eq!(h.runner.commands().len(), 1);

        let events = h.engine.events(id).await.unwrap();
        assert_eq!(names(&events).last(), Some(&"target_selection_required"));

        assert_eq!(h.engine.resume(id, "10.0.0.7", None).await.unwrap(), 2);
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::Completed);

        let task = h.engine.get(id).await.unwrap();
        assert_eq!(task.step(2).unwrap().bound_target(), Some("10.0.0.7"));
        assert_eq!(h.runner.commands().last().unwrap(), "curl -sI http://10.0.0.7/");

        // The checkpoint is spent
        assert!(matches!(
            h.engine.resume(id, "10.0.0.7", None).await,
            Err(EngineError::CheckpointConsumed(_))
        ));
    }

    #[tokio::test]
    async fn test_commands_must_address_the_chosen_target() {
        let h = harness(
            ScriptedPlanner::new(&[DISCOVER, "Enumerate services on the camera"])
                .with_commands(&["nmap -sn 10.0.0.0/24", "nmap -sV 10.0.0.5", "nmap -sV"])
                .with_fallback("nmap -sV 10.0.0.7"),
            ScriptedRunner::default(),
            lobby_camera(),
        );
        let id = h
            .engine
            .start("Assess the Hikvision camera over rtsp", false)
            .await
            .unwrap();
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::PausedForTarget);

        h.engine.resume(id, "10.0.0.7", None).await.unwrap();
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::Completed);

        // Neither the resolver's guess nor an unaddressed scan ever ran
        assert_eq!(
            h.runner.commands(),
            vec!["nmap -sn 10.0.0.0/24".to_string(), "nmap -sV 10.0.0.7".to_string()]
        );
        let task = h.engine.get(id).await.unwrap();
        assert_eq!(task.step(2).unwrap().attempts(), 3);

        let requests = h.planner.requests();
        let wrong_host = requests[2].rejection_reason.as_deref().unwrap();
        assert!(wrong_host.starts_with("mismatch: "));
        assert!(wrong_host.contains("10.0.0.5"));
        assert!(requests[3]
            .rejection_reason
            .as_deref()
            .unwrap()
            .contains("does not address"));
    }

    #[tokio::test]
    async fn test_pause_is_persisted() {
        let store = Arc::new(InMemoryTaskStore::new());
        let h = harness_with_store(
            ScriptedPlanner::new(&[BANNER]),
            ScriptedRunner::default(),
            lobby_camera(),
            store.clone(),
        );
        let id = h
            .engine
            .start("Assess the Hikvision camera over rtsp", false)
            .await
            .unwrap();
        h.engine.wait(id).await.unwrap();

        let stored = store.load(id).await.unwrap().unwrap();
        assert_eq!(stored.status(), &TaskStatus::PausedForTarget);
        assert_eq!(stored.pending_checkpoint().unwrap().resume_from_step, 1);
    }

    #[tokio::test]
    async fn test_resume_validation_keeps_checkpoint() {
        let (h, id) = paused_task().await;

        assert!(matches!(
            h.engine.resume(id, "not a host!", None).await,
            Err(EngineError::InvalidTarget(_))
        ));
        assert!(matches!(
            h.engine.resume(id, "10.0.0.7", Some(3)).await,
            Err(EngineError::InvalidResumeStep { requested: 3, max: 2 })
        ));
        assert!(matches!(
            h.engine.resume(TaskId::new(), "10.0.0.7", None).await,
            Err(EngineError::TaskNotFound(_))
        ));

        let task = h.engine.get(id).await.unwrap();
        assert_eq!(task.status(), &TaskStatus::PausedForTarget);
        assert!(task.pending_checkpoint().is_some());
    }

    #[tokio::test]
    async fn test_resume_from_earlier_step_redrives_it() {
        let (h, id) = paused_task().await;
        assert_eq!(h.engine.resume(id, "10.0.0.7", Some(1)).await.unwrap(), 1);
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::Completed);

        let commands = h.runner.commands();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0], commands[1]);
        assert_eq!(commands[2], "curl -sI http://10.0.0.7/");
    }

    #[tokio::test]
    async fn test_resume_requires_pause() {
        let h = harness(
            ScriptedPlanner::new(&[DISCOVER]).with_fallback("nmap -sn 10.0.0.0/24"),
            ScriptedRunner::default(),
            Vec::new(),
        );
        let id = h.engine.start("Map the network", false).await.unwrap();
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::Completed);
        assert!(matches!(
            h.engine.resume(id, "10.0.0.7", None).await,
            Err(EngineError::NotPaused(_))
        ));
        assert!(matches!(
            h.engine.cancel(id).await,
            Err(EngineError::AlreadyFinished(_))
        ));
    }

    #[tokio::test]
    async fn test_safety_rejection_blocks_without_running() {
        let mut h = harness(
            ScriptedPlanner::new(&["Clean up the scratch directory", DISCOVER])
                .with_commands(&["rm -rf /", "nmap -sn 10.0.0.0/24"]),
            ScriptedRunner::default(),
            Vec::new(),
        );
        let id = h.engine.start("Tidy up and map the network", false).await.unwrap();
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::Completed);

        let task = h.engine.get(id).await.unwrap();
        let blocked = task.step(1).unwrap();
        assert_eq!(blocked.status(), StepStatus::Blocked);
        assert_eq!(blocked.attempts(), 1);
        // A blocked step does not abort the task
        assert_eq!(task.step(2).unwrap().status(), StepStatus::Completed);
        assert_eq!(h.runner.commands(), vec!["nmap -sn 10.0.0.0/24".to_string()]);

        let first = h.audit.try_recv().unwrap();
        assert_eq!(first.decision, Decision::Rejected);
        assert_eq!(first.reason, "safety");

        let events = h.engine.events(id).await.unwrap();
        assert!(names(&events).contains(&"step_blocked"));
        match &events.last().unwrap().kind {
            EventKind::StepsCompleted {
                completed,
                failed,
                blocked,
            } => assert_eq!((*completed, *failed, *blocked), (1, 0, 1)),
            other => panic!("unexpected final event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bypass_runs_blacklisted_command_and_audits_once() {
        let mut h = harness(
            ScriptedPlanner::new(&["Clean up the scratch directory"]).with_commands(&["rm -rf /"]),
            ScriptedRunner::default(),
            Vec::new(),
        );
        let id = h.engine.start("Tidy up", true).await.unwrap();
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::Completed);
        assert_eq!(h.runner.commands(), vec!["rm -rf /".to_string()]);

        let event = h.audit.try_recv().unwrap();
        assert!(event.bypass);
        assert_eq!(event.decision, Decision::Accepted);
        assert_eq!(event.reason, "bypass");
        assert!(h.audit.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let h = harness(
            ScriptedPlanner::new(&[DISCOVER]).with_fallback("nmap -sn 10.0.0.0/24"),
            ScriptedRunner {
                always_fail: true,
                ..Default::default()
            },
            Vec::new(),
        );
        let id = h.engine.start("Map the network", false).await.unwrap();
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::Completed);

        let task = h.engine.get(id).await.unwrap();
        let step = task.step(1).unwrap();
        assert_eq!(step.status(), StepStatus::Failed);
        assert_eq!(step.attempts(), 3);
        assert_eq!(h.runner.commands().len(), 3);

        // Failure reasons are fed back into the next request
        let requests = h.planner.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].rejection_reason.is_none());
        assert!(requests[1]
            .rejection_reason
            .as_deref()
            .unwrap()
            .contains("exit code 1"));
        assert_eq!(requests[2].prior_attempts.len(), 2);
        assert!(requests[1]
            .rejection_reason
            .as_deref()
            .unwrap()
            .contains("connection_failed: "));
        assert_eq!(
            step.last_error().unwrap().category,
            Some(FailureCategory::ConnectionFailed)
        );

        let events = h.engine.events(id).await.unwrap();
        let kinds = names(&events);
        assert_eq!(kinds.iter().filter(|k| **k == "step_retry").count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == "step_failed").count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_stops_retrying() {
        let h = harness(
            ScriptedPlanner::new(&["Enumerate services on 10.0.0.5"]).with_fallback("nmap -sV 10.0.0.5"),
            ScriptedRunner {
                outputs: StdMutex::new(VecDeque::from([CommandOutput {
                    exit_status: Some(1),
                    stdout: "Note: Host seems down. If it is really up, try -Pn".to_string(),
                    stderr: String::new(),
                }])),
                ..Default::default()
            },
            Vec::new(),
        );
        let id = h.engine.start("Assess 10.0.0.5", false).await.unwrap();
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::Completed);

        let task = h.engine.get(id).await.unwrap();
        let step = task.step(1).unwrap();
        assert_eq!(step.status(), StepStatus::Failed);
        assert_eq!(step.attempts(), 1);
        assert_eq!(step.last_error().unwrap().category, Some(FailureCategory::Unreachable));
        assert_eq!(h.runner.commands().len(), 1);

        let events = h.engine.events(id).await.unwrap();
        assert!(events.iter().any(|e| matches!(
            e.kind,
            EventKind::StepFailed {
                category: Some(FailureCategory::Unreachable),
                ..
            }
        )));
        assert!(!names(&events).contains(&"step_retry"));
    }

    #[tokio::test]
    async fn test_planner_unavailable_for_command_fails_step() {
        let h = harness(ScriptedPlanner::new(&[DISCOVER]), ScriptedRunner::default(), Vec::new());
        let id = h.engine.start("Map the network", false).await.unwrap();
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::Completed);

        let step = h.engine.get(id).await.unwrap().step(1).unwrap().clone();
        assert_eq!(step.status(), StepStatus::Failed);
        assert_eq!(step.attempts(), 3);
        assert!(h.runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_planning_failure_fails_task() {
        let h = harness(
            ScriptedPlanner::failing(PlannerError::Unparsable("prose".to_string())),
            ScriptedRunner::default(),
            Vec::new(),
        );
        let id = h.engine.start("Map the network", false).await.unwrap();
        match h.engine.wait(id).await.unwrap() {
            TaskStatus::Failed { reason } => assert!(reason.starts_with("planning failed")),
            other => panic!("unexpected status {:?}", other),
        }
        let events = h.engine.events(id).await.unwrap();
        assert_eq!(names(&events), vec!["task_failed"]);
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_command() {
        let h = harness(
            ScriptedPlanner::new(&[DISCOVER, DISCOVER]).with_fallback("nmap -sn 10.0.0.0/24"),
            ScriptedRunner {
                hang: true,
                ..Default::default()
            },
            Vec::new(),
        );
        let id = h.engine.start("Map the network", false).await.unwrap();

        for _ in 0..200 {
            if !h.runner.commands().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.engine.cancel(id).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), h.engine.wait(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            status,
            TaskStatus::Failed {
                reason: "cancelled".to_string()
            }
        );
        let task = h.engine.get(id).await.unwrap();
        assert_eq!(task.step(1).unwrap().status(), StepStatus::Failed);
        assert_eq!(task.step(2).unwrap().status(), StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_during_host_discovery() {
        let h = harness_with(
            ScriptedPlanner::new(&[DISCOVER]),
            ScriptedRunner::default(),
            ContextBuilder::new().with_discovery(Arc::new(StalledDiscovery)),
            Arc::new(InMemoryTaskStore::new()),
        );
        let id = h.engine.start("Map the network", false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.engine.cancel(id).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), h.engine.wait(id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            status,
            TaskStatus::Failed {
                reason: "cancelled".to_string()
            }
        );
        assert!(h.engine.get(id).await.unwrap().steps().is_empty());
        assert!(h.planner.requests().is_empty());
        assert!(h.runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_paused_task_discards_checkpoint() {
        let (h, id) = paused_task().await;
        h.engine.cancel(id).await.unwrap();

        let task = h.engine.get(id).await.unwrap();
        assert!(matches!(task.status(), TaskStatus::Failed { .. }));
        assert!(task.checkpoint().is_none());
        assert!(matches!(
            h.engine.resume(id, "10.0.0.7", None).await,
            Err(EngineError::NotPaused(_))
        ));
    }

    #[tokio::test]
    async fn test_step_events_are_ordered() {
        let h = harness(
            ScriptedPlanner::new(&[DISCOVER, "Enumerate services on 10.0.0.5", "Fetch http://10.0.0.5/"])
                .with_commands(&["nmap -sn 10.0.0.0/24", "nmap -sV 10.0.0.5", "nmap -p 80 10.0.0.5"])
                .with_fallback("curl -s http://10.0.0.5/"),
            ScriptedRunner::default(),
            Vec::new(),
        );
        let id = h
            .engine
            .start("Assess 10.0.0.5 for known weaknesses", false)
            .await
            .unwrap();
        assert_eq!(h.engine.wait(id).await.unwrap(), TaskStatus::Completed);

        let events = h.engine.events(id).await.unwrap();
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64 + 1);
        }
        for k in 1..3u32 {
            let terminal = events
                .iter()
                .position(|e| e.step_number == Some(k) && e.kind.is_step_terminal())
                .unwrap();
            let next = events.iter().position(|e| e.step_number == Some(k + 1)).unwrap();
            assert!(terminal < next, "step {} events interleave with step {}", k, k + 1);
        }

        // Third scanner in a row was pushed to another family
        let task = h.engine.get(id).await.unwrap();
        assert_eq!(task.step(3).unwrap().last_command(), Some("curl -s http://10.0.0.5/"));
        assert_eq!(task.step(3).unwrap().attempts(), 2);
    }

    #[tokio::test]
    async fn test_recover_reloads_paused_and_fails_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileTaskStore::new(dir.path().to_path_buf()).await.unwrap());

        let running = Task::new("Map the network", false).unwrap();
        store.save(&running).await.unwrap();

        let mut paused = Task::new("Assess the lobby camera", false).unwrap();
        paused
            .set_plan(
                String::new(),
                vec![Step::new(1, "Grab the RTSP banner from TARGET_IP", None, true).unwrap()],
            )
            .unwrap();
        let cp = ExecutionCheckpoint::new(paused.id(), 1, ContextSnapshot::default(), Vec::new(), 0);
        paused.pause_for_target(cp).unwrap();
        store.save(&paused).await.unwrap();

        let h = harness_with_store(
            ScriptedPlanner::new(&[]).with_fallback("nc -vz 10.0.0.9 554"),
            ScriptedRunner::default(),
            Vec::new(),
            store.clone(),
        );
        assert_eq!(h.engine.recover().await.unwrap(), 2);
        assert_eq!(h.engine.list().await.len(), 2);

        assert_eq!(
            h.engine.get(running.id()).await.unwrap().status(),
            &TaskStatus::Failed {
                reason: "interrupted".to_string()
            }
        );
        let persisted = store.load(running.id()).await.unwrap().unwrap();
        assert!(persisted.status().is_terminal());

        assert_eq!(h.engine.resume(paused.id(), "10.0.0.9", None).await.unwrap(), 1);
        assert_eq!(h.engine.wait(paused.id()).await.unwrap(), TaskStatus::Completed);
        assert_eq!(h.runner.commands(), vec!["nc -vz 10.0.0.9 554".to_string()]);
    }

    #[tokio::test]
    async fn test_blank_objective_is_rejected() {
        let h = harness(ScriptedPlanner::new(&[DISCOVER]), ScriptedRunner::default(), Vec::new());
        assert!(matches!(
            h.engine.start("   ", false).await,
            Err(EngineError::Task(TaskError::EmptyDescription))
        ));
    }
}
