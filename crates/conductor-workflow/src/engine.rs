//! Workflow engine with state machine and execution control
//!
//! Each non-terminal run has at most one driver task. The driver evaluates
//! the step graph, starts ready steps, and applies their results. Every
//! mutation of a run happens under that run's async mutex and is written to
//! the state store before the engine acts on it, so a restarted engine can
//! pick any run up from its last checkpoint.

use crate::approval::{ApprovalRequest, ApprovalStatus, ApprovalVerdict};
use crate::clients::{AgentClient, ApprovalClient, DecisionClient, LocalApprovalClient, UnconfiguredClient};
use crate::decision::{fallback_route, route_decision, Route};
use crate::events::{EventSink, WorkflowEvent};
use crate::executor::{ExecutorSet, StepContext, StepError, StepExecutor, StepOutcome, StepSignal};
use crate::lock::ResourceLockManager;
use crate::render::render_value;
use crate::run::{RunSnapshot, RunStatus, StepStatus, WaitReason, WorkflowRun};
use crate::store::{InMemoryStateStore, StateStore};
use crate::template::{LoadedTemplate, StepDefinition, StepKind, TemplateStore};
use crate::{Result, WorkflowError};
use chrono::Utc;
use conductor_core::EngineSettings;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound for agent calls, decision calls and lock waits without `timeout_seconds`
    pub default_step_timeout: Duration,
    /// Approval expiry when the gate declares none
    pub approval_expiry: Duration,
    /// Period of the expired-approval sweep
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            default_step_timeout: settings.default_step_timeout(),
            approval_expiry: settings.approval_expiry(),
            sweep_interval: settings.sweep_interval(),
        }
    }
}

/// Assembles a [`WorkflowEngine`] from its collaborators
pub struct EngineBuilder {
    templates: Arc<TemplateStore>,
    store: Arc<dyn StateStore>,
    locks: Arc<ResourceLockManager>,
    agents: Arc<dyn AgentClient>,
    decisions: Arc<dyn DecisionClient>,
    approvals: Arc<dyn ApprovalClient>,
    events: EventSink,
    config: EngineConfig,
    agent_executor: Option<Arc<dyn StepExecutor>>,
    decision_executor: Option<Arc<dyn StepExecutor>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            templates: Arc::new(TemplateStore::new()),
            store: Arc::new(InMemoryStateStore::new()),
            locks: Arc::new(ResourceLockManager::in_memory()),
            agents: Arc::new(UnconfiguredClient::new("agent")),
            decisions: Arc::new(UnconfiguredClient::new("decision")),
            approvals: Arc::new(LocalApprovalClient),
            events: EventSink::disabled(),
            config: EngineConfig::default(),
            agent_executor: None,
            decision_executor: None,
        }
    }

    pub fn templates(mut self, templates: Arc<TemplateStore>) -> Self {
        self.templates = templates;
        self
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn locks(mut self, locks: Arc<ResourceLockManager>) -> Self {
        self.locks = locks;
        self
    }

    pub fn agent_client(mut self, client: Arc<dyn AgentClient>) -> Self {
        self.agents = client;
        self
    }

    pub fn decision_client(mut self, client: Arc<dyn DecisionClient>) -> Self {
        self.decisions = client;
        self
    }

    pub fn approval_client(mut self, client: Arc<dyn ApprovalClient>) -> Self {
        self.approvals = client;
        self
    }

    pub fn events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the agent-call executor
    pub fn agent_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.agent_executor = Some(executor);
        self
    }

    /// Replace the decision-gate executor
    pub fn decision_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.decision_executor = Some(executor);
        self
    }

    pub fn build(self) -> WorkflowEngine {
        let mut executors = ExecutorSet::new(
            self.agents,
            self.decisions,
            self.approvals,
            self.store.clone(),
            self.locks.clone(),
            self.config.approval_expiry,
        );
        if let Some(executor) = self.agent_executor {
            executors = executors.with_agent_executor(executor);
        }
        if let Some(executor) = self.decision_executor {
            executors = executors.with_decision_executor(executor);
        }

        WorkflowEngine {
            templates: self.templates,
            store: self.store,
            locks: self.locks,
            executors: Arc::new(executors),
            events: self.events,
            config: Arc::new(self.config),
            active: Arc::new(DashMap::new()),
            guards: Arc::new(DashMap::new()),
        }
    }
}

/// Handle on a run's driver task
#[derive(Clone)]
struct ActiveRun {
    cancel: CancellationToken,
    wake: Arc<Notify>,
}

impl ActiveRun {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
        }
    }

    fn is(&self, other: &ActiveRun) -> bool {
        Arc::ptr_eq(&self.wake, &other.wake)
    }
}

/// What the driver does after a scheduling pass
enum Tick {
    /// Wait for a step result, a signal or a wake-up; optionally until a retry is due
    Wait(Option<Duration>),
    Exit,
}

/// Delay between attempts to reach a failing store while driving a run
struct StoreBackoff {
    next: Duration,
}

impl StoreBackoff {
    const INITIAL: Duration = Duration::from_millis(50);
    const MAX: Duration = Duration::from_secs(5);

    fn next(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(Self::MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = Self::INITIAL;
    }
}

impl Default for StoreBackoff {
    fn default() -> Self {
        Self {
            next: Self::INITIAL,
        }
    }
}

/// Result of one step attempt, returned from the step task
#[derive(Clone)]
struct StepCompletion {
    step_id: String,
    attempt: u32,
    result: std::result::Result<StepOutcome, StepError>,
}

/// A prepared attempt, spawned after the start checkpoint is written
struct Launch {
    step: StepDefinition,
    ctx: StepContext,
}

/// Workflow engine
#[derive(Clone)]
pub struct WorkflowEngine {
    templates: Arc<TemplateStore>,
    store: Arc<dyn StateStore>,
    locks: Arc<ResourceLockManager>,
    executors: Arc<ExecutorSet>,
    events: EventSink,
    config: Arc<EngineConfig>,
    /// Driver handles keyed by run id
    active: Arc<DashMap<String, ActiveRun>>,
    /// Single-writer mutex per run
    guards: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl WorkflowEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn locks(&self) -> &Arc<ResourceLockManager> {
        &self.locks
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a run of the latest version of a template
    pub async fn execute(&self, template_name: &str, context: Value) -> Result<String> {
        let loaded = self.templates.get(template_name)?;
        let input = loaded.template.validate_context(&context)?;

        let run = WorkflowRun::new(&loaded.template, input);
        self.store.create_run(&run).await?;

        info!(
            run_id = %run.run_id,
            template = %run.template_name,
            version = run.template_version,
            "Workflow run created"
        );
        self.events.emit(WorkflowEvent::RunCreated {
            run_id: run.run_id.clone(),
            template_name: run.template_name.clone(),
            template_version: run.template_version,
        });

        self.ensure_driver(&run.run_id);
        Ok(run.run_id)
    }

    pub async fn get_status(&self, run_id: &str) -> Result<RunSnapshot> {
        Ok(self.load(run_id).await?.snapshot())
    }

    pub async fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<RunSnapshot>> {
        Ok(self
            .store
            .list_runs(status)
            .await?
            .iter()
            .map(RunSnapshot::from)
            .collect())
    }

    /// Deliver an external signal to a suspended step
    pub async fn resume(&self, run_id: &str, payload: Value) -> Result<RunSnapshot> {
        let guard = self.run_guard(run_id);
        let _lock = guard.lock().await;

        let mut run = self.load(run_id).await?;

        if let Some(request_id) = payload.get("request_id").and_then(Value::as_str) {
            let request = self
                .store
                .load_approval(request_id)
                .await?
                .filter(|r| r.run_id == run_id)
                .ok_or_else(|| WorkflowError::ApprovalNotFound(request_id.to_string()))?;
            return self.resume_approval(&mut run, request, payload).await;
        }

        let waiting: Vec<(String, WaitReason)> = run
            .waiting_steps()
            .into_iter()
            .map(|(id, wait)| (id.to_string(), wait.clone()))
            .collect();

        let approval = waiting.iter().find_map(|(_, wait)| match wait {
            WaitReason::Approval { request_id } => Some(request_id.clone()),
            WaitReason::External => None,
        });
        if let Some(request_id) = approval {
            let request = self
                .store
                .load_approval(&request_id)
                .await?
                .ok_or_else(|| WorkflowError::ApprovalNotFound(request_id.clone()))?;
            return self.resume_approval(&mut run, request, payload).await;
        }

        if let Some((step_id, _)) = waiting.first() {
            return self.resume_external(&mut run, step_id, payload).await;
        }

        // Nothing waits: a repeated resume replays the last verdict
        let last_resolved = self
            .store
            .approvals_for_run(run_id)
            .await?
            .into_iter()
            .rev()
            .find(|r| {
                matches!(
                    r.status,
                    ApprovalStatus::Approved | ApprovalStatus::Rejected | ApprovalStatus::Expired
                )
            });
        match last_resolved {
            Some(request) => {
                debug!(run_id = %run_id, request_id = %request.request_id, "Replaying resolved approval");
                replay(&run, &request)
            }
            None => Err(invalid_state(&run, "waiting_approval or waiting_external")),
        }
    }

    /// Stop a run. In-flight executors are signalled and their results discarded.
    pub async fn cancel(&self, run_id: &str) -> Result<RunSnapshot> {
        let guard = self.run_guard(run_id);
        let _lock = guard.lock().await;

        let mut run = self.load(run_id).await?;
        if run.is_terminal() {
            return Err(invalid_state(&run, "a non-terminal status"));
        }

        info!(run_id = %run_id, status = %run.status, "Cancelling workflow run");
        run.cancel();
        self.finalize(&mut run).await?;
        Ok(run.snapshot())
    }

    /// Stop starting new steps. In-flight steps finish and are recorded.
    pub async fn pause(&self, run_id: &str) -> Result<RunSnapshot> {
        let guard = self.run_guard(run_id);
        let _lock = guard.lock().await;

        let mut run = self.load(run_id).await?;
        if !matches!(
            run.status,
            RunStatus::Pending | RunStatus::Running | RunStatus::WaitingLock
        ) {
            return Err(invalid_state(&run, "running"));
        }

        let from = run.status;
        run.status = RunStatus::Paused;
        self.save(&mut run).await?;
        self.emit_status_change(&run.run_id, from, RunStatus::Paused);
        info!(run_id = %run_id, "Workflow run paused");

        self.wake(run_id);
        Ok(run.snapshot())
    }

    pub async fn unpause(&self, run_id: &str) -> Result<RunSnapshot> {
        let snapshot = {
            let guard = self.run_guard(run_id);
            let _lock = guard.lock().await;

            let mut run = self.load(run_id).await?;
            if run.status != RunStatus::Paused {
                return Err(invalid_state(&run, "paused"));
            }

            run.status = RunStatus::Running;
            self.checkpoint(&mut run).await?;
            self.emit_status_change(&run.run_id, RunStatus::Paused, run.status);
            info!(run_id = %run_id, "Workflow run unpaused");
            run.snapshot()
        };

        self.ensure_driver(run_id);
        Ok(snapshot)
    }

    /// Reload every non-terminal run after a restart and restart its driver
    pub async fn recover(&self) -> Result<usize> {
        let runs = self.store.list_active_runs().await?;
        let mut recovered = 0;

        for run in runs {
            let run_id = run.run_id.clone();
            match self.recover_run(&run_id).await {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(e) => error!(run_id = %run_id, error = %e, "Failed to recover workflow run"),
            }
        }

        info!(recovered, "Workflow recovery finished");
        Ok(recovered)
    }

    async fn recover_run(&self, run_id: &str) -> Result<bool> {
        {
            let guard = self.run_guard(run_id);
            let _lock = guard.lock().await;

            let mut run = self.load(run_id).await?;
            if run.is_terminal() {
                return Ok(false);
            }

            let interrupted: Vec<String> = run
                .steps
                .iter()
                .filter(|(_, s)| s.status == StepStatus::Running)
                .map(|(id, _)| id.clone())
                .collect();
            for step_id in &interrupted {
                info!(run_id = %run_id, step_id = %step_id, "Re-queueing interrupted step");
                run.reset_step(step_id);
            }

            // Verdicts persisted before the run was checkpointed
            let loaded = self.template_for(&run)?;
            let pending: Vec<String> = run
                .waiting_steps()
                .into_iter()
                .filter_map(|(_, wait)| match wait {
                    WaitReason::Approval { request_id } => Some(request_id.clone()),
                    WaitReason::External => None,
                })
                .collect();
            for request_id in pending {
                if let Some(request) = self.store.load_approval(&request_id).await? {
                    if !request.status.is_open() && !run.is_terminal() {
                        info!(run_id = %run_id, step_id = %request.step_id, status = ?request.status, "Applying verdict recorded before restart");
                        self.apply_resolution(&mut run, &loaded, &request);
                    }
                }
            }

            if run.is_terminal() {
                self.finalize(&mut run).await?;
                return Ok(true);
            }
            self.checkpoint(&mut run).await?;

            let kept = self.locks.resume_keepers(run_id).await?;
            if kept > 0 {
                debug!(run_id = %run_id, leases = kept, "Resumed lease renewal");
            }
        }

        self.ensure_driver(run_id);
        Ok(true)
    }

    /// Expire open approval requests past their deadline
    pub async fn sweep_expired_approvals(&self) -> Result<usize> {
        let now = Utc::now();
        let mut candidates = self.store.list_approvals(Some(ApprovalStatus::Pending)).await?;
        candidates.extend(self.store.list_approvals(Some(ApprovalStatus::Created)).await?);

        let mut expired = 0;
        for request in candidates.into_iter().filter(|r| r.is_expired_at(now)) {
            let run_id = request.run_id.clone();
            {
                let guard = self.run_guard(&run_id);
                let _lock = guard.lock().await;

                let Some(request) = self.store.load_approval(&request.request_id).await? else {
                    continue;
                };
                if !request.is_expired_at(Utc::now()) {
                    continue;
                }

                let request = request.expire();
                self.store.save_approval(&request).await?;
                expired += 1;
                warn!(run_id = %run_id, request_id = %request.request_id, "Approval request expired");

                let Some(mut run) = self.store.load_run(&run_id).await? else {
                    continue;
                };
                if run.is_terminal() {
                    continue;
                }
                let loaded = self.template_for(&run)?;
                self.apply_resolution(&mut run, &loaded, &request);
                if run.is_terminal() {
                    self.finalize(&mut run).await?;
                    continue;
                }
                self.checkpoint(&mut run).await?;
            }
            self.ensure_driver(&run_id);
        }

        Ok(expired)
    }

    /// Periodically sweep expired approvals until `shutdown` fires
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let period = self.config.sweep_interval.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match engine.sweep_expired_approvals().await {
                    Ok(0) => {}
                    Ok(n) => info!(expired = n, "Expired approval requests swept"),
                    Err(e) => error!(error = %e, "Approval sweep failed"),
                }
            }
            debug!("Maintenance task stopped");
        })
    }

    /// Stop every driver without touching persisted state
    pub fn shutdown(&self) {
        for entry in self.active.iter() {
            entry.value().cancel.cancel();
        }
        self.active.clear();
        self.locks.stop_keepers();
        info!("Workflow engine stopped");
    }

    /// Number of runs with a live driver
    pub fn active_runs(&self) -> usize {
        self.active.len()
    }

    // ---- run state helpers ----

    fn run_guard(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.guards.entry(run_id.to_string()).or_default().clone()
    }

    async fn load(&self, run_id: &str) -> Result<WorkflowRun> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or_else(|| WorkflowError::RunNotFound(run_id.to_string()))
    }

    fn template_for(&self, run: &WorkflowRun) -> Result<Arc<LoadedTemplate>> {
        self.templates
            .get_version(&run.template_name, run.template_version)
    }

    async fn save(&self, run: &mut WorkflowRun) -> Result<()> {
        run.touch();
        self.store.save_run(run).await
    }

    /// Re-derive status from step states and persist
    async fn checkpoint(&self, run: &mut WorkflowRun) -> Result<()> {
        let next = run.derive_status();
        if next != run.status {
            self.emit_status_change(&run.run_id, run.status, next);
            debug!(run_id = %run.run_id, from = %run.status, to = %next, "Run status changed");
            run.status = next;
        }
        self.save(run).await
    }

    fn emit_status_change(&self, run_id: &str, from: RunStatus, to: RunStatus) {
        self.events.emit(WorkflowEvent::RunStatusChanged {
            run_id: run_id.to_string(),
            from,
            to,
        });
    }

    /// Persist a terminal run and release what it holds
    async fn finalize(&self, run: &mut WorkflowRun) -> Result<()> {
        self.save(run).await?;
        let run_id = run.run_id.clone();

        match run.status {
            RunStatus::Completed => {
                info!(run_id = %run_id, "Workflow run completed");
                self.events.emit(WorkflowEvent::RunCompleted {
                    run_id: run_id.clone(),
                });
            }
            RunStatus::Failed => {
                let error = run.error.clone().unwrap_or_default();
                error!(run_id = %run_id, error = %error, "Workflow run failed");
                self.events.emit(WorkflowEvent::RunFailed {
                    run_id: run_id.clone(),
                    error,
                });
            }
            _ => {
                info!(run_id = %run_id, "Workflow run cancelled");
                self.events.emit(WorkflowEvent::RunCancelled {
                    run_id: run_id.clone(),
                });
            }
        }

        if let Some(active) = self.active.get(&run_id).map(|a| a.value().clone()) {
            active.cancel.cancel();
        }

        self.release_holdings(&run_id).await
    }

    /// Drop the leases and open approval requests of a finished run
    async fn release_holdings(&self, run_id: &str) -> Result<()> {
        match self.locks.release_all(run_id).await {
            Ok(resources) if !resources.is_empty() => {
                self.events.emit(WorkflowEvent::LocksReleased {
                    run_id: run_id.to_string(),
                    resources,
                });
            }
            Ok(_) => {}
            Err(e) => warn!(run_id = %run_id, error = %e, "Failed to release leases"),
        }

        for request in self.store.approvals_for_run(run_id).await? {
            if !request.status.is_open() {
                continue;
            }
            let request = request.cancel();
            self.store.save_approval(&request).await?;
            self.events.emit(WorkflowEvent::ApprovalResolved {
                run_id: run_id.to_string(),
                step_id: request.step_id.clone(),
                request_id: request.request_id.clone(),
                status: request.status,
            });
        }

        Ok(())
    }

    // ---- routing ----

    fn complete_step(
        &self,
        run: &mut WorkflowRun,
        step: &StepDefinition,
        output: Value,
        decision: Option<String>,
    ) {
        run.succeed_step(&step.id, output, decision);
        if let Some(next) = &step.on_success {
            run.activate(next);
        }

        let attempts = run.step(&step.id).map(|s| s.attempts).unwrap_or_default();
        info!(run_id = %run.run_id, step_id = %step.id, attempts, "Step succeeded");
        self.events.emit(WorkflowEvent::StepSucceeded {
            run_id: run.run_id.clone(),
            step_id: step.id.clone(),
            attempts,
        });
    }

    /// Mark a step failed and follow its failure route, failing the run if there is none
    fn route_failure(&self, run: &mut WorkflowRun, step: &StepDefinition, error: String) {
        run.fail_step(&step.id, error.clone());

        let attempts = run.step(&step.id).map(|s| s.attempts).unwrap_or_default();
        warn!(run_id = %run.run_id, step_id = %step.id, attempts, error = %error, "Step failed");
        self.events.emit(WorkflowEvent::StepFailed {
            run_id: run.run_id.clone(),
            step_id: step.id.clone(),
            attempts,
            error: error.clone(),
        });

        let target = match step.kind {
            StepKind::DecisionGate { .. } => fallback_route(step),
            _ => step.on_failure.as_deref(),
        };

        match target {
            Some(target) => {
                info!(run_id = %run.run_id, step_id = %step.id, target = %target, "Routing step failure");
                run.activate(target);
            }
            None => run.fail(format!("step {} failed: {}", step.id, error)),
        }
    }

    /// Apply an approval verdict (or expiry) to the step waiting on it
    fn apply_resolution(
        &self,
        run: &mut WorkflowRun,
        loaded: &LoadedTemplate,
        request: &ApprovalRequest,
    ) {
        if !waits_on(run, request) {
            return;
        }
        let Some(step) = loaded.step(&request.step_id) else {
            return;
        };

        self.events.emit(WorkflowEvent::ApprovalResolved {
            run_id: run.run_id.clone(),
            step_id: step.id.clone(),
            request_id: request.request_id.clone(),
            status: request.status,
        });

        match request.status {
            ApprovalStatus::Approved => {
                let mut output = match request.response.clone() {
                    Some(Value::Object(map)) => map,
                    Some(Value::Null) | None => Map::new(),
                    Some(other) => {
                        let mut map = Map::new();
                        map.insert("response".to_string(), other);
                        map
                    }
                };
                output.insert("request_id".to_string(), json!(request.request_id));
                output.insert("status".to_string(), json!(request.status));
                self.complete_step(run, step, Value::Object(output), None);
            }
            ApprovalStatus::Rejected => {
                self.route_failure(run, step, format!("approval {} rejected", request.request_id));
            }
            ApprovalStatus::Expired => {
                self.route_failure(run, step, format!("approval {} expired", request.request_id));
            }
            ApprovalStatus::Created | ApprovalStatus::Pending | ApprovalStatus::Cancelled => {}
        }
    }

    async fn resume_approval(
        &self,
        run: &mut WorkflowRun,
        request: ApprovalRequest,
        payload: Value,
    ) -> Result<RunSnapshot> {
        let loaded = self.template_for(run)?;

        let request = match request.status {
            ApprovalStatus::Approved | ApprovalStatus::Rejected | ApprovalStatus::Expired => {
                // Either a duplicate, or the verdict was stored but the run was not
                if waits_on(run, &request) && !run.is_terminal() {
                    self.apply_resolution(run, &loaded, &request);
                    self.persist_after_resume(run).await?;
                }
                return replay(run, &request);
            }
            ApprovalStatus::Cancelled => {
                return Err(invalid_state(run, "waiting_approval"));
            }
            ApprovalStatus::Created | ApprovalStatus::Pending => request,
        };

        if !waits_on(run, &request) || run.is_terminal() {
            return Err(invalid_state(run, "waiting_approval"));
        }

        let request = if request.is_expired_at(Utc::now()) {
            warn!(run_id = %run.run_id, request_id = %request.request_id, "Resume arrived after approval expiry");
            request.expire()
        } else {
            let verdict = ApprovalVerdict::from_payload(&payload)?;
            request.resolve(verdict, payload)
        };

        // Verdict first, so a crash before the run checkpoint can be replayed
        self.store.save_approval(&request).await?;
        info!(
            run_id = %run.run_id,
            step_id = %request.step_id,
            request_id = %request.request_id,
            status = ?request.status,
            "Approval resolved"
        );

        self.apply_resolution(run, &loaded, &request);
        self.persist_after_resume(run).await?;
        replay(run, &request)
    }

    async fn resume_external(
        &self,
        run: &mut WorkflowRun,
        step_id: &str,
        payload: Value,
    ) -> Result<RunSnapshot> {
        let loaded = self.template_for(run)?;
        let step = loaded
            .step(step_id)
            .ok_or_else(|| WorkflowError::Storage(format!("step {} missing from template", step_id)))?;

        let interim = run.step(step_id).and_then(|s| s.interim_output.clone());
        let output = match (interim, payload) {
            (Some(Value::Object(mut base)), Value::Object(update)) => {
                base.extend(update);
                Value::Object(base)
            }
            (Some(base), Value::Null) => base,
            (_, payload) => payload,
        };

        info!(run_id = %run.run_id, step_id = %step_id, "External callback received");
        self.complete_step(run, step, output, None);
        self.persist_after_resume(run).await?;
        Ok(run.snapshot())
    }

    /// Persist a run after a resume mutated it and hand it back to a driver
    async fn persist_after_resume(&self, run: &mut WorkflowRun) -> Result<()> {
        if run.is_terminal() {
            return self.finalize(run).await;
        }
        self.checkpoint(run).await?;
        self.ensure_driver(&run.run_id);
        Ok(())
    }

    // ---- driver ----

    fn wake(&self, run_id: &str) {
        if let Some(active) = self.active.get(run_id) {
            active.wake.notify_one();
        }
    }

    /// Start a driver for the run unless one is already running
    fn ensure_driver(&self, run_id: &str) {
        match self.active.entry(run_id.to_string()) {
            Entry::Occupied(entry) => entry.get().wake.notify_one(),
            Entry::Vacant(entry) => {
                let active = ActiveRun::new();
                entry.insert(active.clone());

                let engine = self.clone();
                let run_id = run_id.to_string();
                tokio::spawn(async move { engine.drive(run_id, active).await });
            }
        }
    }

    /// Forget a driver handle. Called under the run guard.
    fn detach(&self, run_id: &str, active: &ActiveRun) {
        self.active.remove_if(run_id, |_, current| current.is(active));
    }

    async fn drive(self, run_id: String, active: ActiveRun) {
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let mut tasks: JoinSet<StepCompletion> = JoinSet::new();
        // Step results the store has not accepted yet, oldest first
        let mut unrecorded: VecDeque<StepCompletion> = VecDeque::new();
        let mut backoff = StoreBackoff::default();
        debug!(run_id = %run_id, "Driver started");

        loop {
            while let Some(completion) = unrecorded.front() {
                match self.apply_completion(&run_id, completion.clone()).await {
                    Ok(()) => {
                        unrecorded.pop_front();
                        backoff.reset();
                    }
                    Err(e) => {
                        warn!(run_id = %run_id, step_id = %completion.step_id, error = %e, "Step result still not recorded");
                        break;
                    }
                }
            }

            let wait = if !unrecorded.is_empty() {
                // Scheduling from a record that misses these results would misjudge the run
                Some(backoff.next())
            } else {
                match self.schedule(&run_id, &active, &mut tasks, &signal_tx).await {
                    Ok(Tick::Exit) => break,
                    Ok(Tick::Wait(wait)) => {
                        backoff.reset();
                        wait
                    }
                    Err(e) if !e.is_transient() && tasks.is_empty() => {
                        error!(run_id = %run_id, error = %e, "Scheduling pass failed, driver stopping");
                        break;
                    }
                    Err(e) => {
                        let delay = backoff.next();
                        error!(
                            run_id = %run_id,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Scheduling pass failed"
                        );
                        Some(delay)
                    }
                }
            };

            let timer_armed = wait.is_some();
            let timer = tokio::time::sleep(wait.unwrap_or(Duration::from_secs(3600)));

            tokio::select! {
                _ = active.cancel.cancelled() => {
                    debug!(run_id = %run_id, "Driver cancelled");
                    break;
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok(completion) => {
                        if let Err(e) = self.apply_completion(&run_id, completion.clone()).await {
                            if e.is_transient() {
                                warn!(run_id = %run_id, step_id = %completion.step_id, error = %e, "Failed to record step result, will retry");
                                unrecorded.push_back(completion);
                            } else {
                                error!(run_id = %run_id, step_id = %completion.step_id, error = %e, "Failed to record step result");
                            }
                        }
                    }
                    Err(e) => warn!(run_id = %run_id, error = %e, "Step task aborted"),
                },
                Some(signal) = signal_rx.recv() => {
                    if let Err(e) = self.apply_signal(&run_id, signal).await {
                        warn!(run_id = %run_id, error = %e, "Failed to record step signal");
                    }
                }
                _ = active.wake.notified() => {}
                _ = timer, if timer_armed => {}
            }
        }

        self.detach(&run_id, &active);
        tasks.abort_all();
        debug!(run_id = %run_id, "Driver stopped");
    }

    /// One scheduling pass: skip dead branches, finish the run or start ready steps
    async fn schedule(
        &self,
        run_id: &str,
        active: &ActiveRun,
        tasks: &mut JoinSet<StepCompletion>,
        signals: &mpsc::UnboundedSender<StepSignal>,
    ) -> Result<Tick> {
        let guard = self.run_guard(run_id);
        let _lock = guard.lock().await;

        let mut run = self.load(run_id).await?;
        if run.is_terminal() {
            self.detach(run_id, active);
            return Ok(Tick::Exit);
        }
        let loaded = self.template_for(&run)?;

        let mut launches = Vec::new();
        let mut dirty = false;

        loop {
            let eval = loaded.dag.evaluate(&run.steps);
            let mut changed = false;

            for step_id in &eval.skipped {
                debug!(run_id = %run_id, step_id = %step_id, "Step skipped");
                run.skip_step(step_id);
                self.events.emit(WorkflowEvent::StepSkipped {
                    run_id: run_id.to_string(),
                    step_id: step_id.clone(),
                });
                changed = true;
            }

            if run.all_steps_terminal() {
                run.complete();
                self.finalize(&mut run).await?;
                self.detach(run_id, active);
                return Ok(Tick::Exit);
            }

            if run.status == RunStatus::Paused {
                dirty |= changed;
                break;
            }

            let now = Utc::now();
            let due_retries: Vec<String> = run
                .steps
                .iter()
                .filter(|(_, s)| {
                    s.status == StepStatus::Retrying && s.next_attempt_at.map_or(true, |t| t <= now)
                })
                .map(|(id, _)| id.clone())
                .collect();
            let capacity = loaded
                .template
                .max_concurrency
                .saturating_sub(run.in_flight_count());
            let to_start: Vec<String> = due_retries
                .into_iter()
                .chain(eval.ready.into_iter().take(capacity))
                .collect();

            for step_id in to_start {
                let Some(step) = loaded.step(&step_id) else {
                    continue;
                };
                changed = true;
                let attempt = run.start_step(&step_id);

                match render_value(&step.payload, &run.context) {
                    Ok(payload) => {
                        info!(run_id = %run_id, step_id = %step_id, kind = step.kind.name(), attempt, "Step started");
                        self.events.emit(WorkflowEvent::StepStarted {
                            run_id: run_id.to_string(),
                            step_id: step_id.clone(),
                            attempt,
                        });
                        launches.push(self.prepare(&run, step, attempt, payload, active, signals));
                    }
                    Err(e) => {
                        let err = WorkflowError::TemplateRender {
                            step_id: step_id.clone(),
                            source: e,
                        };
                        self.route_failure(&mut run, step, err.to_string());
                        if run.is_terminal() {
                            self.finalize(&mut run).await?;
                            self.detach(run_id, active);
                            return Ok(Tick::Exit);
                        }
                    }
                }
            }

            dirty |= changed;
            if !changed {
                break;
            }
        }

        if dirty {
            self.checkpoint(&mut run).await?;
        }
        for launch in launches {
            self.spawn_step(tasks, launch);
        }

        let paused = run.status == RunStatus::Paused;
        let next_retry = if paused {
            None
        } else {
            run.steps
                .values()
                .filter(|s| s.status == StepStatus::Retrying)
                .filter_map(|s| s.next_attempt_at)
                .min()
        };

        if tasks.is_empty() && next_retry.is_none() {
            if !paused && run.waiting_steps().is_empty() {
                // No step can make progress and nothing is pending externally
                error!(run_id = %run_id, "Workflow run stalled");
                run.fail("no runnable steps remain");
                self.finalize(&mut run).await?;
            }
            debug!(run_id = %run_id, status = %run.status, "Driver idle, detaching");
            self.detach(run_id, active);
            return Ok(Tick::Exit);
        }

        let wait = next_retry.map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO));
        Ok(Tick::Wait(wait))
    }

    fn prepare(
        &self,
        run: &WorkflowRun,
        step: &StepDefinition,
        attempt: u32,
        payload: Value,
        active: &ActiveRun,
        signals: &mpsc::UnboundedSender<StepSignal>,
    ) -> Launch {
        let timeout = step
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_step_timeout);

        Launch {
            step: step.clone(),
            ctx: StepContext {
                run_id: run.run_id.clone(),
                step_id: step.id.clone(),
                attempt,
                payload,
                context: run.context.clone(),
                timeout,
                cancel: active.cancel.child_token(),
                signals: signals.clone(),
            },
        }
    }

    fn spawn_step(&self, tasks: &mut JoinSet<StepCompletion>, launch: Launch) {
        let executor = self.executors.for_kind(&launch.step.kind);
        let Launch { step, ctx } = launch;
        let step_id = ctx.step_id.clone();
        let attempt = ctx.attempt;

        tasks.spawn(async move {
            // Inner task so a panicking executor becomes a step failure
            let handle = tokio::spawn(async move { executor.execute(&step, ctx).await });
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(StepError::Fatal(format!("executor panicked: {}", e))),
            };
            StepCompletion {
                step_id,
                attempt,
                result,
            }
        });
    }

    async fn apply_completion(&self, run_id: &str, completion: StepCompletion) -> Result<()> {
        let guard = self.run_guard(run_id);
        let _lock = guard.lock().await;

        let mut run = self.load(run_id).await?;
        if run.is_terminal() {
            // A late attempt may have taken a lease or filed a ticket after the run ended
            if !matches!(completion.result, Err(StepError::Cancelled)) {
                debug!(run_id = %run_id, step_id = %completion.step_id, "Late step result for finished run");
                self.release_holdings(run_id).await?;
            }
            return Ok(());
        }

        let StepCompletion {
            step_id,
            attempt,
            result,
        } = completion;

        let current = run.step(&step_id).cloned().unwrap_or_default();
        if current.status != StepStatus::Running || current.attempts != attempt {
            debug!(run_id = %run_id, step_id = %step_id, attempt, "Discarding stale step result");
            return Ok(());
        }

        let loaded = self.template_for(&run)?;
        let step = loaded
            .step(&step_id)
            .ok_or_else(|| WorkflowError::Storage(format!("step {} missing from template", step_id)))?;

        match result {
            Ok(StepOutcome::Completed { output }) => {
                self.complete_step(&mut run, step, output, None);
            }
            Ok(StepOutcome::Decided { decision }) => {
                let route = route_decision(step, &decision.decision);
                let target = match route {
                    Route::Mapped(target) => Some(target.to_string()),
                    Route::FailSafe(target) => {
                        warn!(
                            run_id = %run_id,
                            step_id = %step_id,
                            decision = %decision.decision,
                            target = %target,
                            "Unmapped decision, taking fail-safe route"
                        );
                        Some(target.to_string())
                    }
                    Route::Unrouted => None,
                };

                self.events.emit(WorkflowEvent::DecisionMade {
                    run_id: run_id.to_string(),
                    step_id: step_id.clone(),
                    decision: decision.decision.clone(),
                    risk_level: decision.risk_level,
                    route: target.clone(),
                });

                match target {
                    Some(target) => {
                        let output = serde_json::to_value(&decision)?;
                        self.complete_step(&mut run, step, output, Some(decision.decision.clone()));
                        run.activate(&target);
                    }
                    None => {
                        let error = format!("decision `{}` has no route", decision.decision);
                        run.fail_step(&step_id, error.clone());
                        run.fail(format!("step {} failed: {}", step_id, error));
                    }
                }
            }
            Ok(StepOutcome::Suspended { output, wait }) => {
                if let WaitReason::Approval { request_id } = &wait {
                    self.events.emit(WorkflowEvent::ApprovalRequested {
                        run_id: run_id.to_string(),
                        step_id: step_id.clone(),
                        request_id: request_id.clone(),
                    });
                }
                info!(run_id = %run_id, step_id = %step_id, wait = ?wait, "Step suspended");
                run.suspend_step(&step_id, wait, output);
            }
            Err(StepError::Cancelled) => {
                debug!(run_id = %run_id, step_id = %step_id, "Step cancelled");
                return Ok(());
            }
            Err(e) if e.is_retryable() && step.retry.should_retry(current.attempts) => {
                let delay = step.retry.delay_for_attempt(current.attempts);
                let next_at = Utc::now() + crate::lock::chrono_ttl(delay);
                warn!(
                    run_id = %run_id,
                    step_id = %step_id,
                    attempt = current.attempts,
                    max_attempts = step.retry.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Step attempt failed, retrying"
                );
                self.events.emit(WorkflowEvent::StepRetrying {
                    run_id: run_id.to_string(),
                    step_id: step_id.clone(),
                    attempt: current.attempts,
                    error: e.to_string(),
                    delay_ms: delay.as_millis() as u64,
                });
                run.schedule_retry(&step_id, e.to_string(), next_at);
            }
            Err(e) => {
                self.route_failure(&mut run, step, e.to_string());
            }
        }

        if run.is_terminal() {
            return self.finalize(&mut run).await;
        }
        self.checkpoint(&mut run).await
    }

    async fn apply_signal(&self, run_id: &str, signal: StepSignal) -> Result<()> {
        let guard = self.run_guard(run_id);
        let _lock = guard.lock().await;

        let mut run = self.load(run_id).await?;
        if run.is_terminal() {
            return Ok(());
        }

        match signal {
            StepSignal::WaitingLock {
                step_id,
                resource,
                holder,
            } => {
                info!(run_id = %run_id, step_id = %step_id, resource = %resource, holder = %holder, "Waiting for resource lock");
                run.set_blocked(&step_id, Some(resource.clone()));
                self.events.emit(WorkflowEvent::LockWaiting {
                    run_id: run_id.to_string(),
                    step_id,
                    resource,
                    holder,
                });
            }
            StepSignal::LockAcquired { step_id, resource } => {
                run.set_blocked(&step_id, None);
                self.events.emit(WorkflowEvent::LockAcquired {
                    run_id: run_id.to_string(),
                    step_id,
                    resource,
                });
            }
        }

        self.checkpoint(&mut run).await
    }
}

fn invalid_state(run: &WorkflowRun, expected: &str) -> WorkflowError {
    WorkflowError::InvalidState {
        run_id: run.run_id.clone(),
        status: run.status,
        expected: expected.to_string(),
    }
}

/// Whether the request's step is suspended on this very request
fn waits_on(run: &WorkflowRun, request: &ApprovalRequest) -> bool {
    run.step(&request.step_id).is_some_and(|s| {
        s.status == StepStatus::Waiting
            && matches!(&s.wait, Some(WaitReason::Approval { request_id }) if *request_id == request.request_id)
    })
}

/// Outcome of a resume for an already-resolved request
fn replay(run: &WorkflowRun, request: &ApprovalRequest) -> Result<RunSnapshot> {
    match request.status {
        ApprovalStatus::Approved => Ok(run.snapshot()),
        ApprovalStatus::Rejected => Err(WorkflowError::ApprovalRejected(request.request_id.clone())),
        ApprovalStatus::Expired => Err(WorkflowError::ExpiredApproval(request.request_id.clone())),
        _ => Err(invalid_state(run, "waiting_approval")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{AgentResponse, ClientError};
    use crate::template::WorkflowTemplate;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl AgentClient for Echo {
        async fn invoke(
            &self,
            agent: &str,
            payload: &Value,
        ) -> std::result::Result<AgentResponse, ClientError> {
            Ok(AgentResponse::ok(json!({"agent": agent, "payload": payload})))
        }
    }

    fn engine(template: WorkflowTemplate) -> WorkflowEngine {
        let templates = Arc::new(TemplateStore::new());
        templates.register(template).unwrap();
        WorkflowEngine::builder()
            .templates(templates)
            .agent_client(Arc::new(Echo))
            .build()
    }

    async fn wait_for(engine: &WorkflowEngine, run_id: &str, status: RunStatus) -> RunSnapshot {
        for _ in 0..200 {
            let snapshot = engine.get_status(run_id).await.unwrap();
            if snapshot.status == status {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} never reached {}", run_id, status);
    }

    #[tokio::test]
    async fn test_linear_run_completes() {
        let engine = engine(
            WorkflowTemplate::new("linear")
                .with_step(StepDefinition::agent("a", "first").with_payload(json!({"env": "{{ env }}"})))
                .with_step(
                    StepDefinition::agent("b", "second")
                        .depends_on(["a"])
                        .with_payload(json!({"from": "{{ steps.a.agent }}"})),
                ),
        );

        let run_id = engine.execute("linear", json!({"env": "dev"})).await.unwrap();
        let snapshot = wait_for(&engine, &run_id, RunStatus::Completed).await;

        assert_eq!(snapshot.context.steps["a"]["payload"]["env"], "dev");
        assert_eq!(snapshot.context.steps["b"]["payload"]["from"], "first");
        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(snapshot.progress_percent, 100.0);
    }

    #[tokio::test]
    async fn test_unknown_template_and_bad_context() {
        let engine = engine(
            WorkflowTemplate::new("needs_env")
                .with_input(crate::template::InputSpec {
                    name: "env".to_string(),
                    required: true,
                    description: None,
                    default: None,
                })
                .with_step(StepDefinition::agent("a", "x")),
        );

        assert!(matches!(
            engine.execute("missing", json!({})).await,
            Err(WorkflowError::TemplateNotFound(_))
        ));
        assert!(matches!(
            engine.execute("needs_env", json!({})).await,
            Err(WorkflowError::InvalidContext(_))
        ));
        assert!(engine.list_runs(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_render_error_fails_run_without_retry() {
        let engine = engine(
            WorkflowTemplate::new("broken")
                .with_step(StepDefinition::agent("a", "x").with_payload(json!({"v": "{{ steps.nope.id }}"}))),
        );

        let run_id = engine.execute("broken", json!({})).await.unwrap();
        let snapshot = wait_for(&engine, &run_id, RunStatus::Failed).await;

        assert_eq!(snapshot.steps["a"].attempts, 1);
        assert!(snapshot.error.unwrap().contains("steps.nope.id"));
    }

    #[tokio::test]
    async fn test_cancel_terminal_run_is_invalid() {
        let engine = engine(WorkflowTemplate::new("one").with_step(StepDefinition::agent("a", "x")));

        let run_id = engine.execute("one", json!({})).await.unwrap();
        wait_for(&engine, &run_id, RunStatus::Completed).await;

        assert!(matches!(
            engine.cancel(&run_id).await,
            Err(WorkflowError::InvalidState { status: RunStatus::Completed, .. })
        ));
        assert!(matches!(
            engine.get_status("nope").await,
            Err(WorkflowError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resume_without_wait_is_invalid() {
        let engine = engine(WorkflowTemplate::new("one").with_step(StepDefinition::agent("a", "x")));

        let run_id = engine.execute("one", json!({})).await.unwrap();
        wait_for(&engine, &run_id, RunStatus::Completed).await;

        assert!(matches!(
            engine.resume(&run_id, json!({"approved": true})).await,
            Err(WorkflowError::InvalidState { .. })
        ));
    }
}
