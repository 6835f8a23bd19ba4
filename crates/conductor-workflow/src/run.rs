//! Persisted run state: status machine, context, step states and history

use crate::template::WorkflowTemplate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Status of a workflow run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet scheduled
    Pending,
    /// At least one step is executing
    Running,
    /// Every in-flight step is blocked on a resource lease
    WaitingLock,
    /// Suspended on an approval gate
    WaitingApproval,
    /// Suspended on an external callback
    WaitingExternal,
    /// Paused by an operator; no new steps start
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::WaitingLock => "waiting_lock",
            RunStatus::WaitingApproval => "waiting_approval",
            RunStatus::WaitingExternal => "waiting_external",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| format!("unknown run status: {}", s))
    }
}

/// Status of a single step within a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    /// Failed transiently, waiting for the backoff before the next attempt
    Retrying,
    /// Suspended until a resume call arrives
    Waiting,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, StepStatus::Running | StepStatus::Retrying)
    }
}

/// Why a step is suspended
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitReason {
    Approval { request_id: String },
    External,
}

/// Mutable per-step bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepState {
    pub status: StepStatus,
    /// Number of executions started
    #[serde(default)]
    pub attempts: u32,
    /// Set when a routing decision selected this step
    #[serde(default)]
    pub activated: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub decision: Option<String>,
    #[serde(default)]
    pub wait: Option<WaitReason>,
    /// Output produced before suspending; merged with the resume payload
    #[serde(default)]
    pub interim_output: Option<Value>,
    /// Resource this step is currently polling for
    #[serde(default)]
    pub blocked_on: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl Default for StepState {
    fn default() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            activated: false,
            last_error: None,
            decision: None,
            wait: None,
            interim_output: None,
            blocked_on: None,
            started_at: None,
            finished_at: None,
            next_attempt_at: None,
        }
    }
}

/// A terminal step entry in the run history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step_id: String,
    pub outcome: StepStatus,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub decision: Option<String>,
}

/// Run input plus accumulated step outputs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RunContext {
    pub input: Map<String, Value>,
    /// Step outputs keyed by step id, written once
    #[serde(default)]
    pub steps: BTreeMap<String, Value>,
}

impl RunContext {
    pub fn new(input: Map<String, Value>) -> Self {
        Self {
            input,
            steps: BTreeMap::new(),
        }
    }

    /// Record a step output. Returns false if the step already has one.
    pub fn record_output(&mut self, step_id: &str, output: Value) -> bool {
        if self.steps.contains_key(step_id) {
            tracing::warn!(step_id = %step_id, "Ignoring second output for step");
            return false;
        }
        self.steps.insert(step_id.to_string(), output);
        true
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id)
    }

    /// Resolve a dotted path. `steps.*` and `input.*` address the two maps,
    /// anything else is looked up among the input keys.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;

        let mut current = match first {
            "steps" => {
                let step_id = segments.next()?;
                self.steps.get(step_id)?
            }
            "input" => {
                let key = segments.next()?;
                self.input.get(key)?
            }
            key => self.input.get(key)?,
        };

        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }
}

/// A single execution of a workflow template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRun {
    pub run_id: String,
    pub template_name: String,
    pub template_version: u32,
    pub context: RunContext,
    pub status: RunStatus,
    #[serde(default)]
    pub current_step_id: Option<String>,
    /// Step states keyed by step id
    pub steps: BTreeMap<String, StepState>,
    #[serde(default)]
    pub history: Vec<StepRecord>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Incremented on every checkpoint
    #[serde(default)]
    pub revision: u64,
}

impl WorkflowRun {
    /// Create a pending run for a template
    pub fn new(template: &WorkflowTemplate, input: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            template_name: template.name.clone(),
            template_version: template.version,
            context: RunContext::new(input),
            status: RunStatus::Pending,
            current_step_id: None,
            steps: template
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepState::default()))
                .collect(),
            history: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.steps.get(step_id)
    }

    fn step_mut(&mut self, step_id: &str) -> &mut StepState {
        self.steps.entry(step_id.to_string()).or_default()
    }

    /// Bump revision and timestamp before a checkpoint write
    pub fn touch(&mut self) {
        self.revision += 1;
        self.updated_at = Utc::now();
    }

    pub fn all_steps_terminal(&self) -> bool {
        self.steps.values().all(|s| s.status.is_terminal())
    }

    pub fn in_flight_count(&self) -> usize {
        self.steps.values().filter(|s| s.status.is_in_flight()).count()
    }

    /// Steps currently suspended, in step-id order
    pub fn waiting_steps(&self) -> Vec<(&str, &WaitReason)> {
        self.steps
            .iter()
            .filter(|(_, s)| s.status == StepStatus::Waiting)
            .filter_map(|(id, s)| s.wait.as_ref().map(|w| (id.as_str(), w)))
            .collect()
    }

    pub fn pending_approval(&self) -> Option<&str> {
        self.waiting_steps().into_iter().find_map(|(_, w)| match w {
            WaitReason::Approval { request_id } => Some(request_id.as_str()),
            WaitReason::External => None,
        })
    }

    pub fn activate(&mut self, step_id: &str) {
        self.step_mut(step_id).activated = true;
    }

    pub fn start_step(&mut self, step_id: &str) -> u32 {
        let state = self.step_mut(step_id);
        state.status = StepStatus::Running;
        state.attempts += 1;
        state.started_at = Some(Utc::now());
        state.next_attempt_at = None;
        state.blocked_on = None;
        let attempt = state.attempts;
        self.current_step_id = Some(step_id.to_string());
        attempt
    }

    /// Park a failed attempt until `next_at`. Attempts are counted on start.
    pub fn schedule_retry(&mut self, step_id: &str, error: String, next_at: DateTime<Utc>) -> u32 {
        let state = self.step_mut(step_id);
        state.status = StepStatus::Retrying;
        state.last_error = Some(error);
        state.next_attempt_at = Some(next_at);
        state.blocked_on = None;
        state.attempts
    }

    pub fn succeed_step(&mut self, step_id: &str, output: Value, decision: Option<String>) {
        self.context.record_output(step_id, output);
        let state = self.step_mut(step_id);
        state.status = StepStatus::Succeeded;
        state.finished_at = Some(Utc::now());
        state.decision = decision.clone();
        state.wait = None;
        state.interim_output = None;
        state.blocked_on = None;
        let attempts = state.attempts;
        self.push_history(step_id, StepStatus::Succeeded, attempts, None, decision);
    }

    pub fn fail_step(&mut self, step_id: &str, error: String) {
        let state = self.step_mut(step_id);
        state.status = StepStatus::Failed;
        state.finished_at = Some(Utc::now());
        state.last_error = Some(error.clone());
        state.wait = None;
        state.blocked_on = None;
        let attempts = state.attempts;
        self.push_history(step_id, StepStatus::Failed, attempts, Some(error), None);
    }

    pub fn skip_step(&mut self, step_id: &str) {
        let state = self.step_mut(step_id);
        state.status = StepStatus::Skipped;
        state.finished_at = Some(Utc::now());
        let attempts = state.attempts;
        self.push_history(step_id, StepStatus::Skipped, attempts, None, None);
    }

    pub fn suspend_step(&mut self, step_id: &str, wait: WaitReason, interim: Option<Value>) {
        let state = self.step_mut(step_id);
        state.status = StepStatus::Waiting;
        state.wait = Some(wait);
        state.interim_output = interim;
        state.blocked_on = None;
    }

    /// Put an interrupted step back in the ready pool (crash recovery)
    pub fn reset_step(&mut self, step_id: &str) {
        let state = self.step_mut(step_id);
        state.status = StepStatus::Pending;
        state.next_attempt_at = None;
        state.blocked_on = None;
    }

    pub fn set_blocked(&mut self, step_id: &str, resource: Option<String>) {
        if let Some(state) = self.steps.get_mut(step_id) {
            if state.status.is_in_flight() {
                state.blocked_on = resource;
            }
        }
    }

    fn push_history(
        &mut self,
        step_id: &str,
        outcome: StepStatus,
        attempts: u32,
        error: Option<String>,
        decision: Option<String>,
    ) {
        self.history.push(StepRecord {
            step_id: step_id.to_string(),
            outcome,
            attempts,
            timestamp: Utc::now(),
            error,
            decision,
        });
    }

    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn cancel(&mut self) {
        self.status = RunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Status implied by the step states. Terminal and paused runs keep theirs.
    pub fn derive_status(&self) -> RunStatus {
        if self.status.is_terminal() || self.status == RunStatus::Paused {
            return self.status;
        }

        let in_flight: Vec<&StepState> = self
            .steps
            .values()
            .filter(|s| s.status.is_in_flight())
            .collect();

        if !in_flight.is_empty() {
            let all_blocked = in_flight
                .iter()
                .all(|s| s.status == StepStatus::Running && s.blocked_on.is_some());
            return if all_blocked {
                RunStatus::WaitingLock
            } else {
                RunStatus::Running
            };
        }

        let waits: Vec<&WaitReason> = self.waiting_steps().into_iter().map(|(_, w)| w).collect();
        if waits.iter().any(|w| matches!(w, WaitReason::Approval { .. })) {
            RunStatus::WaitingApproval
        } else if !waits.is_empty() {
            RunStatus::WaitingExternal
        } else {
            RunStatus::Running
        }
    }

    /// Percentage of steps in a terminal state
    pub fn progress_percent(&self) -> f64 {
        if self.steps.is_empty() {
            return 100.0;
        }
        let done = self.steps.values().filter(|s| s.status.is_terminal()).count();
        (done as f64 / self.steps.len() as f64) * 100.0
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot::from(self)
    }
}

/// Read-only view of a run returned to callers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSnapshot {
    pub run_id: String,
    pub template_name: String,
    pub template_version: u32,
    pub status: RunStatus,
    pub current_step_id: Option<String>,
    pub context: RunContext,
    pub steps: BTreeMap<String, StepState>,
    pub history: Vec<StepRecord>,
    pub error: Option<String>,
    pub progress_percent: f64,
    pub pending_approval: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&WorkflowRun> for RunSnapshot {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            template_name: run.template_name.clone(),
            template_version: run.template_version,
            status: run.status,
            current_step_id: run.current_step_id.clone(),
            context: run.context.clone(),
            steps: run.steps.clone(),
            history: run.history.clone(),
            error: run.error.clone(),
            progress_percent: run.progress_percent(),
            pending_approval: run.pending_approval().map(str::to_string),
            created_at: run.created_at,
            updated_at: run.updated_at,
            completed_at: run.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{StepDefinition, WorkflowTemplate};
    use serde_json::json;

    fn template() -> WorkflowTemplate {
        WorkflowTemplate::new("deploy")
            .with_step(StepDefinition::agent("build", "builder"))
            .with_step(StepDefinition::approval("gate").depends_on(["build"]))
    }

    fn input(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_new_run_is_pending() {
        let run = WorkflowRun::new(&template(), input(json!({"env": "staging"})));

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.steps.len(), 2);
        assert!(run.steps.values().all(|s| s.status == StepStatus::Pending));
        assert_eq!(run.progress_percent(), 0.0);
    }

    #[test]
    fn test_context_lookup() {
        let mut ctx = RunContext::new(input(json!({"env": "staging", "regions": ["eu", "us"]})));
        ctx.record_output("build", json!({"artifact": {"sha": "abc"}}));

        assert_eq!(ctx.lookup("env"), Some(&json!("staging")));
        assert_eq!(ctx.lookup("input.env"), Some(&json!("staging")));
        assert_eq!(ctx.lookup("regions.1"), Some(&json!("us")));
        assert_eq!(ctx.lookup("steps.build.artifact.sha"), Some(&json!("abc")));
        assert_eq!(ctx.lookup("steps.missing"), None);
        assert_eq!(ctx.lookup("env.nested"), None);
    }

    #[test]
    fn test_outputs_are_write_once() {
        let mut ctx = RunContext::default();

        assert!(ctx.record_output("a", json!(1)));
        assert!(!ctx.record_output("a", json!(2)));
        assert_eq!(ctx.output("a"), Some(&json!(1)));
    }

    #[test]
    fn test_step_transitions_and_history() {
        let mut run = WorkflowRun::new(&template(), Map::new());

        assert_eq!(run.start_step("build"), 1);
        assert_eq!(run.derive_status(), RunStatus::Running);
        run.succeed_step("build", json!({"ok": true}), None);

        run.start_step("gate");
        run.suspend_step(
            "gate",
            WaitReason::Approval {
                request_id: "req-1".to_string(),
            },
            None,
        );

        assert_eq!(run.derive_status(), RunStatus::WaitingApproval);
        assert_eq!(run.pending_approval(), Some("req-1"));
        assert_eq!(run.history.len(), 1);
        assert_eq!(run.history[0].outcome, StepStatus::Succeeded);
        assert_eq!(run.progress_percent(), 50.0);
    }

    #[test]
    fn test_blocked_steps_report_waiting_lock() {
        let mut run = WorkflowRun::new(&template(), Map::new());
        run.start_step("build");
        run.set_blocked("build", Some("env:staging".to_string()));

        assert_eq!(run.derive_status(), RunStatus::WaitingLock);

        run.set_blocked("build", None);
        assert_eq!(run.derive_status(), RunStatus::Running);
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut run = WorkflowRun::new(&template(), Map::new());
        run.cancel();
        run.start_step("build");

        assert_eq!(run.derive_status(), RunStatus::Cancelled);
        assert!(run.is_terminal());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("waiting_approval".parse::<RunStatus>(), Ok(RunStatus::WaitingApproval));
        assert!("sleeping".parse::<RunStatus>().is_err());
        assert_eq!(RunStatus::WaitingLock.to_string(), "waiting_lock");
    }
}
