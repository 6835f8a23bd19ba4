//! Workflow templates
//!
//! Declarative, versioned workflow definitions loaded from YAML or JSON and
//! cached in a [`TemplateStore`]. A loaded template is never mutated; a new
//! definition under the same name must carry a strictly greater version, and
//! older versions stay available so in-flight runs keep their graph.

use crate::{dag::WorkflowDag, retry::RetryPolicy, Result, WorkflowError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Declared run input
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Applied when the caller omits the input
    #[serde(default)]
    pub default: Option<Value>,
}

fn default_true() -> bool {
    true
}

/// What a resource lock step does
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockAction {
    #[default]
    Acquire,
    Release,
}

/// Behaviour when the resource is already leased by another run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPolicy {
    /// Poll until the lease frees up or the step times out
    #[default]
    Wait,
    /// Report contention immediately; the retry policy decides what happens next
    FailFast,
}

/// Step kind with kind-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    AgentCall {
        agent: String,
        /// Suspend after invocation until an external resume delivers the result
        #[serde(default)]
        await_callback: bool,
    },
    DecisionGate {
        /// Route for unmapped decisions and exhausted attempts
        #[serde(default)]
        fail_safe: Option<String>,
    },
    ApprovalGate {
        #[serde(default)]
        expires_in_seconds: Option<u64>,
        #[serde(default)]
        summary: Option<String>,
    },
    ResourceLock {
        resource: String,
        #[serde(default)]
        action: LockAction,
        #[serde(default)]
        ttl_seconds: Option<u64>,
        #[serde(default)]
        on_contention: ContentionPolicy,
    },
    Merge,
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::AgentCall { .. } => "agent_call",
            StepKind::DecisionGate { .. } => "decision_gate",
            StepKind::ApprovalGate { .. } => "approval_gate",
            StepKind::ResourceLock { .. } => "resource_lock",
            StepKind::Merge => "merge",
        }
    }
}

/// A single step in a workflow template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepDefinition {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Rendered against the run context before execution
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub on_success: Option<String>,
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub on_decision: BTreeMap<String, String>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            depends_on: Vec::new(),
            payload: Value::Null,
            retry: RetryPolicy::default(),
            timeout_seconds: None,
            on_success: None,
            on_failure: None,
            on_decision: BTreeMap::new(),
        }
    }

    pub fn agent(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::AgentCall {
                agent: agent.into(),
                await_callback: false,
            },
        )
    }

    pub fn decision(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::DecisionGate { fail_safe: None })
    }

    pub fn approval(id: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::ApprovalGate {
                expires_in_seconds: None,
                summary: None,
            },
        )
    }

    pub fn lock(id: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::ResourceLock {
                resource: resource.into(),
                action: LockAction::Acquire,
                ttl_seconds: None,
                on_contention: ContentionPolicy::Wait,
            },
        )
    }

    pub fn release(id: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::new(
            id,
            StepKind::ResourceLock {
                resource: resource.into(),
                action: LockAction::Release,
                ttl_seconds: None,
                on_contention: ContentionPolicy::Wait,
            },
        )
    }

    pub fn merge(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Merge)
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn on_success(mut self, step_id: impl Into<String>) -> Self {
        self.on_success = Some(step_id.into());
        self
    }

    pub fn on_failure(mut self, step_id: impl Into<String>) -> Self {
        self.on_failure = Some(step_id.into());
        self
    }

    pub fn route(mut self, decision: impl Into<String>, step_id: impl Into<String>) -> Self {
        self.on_decision.insert(decision.into(), step_id.into());
        self
    }

    /// Only meaningful on decision gates
    pub fn fail_safe(mut self, step_id: impl Into<String>) -> Self {
        if let StepKind::DecisionGate { fail_safe } = &mut self.kind {
            *fail_safe = Some(step_id.into());
        }
        self
    }

    /// Only meaningful on agent calls
    pub fn await_callback(mut self) -> Self {
        if let StepKind::AgentCall { await_callback, .. } = &mut self.kind {
            *await_callback = true;
        }
        self
    }

    /// Only meaningful on resource locks
    pub fn on_contention(mut self, policy: ContentionPolicy) -> Self {
        if let StepKind::ResourceLock { on_contention, .. } = &mut self.kind {
            *on_contention = policy;
        }
        self
    }

    /// Only meaningful on approval gates
    pub fn expires_in(mut self, seconds: u64) -> Self {
        if let StepKind::ApprovalGate {
            expires_in_seconds, ..
        } = &mut self.kind
        {
            *expires_in_seconds = Some(seconds);
        }
        self
    }

    pub fn fail_safe_target(&self) -> Option<&str> {
        match &self.kind {
            StepKind::DecisionGate { fail_safe } => fail_safe.as_deref(),
            _ => None,
        }
    }

    /// Every step this one can route to
    pub fn route_targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = Vec::new();
        targets.extend(self.on_success.as_deref());
        targets.extend(self.on_failure.as_deref());
        targets.extend(self.on_decision.values().map(String::as_str));
        targets.extend(self.fail_safe_target());
        targets.sort_unstable();
        targets.dedup();
        targets
    }

    pub fn is_merge(&self) -> bool {
        matches!(self.kind, StepKind::Merge)
    }
}

/// A declarative workflow definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowTemplate {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    /// Maximum steps of one run executing at the same time
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    pub steps: Vec<StepDefinition>,
}

fn default_version() -> u32 {
    1
}

fn default_max_concurrency() -> usize {
    1
}

impl WorkflowTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            description: None,
            inputs: Vec::new(),
            max_concurrency: default_max_concurrency(),
            steps: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Check structure and build the step graph
    pub fn validate(&self) -> Result<WorkflowDag> {
        if self.name.trim().is_empty() {
            return Err(WorkflowError::InvalidTemplate(
                "template name must not be empty".to_string(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(WorkflowError::InvalidTemplate(format!(
                "{}: max_concurrency must be at least 1",
                self.name
            )));
        }

        for step in &self.steps {
            if step.retry.max_attempts == 0 {
                return Err(WorkflowError::InvalidTemplate(format!(
                    "step {}: max_attempts must be at least 1",
                    step.id
                )));
            }
            match &step.kind {
                StepKind::DecisionGate { .. } if step.on_decision.is_empty() => {
                    return Err(WorkflowError::InvalidTemplate(format!(
                        "decision gate {} declares no on_decision routes",
                        step.id
                    )));
                }
                StepKind::ResourceLock { resource, .. } if resource.trim().is_empty() => {
                    return Err(WorkflowError::InvalidTemplate(format!(
                        "resource lock {} has an empty resource key",
                        step.id
                    )));
                }
                StepKind::AgentCall { agent, .. } if agent.trim().is_empty() => {
                    return Err(WorkflowError::InvalidTemplate(format!(
                        "agent call {} names no agent",
                        step.id
                    )));
                }
                _ => {}
            }
        }

        Ok(WorkflowDag::new(&self.steps)?)
    }

    /// Check a caller-supplied context against the declared inputs and apply defaults
    pub fn validate_context(&self, context: &Value) -> Result<Map<String, Value>> {
        let mut input = match context {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(WorkflowError::InvalidContext(format!(
                    "context must be a JSON object, got {}",
                    json_type(other)
                )))
            }
        };

        for spec in &self.inputs {
            if input.contains_key(&spec.name) {
                continue;
            }
            match &spec.default {
                Some(default) => {
                    input.insert(spec.name.clone(), default.clone());
                }
                None if spec.required => {
                    return Err(WorkflowError::InvalidContext(format!(
                        "missing required input `{}`",
                        spec.name
                    )));
                }
                None => {}
            }
        }

        Ok(input)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A validated template together with its step graph
#[derive(Debug)]
pub struct LoadedTemplate {
    pub template: WorkflowTemplate,
    pub dag: WorkflowDag,
}

impl LoadedTemplate {
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.dag.get_step(step_id)
    }
}

/// Listing entry for a template name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateSummary {
    pub name: String,
    pub latest_version: u32,
    pub versions: Vec<u32>,
    pub description: Option<String>,
    pub step_count: usize,
}

/// In-process cache of validated templates, keyed by name then version
#[derive(Debug, Default)]
pub struct TemplateStore {
    templates: RwLock<HashMap<String, BTreeMap<u32, Arc<LoadedTemplate>>>>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a template
    pub fn register(&self, template: WorkflowTemplate) -> Result<Arc<LoadedTemplate>> {
        let dag = template.validate()?;

        let mut templates = self.templates.write();
        let versions = templates.entry(template.name.clone()).or_default();

        if let Some((&latest, _)) = versions.iter().next_back() {
            if template.version <= latest {
                return Err(WorkflowError::TemplateConflict {
                    name: template.name.clone(),
                    version: template.version,
                });
            }
        }

        info!(
            template = %template.name,
            version = template.version,
            steps = template.steps.len(),
            "Registered workflow template"
        );

        let loaded = Arc::new(LoadedTemplate { template, dag });
        versions.insert(loaded.template.version, loaded.clone());
        Ok(loaded)
    }

    pub fn load_yaml_str(&self, source: &str) -> Result<Arc<LoadedTemplate>> {
        let template: WorkflowTemplate = serde_yaml::from_str(source)?;
        self.register(template)
    }

    pub fn load_json_str(&self, source: &str) -> Result<Arc<LoadedTemplate>> {
        let template: WorkflowTemplate = serde_json::from_str(source)?;
        self.register(template)
    }

    /// Load a single `.yaml`, `.yml` or `.json` file
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Arc<LoadedTemplate>> {
        let template = parse_file(path.as_ref())?;
        self.register(template)
    }

    /// Load every template file in a directory, lowest versions first
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<Vec<Arc<LoadedTemplate>>> {
        let dir = dir.as_ref();
        let mut parsed = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || template_format(&path).is_none() {
                debug!(path = %path.display(), "Skipping non-template file");
                continue;
            }
            parsed.push(parse_file(&path)?);
        }

        parsed.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));

        let loaded = parsed
            .into_iter()
            .map(|template| self.register(template))
            .collect::<Result<Vec<_>>>()?;

        info!(dir = %dir.display(), count = loaded.len(), "Loaded workflow templates");
        Ok(loaded)
    }

    /// Latest version of a template
    pub fn get(&self, name: &str) -> Result<Arc<LoadedTemplate>> {
        self.templates
            .read()
            .get(name)
            .and_then(|versions| versions.values().next_back().cloned())
            .ok_or_else(|| WorkflowError::TemplateNotFound(name.to_string()))
    }

    pub fn get_version(&self, name: &str, version: u32) -> Result<Arc<LoadedTemplate>> {
        self.templates
            .read()
            .get(name)
            .and_then(|versions| versions.get(&version).cloned())
            .ok_or_else(|| WorkflowError::TemplateNotFound(format!("{}@{}", name, version)))
    }

    pub fn list(&self) -> Vec<TemplateSummary> {
        let templates = self.templates.read();
        let mut summaries: Vec<TemplateSummary> = templates
            .iter()
            .filter_map(|(name, versions)| {
                let latest = versions.values().next_back()?;
                Some(TemplateSummary {
                    name: name.clone(),
                    latest_version: latest.template.version,
                    versions: versions.keys().copied().collect(),
                    description: latest.template.description.clone(),
                    step_count: latest.template.steps.len(),
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }
}

enum TemplateFormat {
    Yaml,
    Json,
}

fn template_format(path: &Path) -> Option<TemplateFormat> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => Some(TemplateFormat::Yaml),
        Some("json") => Some(TemplateFormat::Json),
        _ => None,
    }
}

fn parse_file(path: &Path) -> Result<WorkflowTemplate> {
    let format = template_format(path).ok_or_else(|| {
        WorkflowError::InvalidTemplate(format!(
            "{}: expected a .yaml, .yml or .json file",
            path.display()
        ))
    })?;
    let source = std::fs::read_to_string(path)?;

    Ok(match format {
        TemplateFormat::Yaml => serde_yaml::from_str(&source)?,
        TemplateFormat::Json => serde_json::from_str(&source)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DEPLOY_YAML: &str = r#"
name: deploy
version: 2
description: Staged deployment
inputs:
  - name: env
  - name: replicas
    required: false
    default: 2
steps:
  - id: build
    kind: agent_call
    agent: builder
    payload:
      target: "{{ env }}"
  - id: lock
    kind: resource_lock
    resource: "env:{{ env }}"
    depends_on: [build]
  - id: review
    kind: decision_gate
    depends_on: [lock]
    payload:
      prompt: "Ship {{ steps.build.image }}?"
    on_decision:
      ship: approve
      hold: abort
    fail_safe: abort
  - id: approve
    kind: approval_gate
    expires_in_seconds: 600
  - id: abort
    kind: agent_call
    agent: notifier
"#;

    #[test]
    fn test_parse_yaml_template() {
        let template: WorkflowTemplate = serde_yaml::from_str(DEPLOY_YAML).unwrap();

        assert_eq!(template.version, 2);
        assert_eq!(template.max_concurrency, 1);
        assert_eq!(template.steps.len(), 5);
        assert_eq!(
            template.steps[1].kind,
            StepKind::ResourceLock {
                resource: "env:{{ env }}".to_string(),
                action: LockAction::Acquire,
                ttl_seconds: None,
                on_contention: ContentionPolicy::Wait,
            }
        );
        assert_eq!(template.steps[2].fail_safe_target(), Some("abort"));
        assert_eq!(template.steps[2].route_targets(), vec!["abort", "approve"]);
        assert_eq!(template.steps[0].retry.max_attempts, 3);
    }

    #[test]
    fn test_parse_json_template() {
        let store = TemplateStore::new();
        let loaded = store
            .load_json_str(
                r#"{"name":"tiny","steps":[{"id":"a","kind":"agent_call","agent":"x"},{"id":"m","kind":"merge","depends_on":["a"]}]}"#,
            )
            .unwrap();

        assert_eq!(loaded.template.version, 1);
        assert!(loaded.step("m").unwrap().is_merge());
    }

    #[test]
    fn test_decision_gate_requires_routes() {
        let template = WorkflowTemplate::new("bad")
            .with_step(StepDefinition::decision("d"));

        assert!(matches!(
            template.validate(),
            Err(WorkflowError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let template = WorkflowTemplate::new("bad")
            .with_max_concurrency(0)
            .with_step(StepDefinition::agent("a", "x"));

        assert!(template.validate().is_err());
    }

    #[test]
    fn test_validate_context_applies_defaults() {
        let template: WorkflowTemplate = serde_yaml::from_str(DEPLOY_YAML).unwrap();

        let input = template.validate_context(&json!({"env": "staging"})).unwrap();
        assert_eq!(input["replicas"], json!(2));

        let err = template.validate_context(&json!({"replicas": 1})).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidContext(_)));

        let err = template.validate_context(&json!(["staging"])).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidContext(_)));
    }

    #[test]
    fn test_versions_must_increase() {
        let store = TemplateStore::new();
        let v1 = WorkflowTemplate::new("flow").with_step(StepDefinition::agent("a", "x"));

        store.register(v1.clone()).unwrap();
        assert!(matches!(
            store.register(v1.clone()),
            Err(WorkflowError::TemplateConflict { version: 1, .. })
        ));

        store.register(v1.with_version(3)).unwrap();
        assert_eq!(store.get("flow").unwrap().template.version, 3);
        assert_eq!(store.get_version("flow", 1).unwrap().template.version, 1);
        assert!(store.get_version("flow", 2).is_err());
        assert!(matches!(
            store.get("other"),
            Err(WorkflowError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn test_load_dir_orders_versions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a-deploy-v2.yaml"), DEPLOY_YAML).unwrap();
        std::fs::write(
            dir.path().join("b-deploy-v1.yml"),
            "name: deploy\nsteps:\n  - id: only\n    kind: agent_call\n    agent: x\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not a template").unwrap();

        let store = TemplateStore::new();
        let loaded = store.load_dir(dir.path()).unwrap();

        assert_eq!(loaded.len(), 2);
        let summaries = store.list();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].versions, vec![1, 2]);
        assert_eq!(summaries[0].latest_version, 2);
        assert_eq!(summaries[0].step_count, 5);
    }
}
