//! Decision gates: ask the reasoning service, route on its answer

use crate::clients::DecisionClient;
use crate::executor::{bounded, StepContext, StepError, StepExecutor, StepOutcome};
use crate::template::StepDefinition;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Risk attached to a decision or approval
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    #[default]
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

/// Structured answer from the reasoning service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub decision: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub risk_level: RiskLevel,
}

/// Parse a raw answer. The first JSON object carrying a `decision` field wins,
/// so prose or code fences around it are tolerated.
pub fn parse_decision(raw: &str) -> Result<Decision, String> {
    for (start, _) in raw.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&raw[start..]).into_iter::<Decision>();
        if let Some(Ok(decision)) = stream.next() {
            if !decision.decision.trim().is_empty() {
                return Ok(decision);
            }
        }
    }

    Err(format!(
        "no decision object in answer: {}",
        raw.chars().take(200).collect::<String>()
    ))
}

/// Where a decision sends the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route<'a> {
    /// `on_decision` names the decision
    Mapped(&'a str),
    /// Unmapped decision sent to `fail_safe` or `on_failure`
    FailSafe(&'a str),
    /// Unmapped and no fallback declared
    Unrouted,
}

/// Map a decision through `on_decision`: exact key first, then a
/// case-insensitive match, then the fail-safe chain.
pub fn route_decision<'a>(step: &'a StepDefinition, decision: &str) -> Route<'a> {
    if let Some(target) = step.on_decision.get(decision) {
        return Route::Mapped(target);
    }

    let wanted = decision.trim();
    if let Some((_, target)) = step
        .on_decision
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(wanted))
    {
        return Route::Mapped(target);
    }

    match fallback_route(step) {
        Some(target) => Route::FailSafe(target),
        None => Route::Unrouted,
    }
}

/// `fail_safe`, then `on_failure`
pub fn fallback_route(step: &StepDefinition) -> Option<&str> {
    step.fail_safe_target().or(step.on_failure.as_deref())
}

/// Executes decision gates through a [`DecisionClient`]
pub struct DecisionGateExecutor {
    client: Arc<dyn DecisionClient>,
}

impl DecisionGateExecutor {
    pub fn new(client: Arc<dyn DecisionClient>) -> Self {
        Self { client }
    }

    fn prompt(payload: &Value) -> String {
        match payload.get("prompt").and_then(Value::as_str) {
            Some(prompt) => prompt.to_string(),
            None => payload.to_string(),
        }
    }
}

#[async_trait]
impl StepExecutor for DecisionGateExecutor {
    async fn execute(
        &self,
        step: &StepDefinition,
        ctx: StepContext,
    ) -> Result<StepOutcome, StepError> {
        let prompt = Self::prompt(&ctx.payload);

        let raw = bounded(&ctx, "decision call", async {
            self.client
                .ask(&prompt)
                .await
                .map_err(|e| StepError::Retryable(e.to_string()))
        })
        .await?;

        let decision = parse_decision(&raw).map_err(|e| {
            warn!(run_id = %ctx.run_id, step_id = %step.id, error = %e, "Unparsable decision");
            StepError::Retryable(e)
        })?;

        info!(
            run_id = %ctx.run_id,
            step_id = %step.id,
            decision = %decision.decision,
            risk_level = %decision.risk_level,
            "Decision received"
        );

        Ok(StepOutcome::Decided { decision })
    }
}
