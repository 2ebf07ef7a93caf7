//! Arbiter Types - the shared data model for the gated pipeline runtime.
//!
//! Every runtime surface (store, ledger, pipeline, coordinator) speaks these
//! types. The crate is pure data: no IO, no async, no policy.

#![deny(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifiers ──────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);
impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn generate() -> Self {
        Self(format!("task-{}", uuid::Uuid::new_v4()))
    }
}
impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThoughtId(pub String);
impl ThoughtId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn generate() -> Self {
        Self(format!("thought-{}", uuid::Uuid::new_v4()))
    }
}
impl std::fmt::Display for ThoughtId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OccurrenceId(pub String);
impl OccurrenceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn generate() -> Self {
        Self(format!("occurrence-{}", uuid::Uuid::new_v4()))
    }
}
impl std::fmt::Display for OccurrenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Task ─────────────────────────────────────────────────────────────

/// Bounded ordinal priority. Higher claims first; it never preempts
/// in-flight work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const MAX: u8 = 10;

    /// Construct a priority, clamped to the valid range.
    pub fn new(value: u8) -> Self {
        Self(value.min(Self::MAX))
    }

    pub fn normal() -> Self {
        Self(5)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::normal()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Claimed,
    Active,
    Completed,
    Deferred,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Deferred | TaskStatus::Failed
        )
    }
}

/// Externally created unit of intent. The claim fields (`claimed_by`,
/// `lease_expires_at`) are the only cross-occurrence coordination state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<OccurrenceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Origin hint used when building context (e.g. a conversation channel).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// Number of thoughts already generated for this task.
    pub retry_count: u32,
}

impl Task {
    pub fn new(description: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: TaskId::generate(),
            description: description.into(),
            priority,
            status: TaskStatus::Queued,
            created_at: Utc::now(),
            claimed_by: None,
            lease_expires_at: None,
            channel_id: None,
            retry_count: 0,
        }
    }

    /// True when another occurrence holds an unexpired lease.
    pub fn has_live_claim(&self, now: DateTime<Utc>) -> bool {
        match (&self.claimed_by, self.lease_expires_at) {
            (Some(_), Some(expiry)) => expiry > now,
            _ => false,
        }
    }

    /// A task is claimable when queued with no live lease. Invariant: at
    /// most one non-expired claim at a time.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Queued => true,
            TaskStatus::Claimed | TaskStatus::Active => !self.has_live_claim(now),
            _ => false,
        }
    }
}

// ── Thought ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThoughtKind {
    Standard,
    FollowUp,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThoughtStatus {
    Pending,
    Processing,
    Completed,
    Errored,
    Deferred,
}

impl ThoughtStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ThoughtStatus::Completed | ThoughtStatus::Errored | ThoughtStatus::Deferred
        )
    }
}

/// Ordered pipeline stages. `SelectAction` is the only re-entrant stage
/// (via the bounded retry edge out of `PolicyCheck`); everything else moves
/// strictly forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    BuildContext,
    Evaluate,
    SelectAction,
    PolicyCheck,
    Commit,
    Fallback,
    Dispatch,
    Done,
    Errored,
}

impl PipelineStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Errored)
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::BuildContext => "build_context",
            PipelineStage::Evaluate => "evaluate",
            PipelineStage::SelectAction => "select_action",
            PipelineStage::PolicyCheck => "policy_check",
            PipelineStage::Commit => "commit",
            PipelineStage::Fallback => "fallback",
            PipelineStage::Dispatch => "dispatch",
            PipelineStage::Done => "done",
            PipelineStage::Errored => "errored",
        };
        write!(f, "{name}")
    }
}

/// One pipeline pass derived from a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Thought {
    pub id: ThoughtId,
    pub task_id: TaskId,
    pub kind: ThoughtKind,
    pub stage: PipelineStage,
    /// Retry depth. Starts at 0, incremented on each policy-rejection retry,
    /// never exceeds the configured maximum.
    pub depth: u32,
    pub status: ThoughtStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_action: Option<ActionKind>,
    /// Dispatch failures are reported here, not retried by the pipeline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_error: Option<String>,
}

impl Thought {
    pub fn new(task_id: TaskId, kind: ThoughtKind) -> Self {
        Self {
            id: ThoughtId::generate(),
            task_id,
            kind,
            stage: PipelineStage::BuildContext,
            depth: 0,
            status: ThoughtStatus::Pending,
            created_at: Utc::now(),
            final_action: None,
            dispatch_error: None,
        }
    }
}

// ── Actions ──────────────────────────────────────────────────────────

/// The bounded action vocabulary a candidate may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Speak,
    Tool,
    Observe,
    Memorize,
    Recall,
    Ponder,
    Defer,
    Reject,
    TaskComplete,
}

impl ActionKind {
    /// Terminal actions close the parent task; anything else leaves the
    /// task eligible for a follow-up thought.
    pub fn is_terminal_for_task(&self) -> bool {
        matches!(
            self,
            ActionKind::Defer | ActionKind::Reject | ActionKind::TaskComplete
        )
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionKind::Speak => "speak",
            ActionKind::Tool => "tool",
            ActionKind::Observe => "observe",
            ActionKind::Memorize => "memorize",
            ActionKind::Recall => "recall",
            ActionKind::Ponder => "ponder",
            ActionKind::Defer => "defer",
            ActionKind::Reject => "reject",
            ActionKind::TaskComplete => "task_complete",
        };
        write!(f, "{name}")
    }
}

// ── Evaluation ───────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationOutcome {
    Succeeded,
    Failed { reason: String },
    TimedOut,
}

impl EvaluationOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, EvaluationOutcome::Succeeded)
    }
}

/// Output of one evaluator for one thought. Immutable once recorded; order
/// in the result set follows evaluator registration order, not completion
/// order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub evaluator: String,
    pub verdict: serde_json::Value,
    /// Action this evaluator proposes, if it proposes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed_action: Option<ActionKind>,
    pub confidence: f64,
    pub flags: Vec<String>,
    pub latency_ms: u64,
    pub outcome: EvaluationOutcome,
}

impl EvaluationResult {
    pub fn failed(evaluator: impl Into<String>, reason: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            evaluator: evaluator.into(),
            verdict: serde_json::Value::Null,
            proposed_action: None,
            confidence: 0.0,
            flags: vec![],
            latency_ms,
            outcome: EvaluationOutcome::Failed {
                reason: reason.into(),
            },
        }
    }

    pub fn timed_out(evaluator: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            evaluator: evaluator.into(),
            verdict: serde_json::Value::Null,
            proposed_action: None,
            confidence: 0.0,
            flags: vec![],
            latency_ms,
            outcome: EvaluationOutcome::TimedOut,
        }
    }
}

/// Output of the action selector: exactly one per selection attempt.
/// Superseded attempts are retained, never deleted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CandidateAction {
    pub action: ActionKind,
    pub params: serde_json::Value,
    pub rationale: String,
    /// Zero-based selection attempt (equals the thought depth it was
    /// produced at).
    pub attempt: u32,
    /// Names of the evaluations this candidate was derived from.
    pub evaluation_refs: Vec<String>,
}

// ── Policy verdicts ──────────────────────────────────────────────────

/// Outcome of a single policy check.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub name: String,
    pub passed: bool,
    pub fatal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CheckOutcome {
    pub fn pass(name: impl Into<String>, fatal: bool) -> Self {
        Self {
            name: name.into(),
            passed: true,
            fatal,
            reason: None,
        }
    }

    pub fn fail(name: impl Into<String>, fatal: bool, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            fatal,
            reason: Some(reason.into()),
        }
    }
}

/// Aggregate policy-gate verdict for one candidate action. Immutable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub checks: Vec<CheckOutcome>,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    /// True when a failing check was marked fatal: retry must be skipped.
    pub fatal_failure: bool,
}

impl PolicyVerdict {
    /// Aggregate per-check outcomes: pass only if every check passed.
    pub fn from_checks(checks: Vec<CheckOutcome>) -> Self {
        let passed = checks.iter().all(|c| c.passed);
        let fatal_failure = checks.iter().any(|c| !c.passed && c.fatal);
        let rejection_reason = if passed {
            None
        } else {
            let reasons: Vec<String> = checks
                .iter()
                .filter(|c| !c.passed)
                .map(|c| {
                    format!(
                        "{}: {}",
                        c.name,
                        c.reason.as_deref().unwrap_or("rejected")
                    )
                })
                .collect();
            Some(reasons.join("; "))
        };
        Self {
            checks,
            passed,
            rejection_reason,
            fatal_failure,
        }
    }
}

// ── Audit ────────────────────────────────────────────────────────────

/// Payload of one committed pipeline decision.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditPayload {
    pub thought_id: ThoughtId,
    pub task_id: TaskId,
    pub action: ActionKind,
    pub params: serde_json::Value,
    pub verdict_summary: String,
    pub depth: u32,
    /// True when the committed action is the configured fallback.
    pub fallback: bool,
}

/// One signed, hash-chained audit record. Entry n's `previous_hash` must
/// equal entry n-1's `content_hash`; sequence numbers are 1-based and
/// gap-free.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: AuditPayload,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    /// Hex-encoded Ed25519 signature over the content hash bytes.
    pub signature: String,
    /// Key id of the signer, `agent-` + first 12 hex chars of the blake3
    /// hash of the public key.
    pub signer: String,
}

// ── Step events ──────────────────────────────────────────────────────

/// One structured event per stage transition. The schema is a stable
/// boundary contract for external observers; transport is not.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepEvent {
    pub stage: PipelineStage,
    pub thought_id: ThoughtId,
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl StepEvent {
    pub fn new(
        stage: PipelineStage,
        thought_id: ThoughtId,
        task_id: TaskId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            stage,
            thought_id,
            task_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ── Dispatch boundary ────────────────────────────────────────────────

/// Result of handing a finalized action to the external dispatch handler.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchResult {
    pub success: bool,
    pub detail: String,
}

// ── Configuration ────────────────────────────────────────────────────

/// Runtime configuration, constructed once at the composition root and
/// passed explicitly. No process-wide state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Identity of this runtime occurrence.
    pub occurrence_id: OccurrenceId,
    /// Maximum retry depth before the pipeline forces the fallback action.
    pub max_depth: u32,
    /// Minimum number of successful evaluations required to proceed.
    pub quorum: usize,
    pub evaluator_timeout_secs: u64,
    pub context_timeout_secs: u64,
    pub lease_ttl_secs: u64,
    pub worker_count: usize,
    /// Safe default action emitted on fatal rejection or depth exhaustion.
    pub fallback_action: ActionKind,
    /// Follow-up thoughts allowed per task before it is force-deferred.
    pub max_follow_ups: u32,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            occurrence_id: OccurrenceId::generate(),
            max_depth: 5,
            quorum: 1,
            evaluator_timeout_secs: 30,
            context_timeout_secs: 10,
            lease_ttl_secs: 300,
            worker_count: 4,
            fallback_action: ActionKind::Defer,
            max_follow_ups: 3,
        }
    }
}

impl ArbiterConfig {
    pub fn evaluator_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.evaluator_timeout_secs)
    }

    pub fn context_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.context_timeout_secs)
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs as i64)
    }
}
