use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plan::PlanId;

/// Lifecycle state of a campaign.
///
/// `Canceling` is transient: it resolves to `Canceled` once every in-flight
/// child has settled. `Retrying` is supervised like `InProgress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Pending,
    InProgress,
    Canceling,
    Canceled,
    Succeeded,
    Failed,
    Retrying,
}

impl OrchestrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationState::Canceled
                | OrchestrationState::Succeeded
                | OrchestrationState::Failed
        )
    }
}

impl std::fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Canceling => write!(f, "canceling"),
            Self::Canceled => write!(f, "canceled"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
        }
    }
}

impl std::str::FromStr for OrchestrationState {
    type Err = UnknownOrchestrationValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "canceling" => Ok(Self::Canceling),
            "canceled" => Ok(Self::Canceled),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            other => Err(UnknownOrchestrationValue(other.to_string())),
        }
    }
}

/// Error returned when parsing an orchestration state or kind fails.
#[derive(Debug, thiserror::Error)]
#[error("unknown orchestration value: {0}")]
pub struct UnknownOrchestrationValue(pub String);

/// Kind of campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationKind {
    UpgradeRuntime,
    UpgradeCluster,
}

impl OrchestrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpgradeRuntime => "upgrade_runtime",
            Self::UpgradeCluster => "upgrade_cluster",
        }
    }
}

impl std::fmt::Display for OrchestrationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrchestrationKind {
    type Err = UnknownOrchestrationValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upgrade_runtime" => Ok(Self::UpgradeRuntime),
            "upgrade_cluster" => Ok(Self::UpgradeCluster),
            other => Err(UnknownOrchestrationValue(other.to_string())),
        }
    }
}

/// Selects the runtimes a campaign applies to.
///
/// An empty selector matches nothing; `all` short-circuits every other
/// criterion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetSelector {
    #[serde(default)]
    pub all: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtime_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plans: Vec<PlanId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shoot_globs: Vec<String>,
}

/// Days-of-week plus a time-of-day range gating child admission.
///
/// Outside the window no new children are released; children already in
/// progress continue. A window whose `start` is after `end` wraps past
/// midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleWindow {
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ScheduleWindow {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        if !self.days.contains(&now.weekday()) {
            return false;
        }
        let t = now.time();
        // Truncate to whole seconds so a window ending at 17:00:00 still
        // admits at 17:00:00.999.
        let t = NaiveTime::from_hms_opt(t.hour(), t.minute(), t.second()).unwrap_or(t);
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

/// How a campaign releases its children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    /// Wave size: the number of children allowed in flight at once.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleWindow>,
}

fn default_parallelism() -> usize {
    1
}

impl Default for StrategySpec {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            schedule: None,
        }
    }
}

/// Execution parameters of a campaign.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationParameters {
    pub targets: TargetSelector,
    #[serde(default)]
    pub strategy: StrategySpec,
    /// Runtime version upgrade-runtime campaigns move their targets to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
}

/// Aggregate counts of child operations, one bucket per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildCounters {
    pub pending: usize,
    pub in_progress: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl ChildCounters {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.succeeded + self.failed + self.canceled
    }

    /// No child is pending or in flight.
    pub fn settled(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }
}

/// A fleet-wide campaign producing many child operations.
///
/// Children back-reference the campaign through
/// `Operation::orchestration_id`; the relation lives in the stores, not in
/// either record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Orchestration {
    pub id: Uuid,
    pub kind: OrchestrationKind,
    pub state: OrchestrationState,
    pub description: String,
    pub parameters: OrchestrationParameters,
    #[serde(default)]
    pub counters: ChildCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency counter, bumped by the store on every update.
    pub version: i64,
}

impl Orchestration {
    pub fn new(kind: OrchestrationKind, parameters: OrchestrationParameters) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            kind,
            state: OrchestrationState::Pending,
            description: "orchestration created".to_string(),
            parameters,
            counters: ChildCounters::default(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}
