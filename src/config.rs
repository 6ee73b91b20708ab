use std::collections::HashMap;
use std::time::Duration;

use chrono::TimeDelta;
use fieldx::fxstruct;

use crate::policy::RetentionPolicy;
use crate::types::EventTable;

/// Hard cap applied to "unbounded" remote reads.
pub const MAX_TAKE_COUNT: usize = 1000;

/// Knobs of the read and refresh paths that are not about retention.
#[fxstruct(no_new, builder, get(copy))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTuning {
    /// The cache is authoritative only up to `end_time - freshness_delay`. Narrower queries are answered with nothing.
    #[fieldx(default(TimeDelta::minutes(1)))]
    freshness_delay: TimeDelta,

    /// How far behind the current window end every update starts fetching. Compensates for rows showing up in the
    /// remote store later than their logical timestamp.
    #[fieldx(default(TimeDelta::minutes(5)))]
    look_back: TimeDelta,

    /// A hydrate chunk returning fewer rows than this widens the next chunk.
    #[fieldx(default(100))]
    sparse_chunk_threshold: usize,
}

impl QueryTuning {
    pub fn standard() -> Self {
        Self {
            freshness_delay:        TimeDelta::minutes(1),
            look_back:              TimeDelta::minutes(5),
            sparse_chunk_threshold: 100,
        }
    }
}

/// Cadence and resilience of the background refresh loop.
#[fxstruct(no_new, builder, get(copy))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSettings {
    #[fieldx(default(Duration::from_secs(30)))]
    update_interval: Duration,

    /// How often per-cache item counts and process memory are reported.
    #[fieldx(default(Duration::from_secs(30 * 60)))]
    telemetry_interval: Duration,

    /// Additional attempts after the first failure of a hydrate or update.
    #[fieldx(default(2))]
    max_retries: u32,

    #[fieldx(default(Duration::from_secs(5)))]
    retry_delay: Duration,
}

impl RefreshSettings {
    pub fn standard() -> Self {
        Self {
            update_interval:    Duration::from_secs(30),
            telemetry_interval: Duration::from_secs(30 * 60),
            max_retries:        2,
            retry_delay:        Duration::from_secs(5),
        }
    }
}

/// Environment-specific decoration of logical table names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableNaming {
    prefix:        String,
    deployment_id: String,
}

impl TableNaming {
    pub fn new(prefix: impl Into<String>, deployment_id: impl Into<String>) -> Self {
        Self {
            prefix:        prefix.into(),
            deployment_id: deployment_id.into(),
        }
    }

    /// Physical name: prefix, then deployment id, then the logical name. Physical names therefore always end with the
    /// logical one.
    pub fn decorate(&self, logical: &str) -> String {
        format!("{}{}{}", self.prefix, self.deployment_id, logical)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }
}

/// Everything a registry needs besides its collaborators.
#[fxstruct(no_new, builder)]
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    #[fieldx(get, default(RetentionPolicy::standard()))]
    default_policy: RetentionPolicy,

    /// Per-table replacements of `default_policy`.
    #[fieldx(get, default(HashMap::new()))]
    policies: HashMap<EventTable, RetentionPolicy>,

    #[fieldx(get, default(QueryTuning::standard()))]
    tuning: QueryTuning,

    #[fieldx(get, default(RefreshSettings::standard()))]
    refresh: RefreshSettings,

    #[fieldx(get, default(TableNaming::default()))]
    naming: TableNaming,
}

impl RegistryConfig {
    pub fn standard() -> Self {
        Self {
            default_policy: RetentionPolicy::standard(),
            policies:       HashMap::new(),
            tuning:         QueryTuning::standard(),
            refresh:        RefreshSettings::standard(),
            naming:         TableNaming::default(),
        }
    }

    pub fn policy_for(&self, table: EventTable) -> RetentionPolicy {
        self.policies
            .get(&table)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }
}
