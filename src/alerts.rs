use serde::{Deserialize, Serialize};

use crate::error::SlotError;

/// Conditions that can take the node out of rotation. The set is fixed; the
/// board stores one optional error per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    GenericPersistentError,
    TooManyConsecutiveJobAbortions,
    TooManyConsecutiveGpuJobFailures,
    JobProxyUnavailable,
    GpuCheckFailed,
}

pub const ALERT_KIND_COUNT: usize = 5;

impl AlertKind {
    pub const ALL: [AlertKind; ALERT_KIND_COUNT] = [
        AlertKind::GenericPersistentError,
        AlertKind::TooManyConsecutiveJobAbortions,
        AlertKind::TooManyConsecutiveGpuJobFailures,
        AlertKind::JobProxyUnavailable,
        AlertKind::GpuCheckFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::GenericPersistentError => "generic_persistent_error",
            AlertKind::TooManyConsecutiveJobAbortions => "too_many_consecutive_job_abortions",
            AlertKind::TooManyConsecutiveGpuJobFailures => {
                "too_many_consecutive_gpu_job_failures"
            }
            AlertKind::JobProxyUnavailable => "job_proxy_unavailable",
            AlertKind::GpuCheckFailed => "gpu_check_failed",
        }
    }

    /// Kinds that external operators may clear through the administrative
    /// interface. The rest are owned by their event streams.
    pub fn is_resettable(&self) -> bool {
        matches!(
            self,
            AlertKind::GpuCheckFailed
                | AlertKind::TooManyConsecutiveJobAbortions
                | AlertKind::TooManyConsecutiveGpuJobFailures
        )
    }

    fn index(&self) -> usize {
        match self {
            AlertKind::GenericPersistentError => 0,
            AlertKind::TooManyConsecutiveJobAbortions => 1,
            AlertKind::TooManyConsecutiveGpuJobFailures => 2,
            AlertKind::JobProxyUnavailable => 3,
            AlertKind::GpuCheckFailed => 4,
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AlertKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown alert kind: {s:?}"))
    }
}

/// Dense table of alert values. The board itself carries no lock; the manager
/// guards it together with the consecutive-failure counters so that
/// threshold checks and alert transitions are a single critical section.
#[derive(Debug, Default)]
pub struct AlertBoard {
    alerts: [Option<SlotError>; ALERT_KIND_COUNT],
}

impl AlertBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, kind: AlertKind, error: SlotError) {
        self.alerts[kind.index()] = Some(error);
    }

    /// Force-clears a single kind. Clearing an already-clear kind is a no-op.
    pub fn reset(&mut self, kind: AlertKind) {
        self.alerts[kind.index()] = None;
    }

    pub fn get(&self, kind: AlertKind) -> Option<&SlotError> {
        self.alerts[kind.index()].as_ref()
    }

    pub fn has_fatal(&self) -> bool {
        self.get(AlertKind::GenericPersistentError).is_some()
    }

    /// True when the node must stop advertising capacity. The GPU check alert
    /// only participates when the corresponding config flag is in effect.
    pub fn has_disabling_alert(&self, disable_jobs_on_gpu_check_failure: bool) -> bool {
        self.get(AlertKind::GenericPersistentError).is_some()
            || self.get(AlertKind::TooManyConsecutiveJobAbortions).is_some()
            || self
                .get(AlertKind::TooManyConsecutiveGpuJobFailures)
                .is_some()
            || self.get(AlertKind::JobProxyUnavailable).is_some()
            || (disable_jobs_on_gpu_check_failure
                && self.get(AlertKind::GpuCheckFailed).is_some())
    }

    /// Appends all raised alerts to `out`, in enum order.
    pub fn populate(&self, out: &mut Vec<SlotError>) {
        for alert in self.alerts.iter().flatten() {
            out.push(alert.clone());
        }
    }
}
