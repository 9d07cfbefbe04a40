use serde::Serialize;

use crate::errors::redact_message;
use crate::upstream::{Summary, UpstreamStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailLevel {
    Full,
    Basic,
    Minimal,
}

impl DetailLevel {
    pub fn parse(s: &str) -> Self {
        match s {
            "full" => DetailLevel::Full,
            "minimal" => DetailLevel::Minimal,
            _ => DetailLevel::Basic,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerDetail {
    pub name: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total: usize,
    pub ready: usize,
    pub loading: usize,
    pub failed: usize,
    pub awaiting_oauth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<ServerDetail>>,
}

pub fn detailed_health(
    config_loaded: bool,
    summary: &Summary,
    statuses: &[UpstreamStatus],
    level: DetailLevel,
) -> HealthReport {
    let status = if !config_loaded {
        HealthStatus::Unhealthy
    } else if summary.total == 0 || summary.ready < summary.total {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };

    let servers = match level {
        DetailLevel::Minimal => None,
        DetailLevel::Basic => Some(
            statuses
                .iter()
                .map(|s| ServerDetail {
                    name: s.name.clone(),
                    state: s.state.label().to_string(),
                    last_error: None,
                    retry_count: None,
                })
                .collect(),
        ),
        DetailLevel::Full => Some(
            statuses
                .iter()
                .map(|s| ServerDetail {
                    name: s.name.clone(),
                    state: s.state.label().to_string(),
                    last_error: match &s.state {
                        crate::upstream::LoadingState::Failed { cause } => {
                            Some(redact_message(cause))
                        }
                        _ => None,
                    },
                    retry_count: Some(s.retry_count),
                })
                .collect(),
        ),
    };

    HealthReport {
        status,
        total: summary.total,
        ready: summary.ready,
        loading: summary.loading,
        failed: summary.failed,
        awaiting_oauth: summary.awaiting_oauth,
        servers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_ready_is_healthy() {
        let summary = Summary {
            total: 2,
            ready: 2,
            loading: 0,
            failed: 0,
            awaiting_oauth: 0,
            cancelled: 0,
        };
        let report = detailed_health(true, &summary, &[], DetailLevel::Minimal);
        assert_eq!(report.status, HealthStatus::Healthy);
        assert!(report.servers.is_none());
    }

    #[test]
    fn config_not_loaded_is_unhealthy() {
        let summary = Summary::default();
        let report = detailed_health(false, &summary, &[], DetailLevel::Basic);
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn some_ready_is_degraded() {
        let summary = Summary {
            total: 2,
            ready: 1,
            loading: 1,
            failed: 0,
            awaiting_oauth: 0,
            cancelled: 0,
        };
        let report = detailed_health(true, &summary, &[], DetailLevel::Minimal);
        assert_eq!(report.status, HealthStatus::Degraded);
    }
}
