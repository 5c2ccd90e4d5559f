use crate::source::event::millis_to_datetime;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Fixed service name of load-balancer access-log records
pub const ALB_SERVICE: &str = "alb";
/// Fixed service name of deployment-orchestrator output
pub const CONTROL_PLANE_SERVICE: &str = "cd";
/// Fixed host name of deployment-orchestrator output
pub const CONTROL_PLANE_HOST: &str = "pulumi";

/// Provider-independent log record handed to the consumer.
///
/// `service` and `correlation_tag` may be empty when the source carries no
/// such information (access logs, orchestrator output).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalLogRecord {
    pub service: String,
    pub host: String,
    #[serde(rename = "etag")]
    pub correlation_tag: String,
    pub stderr: bool,
    pub message: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl CanonicalLogRecord {
    pub fn time(&self) -> Option<DateTime<Utc>> {
        millis_to_datetime(self.timestamp)
    }
}
