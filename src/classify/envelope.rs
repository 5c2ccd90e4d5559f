//! Structured envelopes found inside raw log messages.

use serde::Deserialize;

/// Infrastructure lifecycle event (task/service state change) delivered as a
/// JSON message in the lifecycle log group.
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "detail-type", default)]
    pub detail_type: String,
    pub detail: LifecycleDetail,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleDetail {
    /// `service:<name>` for service tasks
    pub group: String,
    pub last_status: String,
    pub desired_status: String,
    pub stopped_reason: String,
    /// The deployment's correlation tag
    pub started_by: String,
    pub task_arn: String,
}

impl LifecycleEvent {
    pub fn parse(message: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(message)
    }

    pub fn service(&self) -> &str {
        self.detail
            .group
            .strip_prefix("service:")
            .unwrap_or(&self.detail.group)
    }

    /// Task id: the last path segment of the task ARN.
    pub fn host(&self) -> &str {
        self.detail
            .task_arn
            .rsplit('/')
            .next()
            .unwrap_or(&self.detail.task_arn)
    }

    pub fn correlation_tag(&self) -> &str {
        &self.detail.started_by
    }

    pub fn is_failure(&self) -> bool {
        !self.detail.stopped_reason.is_empty() && self.detail.last_status == "STOPPED"
    }

    /// One-line human summary, e.g. `Task State Change: RUNNING`.
    pub fn summary(&self) -> String {
        let mut text = if self.detail_type.is_empty() {
            "State change".to_string()
        } else {
            self.detail_type.clone()
        };
        if !self.detail.last_status.is_empty() {
            text.push_str(": ");
            text.push_str(&self.detail.last_status);
        }
        if !self.detail.desired_status.is_empty() && self.detail.desired_status != self.detail.last_status {
            text.push_str(" (desired ");
            text.push_str(&self.detail.desired_status);
            text.push(')');
        }
        if !self.detail.stopped_reason.is_empty() {
            text.push_str(" - ");
            text.push_str(&self.detail.stopped_reason);
        }
        text
    }
}

/// Log-router sidecar envelope wrapping one line of an application container.
#[derive(Debug, Clone, Deserialize)]
pub struct SidecarEnvelope {
    #[serde(default)]
    pub container_name: String,
    /// `stdout` or `stderr`
    #[serde(default)]
    pub source: String,
    pub log: String,
    #[serde(default)]
    pub ecs_task_arn: String,
}

impl SidecarEnvelope {
    pub fn parse(message: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(message)
    }

    pub fn task_id(&self) -> &str {
        self.ecs_task_arn.rsplit('/').next().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_event_fields() {
        let event = LifecycleEvent::parse(
            r#"{"detail-type":"ECS Task State Change","detail":{"group":"service:django","lastStatus":"STOPPED","desiredStatus":"STOPPED","stoppedReason":"Essential container in task exited","startedBy":"hg2xsgvsldqk","taskArn":"arn:aws:ecs:us-west-2:123:task/cluster/0f9e8d7c"}}"#,
        )
        .unwrap();

        assert_eq!(event.service(), "django");
        assert_eq!(event.host(), "0f9e8d7c");
        assert_eq!(event.correlation_tag(), "hg2xsgvsldqk");
        assert!(event.is_failure());
        assert_eq!(
            event.summary(),
            "ECS Task State Change: STOPPED - Essential container in task exited"
        );
    }

    #[test]
    fn test_sidecar_envelope() {
        let envelope = SidecarEnvelope::parse(
            r#"{"container_name":"app","source":"stderr","log":"boom","ecs_task_arn":"arn:aws:ecs:r:1:task/c/abc123"}"#,
        )
        .unwrap();
        assert_eq!(envelope.source, "stderr");
        assert_eq!(envelope.task_id(), "abc123");

        assert!(SidecarEnvelope::parse("plain text").is_err());
        assert!(SidecarEnvelope::parse(r#"{"container_name":"app"}"#).is_err());
    }
}
