pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# LOGFAN CONFIGURATION
# =============================================================================
# Every section is optional; anything left out uses the defaults shown here.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/logfan/config.yml
#   3. /etc/logfan/config.yml
#
# Values may reference environment variables as $env{NAME}.

# =============================================================================
# TAIL
# =============================================================================
tail:
  # Batches buffered between source workers and the terminal
  queue_capacity: 100
  # How often local live tails look for new lines
  poll_interval: 1s
  # Wait between attempts to open a log group that does not exist yet
  not_found_retry_interval: 1s
  # How often the watched task's status is checked
  task_poll_interval: 1s
  # Grace period after the task stops, so its last lines still arrive
  task_stop_grace: 3s
  # Maximum events fetched per provider page
  page_limit: 1000

# =============================================================================
# CLASSIFIER
# =============================================================================
classifier:
  control_plane_prefix: defang-cd-
  lifecycle_suffix: /ecs
  sidecar_marker: -firelens-
  error_scan_container: kaniko
  # Records with an unknown service or deployment tag while that filter is
  # active: 'hide' drops them, 'show' always prints them
  unknown_fields: hide

# =============================================================================
# LOCAL LOG GROUPS
# =============================================================================
# Layout: <root>/<group>/<tenant>/<service>_<tag>/<host>
local:
  root: ~/.local/share/logfan/groups
  timestamp:
    # Regex must contain a named capture group 'ts' for the timestamp
    pattern: '^(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2}))\s'
    # Format: strftime format string, 'iso8601', 'epoch', or 'epoch_ms'
    format: iso8601

# =============================================================================
# LOAD-BALANCER ACCESS LOGS (optional)
# =============================================================================
# Required for s3://<bucket>/<prefix> groups. Objects are read from a local
# mirror laid out as <root>/<bucket>/<key>.
#
# access_logs:
#   root: ~/.local/share/logfan/buckets
#   listing_page_size: 1000

# =============================================================================
# DEFAULT GROUPS
# =============================================================================
# Tailed when no --group is given on the command line.
groups:
  - group: my-project
    # stream_prefix: web/
    # streams: []
    # filter_pattern: GET
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse::parse_config;

    #[test]
    fn test_starter_config_is_valid() {
        let config = parse_config(&generate_starter_config()).unwrap();
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.tail.task_stop_grace, std::time::Duration::from_secs(3));
        assert!(config.local.root.ends_with("logfan/groups"));
    }
}
