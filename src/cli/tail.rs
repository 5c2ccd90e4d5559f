use super::render::{OutputFormat, Renderer};
use crate::classify::filter::{Filter, UnknownFieldPolicy};
use crate::config::parse::ConfigError;
use crate::config::types::{parse_duration, Config};
use crate::config::load_or_default;
use crate::session::{SessionError, TailDeps, TailRequest, TailSession};
use crate::source::access_log::{is_access_log_group, AccessLogProvider, DirectoryObjectStore};
use crate::source::event::{now_millis, LogGroupHandle};
use crate::source::local::DirectoryProvider;
use crate::source::provider::{EventPage, LiveTail, LogProvider, PageRequest, ProviderError};
use crate::source::timestamp::{TimestampError, TimestampExtractor};
use async_trait::async_trait;
use chrono::DateTime;
use clap::Args;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum TailError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid timestamp settings: {0}")]
    Timestamp(#[from] TimestampError),

    #[error("invalid time '{0}': expected RFC 3339 or a duration such as 5m")]
    Time(String),

    #[error("--since must be earlier than --until")]
    EmptyWindow,

    #[error("no log groups: pass --group or list groups in the config file")]
    NoGroups,

    #[error("group '{0}' needs an access_logs section in the config file")]
    NoAccessLogs(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("output error: {0}")]
    Output(#[from] io::Error),
}

#[derive(Debug, Clone, Default, Args)]
pub struct TailArgs {
    /// Log group to tail (repeatable); `s3://bucket/prefix` reads access logs
    #[arg(long = "group")]
    pub groups: Vec<String>,

    /// Only streams whose name starts with this prefix
    #[arg(long)]
    pub stream_prefix: Option<String>,

    /// Only records of this deployment
    #[arg(long)]
    pub etag: Option<String>,

    /// Only records of this service (repeatable)
    #[arg(long = "service")]
    pub services: Vec<String>,

    /// Start of the window: RFC 3339 or a duration ago (e.g. 5m)
    #[arg(long)]
    pub since: Option<String>,

    /// End of the window: RFC 3339 or a duration ago
    #[arg(long)]
    pub until: Option<String>,

    /// Maximum number of historical events
    #[arg(long)]
    pub limit: Option<usize>,

    /// Keep streaming new events
    #[arg(short, long)]
    pub follow: bool,

    /// Show records with an unknown service or etag even when filtering on it
    #[arg(long)]
    pub show_unknown: bool,

    /// One JSON object per record
    #[arg(long)]
    pub json: bool,
}

pub async fn run(config_path: Option<PathBuf>, args: TailArgs) -> Result<(), TailError> {
    let config = load_or_default(config_path.as_deref())?;
    let request = build_request(&args, &config, now_millis())?;

    let deps = TailDeps {
        logs: Arc::new(GroupRouter::from_config(&config)?),
        tasks: None,
    };
    let mut session = TailSession::start(request, deps, config.tail.clone(), config.classifier.clone())?;

    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let mut renderer = Renderer::new(io::stdout(), format);
    let mut output_error = None;

    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let record = tokio::select! {
            biased;
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, stopping");
                break;
            }
            record = session.receive() => record,
        };

        let Some(record) = record else { break };
        if let Err(e) = renderer.render(&record) {
            output_error = Some(e);
            break;
        }
    }

    if let Err(e) = renderer.flush() {
        output_error.get_or_insert(e);
    }
    if let Err(e) = session.close().await {
        warn!(error = %e, "Some sources failed to close cleanly");
    }

    if let Some(e) = session.take_error() {
        return Err(e.into());
    }
    match output_error {
        Some(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e.into()),
        _ => Ok(()),
    }
}

/// Turn the command line and config into a session request.
pub fn build_request(args: &TailArgs, config: &Config, now: i64) -> Result<TailRequest, TailError> {
    let mut handles: Vec<LogGroupHandle> = if args.groups.is_empty() {
        config.groups.iter().map(|g| g.to_handle()).collect()
    } else {
        args.groups.iter().map(LogGroupHandle::new).collect()
    };
    if handles.is_empty() {
        return Err(TailError::NoGroups);
    }

    if let Some(prefix) = &args.stream_prefix {
        for handle in &mut handles {
            handle.stream_name_prefix = Some(prefix.clone());
        }
    }
    if config.access_logs.is_none() {
        if let Some(handle) = handles.iter().find(|h| is_access_log_group(&h.group_identifier)) {
            return Err(TailError::NoAccessLogs(handle.group_identifier.clone()));
        }
    }

    let since = args.since.as_deref().map(|t| parse_time(t, now)).transpose()?;
    let until = args.until.as_deref().map(|t| parse_time(t, now)).transpose()?;
    if let (Some(since), Some(until)) = (since, until) {
        if since >= until {
            return Err(TailError::EmptyWindow);
        }
    }

    let policy = if args.show_unknown {
        UnknownFieldPolicy::Show
    } else {
        config.classifier.unknown_fields
    };
    let mut filter = Filter::new()
        .with_services(args.services.iter().cloned())
        .with_unknown_fields(policy);
    if let Some(etag) = &args.etag {
        filter = filter.with_correlation_tag(etag.clone());
    }

    Ok(TailRequest {
        handles,
        filter,
        since,
        until,
        limit: args.limit,
        follow: args.follow,
        task: None,
    })
}

/// RFC 3339, or a duration before `now` (`5m` means five minutes ago).
pub fn parse_time(text: &str, now: i64) -> Result<i64, TailError> {
    if let Ok(time) = DateTime::parse_from_rfc3339(text) {
        return Ok(time.timestamp_millis());
    }
    let invalid = || TailError::Time(text.to_string());
    let ago = parse_duration(text).map_err(|_| invalid())?;
    let ago = i64::try_from(ago.as_millis()).map_err(|_| invalid())?;
    now.checked_sub(ago).ok_or_else(invalid)
}

/// Sends `s3://` groups to the access-log adapter and everything else to the
/// local directory adapter.
pub struct GroupRouter {
    local: DirectoryProvider,
    access_logs: Option<AccessLogProvider<DirectoryObjectStore>>,
}

impl GroupRouter {
    pub fn from_config(config: &Config) -> Result<Self, TailError> {
        let extractor = TimestampExtractor::new(
            &config.local.timestamp.pattern,
            &config.local.timestamp.format,
        )?;
        let local = DirectoryProvider::new(config.local.root.clone(), extractor)
            .with_poll_interval(config.tail.poll_interval);

        let access_logs = config.access_logs.as_ref().map(|settings| {
            AccessLogProvider::new(
                DirectoryObjectStore::new(settings.root.clone()).with_page_size(settings.listing_page_size),
            )
        });

        Ok(Self { local, access_logs })
    }

    fn route(&self, handle: &LogGroupHandle) -> Result<&dyn LogProvider, ProviderError> {
        if !is_access_log_group(&handle.group_identifier) {
            return Ok(&self.local);
        }
        match &self.access_logs {
            Some(provider) => Ok(provider),
            None => Err(ProviderError::InvalidRequest(format!(
                "no access log store configured for '{}'",
                handle.group_identifier
            ))),
        }
    }
}

#[async_trait]
impl LogProvider for GroupRouter {
    fn supports_live_tail(&self, handle: &LogGroupHandle) -> bool {
        self.route(handle)
            .map(|p| p.supports_live_tail(handle))
            .unwrap_or(false)
    }

    fn history_bucket_millis(&self, handle: &LogGroupHandle) -> Option<i64> {
        self.route(handle).ok().and_then(|p| p.history_bucket_millis(handle))
    }

    async fn fetch_historical_page(
        &self,
        handle: &LogGroupHandle,
        request: &PageRequest,
    ) -> Result<EventPage, ProviderError> {
        self.route(handle)?.fetch_historical_page(handle, request).await
    }

    async fn open_live_tail(
        &self,
        handle: &LogGroupHandle,
        from: Option<i64>,
    ) -> Result<Box<dyn LiveTail>, ProviderError> {
        self.route(handle)?.open_live_tail(handle, from).await
    }
}
