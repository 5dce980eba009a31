use std::str::FromStr;

use serde::Deserialize;

/// How listener events reach the notification pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngressMode {
    /// Every event is queued as soon as it arrives.
    #[default]
    Direct,
    /// Last-write-wins per area and type, flushed after a quiet window.
    Throttle,
    /// Size-or-time batches.
    Batch,
    /// Only the last event per area and type within the quiet period.
    Debounce,
}

impl FromStr for IngressMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(IngressMode::Direct),
            "throttle" => Ok(IngressMode::Throttle),
            "batch" => Ok(IngressMode::Batch),
            "debounce" => Ok(IngressMode::Debounce),
            other => Err(anyhow::anyhow!(
                "INGRESS_MODE must be one of direct, throttle, batch, debounce (got '{}')",
                other
            )),
        }
    }
}

/// Global application configuration loaded from environment variables.
///
/// Tunables left unset stay `None` so that component defaults apply.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Redis connection string
    pub redis_url: String,

    /// Pub/sub channel prefix the change feed publishes on
    pub change_feed_channel_prefix: String,

    /// Schema of the watched table
    pub change_feed_schema: String,

    /// Watched table holding road-clearing reports
    pub change_feed_table: String,

    /// Key under which subscriber preferences are persisted
    pub preferences_key: String,

    /// Key under which the notification history is persisted
    pub history_key: String,

    /// Push gateway endpoint; push is unsupported when unset
    pub push_gateway_url: Option<String>,

    /// Bearer token for the push gateway
    pub push_gateway_token: Option<String>,

    /// Icon URL attached to push payloads
    pub push_icon: Option<String>,

    /// How listener events are fed to the pipeline (default: direct)
    pub ingress_mode: IngressMode,

    /// Interval for draining the standing failure queue (default: 30000)
    pub queue_process_interval_ms: u64,

    /// Attempt the top recovery action before escalating a failed delivery
    pub auto_recover: bool,

    pub pipeline_batch_size: Option<usize>,
    pub pipeline_debounce_ms: Option<u64>,
    pub pipeline_delivery_delay_ms: Option<u64>,
    pub pipeline_delivery_timeout_ms: Option<u64>,

    pub push_max_retries: Option<u32>,
    pub push_base_delay_ms: Option<u64>,

    pub requeue_max_retries: Option<u32>,
    pub requeue_base_delay_ms: Option<u64>,
    pub requeue_max_delay_ms: Option<u64>,

    pub reconnect_delay_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,

    pub throttle_delay_ms: Option<u64>,
    pub throttle_batch_size: Option<usize>,
    pub throttle_batch_timeout_ms: Option<u64>,
    pub throttle_debounce_ms: Option<u64>,
    pub throttle_max_queue_size: Option<usize>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let config = Self {
            redis_url: text("REDIS_URL", "redis://localhost:6379"),
            change_feed_channel_prefix: text("CHANGE_FEED_CHANNEL_PREFIX", "realtime"),
            change_feed_schema: text("CHANGE_FEED_SCHEMA", "public"),
            change_feed_table: text("CHANGE_FEED_TABLE", "reports"),
            preferences_key: text("PREFERENCES_KEY", "snowline:notification_preferences"),
            history_key: text("HISTORY_KEY", "snowline:notification_history"),
            push_gateway_url: lookup("PUSH_GATEWAY_URL").filter(|v| !v.is_empty()),
            push_gateway_token: lookup("PUSH_GATEWAY_TOKEN").filter(|v| !v.is_empty()),
            push_icon: lookup("PUSH_ICON").filter(|v| !v.is_empty()),
            ingress_mode: text("INGRESS_MODE", "direct").parse()?,
            queue_process_interval_ms: parse_or(&lookup, "QUEUE_PROCESS_INTERVAL_MS", 30_000)?,
            auto_recover: parse_or(&lookup, "AUTO_RECOVER", false)?,
            pipeline_batch_size: parse_opt(&lookup, "PIPELINE_BATCH_SIZE")?,
            pipeline_debounce_ms: parse_opt(&lookup, "PIPELINE_DEBOUNCE_MS")?,
            pipeline_delivery_delay_ms: parse_opt(&lookup, "PIPELINE_DELIVERY_DELAY_MS")?,
            pipeline_delivery_timeout_ms: parse_opt(&lookup, "PIPELINE_DELIVERY_TIMEOUT_MS")?,
            push_max_retries: parse_opt(&lookup, "PUSH_MAX_RETRIES")?,
            push_base_delay_ms: parse_opt(&lookup, "PUSH_BASE_DELAY_MS")?,
            requeue_max_retries: parse_opt(&lookup, "REQUEUE_MAX_RETRIES")?,
            requeue_base_delay_ms: parse_opt(&lookup, "REQUEUE_BASE_DELAY_MS")?,
            requeue_max_delay_ms: parse_opt(&lookup, "REQUEUE_MAX_DELAY_MS")?,
            reconnect_delay_ms: parse_opt(&lookup, "RECONNECT_DELAY_MS")?,
            max_reconnect_attempts: parse_opt(&lookup, "MAX_RECONNECT_ATTEMPTS")?,
            throttle_delay_ms: parse_opt(&lookup, "THROTTLE_DELAY_MS")?,
            throttle_batch_size: parse_opt(&lookup, "THROTTLE_BATCH_SIZE")?,
            throttle_batch_timeout_ms: parse_opt(&lookup, "THROTTLE_BATCH_TIMEOUT_MS")?,
            throttle_debounce_ms: parse_opt(&lookup, "THROTTLE_DEBOUNCE_MS")?,
            throttle_max_queue_size: parse_opt(&lookup, "THROTTLE_MAX_QUEUE_SIZE")?,
        };

        if config.queue_process_interval_ms == 0 {
            anyhow::bail!("QUEUE_PROCESS_INTERVAL_MS must be greater than zero");
        }
        Ok(config)
    }

    /// Pub/sub channel carrying change records for the watched table.
    pub fn change_feed_channel(&self) -> String {
        format!(
            "{}:{}:{}",
            self.change_feed_channel_prefix, self.change_feed_schema, self.change_feed_table
        )
    }
}

fn parse_opt<T, F>(lookup: &F, name: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        None => Ok(None),
    }
}

fn parse_or<T, F>(lookup: &F, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(lookup, name)?.unwrap_or(default))
}
