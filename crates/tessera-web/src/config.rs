use std::str::FromStr;
use std::time::Duration;

use tessera_runtime::{GovernorConfig, History, InspectorConfig};
use tessera_wire::DEFAULT_MAX_FRAME_BYTES;
use tracing::warn;

use crate::transport::StreamOptions;

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:9230";
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9219";
pub const DEFAULT_DEREF_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub http_addr: String,
    /// Raw socket transport (framed JSON-RPC).
    pub listen_addr: String,
    pub history_capacity: usize,
    pub coalesce_window: Duration,
    pub sample_drop: f64,
    pub deref_timeout: Duration,
    pub max_frame_bytes: usize,
    pub protocol_trace: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: DEFAULT_HTTP_ADDR.into(),
            listen_addr: DEFAULT_LISTEN_ADDR.into(),
            history_capacity: History::DEFAULT_CAPACITY,
            coalesce_window: GovernorConfig::default().coalesce_window,
            sample_drop: GovernorConfig::default().sample_drop,
            deref_timeout: DEFAULT_DEREF_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            protocol_trace: false,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable source. Unparseable values
    /// are logged and replaced by their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let sample_drop = parsed(&lookup, "TESSERA_SAMPLE_DROP", defaults.sample_drop);
        let sample_drop = if (0.0..=1.0).contains(&sample_drop) {
            sample_drop
        } else {
            warn!(sample_drop, "TESSERA_SAMPLE_DROP outside 0..=1, using default");
            defaults.sample_drop
        };
        Self {
            http_addr: lookup("TESSERA_HTTP").unwrap_or(defaults.http_addr),
            listen_addr: lookup("TESSERA_LISTEN").unwrap_or(defaults.listen_addr),
            history_capacity: positive(
                &lookup,
                "TESSERA_HISTORY_CAPACITY",
                defaults.history_capacity,
            ),
            coalesce_window: Duration::from_millis(positive(
                &lookup,
                "TESSERA_COALESCE_MS",
                defaults.coalesce_window.as_millis() as u64,
            )),
            sample_drop,
            deref_timeout: Duration::from_millis(positive(
                &lookup,
                "TESSERA_DEREF_TIMEOUT_MS",
                defaults.deref_timeout.as_millis() as u64,
            )),
            max_frame_bytes: positive(&lookup, "TESSERA_MAX_FRAME_BYTES", defaults.max_frame_bytes),
            protocol_trace: lookup("TESSERA_PROTOCOL_TRACE")
                .is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes" | "on")),
        }
    }

    pub fn inspector_config(&self) -> InspectorConfig {
        InspectorConfig {
            history_capacity: self.history_capacity,
            ..InspectorConfig::default()
        }
    }

    pub fn governor_config(&self) -> GovernorConfig {
        GovernorConfig {
            coalesce_window: self.coalesce_window,
            sample_drop: self.sample_drop,
            ..GovernorConfig::default()
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            max_frame_bytes: self.max_frame_bytes,
            protocol_trace: self.protocol_trace,
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy,
{
    match lookup(name) {
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(%name, raw = %raw, %default, "invalid value, using default");
                default
            }
        },
        None => default,
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display + Copy + PartialOrd + Default,
{
    let value = parsed(lookup, name, default);
    if value > T::default() {
        value
    } else {
        warn!(%name, %default, "value must be positive, using default");
        default
    }
}
