//! Router configuration (spec §6 "Environment / config"). A plain struct
//! with `Default`, the way the teacher loads `AppConfig` — no mandated env
//! var names here, per spec.

use regex::Regex;

/// Default topic pattern (spec §3 "Topic (global)").
pub const DEFAULT_TOPIC_PATTERN: &str = r"^[a-zA-Z0-9:_./-]{1,128}$";

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub rpc_timeout_ms: u64,
    /// Fixed at `rpc_timeout_ms + rpc_idle_timeout_extra_ms` per correlation
    /// (spec §9 resolved open question), not a standalone default.
    pub rpc_idle_timeout_extra_ms: u64,
    pub max_inflight_rpcs_per_socket: usize,
    pub socket_buffer_limit_bytes: u64,
    pub max_topics_per_connection: usize,
    pub topic_pattern: String,
    pub topic_max_length: usize,
    pub rpc_sweep_interval_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 30_000,
            rpc_idle_timeout_extra_ms: 10_000,
            max_inflight_rpcs_per_socket: 1000,
            socket_buffer_limit_bytes: 16 * 1024 * 1024,
            max_topics_per_connection: 1000,
            topic_pattern: DEFAULT_TOPIC_PATTERN.to_string(),
            topic_max_length: 128,
            rpc_sweep_interval_ms: 5_000,
        }
    }
}

impl RouterConfig {
    pub fn compiled_topic_pattern(&self) -> Result<Regex, regex::Error> {
        Regex::new(&self.topic_pattern)
    }
}
