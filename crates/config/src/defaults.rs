pub fn default_enabled() -> bool {
    true
}

pub fn default_service_name() -> String {
    "greekd".to_string()
}

pub fn default_log_format() -> String {
    "pretty".to_string()
}

// Source defaults
pub fn default_connect_timeout_seconds() -> u64 {
    10
}

pub fn default_heartbeat_interval_seconds() -> u64 {
    15
}

pub fn default_heartbeat_timeout_multiple() -> u32 {
    3
}

pub fn default_ibkr_maintenance() -> super::MaintenanceConfig {
    super::MaintenanceConfig {
        timezone: "America/New_York".to_string(),
        start: "23:40".to_string(),
        end: "01:00".to_string(),
        resume_at: "01:05".to_string(),
    }
}

// Supervisor defaults
pub fn default_backoff_seconds() -> Vec<u64> {
    vec![5, 10, 20]
}

pub fn default_inbound_capacity() -> usize {
    4096
}

pub fn default_push_timeout_ms() -> u64 {
    50
}

pub fn default_overflow_capacity() -> usize {
    1024
}

// Normalizer defaults
pub fn default_dedup_history() -> usize {
    128
}

pub fn default_output_capacity() -> usize {
    4096
}

// Writer defaults
pub fn default_batch_size() -> usize {
    50
}

pub fn default_flush_interval_ms() -> u64 {
    1000
}

pub fn default_failure_threshold() -> u32 {
    3
}

pub fn default_probe_interval_seconds() -> u64 {
    60
}

pub fn default_write_timeout_ms() -> u64 {
    5000
}

pub fn default_buffer_path() -> String {
    "data/greek_buffer.jsonl".to_string()
}

pub fn default_latency_target_ms() -> u64 {
    500
}

pub fn default_latency_window() -> usize {
    2048
}

// Storage defaults
pub fn default_max_connections() -> u32 {
    10
}

pub fn default_connection_timeout() -> u64 {
    5
}

// Surfaces
pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub fn default_status_port() -> u16 {
    8088
}

pub fn default_metrics_port() -> u16 {
    9100
}
