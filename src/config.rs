use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the HTTP/WebSocket server binds to (default: 0.0.0.0:8080)
    #[serde(default = "Config::default_bind_addr")]
    pub bind_addr: String,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    pub auth: AuthConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub routes: RouteSourceConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub ws: WsConfig,
    #[serde(default)]
    pub fanout: FanoutConfig,
}

/// Token verification settings shared with the token issuer.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret used to verify HS256 tokens. No default on purpose.
    pub secret: String,
}

/// Connection settings for the GPS telemetry broker.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "MqttConfig::default_host")]
    pub host: String,
    #[serde(default = "MqttConfig::default_port")]
    pub port: u16,
    #[serde(default = "MqttConfig::default_client_id")]
    pub client_id: String,
    /// First topic segment; fixes arrive on {prefix}/{routeId}/{direction}/{busId}.
    #[serde(default = "MqttConfig::default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "MqttConfig::default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// Pause between reconnect attempts after the event loop errors (default: 5)
    #[serde(default = "MqttConfig::default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: Self::default_port(),
            client_id: Self::default_client_id(),
            topic_prefix: Self::default_topic_prefix(),
            keep_alive_secs: Self::default_keep_alive_secs(),
            reconnect_delay_secs: Self::default_reconnect_delay_secs(),
        }
    }
}

impl MqttConfig {
    fn default_host() -> String {
        "localhost".to_string()
    }
    fn default_port() -> u16 {
        1883
    }
    fn default_client_id() -> String {
        "livebus-ingest".to_string()
    }
    fn default_topic_prefix() -> String {
        "gps".to_string()
    }
    fn default_keep_alive_secs() -> u64 {
        30
    }
    fn default_reconnect_delay_secs() -> u64 {
        5
    }
}

/// Where route polylines and arrival zones are loaded from.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSourceConfig {
    #[serde(default = "RouteSourceConfig::default_db_url")]
    pub db_url: String,
    /// How long a fetched shape stays cached, including negative results (default: 300)
    #[serde(default = "RouteSourceConfig::default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for RouteSourceConfig {
    fn default() -> Self {
        Self {
            db_url: Self::default_db_url(),
            cache_ttl_secs: Self::default_cache_ttl_secs(),
        }
    }
}

impl RouteSourceConfig {
    fn default_db_url() -> String {
        "sqlite:routes.db?mode=rwc".to_string()
    }
    fn default_cache_ttl_secs() -> u64 {
        300
    }
}

/// Thresholds for the per-vehicle state machine.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Deviation at or above which a vehicle becomes off-track (default: 50)
    #[serde(default = "TrackingConfig::default_off_track_enter_meters")]
    pub off_track_enter_meters: f64,
    /// Deviation at or below which an off-track vehicle recovers (default: 35)
    #[serde(default = "TrackingConfig::default_off_track_recover_meters")]
    pub off_track_recover_meters: f64,
    /// Minimum route progress for the arrival gate (default: 0.97)
    #[serde(default = "TrackingConfig::default_arrival_progress_threshold")]
    pub arrival_progress_threshold: f64,
    /// Maximum speed in km/h for the arrival gate (default: 8)
    #[serde(default = "TrackingConfig::default_arrival_max_speed_kmh")]
    pub arrival_max_speed_kmh: f64,
    /// How long the arrival gate must hold before ARRIVED is committed (default: 10000)
    #[serde(default = "TrackingConfig::default_arrival_dwell_ms")]
    pub arrival_dwell_ms: i64,
    /// How long an arrived vehicle may fail the gate before reverting (default: 10000)
    #[serde(default = "TrackingConfig::default_arrival_exit_grace_ms")]
    pub arrival_exit_grace_ms: i64,
    /// Progress at or below which ARRIVED reverts immediately (default: 0.2)
    #[serde(default = "TrackingConfig::default_arrival_reset_progress")]
    pub arrival_reset_progress: f64,
    /// Liveness TTL for vehicle state records (default: 120)
    #[serde(default = "TrackingConfig::default_vehicle_ttl_secs")]
    pub vehicle_ttl_secs: u64,
    /// Fixes older than this are rejected as stale (default: 600)
    #[serde(default = "TrackingConfig::default_max_fix_age_secs")]
    pub max_fix_age_secs: i64,
    /// Fixes further in the future than this are rejected (default: 60)
    #[serde(default = "TrackingConfig::default_max_future_drift_secs")]
    pub max_future_drift_secs: i64,
    /// Raw messages kept per vehicle for diagnostics (default: 50)
    #[serde(default = "TrackingConfig::default_audit_trail_len")]
    pub audit_trail_len: usize,
    #[serde(default = "TrackingConfig::default_audit_trail_ttl_secs")]
    pub audit_trail_ttl_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            off_track_enter_meters: Self::default_off_track_enter_meters(),
            off_track_recover_meters: Self::default_off_track_recover_meters(),
            arrival_progress_threshold: Self::default_arrival_progress_threshold(),
            arrival_max_speed_kmh: Self::default_arrival_max_speed_kmh(),
            arrival_dwell_ms: Self::default_arrival_dwell_ms(),
            arrival_exit_grace_ms: Self::default_arrival_exit_grace_ms(),
            arrival_reset_progress: Self::default_arrival_reset_progress(),
            vehicle_ttl_secs: Self::default_vehicle_ttl_secs(),
            max_fix_age_secs: Self::default_max_fix_age_secs(),
            max_future_drift_secs: Self::default_max_future_drift_secs(),
            audit_trail_len: Self::default_audit_trail_len(),
            audit_trail_ttl_secs: Self::default_audit_trail_ttl_secs(),
        }
    }
}

impl TrackingConfig {
    fn default_off_track_enter_meters() -> f64 {
        50.0
    }
    fn default_off_track_recover_meters() -> f64 {
        35.0
    }
    fn default_arrival_progress_threshold() -> f64 {
        0.97
    }
    fn default_arrival_max_speed_kmh() -> f64 {
        8.0
    }
    fn default_arrival_dwell_ms() -> i64 {
        10_000
    }
    fn default_arrival_exit_grace_ms() -> i64 {
        10_000
    }
    fn default_arrival_reset_progress() -> f64 {
        0.2
    }
    fn default_vehicle_ttl_secs() -> u64 {
        120
    }
    fn default_max_fix_age_secs() -> i64 {
        600
    }
    fn default_max_future_drift_secs() -> i64 {
        60
    }
    fn default_audit_trail_len() -> usize {
        50
    }
    fn default_audit_trail_ttl_secs() -> u64 {
        3600
    }
}

/// Stale ordering-entry reclaimer schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    /// Seconds between sweeps; values below 5 are raised to 5 (default: 30)
    #[serde(default = "SweepConfig::default_interval_secs")]
    pub interval_secs: u64,
    /// Ordering members checked per liveness batch (default: 100)
    #[serde(default = "SweepConfig::default_page_size")]
    pub page_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: Self::default_interval_secs(),
            page_size: Self::default_page_size(),
        }
    }
}

impl SweepConfig {
    fn default_interval_secs() -> u64 {
        30
    }
    fn default_page_size() -> usize {
        100
    }
}

/// WebSocket session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct WsConfig {
    /// Seconds an unauthenticated socket may stay open (default: 10)
    #[serde(default = "WsConfig::default_auth_deadline_secs")]
    pub auth_deadline_secs: u64,
    /// Seconds between liveness pings; a missed pong closes the socket (default: 30)
    #[serde(default = "WsConfig::default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Outbound messages buffered per connection before drops (default: 256)
    #[serde(default = "WsConfig::default_send_buffer")]
    pub send_buffer: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            auth_deadline_secs: Self::default_auth_deadline_secs(),
            ping_interval_secs: Self::default_ping_interval_secs(),
            send_buffer: Self::default_send_buffer(),
        }
    }
}

impl WsConfig {
    fn default_auth_deadline_secs() -> u64 {
        10
    }
    fn default_ping_interval_secs() -> u64 {
        30
    }
    fn default_send_buffer() -> usize {
        256
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FanoutConfig {
    /// Neighbors resolved ahead and behind each vehicle (default: 2)
    #[serde(default = "FanoutConfig::default_neighbor_count")]
    pub neighbor_count: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            neighbor_count: Self::default_neighbor_count(),
        }
    }
}

impl FanoutConfig {
    fn default_neighbor_count() -> usize {
        2
    }
}

impl Config {
    fn default_bind_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        let config: Config =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.secret.is_empty() {
            return Err(ConfigError::Invalid("auth.secret must not be empty".into()));
        }
        if self.tracking.off_track_recover_meters >= self.tracking.off_track_enter_meters {
            return Err(ConfigError::Invalid(
                "tracking.off_track_recover_meters must be below off_track_enter_meters".into(),
            ));
        }
        if self.tracking.arrival_reset_progress >= self.tracking.arrival_progress_threshold {
            return Err(ConfigError::Invalid(
                "tracking.arrival_reset_progress must be below arrival_progress_threshold".into(),
            ));
        }
        if self.sweep.page_size == 0 {
            return Err(ConfigError::Invalid("sweep.page_size must be positive".into()));
        }
        Ok(())
    }

    /// Sweep interval with the 5 second floor applied.
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep.interval_secs.max(5))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
