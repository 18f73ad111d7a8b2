use serde::{Deserialize, Serialize};

/// 2017-01-01T00:00:00Z
pub const DEFAULT_MIN_VALID_EPOCH: i64 = 1_483_228_800;
/// 2030-01-01T00:00:00Z
pub const DEFAULT_MAX_VALID_EPOCH: i64 = 1_893_456_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub topic_prefix: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            topic_prefix: "lagwatch".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }

        let prefix = self.topic_prefix.trim_matches('/').trim();
        self.topic_prefix = if prefix.is_empty() {
            "lagwatch".to_string()
        } else {
            prefix.to_string()
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub auth_host: String,
    pub auth_port: u16,
    pub use_tls: bool,
    pub version: String,
    pub query_timeout_ms: u64,
    pub update_timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "api.telemetry.example.com".to_string(),
            port: 443,
            auth_host: String::new(),
            auth_port: 0,
            use_tls: true,
            version: "v1".to_string(),
            query_timeout_ms: 15_000,
            update_timeout_ms: 5_000,
            max_attempts: 3,
        }
    }
}

impl ApiConfig {
    pub fn sanitize(&mut self) {
        let default_port = if self.use_tls { 443 } else { 80 };
        if self.port == 0 {
            self.port = default_port;
        }
        if self.auth_port == 0 {
            self.auth_port = default_port;
        }
        if self.auth_host.trim().is_empty() {
            self.auth_host = self.host.clone();
        }

        let version = self.version.trim_matches('/').trim();
        self.version = if version.is_empty() {
            "v1".to_string()
        } else {
            version.to_string()
        };

        self.query_timeout_ms = self.query_timeout_ms.clamp(1_000, 60_000);
        self.update_timeout_ms = self.update_timeout_ms.clamp(1_000, 60_000);
        self.max_attempts = self.max_attempts.clamp(1, 3);
    }
}

/// Remote sensor ids the agent reads back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorIds {
    pub pubsub_time: String,
    pub rest_time: String,
    pub reboot_count: String,
    pub machine_enabled: String,
    pub cycle_rate: String,
}

impl Default for SensorIds {
    fn default() -> Self {
        Self {
            pubsub_time: "1".to_string(),
            rest_time: "2".to_string(),
            reboot_count: "4".to_string(),
            machine_enabled: "20".to_string(),
            cycle_rate: "21".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialConfig {
    /// Refresh token used until a persisted one is adopted.
    pub bootstrap_refresh_token: String,
    pub min_valid_epoch: i64,
    pub max_valid_epoch: i64,
    /// Local minute of day at which the daily refresh window opens.
    pub refresh_window_start_minute: u16,
    pub refresh_window_minutes: u16,
    pub auth_failure_threshold: u32,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            bootstrap_refresh_token: String::new(),
            min_valid_epoch: DEFAULT_MIN_VALID_EPOCH,
            max_valid_epoch: DEFAULT_MAX_VALID_EPOCH,
            refresh_window_start_minute: 3 * 60,
            refresh_window_minutes: 10,
            auth_failure_threshold: 3,
        }
    }
}

impl CredentialConfig {
    pub fn sanitize(&mut self) {
        self.bootstrap_refresh_token = self.bootstrap_refresh_token.trim().to_string();
        if self.min_valid_epoch >= self.max_valid_epoch {
            self.min_valid_epoch = DEFAULT_MIN_VALID_EPOCH;
            self.max_valid_epoch = DEFAULT_MAX_VALID_EPOCH;
        }
        self.refresh_window_start_minute = self.refresh_window_start_minute.min(1_439);
        self.refresh_window_minutes = self.refresh_window_minutes.clamp(1, 120);
        self.auth_failure_threshold = self.auth_failure_threshold.clamp(1, 20);
    }

    pub fn is_sane_epoch(&self, epoch_secs: i64) -> bool {
        (self.min_valid_epoch..=self.max_valid_epoch).contains(&epoch_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub tick_interval_ms: u64,
    /// Lag cycles run on every n-th tick.
    pub lag_every_ticks: u32,
    pub tick_budget_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 15_000,
            lag_every_ticks: 4,
            tick_budget_ms: 60_000,
            restart_delay_ms: 1_000,
        }
    }
}

impl ScheduleConfig {
    pub fn sanitize(&mut self) {
        self.tick_interval_ms = self.tick_interval_ms.clamp(1_000, 300_000);
        self.lag_every_ticks = self.lag_every_ticks.clamp(1, 60);
        self.tick_budget_ms = self.tick_budget_ms.max(self.tick_interval_ms);
        self.restart_delay_ms = self.restart_delay_ms.min(60_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub device_id: String,
    pub build_marker: f64,
    pub timezone: String,
    pub network: NetworkConfig,
    pub api: ApiConfig,
    pub sensors: SensorIds,
    pub credential: CredentialConfig,
    pub schedule: ScheduleConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: "lagwatch-01".to_string(),
            build_marker: 1.0,
            timezone: "UTC".to_string(),
            network: NetworkConfig::default(),
            api: ApiConfig::default(),
            sensors: SensorIds::default(),
            credential: CredentialConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn sanitize(&mut self) {
        self.device_id = self.device_id.trim().to_string();
        if self.device_id.is_empty() {
            self.device_id = "lagwatch-01".to_string();
        }
        if !self.build_marker.is_finite() {
            self.build_marker = 1.0;
        }
        if self.timezone.trim().is_empty() {
            self.timezone = "UTC".to_string();
        }

        self.network.sanitize();
        self.api.sanitize();
        self.credential.sanitize();
        self.schedule.sanitize();
    }
}
