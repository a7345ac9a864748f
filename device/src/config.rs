use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub device_id: String,
    pub auth_token: Option<String>,
    pub backend_url: String,
    pub report_topic: String,
    pub diagnostic_topic: String,
    pub store_path: String,
    pub loop_interval_ms: u64,
    pub response_timeout_secs: u64,
    pub settle_delay_secs: u64,
    pub connect_ceiling_secs: u64,
    pub awake_secs: u64,
    pub extended_awake_secs: u64,
    pub wake_period_secs: u64,
    pub wake_offset_secs: u64,
    pub low_battery_volts: f32,
    pub diagnostic_interval_ms: u64,
    pub flush_delay_ms: u64,
    pub measurement_failure_rate: f64,
}

impl Config {
    pub fn defaults(device_id: String) -> Self {
        Config {
            device_id,
            auth_token: None,
            backend_url: "http://localhost:8000".to_string(),
            report_topic: "report".to_string(),
            diagnostic_topic: "status".to_string(),
            store_path: "./node_nvram.db".to_string(),
            loop_interval_ms: 100,
            response_timeout_secs: 45,
            settle_delay_secs: 30,
            connect_ceiling_secs: 300,
            awake_secs: 90,
            extended_awake_secs: 90,
            wake_period_secs: 3600,
            wake_offset_secs: 300,
            low_battery_volts: 3.0,
            diagnostic_interval_ms: 1000,
            flush_delay_ms: 1000,
            measurement_failure_rate: 0.0,
        }
    }

    pub fn from_env() -> Result<Self> {
        let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| Uuid::new_v4().to_string());
        let mut config = Config::defaults(device_id);

        config.auth_token = env::var("AUTH_TOKEN").ok();
        if let Ok(url) = env::var("BACKEND_URL") {
            config.backend_url = url;
        }
        if let Ok(topic) = env::var("REPORT_TOPIC") {
            config.report_topic = topic;
        }
        if let Ok(topic) = env::var("DIAGNOSTIC_TOPIC") {
            config.diagnostic_topic = topic;
        }
        if let Ok(path) = env::var("STORE_PATH") {
            config.store_path = path;
        }

        config.loop_interval_ms = get_env_var_u64("LOOP_INTERVAL_MS", config.loop_interval_ms);
        config.response_timeout_secs =
            get_env_var_u64("RESPONSE_TIMEOUT_SECS", config.response_timeout_secs);
        config.settle_delay_secs = get_env_var_u64("SETTLE_DELAY_SECS", config.settle_delay_secs);
        config.connect_ceiling_secs =
            get_env_var_u64("CONNECT_CEILING_SECS", config.connect_ceiling_secs);
        config.awake_secs = get_env_var_u64("AWAKE_SECS", config.awake_secs);
        config.extended_awake_secs =
            get_env_var_u64("EXTENDED_AWAKE_SECS", config.extended_awake_secs);
        config.wake_period_secs =
            get_env_var_u64("WAKE_PERIOD_SECS", config.wake_period_secs).max(1);
        config.wake_offset_secs = get_env_var_u64("WAKE_OFFSET_SECS", config.wake_offset_secs);
        config.diagnostic_interval_ms =
            get_env_var_u64("DIAGNOSTIC_INTERVAL_MS", config.diagnostic_interval_ms);
        config.flush_delay_ms = get_env_var_u64("FLUSH_DELAY_MS", config.flush_delay_ms);

        if let Some(volts) = env::var("LOW_BATTERY_VOLTS").ok().and_then(|v| v.parse().ok()) {
            config.low_battery_volts = volts;
        }
        if let Some(rate) = env::var("MEASUREMENT_FAILURE_RATE").ok().and_then(|v| v.parse().ok()) {
            config.measurement_failure_rate = rate;
        }

        Ok(config)
    }

    fn get_config_file_path() -> PathBuf {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join("node_config.json")
    }

    pub fn load_from_file() -> Result<Self> {
        let config_file_path = Self::get_config_file_path();
        let contents = fs::read_to_string(&config_file_path)?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn save_to_file(&self) -> Result<()> {
        let config_file_path = Self::get_config_file_path();
        if let Some(parent) = config_file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        let mut file = fs::File::create(&config_file_path)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }

    pub fn connect_ceiling(&self) -> Duration {
        Duration::from_secs(self.connect_ceiling_secs)
    }

    pub fn diagnostic_interval(&self) -> Duration {
        Duration::from_millis(self.diagnostic_interval_ms)
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}
