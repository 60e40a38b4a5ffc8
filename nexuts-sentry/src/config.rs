//! TOML + environment variable configuration for the Sentry process,
//! following `knhk_config::config::load_config`'s "env > file > defaults"
//! hierarchy (spec.md SPEC_FULL.md "(ambient) Configuration").

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentryConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_sentry_id")]
    pub sentry_id: String,
    #[serde(default = "default_instance_db_path")]
    pub instance_db_path: String,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: f64,
    #[serde(default = "default_nexuts_base_url")]
    pub nexuts_base_url: String,
    #[serde(default = "default_queue_path")]
    pub outbound_queue_path: String,
    #[serde(default = "default_flush_cycle")]
    pub flush_interval_secs: f64,
    #[serde(default = "default_send_cycle")]
    pub send_nexuts_cycle_secs: f64,
}

fn default_bind_address() -> String {
    "0.0.0.0:9000".to_string()
}
fn default_sentry_id() -> String {
    "sentry-1".to_string()
}
fn default_instance_db_path() -> String {
    "./data/sentry_instances.db".to_string()
}
fn default_health_interval() -> f64 {
    5.0
}
fn default_nexuts_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_queue_path() -> String {
    "./data/sentry_outbound_queue".to_string()
}
fn default_flush_cycle() -> f64 {
    1.0
}
fn default_send_cycle() -> f64 {
    1.0
}

impl Default for SentryConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            sentry_id: default_sentry_id(),
            instance_db_path: default_instance_db_path(),
            health_interval_secs: default_health_interval(),
            nexuts_base_url: default_nexuts_base_url(),
            outbound_queue_path: default_queue_path(),
            flush_interval_secs: default_flush_cycle(),
            send_nexuts_cycle_secs: default_send_cycle(),
        }
    }
}

impl SentryConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text)?
            }
            _ => SentryConfig::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NEXUTS_SENTRY_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Ok(v) = std::env::var("NEXUTS_SENTRY_ID") {
            self.sentry_id = v;
        }
        if let Ok(v) = std::env::var("NEXUTS_IC_BASE_URL") {
            self.nexuts_base_url = v;
        }
        if let Ok(v) = std::env::var("NEXUTS_SENTRY_HEALTH_INTERVAL") {
            if let Ok(parsed) = v.parse() {
                self.health_interval_secs = parsed;
            }
        }
    }

    pub fn instance_db_path(&self) -> PathBuf {
        PathBuf::from(&self.instance_db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = SentryConfig::default();
        assert_eq!(cfg.bind_address, "0.0.0.0:9000");
        assert!(cfg.health_interval_secs > 0.0);
    }

    #[test]
    fn loads_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentry.toml");
        std::fs::write(&path, "sentry_id = \"s42\"\nbind_address = \"0.0.0.0:7000\"\n").unwrap();
        let cfg = SentryConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.sentry_id, "s42");
        assert_eq!(cfg.bind_address, "0.0.0.0:7000");
    }
}
