//! TOML + environment variable configuration for the IC process (spec.md
//! §6 "Configuration (IC)"), following `knhk_config::config::load_config`'s
//! "env > file > defaults" hierarchy.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingWeights {
    #[serde(default = "default_alpha")]
    pub prealloc: f64,
    #[serde(default = "default_beta")]
    pub inflight: f64,
}

fn default_alpha() -> f64 {
    0.3
}
fn default_beta() -> f64 {
    0.7
}

impl Default for LoadBalancingWeights {
    fn default() -> Self {
        Self {
            prealloc: default_alpha(),
            inflight: default_beta(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// IC→Sentry ping period (spec.md §6 `sentry_hearbeat`, default 5s).
    #[serde(default = "default_sentry_heartbeat", rename = "sentry_hearbeat")]
    pub sentry_heartbeat_secs: f64,

    #[serde(default)]
    pub load_balancing_weights: LoadBalancingWeights,

    #[serde(default = "default_balance_threshold")]
    pub balance_threshold: f64,

    #[serde(default = "default_wal_dir", rename = "WalManager_dir")]
    pub wal_dir: String,

    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,

    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_seconds: u64,

    #[serde(default)]
    pub resume: bool,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_metrics_poll_interval")]
    pub metrics_poll_interval_secs: f64,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_sentry_heartbeat() -> f64 {
    5.0
}
fn default_balance_threshold() -> f64 {
    0.3
}
fn default_wal_dir() -> String {
    "./data/wal".to_string()
}
fn default_snapshot_dir() -> String {
    "./data/snapshots".to_string()
}
fn default_snapshot_interval() -> u64 {
    600
}
fn default_db_path() -> String {
    "./data/nexuts.db".to_string()
}
fn default_metrics_poll_interval() -> f64 {
    2.0
}

impl Default for IcConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            sentry_heartbeat_secs: default_sentry_heartbeat(),
            load_balancing_weights: LoadBalancingWeights::default(),
            balance_threshold: default_balance_threshold(),
            wal_dir: default_wal_dir(),
            snapshot_dir: default_snapshot_dir(),
            snapshot_interval_seconds: default_snapshot_interval(),
            resume: false,
            db_path: default_db_path(),
            metrics_poll_interval_secs: default_metrics_poll_interval(),
        }
    }
}

impl IcConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text)?
            }
            _ => IcConfig::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NEXUTS_IC_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Ok(v) = std::env::var("NEXUTS_IC_RESUME") {
            if let Ok(parsed) = v.parse() {
                self.resume = parsed;
            }
        }
        if let Ok(v) = std::env::var("NEXUTS_IC_SNAPSHOT_INTERVAL_SECONDS") {
            if let Ok(parsed) = v.parse() {
                self.snapshot_interval_seconds = parsed;
            }
        }
        if let Ok(v) = std::env::var("NEXUTS_IC_DB_PATH") {
            self.db_path = v;
        }
    }

    pub fn wal_dir(&self) -> PathBuf {
        PathBuf::from(&self.wal_dir)
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        PathBuf::from(&self.snapshot_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = IcConfig::default();
        assert_eq!(cfg.sentry_heartbeat_secs, 5.0);
        assert_eq!(cfg.load_balancing_weights.prealloc, 0.3);
        assert_eq!(cfg.load_balancing_weights.inflight, 0.7);
        assert_eq!(cfg.snapshot_interval_seconds, 600);
        assert!(!cfg.resume);
    }

    #[test]
    fn loads_renamed_toml_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ic.toml");
        std::fs::write(
            &path,
            "sentry_hearbeat = 10\nWalManager_dir = \"/tmp/wal\"\nresume = true\n",
        )
        .unwrap();
        let cfg = IcConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.sentry_heartbeat_secs, 10.0);
        assert_eq!(cfg.wal_dir, "/tmp/wal");
        assert!(cfg.resume);
    }
}
