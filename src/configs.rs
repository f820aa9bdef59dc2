//! Configuration Module
//!
//! TOML-backed settings for both daemons. Each binary loads one file
//! (default `capfd.toml` / `tvsd.toml` in the working directory) and
//! validates it before any socket is bound; a bad option aborts startup.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Issued-certificate validity bounds in days.
const VALIDITY_DAYS_MIN: u32 = 1;
const VALIDITY_DAYS_MAX: u32 = 3560;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the CAPF enrollment daemon.
#[derive(Debug, Deserialize, Clone)]
pub struct CapfConfig {
    #[serde(default = "default_capf_port")]
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Server TLS certificate and key, one PEM file (possibly concatenated).
    pub server_certificate: PathBuf,
    /// Operator CA certificate and key used to sign issued phone certificates.
    pub issuer_certificate: PathBuf,
    /// Additional trust anchors consulted after the issuer, in listed order.
    #[serde(default)]
    pub verify_certificates: Vec<PathBuf>,
    #[serde(default = "default_validity_days")]
    pub validity_days: u32,
    /// 0 means unlimited.
    #[serde(default)]
    pub concurrent_clients: u32,
    pub database: PathBuf,
    /// Where issued PEM copies land. Defaults to the database's directory.
    pub certificates_dir: Option<PathBuf>,
    pub log_directory: Option<PathBuf>,
}

/// Settings for the TVS trust-query daemon.
#[derive(Debug, Deserialize, Clone)]
pub struct TvsConfig {
    #[serde(default = "default_tvs_port")]
    pub port: u16,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    pub server_certificate: PathBuf,
    #[serde(default)]
    pub concurrent_clients: u32,
    pub database: PathBuf,
    pub log_directory: Option<PathBuf>,
}

fn default_capf_port() -> u16 {
    3804
}

fn default_tvs_port() -> u16 {
    2445
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_validity_days() -> u32 {
    365
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn check_readable(path: &Path, what: &str) -> Result<(), ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::Invalid(format!(
            "{} {} does not exist or is not a file",
            what,
            path.display()
        )));
    }
    Ok(())
}

impl CapfConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: CapfConfig = read_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(VALIDITY_DAYS_MIN..=VALIDITY_DAYS_MAX).contains(&self.validity_days) {
            return Err(ConfigError::Invalid(format!(
                "validity_days must be between {} and {}, got {}",
                VALIDITY_DAYS_MIN, VALIDITY_DAYS_MAX, self.validity_days
            )));
        }
        check_readable(&self.server_certificate, "server_certificate")?;
        check_readable(&self.issuer_certificate, "issuer_certificate")?;
        for anchor in &self.verify_certificates {
            check_readable(anchor, "verify_certificates entry")?;
        }
        check_readable(&self.database, "database")?;
        Ok(())
    }

    /// Resolved issued-certificate directory.
    pub fn certificates_dir(&self) -> PathBuf {
        match &self.certificates_dir {
            Some(dir) => dir.clone(),
            None => self
                .database
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}

impl TvsConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: TvsConfig = read_toml(path)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_readable(&self.server_certificate, "server_certificate")?;
        check_readable(&self.database, "database")?;
        Ok(())
    }
}
