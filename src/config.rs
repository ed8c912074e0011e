// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server configuration (§6 "Configuration"), loaded from a TOML file.

use std::path::Path;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("neither listen.tcp.port nor listen.udp.port is set")]
    NoListener,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_max")]
    pub max: u32,
}

fn default_pool_max() -> u32 {
    20
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig { max: default_pool_max() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    pub session_ms: u64,
    pub idle_ms: u64,
    pub packet_ms: u64,
    #[serde(default = "default_linger_sec")]
    pub linger_sec: u8,
    #[serde(default)]
    pub terminate_on_timeout: bool,
}

fn default_linger_sec() -> u8 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct PacketConfig {
    #[serde(default = "default_ascii_max_len")]
    pub max_len_ascii: u16,
    #[serde(default = "default_binary_max_len")]
    pub max_len_binary: u16,
    #[serde(default = "default_eol")]
    pub eol: u8,
    #[serde(default = "default_ignore")]
    pub ignore: Vec<u8>,
}

fn default_ascii_max_len() -> u16 {
    2048
}

fn default_binary_max_len() -> u16 {
    1024
}

fn default_eol() -> u8 {
    b'\n'
}

fn default_ignore() -> Vec<u8> {
    vec![b'\r']
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    #[serde(default)]
    pub custom_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    #[serde(default)]
    pub duplicate_nack: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub show_sql: bool,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub email_to: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub packet: PacketConfig,
    #[serde(default)]
    pub template: TemplateConfig,
    #[serde(default)]
    pub event: EventConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for PacketConfig {
    fn default() -> Self {
        PacketConfig {
            max_len_ascii: default_ascii_max_len(),
            max_len_binary: default_binary_max_len(),
            eol: default_eol(),
            ignore: default_ignore(),
        }
    }
}

impl Default for TemplateConfig {
    fn default() -> Self {
        TemplateConfig { custom_enabled: false }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        EventConfig { duplicate_nack: false }
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path_ref = path.as_ref();
        let raw = std::fs::read_to_string(path_ref).map_err(|e| ConfigError::Read {
            path: path_ref.display().to_string(),
            source: e,
        })?;
        let config: Config = toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path_ref.display().to_string(),
            source: e,
        })?;
        if config.listen.tcp_port.is_none() && config.listen.udp_port.is_none() {
            return Err(ConfigError::NoListener);
        }
        Ok(config)
    }
}
