//! Server configuration, loaded from a YAML file.
//!
//! All operational knobs live in `config_vad.yaml`; the only command-line
//! surface is the path to that file, via `clap::Parser`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, clap::Parser)]
#[command(author, version, about = "Streaming speech-recognition server")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config_vad.yaml")]
    pub config: PathBuf,

    /// Print the resolved configuration and exit.
    #[arg(long, default_value_t = false)]
    pub print_config: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub model: ModelConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    /// Bytes per VAD frame (`sample_rate * frame_duration_ms / 1000 * 2`).
    pub frame_size: usize,
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VadConfig {
    /// Classifier aggressiveness, passed through to the `FrameClassifier`.
    pub mode: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub size: String,
    pub device: Device,
    pub language: String,
    /// Engine pool size.
    pub channel: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    /// Socket idle read timeout, seconds.
    pub socket_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub log_path: String,
    pub level: String,
    pub save_pcm: bool,
    pub pcm_path: String,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.as_ref().display()))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.as_ref().display()))?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.network.ip, self.network.port)
    }
}

#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        audio: AudioConfig {
            frame_size: 960,
            sample_rate: 16000,
            frame_duration_ms: 30,
        },
        vad: VadConfig { mode: 2 },
        model: ModelConfig {
            size: "large-v2".into(),
            device: Device::Cpu,
            language: "en".into(),
            channel: 2,
        },
        network: NetworkConfig {
            ip: "127.0.0.1".into(),
            port: 0,
            socket_timeout: 60,
        },
        logging: LoggingConfig {
            log_path: "./logs".into(),
            level: "info".into(),
            save_pcm: false,
            pcm_path: "./pcm".into(),
        },
    }
}
