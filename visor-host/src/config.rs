//! Configuration for the Visor host engine.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration. Constructed by the embedding application,
/// optionally loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Screen capture settings.
    pub capture: CaptureConfig,
    /// Activity-telemetry sampling.
    pub telemetry: TelemetryConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind the listener on.
    pub bind_addr: String,
    /// TCP port for peer connections.
    pub port: u16,
    /// Shared secret peers must present in the handshake.
    pub password: String,
    /// Display name used for host-originated chat and file frames.
    pub host_name: String,
}

/// Screen capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Lower bound for the adaptive frame rate.
    pub min_fps: u32,
    /// Upper bound for the adaptive frame rate.
    pub max_fps: u32,
    /// Initial target frame rate.
    pub default_fps: u32,
    /// JPEG quality factor, 0.0–1.0.
    pub quality: f32,
    /// Whether the pipeline self-tunes its rate.
    pub auto_adjust: bool,
}

/// Sampling rates for input-activity telemetry. Not correctness
/// relevant; any fixed rate satisfies the contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Fraction of mouse events recorded as activity (0.0–1.0).
    pub mouse_sample_rate: f64,
    /// Fraction of keyboard events recorded as activity (0.0–1.0).
    pub keyboard_sample_rate: f64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".into(),
            port: 5000,
            password: String::new(),
            host_name: "host".into(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_fps: 15,
            max_fps: 120,
            default_fps: 30,
            quality: 0.7,
            auto_adjust: true,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            mouse_sample_rate: 0.01,
            keyboard_sample_rate: 0.05,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let cfg = Self::default();
        let text = toml::to_string_pretty(&cfg)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, text)
    }
}

// ── Tests ────────────────────────────────────────────────────────
