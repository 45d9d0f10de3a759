//! Configuration module for the flutgrid server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::broadcast::{HubConfig, PacerConfig};
use crate::canvas::Fill;
use crate::color::decode_hex_color;
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the canvas server
#[derive(Parser, Debug)]
#[command(name = "flutgrid")]
#[command(author = "flutgrid authors")]
#[command(version = "0.1.0")]
#[command(about = "A pixelflut canvas server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address the pixelflut protocol listens on (e.g., 0.0.0.0:7791)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Address the viewer streams listen on (e.g., 0.0.0.0:7792)
    #[arg(long)]
    pub viewer_listen: Option<String>,

    /// Main canvas width in pixels
    #[arg(long)]
    pub width: Option<u16>,

    /// Main canvas height in pixels
    #[arg(long)]
    pub height: Option<u16>,

    /// Initial canvas contents
    #[arg(long, value_enum)]
    pub fill: Option<FillKind>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FillKind {
    Random,
    Solid,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub canvas: CanvasConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent protocol connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            workers: None,
        }
    }
}

/// Canvas sizes and initial contents
#[derive(Debug, Deserialize)]
pub struct CanvasConfig {
    #[serde(default = "default_width")]
    pub width: u16,
    #[serde(default = "default_height")]
    pub height: u16,
    #[serde(default = "default_icon_size")]
    pub icon_width: u16,
    #[serde(default = "default_icon_size")]
    pub icon_height: u16,
    #[serde(default = "default_fill")]
    pub fill: FillKind,
    /// Hex color used when `fill = "solid"`
    #[serde(default = "default_fill_color")]
    pub fill_color: String,
}

impl Default for CanvasConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            icon_width: default_icon_size(),
            icon_height: default_icon_size(),
            fill: default_fill(),
            fill_color: default_fill_color(),
        }
    }
}

/// Wire protocol limits
#[derive(Debug, Deserialize)]
pub struct ProtocolConfig {
    /// Longest accepted text line, terminator included
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
    /// How long an unrecognized opcode may stall a connection
    #[serde(default = "default_stall_grace_ms")]
    pub stall_grace_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_line_length: default_max_line_length(),
            stall_grace_ms: default_stall_grace_ms(),
        }
    }
}

/// Viewer streams and frame pacing
#[derive(Debug, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default = "default_viewer_listen")]
    pub viewer_listen: String,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_idle_after_ms")]
    pub idle_after_ms: u64,
    #[serde(default = "default_idle_ceiling_ms")]
    pub idle_ceiling_ms: u64,
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    /// JPEG quality of the main canvas stream
    #[serde(default = "default_grid_quality")]
    pub grid_quality: u8,
    /// JPEG quality of icon frames and snapshots
    #[serde(default = "default_icon_quality")]
    pub icon_quality: u8,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            viewer_listen: default_viewer_listen(),
            frame_interval_ms: default_frame_interval_ms(),
            idle_after_ms: default_idle_after_ms(),
            idle_ceiling_ms: default_idle_ceiling_ms(),
            subscriber_queue: default_subscriber_queue(),
            write_timeout_ms: default_write_timeout_ms(),
            stats_interval_ms: default_stats_interval_ms(),
            grid_quality: default_grid_quality(),
            icon_quality: default_icon_quality(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:7791".to_string()
}

fn default_viewer_listen() -> String {
    "0.0.0.0:7792".to_string()
}

fn default_max_connections() -> usize {
    10000
}

fn default_width() -> u16 {
    800
}

fn default_height() -> u16 {
    600
}

fn default_icon_size() -> u16 {
    32
}

fn default_fill() -> FillKind {
    FillKind::Random
}

fn default_fill_color() -> String {
    "000000".to_string()
}

fn default_max_line_length() -> usize {
    1024
}

fn default_stall_grace_ms() -> u64 {
    5000
}

fn default_frame_interval_ms() -> u64 {
    25
}

fn default_idle_after_ms() -> u64 {
    50
}

fn default_idle_ceiling_ms() -> u64 {
    25_000
}

fn default_subscriber_queue() -> usize {
    4
}

fn default_write_timeout_ms() -> u64 {
    5000
}

fn default_stats_interval_ms() -> u64 {
    1000
}

fn default_grid_quality() -> u8 {
    75
}

fn default_icon_quality() -> u8 {
    90
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub viewer_listen: String,
    pub max_connections: usize,
    pub workers: Option<usize>,
    pub width: u16,
    pub height: u16,
    pub icon_width: u16,
    pub icon_height: u16,
    pub fill: Fill,
    pub max_line_length: usize,
    pub stall_grace: Duration,
    pub hub: HubConfig,
    pub pacer: PacerConfig,
    pub stats_interval: Duration,
    pub grid_quality: u8,
    pub icon_quality: u8,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            server,
            canvas,
            protocol,
            broadcast,
            logging,
        } = toml_config;

        let fill = match cli.fill.unwrap_or(canvas.fill) {
            FillKind::Random => Fill::Random,
            FillKind::Solid => {
                let color = decode_hex_color(canvas.fill_color.as_bytes()).map_err(|e| {
                    ConfigError::Invalid(format!("fill_color '{}': {}", canvas.fill_color, e))
                })?;
                Fill::Solid(color)
            }
        };

        let config = Config {
            listen: cli.listen.unwrap_or(server.listen),
            viewer_listen: cli.viewer_listen.unwrap_or(broadcast.viewer_listen),
            max_connections: server.max_connections,
            workers: cli.workers.or(server.workers),
            width: cli.width.unwrap_or(canvas.width),
            height: cli.height.unwrap_or(canvas.height),
            icon_width: canvas.icon_width,
            icon_height: canvas.icon_height,
            fill,
            max_line_length: protocol.max_line_length,
            stall_grace: Duration::from_millis(protocol.stall_grace_ms),
            hub: HubConfig {
                queue_len: broadcast.subscriber_queue,
                write_timeout: Duration::from_millis(broadcast.write_timeout_ms),
            },
            pacer: PacerConfig {
                frame_interval: Duration::from_millis(broadcast.frame_interval_ms),
                idle_after: Duration::from_millis(broadcast.idle_after_ms),
                idle_ceiling: Duration::from_millis(broadcast.idle_ceiling_ms),
            },
            stats_interval: Duration::from_millis(broadcast.stats_interval_ms),
            grid_quality: broadcast.grid_quality,
            icon_quality: broadcast.icon_quality,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sizes = [
            ("width", self.width),
            ("height", self.height),
            ("icon_width", self.icon_width),
            ("icon_height", self.icon_height),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }

        let intervals = [
            ("frame_interval_ms", self.pacer.frame_interval),
            ("idle_ceiling_ms", self.pacer.idle_ceiling),
            ("write_timeout_ms", self.hub.write_timeout),
            ("stats_interval_ms", self.stats_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }

        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }

        let qualities = [
            ("grid_quality", self.grid_quality),
            ("icon_quality", self.icon_quality),
        ];
        for (name, quality) in qualities {
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::Invalid(format!("{name} must be within 1..=100")));
            }
        }

        if self.max_connections == 0 || self.hub.queue_len == 0 || self.max_line_length < 8 {
            return Err(ConfigError::Invalid(
                "max_connections, subscriber_queue and max_line_length are too small".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
