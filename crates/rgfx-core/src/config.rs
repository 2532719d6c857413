use serde::{Deserialize, Serialize};

use crate::error::GfxError;

/// Top-level rgfx configuration, loaded from rgfx.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RgfxConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub graphics: GraphicsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Channels a client may open per session
    #[serde(default = "default_channels")]
    pub channels: u32,
    /// Largest accepted frame payload in bytes
    #[serde(default = "default_frame_buffer_size")]
    pub frame_buffer_size: u32,
    /// Drop a session after this many seconds without traffic on any channel
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Maximum concurrent sessions
    #[serde(default = "default_max_clients")]
    pub max_clients: u32,
    /// Seconds between metrics log lines (0 = off)
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Host address (host:port)
    #[serde(default = "default_address")]
    pub address: String,
    /// Channels to open
    #[serde(default = "default_channels")]
    pub channels: u32,
    /// Per-request response timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Name sent in Hello
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphicsConfig {
    /// Frames in flight
    #[serde(default = "default_max_frames")]
    pub max_frames: u32,
    /// Open batches per queue per frame
    #[serde(default = "default_max_pending_batches")]
    pub max_pending_batches: u32,
    /// Slots per handle registry
    #[serde(default = "default_handle_capacity")]
    pub handle_capacity: usize,
    /// Capture arena block size, also the upload chunk size
    #[serde(default = "default_upload_block_size")]
    pub upload_block_size: u64,
    /// Static staging buffer size per frame and queue
    #[serde(default = "default_static_staging_size")]
    pub static_staging_size: u64,
    /// Size of each dynamic staging block
    #[serde(default = "default_dynamic_block_size")]
    pub dynamic_block_size: u64,
    /// Cap on total dynamic staging memory
    #[serde(default = "default_max_dynamic_size")]
    pub max_dynamic_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            channels: default_channels(),
            frame_buffer_size: default_frame_buffer_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_clients: default_max_clients(),
            metrics_interval_secs: default_metrics_interval_secs(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            channels: default_channels(),
            request_timeout_ms: default_request_timeout_ms(),
            client_name: default_client_name(),
        }
    }
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            max_frames: default_max_frames(),
            max_pending_batches: default_max_pending_batches(),
            handle_capacity: default_handle_capacity(),
            upload_block_size: default_upload_block_size(),
            static_staging_size: default_static_staging_size(),
            dynamic_block_size: default_dynamic_block_size(),
            max_dynamic_size: default_max_dynamic_size(),
        }
    }
}

impl RgfxConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, GfxError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GfxError::Config(format!("{}: {}", path, e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, GfxError> {
        let config: RgfxConfig =
            toml::from_str(content).map_err(|e| GfxError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), GfxError> {
        let g = &self.graphics;
        if g.max_frames == 0 || g.max_frames > rgfx_protocol::FrameId::MAX_FRAMES_LIMIT {
            return Err(GfxError::Config(format!(
                "graphics.max_frames must be in 1..={}, got {}",
                rgfx_protocol::FrameId::MAX_FRAMES_LIMIT,
                g.max_frames
            )));
        }
        if g.max_pending_batches == 0 {
            return Err(GfxError::Config("graphics.max_pending_batches must be > 0".into()));
        }
        if g.handle_capacity == 0 {
            return Err(GfxError::Config("graphics.handle_capacity must be > 0".into()));
        }
        if g.upload_block_size < 256 {
            return Err(GfxError::Config(format!(
                "graphics.upload_block_size must be at least 256, got {}",
                g.upload_block_size
            )));
        }
        if g.dynamic_block_size == 0 || g.max_dynamic_size < g.dynamic_block_size {
            return Err(GfxError::Config(
                "graphics.max_dynamic_size must hold at least one dynamic block".into(),
            ));
        }
        if self.server.channels == 0 || self.server.channels > 32 {
            return Err(GfxError::Config("server.channels must be in 1..=32".into()));
        }
        if self.client.channels == 0 || self.client.channels > 32 {
            return Err(GfxError::Config("client.channels must be in 1..=32".into()));
        }
        if self.server.frame_buffer_size < 64 * 1024 {
            return Err(GfxError::Config("server.frame_buffer_size must be at least 64 KiB".into()));
        }
        Ok(())
    }
}

/// Returns the default config file path.
/// Search order:
/// 1. System-wide config: `/etc/rgfx/rgfx.toml`
/// 2. Local fallback: `./rgfx.toml`
pub fn default_config_path() -> String {
    let system_path = "/etc/rgfx/rgfx.toml";
    if std::path::Path::new(system_path).exists() {
        return system_path.to_string();
    }
    "rgfx.toml".to_string()
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9877
}

fn default_channels() -> u32 {
    3
}

fn default_frame_buffer_size() -> u32 {
    4 * 1024 * 1024
}

fn default_idle_timeout_secs() -> u64 {
    120
}

fn default_max_clients() -> u32 {
    16
}

fn default_metrics_interval_secs() -> u64 {
    60
}

fn default_address() -> String {
    "127.0.0.1:9877".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_client_name() -> String {
    "rgfx-client".to_string()
}

fn default_max_frames() -> u32 {
    2
}

fn default_max_pending_batches() -> u32 {
    16
}

fn default_handle_capacity() -> usize {
    4096
}

fn default_upload_block_size() -> u64 {
    4 * 1024 * 1024
}

fn default_static_staging_size() -> u64 {
    8 * 1024 * 1024
}

fn default_dynamic_block_size() -> u64 {
    4 * 1024 * 1024
}

fn default_max_dynamic_size() -> u64 {
    256 * 1024 * 1024
}
