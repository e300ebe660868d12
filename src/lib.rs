pub mod bridge;
pub mod device;
pub mod error;
pub mod lifecycle;
pub mod render;
pub mod utils;

use serde::{Deserialize, Serialize};

use crate::device::graph::{BoardSocket, H264Profile, SensorResolution};
use crate::device::{DeviceInfo, Endpoint};

pub use device::frame::{FrameType, ImgFrame, Message};
pub use error::{Error, Result, RUNTIME_FAILURE_EXIT_CODE, SETUP_FAILURE_EXIT_CODE};

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "DEPTHLINK_CONFIG";
/// Configuration file looked up when `DEPTHLINK_CONFIG` is unset. Optional.
pub const DEFAULT_CONFIG_FILE: &str = "depthlink.toml";
/// Prefix for environment overrides, e.g. `DEPTHLINK__DEVICE__ADDRESS`
pub const ENV_PREFIX: &str = "DEPTHLINK";

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub render: RenderConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Networked camera streaming over TCP
    Tcp,
    /// Local V4L2 camera, encoding runs on the host
    V4l2,
    /// Live test pattern, for running without hardware
    Test,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
    pub v4l2_device: String,
    pub socket: BoardSocket,
    pub sensor_resolution: SensorResolution,
    /// Video output size for the raw stream
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub profile: H264Profile,
    pub bitrate_kbps: Option<u32>,
}

impl DeviceConfig {
    pub fn device_info(&self) -> DeviceInfo {
        let endpoint = match self.protocol {
            Protocol::Tcp => Endpoint::Tcp {
                host: self.address.clone(),
                port: self.port,
            },
            Protocol::V4l2 => Endpoint::V4l2 {
                path: self.v4l2_device.clone(),
            },
            Protocol::Test => Endpoint::Test,
        };
        DeviceInfo { endpoint }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Sink element name, or `detect` to pick the best available one
    pub video_sink: String,
    /// Decoder element name; `None` picks one based on `use_hardware_acceleration`
    pub decoder: Option<String>,
    pub use_hardware_acceleration: bool,
    pub sync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub queue_size: usize,
    pub blocking: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                protocol: Protocol::Tcp,
                address: "192.168.1.211".into(),
                port: 5000,
                v4l2_device: "/dev/video0".into(),
                socket: BoardSocket::Rgb,
                sensor_resolution: SensorResolution::The1080p,
                width: 1280,
                height: 720,
                fps: 30,
                profile: H264Profile::Main,
                bitrate_kbps: None,
            },
            render: RenderConfig {
                video_sink: "autovideosink".into(),
                decoder: None,
                use_hardware_acceleration: false,
                sync: false,
            },
            pipeline: PipelineConfig {
                queue_size: 30,
                blocking: false,
            },
        }
    }
}

/// Load configuration from defaults, the optional config file and the environment
pub fn load_config() -> Result<Config> {
    let path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    load_config_from(&path)
}

pub fn load_config_from(path: &str) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::Config::try_from(&Config::default())?)
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?;

    Ok(settings.try_deserialize()?)
}
