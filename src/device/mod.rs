pub mod frame;
pub mod graph;
pub mod gst_device;
pub mod queue;

use std::fmt;

pub use frame::{FrameType, ImgFrame, Message};
pub use graph::{DeviceGraph, StreamSpec};
pub use gst_device::Device;
pub use queue::{OutputQueue, QueueStats};

/// Where the camera is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    V4l2 { path: String },
    Test,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub endpoint: Endpoint,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Endpoint::V4l2 { path } => write!(f, "v4l2://{path}"),
            Endpoint::Test => f.write_str("test://pattern"),
        }
    }
}
