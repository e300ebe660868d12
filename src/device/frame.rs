use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Image frame delivered by the device output queue
#[derive(Debug, Clone)]
pub struct ImgFrame {
    /// Frame payload: NV12 pixels or one H.264 access unit
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Host arrival time
    pub timestamp: Instant,
}

impl ImgFrame {
    pub fn new(data: Bytes, meta: FrameMetadata) -> Self {
        Self {
            data,
            meta: Arc::new(meta),
            timestamp: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub frame_type: FrameType,
    pub device_timestamp: Option<Duration>, // Presentation timestamp from the device stream
}

/// Stream formats a device can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Nv12,
    H264,
}

impl FrameType {
    pub fn name(self) -> &'static str {
        match self {
            FrameType::Nv12 => "NV12",
            FrameType::H264 => "H.264",
        }
    }
}

/// Datatype delivered through an output queue.
///
/// Only `Frame` carries image data; the other variants describe the stream.
#[derive(Debug, Clone)]
pub enum Message {
    Frame(ImgFrame),
    /// Negotiated stream caps changed, carries the new caps string
    StreamChanged { caps: String },
    EndOfStream,
}

impl Message {
    pub fn as_frame(&self) -> Option<&ImgFrame> {
        match self {
            Message::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}
