//! Declarative device processing graph: camera -> optional encoder -> output queue

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::frame::FrameType;
use crate::error::{Error, Result};
use crate::{DeviceConfig, PipelineConfig};

/// Stream name of the encoded output queue
pub const H264_STREAM: &str = "h264";
/// Stream name of the raw video output queue
pub const VIDEO_STREAM: &str = "video";

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardSocket {
    Auto,
    Rgb,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorResolution {
    #[serde(rename = "1080p")]
    The1080p,
    #[serde(rename = "4k")]
    The4k,
    #[serde(rename = "12mp")]
    The12mp,
}

impl SensorResolution {
    pub fn size(self) -> (u32, u32) {
        match self {
            SensorResolution::The1080p => (1920, 1080),
            SensorResolution::The4k => (3840, 2160),
            SensorResolution::The12mp => (4056, 3040),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum H264Profile {
    Baseline,
    Main,
    High,
}

impl H264Profile {
    pub fn caps_name(self) -> &'static str {
        match self {
            H264Profile::Baseline => "baseline",
            H264Profile::Main => "main",
            H264Profile::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraNode {
    pub socket: BoardSocket,
    pub resolution: SensorResolution,
    /// Cropped/scaled video output; the full sensor size when unset
    pub video_size: Option<(u32, u32)>,
    pub fps: u32,
}

impl CameraNode {
    pub fn output_size(&self) -> (u32, u32) {
        self.video_size.unwrap_or_else(|| self.resolution.size())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderNode {
    pub profile: H264Profile,
    pub fps: u32,
    pub bitrate_kbps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputNode {
    pub stream_name: String,
    pub queue_size: usize,
    pub blocking: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Camera(CameraNode),
    VideoEncoder(EncoderNode),
    Output(OutputNode),
}

impl Node {
    fn kind(&self) -> &'static str {
        match self {
            Node::Camera(_) => "camera",
            Node::VideoEncoder(_) => "video encoder",
            Node::Output(_) => "output",
        }
    }
}

/// Validated, linear view of a [`DeviceGraph`]
#[derive(Debug, Clone, Copy)]
pub struct GraphPlan<'a> {
    pub camera: &'a CameraNode,
    pub encoder: Option<&'a EncoderNode>,
    pub output: &'a OutputNode,
}

impl GraphPlan<'_> {
    pub fn frame_type(&self) -> FrameType {
        if self.encoder.is_some() {
            FrameType::H264
        } else {
            FrameType::Nv12
        }
    }

    /// Stream parameters the render side has to negotiate
    pub fn stream_spec(&self) -> StreamSpec {
        let (width, height) = self.camera.output_size();
        StreamSpec {
            stream_name: self.output.stream_name.clone(),
            frame_type: self.frame_type(),
            width,
            height,
            fps: self.encoder.map_or(self.camera.fps, |enc| enc.fps),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub stream_name: String,
    pub frame_type: FrameType,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceGraph {
    nodes: Vec<Node>,
    links: Vec<(NodeId, NodeId)>,
}

impl DeviceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_camera(&mut self, camera: CameraNode) -> NodeId {
        self.push(Node::Camera(camera))
    }

    pub fn create_encoder(&mut self, encoder: EncoderNode) -> NodeId {
        self.push(Node::VideoEncoder(encoder))
    }

    pub fn create_output(&mut self, output: OutputNode) -> NodeId {
        self.push(Node::Output(output))
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Link the output of `from` to the input of `to`
    pub fn link(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        let (src, dst) = match (self.nodes.get(from), self.nodes.get(to)) {
            (Some(src), Some(dst)) => (src, dst),
            _ => {
                return Err(Error::Link {
                    from: format!("node {from}"),
                    to: format!("node {to}"),
                })
            }
        };

        let allowed = matches!(
            (src, dst),
            (Node::Camera(_), Node::VideoEncoder(_))
                | (Node::Camera(_), Node::Output(_))
                | (Node::VideoEncoder(_), Node::Output(_))
        );
        let occupied = self.links.iter().any(|&(f, t)| f == from || t == to);

        if from == to || !allowed || occupied {
            return Err(Error::Link {
                from: format!("{} {from}", src.kind()),
                to: format!("{} {to}", dst.kind()),
            });
        }

        debug!(from, to, "Linked {} -> {}", src.kind(), dst.kind());
        self.links.push((from, to));
        Ok(())
    }

    fn upstream(&self, id: NodeId) -> Option<NodeId> {
        self.links.iter().find(|&&(_, t)| t == id).map(|&(f, _)| f)
    }

    /// Check the graph is one complete chain and return it
    pub fn validate(&self) -> Result<GraphPlan<'_>> {
        let count = |kind: fn(&Node) -> bool| self.nodes.iter().filter(|n| kind(n)).count();
        if count(|n| matches!(n, Node::Camera(_))) != 1 {
            return Err(Error::Graph("expected exactly one camera node".into()));
        }
        if count(|n| matches!(n, Node::Output(_))) != 1 {
            return Err(Error::Graph("expected exactly one output node".into()));
        }
        if count(|n| matches!(n, Node::VideoEncoder(_))) > 1 {
            return Err(Error::Graph("at most one video encoder is supported".into()));
        }

        let output_id = self
            .nodes
            .iter()
            .position(|n| matches!(n, Node::Output(_)))
            .ok_or_else(|| Error::Graph("missing output node".into()))?;

        let mut encoder = None;
        let mut current = output_id;
        let camera = loop {
            let up = self
                .upstream(current)
                .ok_or_else(|| Error::Graph(format!("node {current} has no input")))?;
            match &self.nodes[up] {
                Node::Camera(camera) => break camera,
                Node::VideoEncoder(enc) => encoder = Some(enc),
                Node::Output(_) => return Err(Error::Graph("output feeds another node".into())),
            }
            current = up;
        };

        if encoder.is_none() && self.nodes.iter().any(|n| matches!(n, Node::VideoEncoder(_))) {
            return Err(Error::Graph("video encoder is not linked".into()));
        }

        let Node::Output(output) = &self.nodes[output_id] else {
            return Err(Error::Graph("missing output node".into()));
        };
        if output.queue_size == 0 {
            return Err(Error::Graph("output queue size must be non-zero".into()));
        }

        Ok(GraphPlan {
            camera,
            encoder,
            output,
        })
    }

    /// Camera -> H.264 encoder -> `h264` output
    pub fn encoded(device: &DeviceConfig, pipeline: &PipelineConfig) -> Result<Self> {
        let mut graph = Self::new();
        let camera = graph.create_camera(CameraNode {
            socket: device.socket,
            resolution: device.sensor_resolution,
            video_size: None,
            fps: device.fps,
        });
        let encoder = graph.create_encoder(EncoderNode {
            profile: device.profile,
            fps: device.fps,
            bitrate_kbps: device.bitrate_kbps,
        });
        let output = graph.create_output(OutputNode {
            stream_name: H264_STREAM.into(),
            queue_size: pipeline.queue_size,
            blocking: pipeline.blocking,
        });

        graph.link(camera, encoder)?;
        graph.link(encoder, output)?;
        Ok(graph)
    }

    /// Camera video output at the configured size -> `video` output
    pub fn raw(device: &DeviceConfig, pipeline: &PipelineConfig) -> Result<Self> {
        let mut graph = Self::new();
        let camera = graph.create_camera(CameraNode {
            socket: device.socket,
            resolution: device.sensor_resolution,
            video_size: Some((device.width, device.height)),
            fps: device.fps,
        });
        let output = graph.create_output(OutputNode {
            stream_name: VIDEO_STREAM.into(),
            queue_size: pipeline.queue_size,
            blocking: pipeline.blocking,
        });

        graph.link(camera, output)?;
        Ok(graph)
    }

    pub fn for_format(
        format: FrameType,
        device: &DeviceConfig,
        pipeline: &PipelineConfig,
    ) -> Result<Self> {
        match format {
            FrameType::H264 => Self::encoded(device, pipeline),
            FrameType::Nv12 => Self::raw(device, pipeline),
        }
    }
}
