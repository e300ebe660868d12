//! GStreamer realisation of a device graph
//!
//! The camera node becomes a source chain for the configured endpoint, the
//! encoder node a hardware (or software fallback) H.264 encoder, and the
//! output node an appsink feeding an [`OutputQueue`].

use std::sync::Arc;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, instrument, warn};

use crate::device::frame::{FrameMetadata, FrameType, ImgFrame, Message};
use crate::device::graph::{DeviceGraph, EncoderNode, GraphPlan};
use crate::device::queue::{output_queue, OutputQueue, QueueSender};
use crate::device::{DeviceInfo, Endpoint};
use crate::error::{Error, Result};
use crate::utils;

/// A connected device with its graph running
pub struct Device {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    queue: Arc<OutputQueue>,
    info: DeviceInfo,
}

impl Device {
    /// Build the graph for `info` and start it
    #[instrument(skip(graph))]
    pub fn connect(info: DeviceInfo, graph: &DeviceGraph) -> Result<Self> {
        let plan = graph.validate()?;
        gst::init()?;

        info!(
            "Connecting to device at {} ({:?} socket, {} stream)",
            info,
            plan.camera.socket,
            plan.frame_type().name()
        );

        let pipeline = gst::Pipeline::with_name("device");
        let mut chain = Self::build_source_chain(&info, &plan)?;

        let output = plan.output;
        let appsink = utils::make_element("appsink", &output.stream_name)?
            .dynamic_cast::<gst_app::AppSink>()
            .map_err(|_| Error::Element {
                factory: "appsink".into(),
            })?;
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", output.queue_size as u32);
        appsink.set_property("drop", !output.blocking);
        appsink.set_property("sync", false);
        appsink.set_property("enable-last-sample", false);
        chain.push(appsink.clone().upcast());

        pipeline
            .add_many(&chain)
            .map_err(|e| Error::Pipeline(e.to_string()))?;
        utils::link_chain(&chain)?;

        let (sender, queue) = output_queue(&output.stream_name, output.queue_size, output.blocking);
        Self::attach_sink(&appsink, sender, &plan);

        let device = Self {
            pipeline,
            appsink,
            queue: Arc::new(queue),
            info,
        };
        device.start()?;
        Ok(device)
    }

    fn build_source_chain(info: &DeviceInfo, plan: &GraphPlan<'_>) -> Result<Vec<gst::Element>> {
        let (width, height) = plan.camera.output_size();
        let fps = gst::Fraction::new(plan.camera.fps as i32, 1);
        let mut chain = Vec::new();

        match &info.endpoint {
            Endpoint::Tcp { host, port } => {
                // The device runs camera and encoder; the host only parses the stream
                chain.push(
                    gst::ElementFactory::make("tcpclientsrc")
                        .name("camera")
                        .property("host", host.as_str())
                        .property("port", i32::from(*port))
                        .build()
                        .map_err(|_| Error::Element {
                            factory: "tcpclientsrc".into(),
                        })?,
                );
                match plan.frame_type() {
                    FrameType::H264 => {
                        chain.push(Self::h264_parser()?);
                        chain.push(Self::capsfilter("au-caps", h264_au_caps())?);
                    }
                    FrameType::Nv12 => {
                        chain.push(
                            gst::ElementFactory::make("rawvideoparse")
                                .name("rawparse")
                                .property_from_str("format", "nv12")
                                .property("width", width as i32)
                                .property("height", height as i32)
                                .property("framerate", fps)
                                .build()
                                .map_err(|_| Error::Element {
                                    factory: "rawvideoparse".into(),
                                })?,
                        );
                    }
                }
            }
            Endpoint::V4l2 { .. } | Endpoint::Test => {
                let source = match &info.endpoint {
                    Endpoint::V4l2 { path } => {
                        let source = utils::make_element("v4l2src", "camera")?;
                        source.set_property("device", path.as_str());
                        source
                    }
                    _ => {
                        let source = utils::make_element("videotestsrc", "camera")?;
                        source.set_property("is-live", true);
                        source
                    }
                };
                chain.push(source);
                chain.push(utils::make_element("videoconvert", "convert")?);
                chain.push(utils::make_element("videoscale", "scale")?);
                chain.push(utils::make_element("videorate", "rate")?);

                let raw_caps = gst_video::VideoCapsBuilder::new()
                    .format(gst_video::VideoFormat::Nv12)
                    .width(width as i32)
                    .height(height as i32)
                    .framerate(fps)
                    .build();
                chain.push(Self::capsfilter("video-caps", raw_caps)?);

                if let Some(encoder) = plan.encoder {
                    chain.push(Self::h264_encoder(encoder)?);
                    chain.push(Self::capsfilter(
                        "profile-caps",
                        gst::Caps::builder("video/x-h264")
                            .field("profile", encoder.profile.caps_name())
                            .build(),
                    )?);
                    chain.push(Self::h264_parser()?);
                    chain.push(Self::capsfilter("au-caps", h264_au_caps())?);
                }
            }
        }

        Ok(chain)
    }

    fn h264_encoder(node: &EncoderNode) -> Result<gst::Element> {
        let factory = utils::detect_h264_encoder();
        let encoder = utils::make_element(factory, "encoder")?;

        if let Some(bitrate) = node.bitrate_kbps {
            if encoder.find_property("bitrate").is_some() {
                encoder.set_property("bitrate", bitrate);
            } else {
                warn!("{} has no bitrate property, using its default", factory);
            }
        }
        if factory == "x264enc" {
            encoder.set_property_from_str("tune", "zerolatency");
            encoder.set_property("key-int-max", node.fps);
        }
        Ok(encoder)
    }

    fn h264_parser() -> Result<gst::Element> {
        let parser = utils::make_element("h264parse", "parse")?;
        // Repeat SPS/PPS with every IDR so a late render pipeline can start decoding
        parser.set_property("config-interval", -1i32);
        Ok(parser)
    }

    fn capsfilter(name: &str, caps: gst::Caps) -> Result<gst::Element> {
        let filter = utils::make_element("capsfilter", name)?;
        filter.set_property("caps", &caps);
        Ok(filter)
    }

    /// Route appsink samples and EOS into the output queue
    fn attach_sink(appsink: &gst_app::AppSink, sender: QueueSender, plan: &GraphPlan<'_>) {
        let frame_type = plan.frame_type();
        let (default_width, default_height) = plan.camera.output_size();
        let eos_sender = sender.clone();

        let mut sequence = 0u64;
        let mut last_caps: Option<gst::Caps> = None;
        let mut size = (default_width, default_height);

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |appsink| {
                    let sample = appsink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;

                    if let Some(caps) = sample.caps() {
                        if last_caps.as_deref() != Some(caps) {
                            debug!("Device stream caps: {}", caps);
                            size = caps_size(caps).unwrap_or(size);
                            last_caps = Some(caps.to_owned());
                            sender.push(Message::StreamChanged {
                                caps: caps.to_string(),
                            });
                        }
                    }

                    let map = buffer.map_readable().map_err(|_| gst::FlowError::Error)?;
                    sequence += 1;

                    let frame = ImgFrame::new(
                        Bytes::copy_from_slice(map.as_slice()),
                        FrameMetadata {
                            sequence,
                            width: size.0,
                            height: size.1,
                            frame_type,
                            device_timestamp: buffer.pts().map(|pts| pts.into()),
                        },
                    );

                    if sender.push(Message::Frame(frame)) {
                        Ok(gst::FlowSuccess::Ok)
                    } else {
                        Err(gst::FlowError::Flushing)
                    }
                })
                .eos(move |_| {
                    info!("Device stream ended");
                    eos_sender.push(Message::EndOfStream);
                })
                .build(),
        );
    }

    fn start(&self) -> Result<()> {
        info!("Starting device pipeline");

        let failed = || match &self.info.endpoint {
            Endpoint::Tcp { .. } => Error::Connection {
                address: self.info.to_string(),
            },
            _ => Error::StateChange {
                pipeline: "device",
                state: "playing",
            },
        };

        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|_| failed())?;

        // Wait for the source to come up so connection errors surface here
        let (state_change, _, _) = self.pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => {
                info!("Device pipeline started successfully");
                Ok(())
            }
            Ok(gst::StateChangeSuccess::Async) => {
                info!("Device pipeline starting asynchronously");
                Ok(())
            }
            Err(_) => {
                let _ = self.pipeline.set_state(gst::State::Null);
                Err(failed())
            }
        }
    }

    /// Output queue for the graph's output node
    pub fn output_queue(&self, name: &str) -> Result<Arc<OutputQueue>> {
        if self.queue.name() == name {
            Ok(self.queue.clone())
        } else {
            Err(Error::UnknownQueue(name.to_string()))
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Log device bus errors and warnings. `on_error` runs after an error
    /// has been logged, e.g. when the TCP stream drops or the encoder fails.
    pub fn watch_bus<F>(&self, on_error: F) -> Result<gst::bus::BusWatchGuard>
    where
        F: Fn() + Send + 'static,
    {
        utils::watch_bus(&self.pipeline, on_error)
    }

    /// Stop the device pipeline, release the queue producer and join delivery
    pub fn close(&self) {
        info!("Closing device at {}", self.info);

        // A streaming thread blocked on a full queue must return before NULL completes
        self.queue.mark_closed();
        if self.pipeline.set_state(gst::State::Null).is_err() {
            warn!("Failed to stop device pipeline");
        }
        self.appsink
            .set_callbacks(gst_app::AppSinkCallbacks::builder().build());
        self.queue.close();
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}

/// Byte-stream, access-unit aligned H.264
fn h264_au_caps() -> gst::Caps {
    gst::Caps::builder("video/x-h264")
        .field("stream-format", "byte-stream")
        .field("alignment", "au")
        .build()
}

fn caps_size(caps: &gst::CapsRef) -> Option<(u32, u32)> {
    let s = caps.structure(0)?;
    let width = s.get::<i32>("width").ok()?;
    let height = s.get::<i32>("height").ok()?;
    Some((width as u32, height as u32))
}
