//! GStreamer render pipeline fed from Rust through appsrc

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{info, instrument};

use crate::bridge::FrameSink;
use crate::device::frame::FrameType;
use crate::device::graph::StreamSpec;
use crate::error::{Error, Result};
use crate::utils;
use crate::RenderConfig;

/// Sink value that selects the best available video sink
pub const DETECT_SINK: &str = "detect";

/// appsrc -> [queue -> h264parse -> decoder | videoconvert] -> video sink
pub struct RenderPipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    sink: gst::Element,
}

impl RenderPipeline {
    /// Create the render pipeline for `spec`. Elements are created and
    /// linked one by one so a failure names the offending stage.
    #[instrument(skip(config), fields(format = spec.frame_type.name()))]
    pub fn new(config: &RenderConfig, spec: &StreamSpec) -> Result<Self> {
        gst::init()?;

        let pipeline = gst::Pipeline::with_name("render");

        let caps = appsrc_caps(spec);
        info!("Render caps: {}", caps);

        let appsrc = utils::make_element("appsrc", "appsrc")?
            .dynamic_cast::<gst_app::AppSrc>()
            .map_err(|_| Error::Element {
                factory: "appsrc".into(),
            })?;
        appsrc.set_caps(Some(&caps));
        appsrc.set_property("is-live", true);
        appsrc.set_property("do-timestamp", true);
        appsrc.set_property("block", false);
        appsrc.set_format(gst::Format::Time);

        let mut chain: Vec<gst::Element> = vec![appsrc.clone().upcast()];
        match spec.frame_type {
            FrameType::H264 => {
                let decoder = match &config.decoder {
                    Some(decoder) => decoder.clone(),
                    None => utils::detect_h264_decoder(config.use_hardware_acceleration).to_string(),
                };
                info!("Using H.264 decoder: {}", decoder);

                chain.push(utils::make_element("queue", "queue")?);
                chain.push(utils::make_element("h264parse", "h264parse")?);
                chain.push(utils::make_element(&decoder, "decoder")?);
            }
            FrameType::Nv12 => {
                chain.push(utils::make_element("videoconvert", "convert")?);
            }
        }

        let sink_factory = if config.video_sink == DETECT_SINK {
            utils::detect_video_sink()
        } else {
            config.video_sink.as_str()
        };
        info!("Using video sink: {}", sink_factory);
        let sink = utils::make_element(sink_factory, "videosink")?;
        if sink.find_property("sync").is_some() {
            sink.set_property("sync", config.sync);
        }
        chain.push(sink.clone());

        pipeline
            .add_many(&chain)
            .map_err(|e| Error::Pipeline(e.to_string()))?;
        utils::link_chain(&chain)?;

        Ok(Self {
            pipeline,
            appsrc,
            sink,
        })
    }

    /// Start the render pipeline
    pub fn start(&self) -> Result<()> {
        info!("Starting render pipeline");

        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|_| Error::StateChange {
                pipeline: "render",
                state: "playing",
            })?;
        Ok(())
    }

    /// Stop the render pipeline
    pub fn stop(&self) -> Result<()> {
        info!("Stopping render pipeline");

        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|_| Error::StateChange {
                pipeline: "render",
                state: "null",
            })?;
        Ok(())
    }

    /// Log bus errors and warnings. `on_error` runs after an error has been logged.
    pub fn watch_bus<F>(&self, on_error: F) -> Result<gst::bus::BusWatchGuard>
    where
        F: Fn() + Send + 'static,
    {
        utils::watch_bus(&self.pipeline, on_error)
    }

    /// The video sink element
    pub fn sink(&self) -> &gst::Element {
        &self.sink
    }
}

impl FrameSink for RenderPipeline {
    fn submit(&self, buffer: gst::Buffer) -> std::result::Result<gst::FlowSuccess, gst::FlowError> {
        self.appsrc.push_buffer(buffer)
    }
}

impl Drop for RenderPipeline {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Caps announced on appsrc for a stream
pub fn appsrc_caps(spec: &StreamSpec) -> gst::Caps {
    let framerate = gst::Fraction::new(spec.fps as i32, 1);
    match spec.frame_type {
        FrameType::Nv12 => gst_video::VideoCapsBuilder::new()
            .format(gst_video::VideoFormat::Nv12)
            .width(spec.width as i32)
            .height(spec.height as i32)
            .framerate(framerate)
            .build(),
        FrameType::H264 => gst::Caps::builder("video/x-h264")
            .field("framerate", framerate)
            .field("stream-format", "byte-stream")
            .field("pixel-aspect-ratio", gst::Fraction::new(1, 1))
            .field("interlace-mode", "progressive")
            .build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(frame_type: FrameType) -> StreamSpec {
        StreamSpec {
            stream_name: "video".into(),
            frame_type,
            width: 1280,
            height: 720,
            fps: 30,
        }
    }

    #[test]
    fn raw_caps_describe_nv12_stream() {
        gst::init().unwrap();
        let caps = appsrc_caps(&spec(FrameType::Nv12));
        let s = caps.structure(0).unwrap();

        assert_eq!(s.name().as_str(), "video/x-raw");
        assert_eq!(s.get::<&str>("format").unwrap(), "NV12");
        assert_eq!(s.get::<i32>("width").unwrap(), 1280);
        assert_eq!(s.get::<i32>("height").unwrap(), 720);
        assert_eq!(
            s.get::<gst::Fraction>("framerate").unwrap(),
            gst::Fraction::new(30, 1)
        );
    }

    #[test]
    fn encoded_caps_describe_byte_stream() {
        gst::init().unwrap();
        let caps = appsrc_caps(&spec(FrameType::H264));
        let s = caps.structure(0).unwrap();

        assert_eq!(s.name().as_str(), "video/x-h264");
        assert_eq!(s.get::<&str>("stream-format").unwrap(), "byte-stream");
        assert_eq!(s.get::<&str>("interlace-mode").unwrap(), "progressive");
        assert!(!s.has_field("width"));
    }

    #[test]
    fn unknown_sink_is_an_element_error() {
        gst::init().unwrap();
        let config = RenderConfig {
            video_sink: "no-such-sink".into(),
            decoder: None,
            use_hardware_acceleration: false,
            sync: false,
        };
        if gst::ElementFactory::find("appsrc").is_none()
            || gst::ElementFactory::find("videoconvert").is_none()
        {
            return;
        }

        match RenderPipeline::new(&config, &spec(FrameType::Nv12)) {
            Err(Error::Element { factory }) => assert_eq!(factory, "no-such-sink"),
            other => panic!("expected element error, got {:?}", other.err()),
        }
    }
}
