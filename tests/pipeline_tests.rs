//! End-to-end tests across device queue, frame bridge and render pipeline.
//!
//! Tests that need GStreamer plugins return early when the elements are
//! not installed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use depthlink::bridge::{FrameBridge, FrameSink};
use depthlink::device::frame::FrameMetadata;
use depthlink::device::graph::{StreamSpec, H264_STREAM, VIDEO_STREAM};
use depthlink::device::queue::output_queue;
use depthlink::device::{Device, DeviceGraph, DeviceInfo, Endpoint, OutputQueue};
use depthlink::lifecycle::{self, register_bridge, FrameSource, Shutdown, ShutdownReason};
use depthlink::render::RenderPipeline;
use depthlink::{Config, Error, FrameType, ImgFrame, Message, RenderConfig};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;
const NV12_LEN: usize = (WIDTH * HEIGHT * 3 / 2) as usize;

fn has_elements(names: &[&str]) -> bool {
    gst::init().unwrap();
    names
        .iter()
        .all(|name| gst::ElementFactory::find(name).is_some())
}

fn raw_spec() -> StreamSpec {
    StreamSpec {
        stream_name: VIDEO_STREAM.into(),
        frame_type: FrameType::Nv12,
        width: WIDTH,
        height: HEIGHT,
        fps: 30,
    }
}

fn appsink_render() -> RenderConfig {
    RenderConfig {
        video_sink: "appsink".into(),
        decoder: None,
        use_hardware_acceleration: false,
        sync: false,
    }
}

fn nv12_frame(sequence: u64) -> Message {
    Message::Frame(ImgFrame::new(
        Bytes::from(vec![sequence as u8; NV12_LEN]),
        FrameMetadata {
            sequence,
            width: WIDTH,
            height: HEIGHT,
            frame_type: FrameType::Nv12,
            device_timestamp: None,
        },
    ))
}

fn render_appsink(render: &RenderPipeline) -> gst_app::AppSink {
    render
        .sink()
        .clone()
        .dynamic_cast::<gst_app::AppSink>()
        .unwrap()
}

#[test]
fn bridge_delivers_frames_to_render_sink_in_order() {
    if !has_elements(&["appsrc", "videoconvert", "appsink"]) {
        return;
    }

    let render = Arc::new(RenderPipeline::new(&appsink_render(), &raw_spec()).unwrap());
    render.start().unwrap();
    let sink = render_appsink(&render);

    let (tx, queue) = output_queue(VIDEO_STREAM, 30, true);
    let bridge = Arc::new(FrameBridge::new(render.clone()));
    let callback = bridge.clone();
    queue.add_callback(move |msg| callback.on_message(msg)).unwrap();

    tx.push(Message::StreamChanged {
        caps: "video/x-raw".into(),
    });
    for seq in 0..10 {
        assert!(tx.push(nv12_frame(seq)));
    }
    tx.push(Message::EndOfStream);

    for seq in 0..10u8 {
        let sample = sink
            .try_pull_sample(gst::ClockTime::from_seconds(5))
            .expect("frame did not reach the render sink");
        let buffer = sample.buffer().unwrap();
        assert_eq!(buffer.size(), NV12_LEN);
        let map = buffer.map_readable().unwrap();
        assert_eq!(map.as_slice()[0], seq);
    }

    queue.close();
    let stats = bridge.stats();
    assert_eq!(stats.frames_forwarded, 10);
    assert_eq!(stats.ignored_messages, 2);
}

#[test]
fn test_device_streams_nv12_frames() {
    if !has_elements(&[
        "videotestsrc",
        "videoconvert",
        "videoscale",
        "videorate",
        "capsfilter",
        "appsink",
    ]) {
        return;
    }

    let mut config = Config::default();
    config.device.width = WIDTH;
    config.device.height = HEIGHT;
    let graph = DeviceGraph::raw(&config.device, &config.pipeline).unwrap();
    let device = Device::connect(
        DeviceInfo {
            endpoint: Endpoint::Test,
        },
        &graph,
    )
    .unwrap();

    let queue = device.output_queue(VIDEO_STREAM).unwrap();
    let frames: Vec<ImgFrame> = std::iter::from_fn(|| queue.get(Duration::from_secs(5)))
        .filter_map(|msg| msg.as_frame().cloned())
        .take(3)
        .collect();

    assert_eq!(frames.len(), 3);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.len(), NV12_LEN);
        assert_eq!(frame.meta.sequence, i as u64 + 1);
        assert_eq!((frame.meta.width, frame.meta.height), (WIDTH, HEIGHT));
    }

    assert!(matches!(
        device.output_queue("h264"),
        Err(Error::UnknownQueue(_))
    ));
}

#[test]
fn blocking_device_closes_with_full_queue() {
    if !has_elements(&[
        "videotestsrc",
        "videoconvert",
        "videoscale",
        "videorate",
        "capsfilter",
        "appsink",
    ]) {
        return;
    }

    let mut config = Config::default();
    config.device.width = WIDTH;
    config.device.height = HEIGHT;
    config.pipeline.blocking = true;
    config.pipeline.queue_size = 2;
    let graph = DeviceGraph::raw(&config.device, &config.pipeline).unwrap();
    let device = Device::connect(
        DeviceInfo {
            endpoint: Endpoint::Test,
        },
        &graph,
    )
    .unwrap();
    let queue = device.output_queue(VIDEO_STREAM).unwrap();

    // Nothing consumes, so the streaming thread ends up waiting on the full queue
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(queue.len(), 2);

    let (done_tx, done_rx) = flume::bounded(1);
    std::thread::spawn(move || {
        drop(device);
        let _ = done_tx.send(());
    });
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("device teardown hung on a full blocking queue");
    assert_eq!(queue.stats().dropped, 0);
}

#[test]
fn encoded_device_feeds_h264_render() {
    gst::init().unwrap();
    let encoder = depthlink::utils::detect_h264_encoder();
    if !has_elements(&[
        "videotestsrc",
        "videoconvert",
        "videoscale",
        "videorate",
        "capsfilter",
        "h264parse",
        "appsink",
        "appsrc",
        "queue",
        "avdec_h264",
        encoder,
    ]) {
        return;
    }

    let mut config = Config::default();
    config.device.bitrate_kbps = Some(2000);
    let graph = DeviceGraph::encoded(&config.device, &config.pipeline).unwrap();
    let spec = graph.validate().unwrap().stream_spec();
    assert_eq!(spec.stream_name, H264_STREAM);
    assert_eq!(spec.frame_type, FrameType::H264);

    let render = Arc::new(RenderPipeline::new(&appsink_render(), &spec).unwrap());
    render.start().unwrap();
    let sink = render_appsink(&render);

    let device = Device::connect(
        DeviceInfo {
            endpoint: Endpoint::Test,
        },
        &graph,
    )
    .unwrap();
    let bridge = register_bridge(&device, &spec.stream_name, render.clone()).unwrap();

    for _ in 0..3 {
        let sample = sink
            .try_pull_sample(gst::ClockTime::from_seconds(10))
            .expect("decoded frame did not reach the render sink");
        let caps = sample.caps().unwrap();
        let s = caps.structure(0).unwrap();
        assert_eq!(s.name().as_str(), "video/x-raw");
        assert_eq!(s.get::<i32>("width").unwrap(), spec.width as i32);
        assert_eq!(s.get::<i32>("height").unwrap(), spec.height as i32);
    }

    drop(device);
    let stats = bridge.stats();
    assert!(stats.frames_forwarded >= 3);
    assert_eq!(stats.submit_failures, 0);
}

struct RecordingSink(std::sync::Mutex<usize>);

impl FrameSink for RecordingSink {
    fn submit(&self, _buffer: gst::Buffer) -> Result<gst::FlowSuccess, gst::FlowError> {
        *self.0.lock().unwrap() += 1;
        Ok(gst::FlowSuccess::Ok)
    }
}

struct MissingQueue;

impl FrameSource for MissingQueue {
    fn output_queue(&self, name: &str) -> depthlink::Result<Arc<OutputQueue>> {
        Err(Error::UnknownQueue(name.to_string()))
    }
}

#[test]
fn failed_setup_never_registers_bridge() {
    gst::init().unwrap();
    let sink = Arc::new(RecordingSink(std::sync::Mutex::new(0)));

    let result = register_bridge(&MissingQueue, VIDEO_STREAM, sink.clone());

    assert!(result.is_err());
    assert_eq!(*sink.0.lock().unwrap(), 0);
    assert_eq!(Arc::strong_count(&sink), 1, "bridge must not outlive a failed setup");
}

#[tokio::test]
async fn invalid_graph_fails_run_before_streaming() {
    let mut config = Config::default();
    config.pipeline.queue_size = 0;

    let result = lifecycle::run(&config, FrameType::Nv12, Shutdown::new()).await;

    assert!(matches!(result, Err(Error::Graph(_))));
    assert_eq!(depthlink::SETUP_FAILURE_EXIT_CODE, -1);
}

#[tokio::test]
async fn missing_render_element_fails_run() {
    if !has_elements(&["appsrc", "videoconvert"]) {
        return;
    }
    let mut config = Config::default();
    config.render.video_sink = "no-such-sink".into();

    let result = lifecycle::run(&config, FrameType::Nv12, Shutdown::new()).await;

    assert!(matches!(result, Err(Error::Element { .. })));
}

#[tokio::test]
async fn run_streams_until_shutdown() {
    if !has_elements(&[
        "appsrc",
        "appsink",
        "videotestsrc",
        "videoconvert",
        "videoscale",
        "videorate",
        "capsfilter",
    ]) {
        return;
    }

    let mut config = Config::default();
    config.device.protocol = depthlink::Protocol::Test;
    config.device.width = WIDTH;
    config.device.height = HEIGHT;
    config.render = appsink_render();

    let shutdown = Shutdown::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.trigger(ShutdownReason::Interrupt);
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        lifecycle::run(&config, FrameType::Nv12, shutdown),
    )
    .await
    .expect("run did not stop after shutdown")
    .unwrap();

    assert_eq!(summary.reason, ShutdownReason::Interrupt);
    assert!(summary.queue.pushed > 0);
    assert_eq!(summary.bridge.submit_failures, 0);
    assert_eq!(
        summary.bridge.bytes_forwarded,
        summary.bridge.frames_forwarded * NV12_LEN as u64
    );
}
