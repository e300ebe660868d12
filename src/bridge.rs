//! Frame bridge: forwards device frames into the render pipeline

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use gstreamer as gst;
use tracing::{debug, trace, warn};

use crate::device::frame::Message;
use crate::error::{Error, Result};

/// Render-side ingestion point
pub trait FrameSink: Send + Sync {
    fn submit(&self, buffer: gst::Buffer) -> std::result::Result<gst::FlowSuccess, gst::FlowError>;
}

impl<S: FrameSink + ?Sized> FrameSink for Arc<S> {
    fn submit(&self, buffer: gst::Buffer) -> std::result::Result<gst::FlowSuccess, gst::FlowError> {
        (**self).submit(buffer)
    }
}

#[derive(Default)]
struct Stats {
    frames_forwarded: AtomicU64,
    bytes_forwarded: AtomicU64,
    submit_failures: AtomicU64,
    ignored_messages: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub frames_forwarded: u64,
    pub bytes_forwarded: u64,
    pub submit_failures: u64,
    pub ignored_messages: u64,
}

/// Copies each delivered frame into a fresh buffer and submits it to `sink`.
///
/// Frames are forwarded in the order `on_message` is called, at most once
/// each. Nothing is dropped or reordered here.
pub struct FrameBridge<S> {
    sink: S,
    stats: CachePadded<Stats>,
}

impl<S: FrameSink> FrameBridge<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Output queue callback
    pub fn on_message(&self, msg: &Message) {
        let Message::Frame(frame) = msg else {
            trace!(?msg, "Ignoring non-frame message");
            self.stats.ignored_messages.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("depthlink_bridge_ignored_total").increment(1);
            return;
        };

        debug!("Data size: {}", frame.len());

        let buffer = match copy_to_buffer(&frame.data) {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!(sequence = frame.meta.sequence, "{e}");
                self.record_failure();
                return;
            }
        };

        match self.sink.submit(buffer) {
            Ok(_) => {
                self.stats.frames_forwarded.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_forwarded
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                metrics::counter!("depthlink_bridge_frames_total").increment(1);
            }
            Err(flow) => {
                warn!(sequence = frame.meta.sequence, ?flow, "Failed to push buffer");
                self.record_failure();
            }
        }
    }

    fn record_failure(&self) {
        self.stats.submit_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("depthlink_bridge_failures_total").increment(1);
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            frames_forwarded: self.stats.frames_forwarded.load(Ordering::Relaxed),
            bytes_forwarded: self.stats.bytes_forwarded.load(Ordering::Relaxed),
            submit_failures: self.stats.submit_failures.load(Ordering::Relaxed),
            ignored_messages: self.stats.ignored_messages.load(Ordering::Relaxed),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

/// Allocate a buffer of exactly `data.len()` bytes and copy `data` into it
pub fn copy_to_buffer(data: &[u8]) -> Result<gst::Buffer> {
    let mut buffer =
        gst::Buffer::with_size(data.len()).map_err(|_| Error::Allocation(data.len()))?;
    buffer
        .make_mut()
        .copy_from_slice(0, data)
        .map_err(|_| Error::Allocation(data.len()))?;
    Ok(buffer)
}
