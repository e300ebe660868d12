use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Initialize logging: `RUST_LOG` when set, `depthlink=debug` otherwise
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("depthlink=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
}

/// First element factory from `candidates` that is installed
pub fn find_element(candidates: &[&'static str]) -> Option<&'static str> {
    candidates.iter().copied().find(|name| {
        match gst::ElementFactory::find(name) {
            Some(factory) => {
                debug!(
                    "Found element: {} - {}",
                    name,
                    factory.metadata("long-name").unwrap_or("")
                );
                true
            }
            None => false,
        }
    })
}

/// Detect best available video sink (hardware accelerated > software)
pub fn detect_video_sink() -> &'static str {
    let sinks = [
        "glimagesink",   // OpenGL (hardware accelerated)
        "waylandsink",   // Wayland native (if available)
        "xvimagesink",   // X11 with XVideo extension
        "ximagesink",    // X11 basic
        "autovideosink", // Auto-detect
    ];

    find_element(&sinks).unwrap_or_else(|| {
        warn!("Using auto video sink");
        "autovideosink"
    })
}

/// Detect the H.264 decoder to use, hardware first when allowed
pub fn detect_h264_decoder(use_hardware: bool) -> &'static str {
    let decoders = [
        "nvh264dec",    // NVIDIA
        "vah264dec",    // VA-API (new plugin)
        "vaapih264dec", // VA-API (legacy plugin)
        "v4l2h264dec",  // V4L2 stateful decoder
    ];

    if use_hardware {
        if let Some(decoder) = find_element(&decoders) {
            return decoder;
        }
        warn!("No hardware H.264 decoder found, using software decoder");
    }
    "avdec_h264"
}

/// Detect best available H.264 encoder (hardware > software)
pub fn detect_h264_encoder() -> &'static str {
    let encoders = [
        "v4l2h264enc",  // V4L2 M2M (Raspberry Pi, Rockchip)
        "vaapih264enc", // Intel/AMD VA-API
        "nvh264enc",    // NVIDIA NVENC
        "x264enc",      // Software encoder (fallback)
    ];

    let encoder = find_element(&encoders).unwrap_or("x264enc");
    info!("Using H.264 encoder: {}", encoder);
    encoder
}

/// Create a named element
pub fn make_element(factory: &str, name: &str) -> Result<gst::Element> {
    gst::ElementFactory::make(factory)
        .name(name)
        .build()
        .map_err(|_| Error::Element {
            factory: factory.to_string(),
        })
}

/// Link consecutive elements, reporting the first pair that fails
pub fn link_chain(chain: &[gst::Element]) -> Result<()> {
    for pair in chain.windows(2) {
        pair[0].link(&pair[1]).map_err(|_| Error::Link {
            from: pair[0].name().to_string(),
            to: pair[1].name().to_string(),
        })?;
    }
    Ok(())
}

/// Log bus errors and warnings of `pipeline`. `on_error` runs after an error has been logged.
///
/// The watch is dispatched by the default main context, so an
/// [`EventLoop`](crate::lifecycle::EventLoop) must be running.
pub fn watch_bus<F>(pipeline: &gst::Pipeline, on_error: F) -> Result<gst::bus::BusWatchGuard>
where
    F: Fn() + Send + 'static,
{
    let name = pipeline.name().to_string();
    let bus = pipeline
        .bus()
        .ok_or_else(|| Error::Pipeline(format!("{name} pipeline has no bus")))?;

    bus.add_watch(move |_, msg| {
        use gst::MessageView;

        match msg.view() {
            MessageView::Error(err) => {
                error!(
                    pipeline = %name,
                    "Error from {:?}: {} ({:?})",
                    err.src().map(|s| s.path_string()),
                    err.error(),
                    err.debug()
                );
                on_error();
            }
            MessageView::Warning(warning) => {
                warn!(
                    pipeline = %name,
                    "Warning from {:?}: {} ({:?})",
                    warning.src().map(|s| s.path_string()),
                    warning.error(),
                    warning.debug()
                );
            }
            MessageView::Eos(..) => info!(pipeline = %name, "End of stream"),
            _ => {}
        }
        gst::glib::ControlFlow::Continue
    })
    .map_err(|e| Error::Pipeline(e.to_string()))
}
