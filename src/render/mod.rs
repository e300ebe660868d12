pub mod gst_render;

pub use gst_render::{appsrc_caps, RenderPipeline, DETECT_SINK};
