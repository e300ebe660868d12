use thiserror::Error;

/// Exit status used by the binaries when setup fails.
pub const SETUP_FAILURE_EXIT_CODE: i32 = -1;

/// Exit status used when a pipeline error stops a running stream.
pub const RUNTIME_FAILURE_EXIT_CODE: i32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to initialize GStreamer: {0}")]
    Init(#[from] gstreamer::glib::Error),

    #[error("failed to create element `{factory}`")]
    Element { factory: String },

    #[error("elements could not be linked: {from} -> {to}")]
    Link { from: String, to: String },

    #[error("unable to set the {pipeline} pipeline to the {state} state")]
    StateChange {
        pipeline: &'static str,
        state: &'static str,
    },

    #[error("invalid device graph: {0}")]
    Graph(String),

    #[error("no output queue named `{0}`")]
    UnknownQueue(String),

    #[error("failed to connect to device at {address}")]
    Connection { address: String },

    #[error("failed to allocate a {0} byte buffer")]
    Allocation(usize),

    #[error("failed to spawn thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
