//! Process lifecycle: event loop thread, setup order, shutdown and teardown

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::glib;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::bridge::{BridgeStats, FrameBridge, FrameSink};
use crate::device::{Device, DeviceGraph, FrameType, OutputQueue, QueueStats};
use crate::error::{Result, RUNTIME_FAILURE_EXIT_CODE, SETUP_FAILURE_EXIT_CODE};
use crate::render::RenderPipeline;
use crate::Config;

/// Why the stream stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownReason {
    #[default]
    Interrupt,
    PipelineError { pipeline: &'static str },
}

impl ShutdownReason {
    /// Process exit status for a run that ended this way
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownReason::Interrupt => 0,
            ShutdownReason::PipelineError { .. } => RUNTIME_FAILURE_EXIT_CODE,
        }
    }
}

/// Cancellation token shared between the signal listener, the bus
/// watches and the wait in [`run`]. The first reason recorded wins.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
    rx: watch::Receiver<Option<ShutdownReason>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.rx.borrow()
    }

    /// Resolves once `trigger` has been called on any clone
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.rx.clone();
        // The sender lives as long as self, so this only returns on trigger
        rx.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| *reason)
            .unwrap_or_default()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Trigger `shutdown` on Ctrl-C
pub fn listen_for_interrupt(shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                shutdown.trigger(ShutdownReason::Interrupt);
            }
            Err(e) => warn!("Failed to listen for interrupt: {}", e),
        }
    })
}

/// Block until shutdown is requested
pub async fn wait_for_shutdown(shutdown: &Shutdown) -> ShutdownReason {
    let reason = shutdown.wait().await;
    info!(?reason, "Shutdown requested");
    reason
}

/// Shutdown callback for a pipeline bus watch
fn on_pipeline_error(shutdown: &Shutdown, pipeline: &'static str) -> impl Fn() + Send + 'static {
    let shutdown = shutdown.clone();
    move || shutdown.trigger(ShutdownReason::PipelineError { pipeline })
}

/// GLib main loop running on its own thread; quits and joins on drop
pub struct EventLoop {
    main_loop: glib::MainLoop,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn spawn() -> Result<Self> {
        let main_loop = glib::MainLoop::new(None, false);
        let runner = main_loop.clone();
        let thread = std::thread::Builder::new()
            .name("gst-main-loop".into())
            .spawn(move || runner.run())?;

        Ok(Self {
            main_loop,
            thread: Some(thread),
        })
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            // A quit issued before run() started is lost, so repeat until the thread exits
            while !thread.is_finished() {
                self.main_loop.quit();
                std::thread::sleep(Duration::from_millis(10));
            }
            if thread.join().is_err() {
                warn!("Main loop thread panicked");
            }
        }
    }
}

/// Anything exposing named output queues
pub trait FrameSource {
    fn output_queue(&self, name: &str) -> Result<Arc<OutputQueue>>;
}

impl FrameSource for Device {
    fn output_queue(&self, name: &str) -> Result<Arc<OutputQueue>> {
        Device::output_queue(self, name)
    }
}

/// Register a [`FrameBridge`] into `sink` as the callback of `source`'s `stream` queue
pub fn register_bridge<S>(
    source: &impl FrameSource,
    stream: &str,
    sink: S,
) -> Result<Arc<FrameBridge<S>>>
where
    S: FrameSink + 'static,
{
    let queue = source.output_queue(stream)?;
    let bridge = Arc::new(FrameBridge::new(sink));

    let callback = bridge.clone();
    queue.add_callback(move |msg| callback.on_message(msg))?;
    info!("Frame bridge registered on queue `{}`", stream);
    Ok(bridge)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub bridge: BridgeStats,
    pub queue: QueueStats,
    pub reason: ShutdownReason,
}

/// Set up both pipelines, stream until `shutdown`, then tear down in
/// reverse order: device, render pipeline, event loop.
///
/// Every error returned is a setup error; the bridge is only registered
/// once both pipelines are running. A bus error on either pipeline
/// triggers `shutdown` and is reported in [`RunSummary::reason`].
#[instrument(skip(config, shutdown))]
pub async fn run(config: &Config, format: FrameType, shutdown: Shutdown) -> Result<RunSummary> {
    gst::init()?;

    let graph = DeviceGraph::for_format(format, &config.device, &config.pipeline)?;
    let spec = graph.validate()?.stream_spec();

    let event_loop = EventLoop::spawn()?;

    let render = Arc::new(RenderPipeline::new(&config.render, &spec)?);
    let render_watch = render.watch_bus(on_pipeline_error(&shutdown, "render"))?;
    render.start()?;

    // Waits up to the state change timeout for the device to come up
    let info = config.device.device_info();
    let device = tokio::task::spawn_blocking(move || Device::connect(info, &graph)).await??;
    let device_watch = device.watch_bus(on_pipeline_error(&shutdown, "device"))?;
    let queue = device.output_queue(&spec.stream_name)?;
    let bridge = register_bridge(&device, &spec.stream_name, render.clone())?;

    info!(
        "Streaming {} {}x{}@{} from {}",
        spec.frame_type.name(),
        spec.width,
        spec.height,
        spec.fps,
        device.info()
    );

    let reason = wait_for_shutdown(&shutdown).await;

    // Closing the device joins its streaming and delivery threads
    let bridge = tokio::task::spawn_blocking(move || {
        drop(device_watch);
        drop(device);
        let stats = bridge.stats();
        drop(bridge);
        drop(render_watch);
        drop(render);
        drop(event_loop);
        stats
    })
    .await?;

    Ok(RunSummary {
        bridge,
        queue: queue.stats(),
        reason,
    })
}

/// Entry point shared by the binaries. Returns the process exit code.
pub async fn launch(format: FrameType) -> i32 {
    let config = match crate::load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return SETUP_FAILURE_EXIT_CODE;
        }
    };

    let shutdown = Shutdown::new();
    let _interrupt = listen_for_interrupt(shutdown.clone());

    match run(&config, format, shutdown).await {
        Ok(summary) => {
            info!(
                frames = summary.bridge.frames_forwarded,
                bytes = summary.bridge.bytes_forwarded,
                failed = summary.bridge.submit_failures,
                dropped = summary.queue.dropped,
                reason = ?summary.reason,
                "depthlink shutting down"
            );
            summary.reason.exit_code()
        }
        Err(e) => {
            error!("{}", e);
            SETUP_FAILURE_EXIT_CODE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gstreamer::prelude::*;
    use std::time::Instant;

    #[tokio::test]
    async fn wait_returns_within_a_second_of_trigger() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { wait_for_shutdown(&shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!shutdown.is_triggered());

        let started = Instant::now();
        shutdown.trigger(ShutdownReason::Interrupt);
        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait loop did not exit")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(reason, ShutdownReason::Interrupt);
    }

    #[tokio::test]
    async fn trigger_before_wait_is_not_lost() {
        let shutdown = Shutdown::new();
        shutdown.trigger(ShutdownReason::Interrupt);
        tokio::time::timeout(Duration::from_millis(100), shutdown.wait())
            .await
            .expect("wait should resolve immediately");
    }

    #[test]
    fn first_shutdown_reason_wins() {
        let shutdown = Shutdown::new();
        assert_eq!(shutdown.reason(), None);

        let error = ShutdownReason::PipelineError { pipeline: "device" };
        shutdown.trigger(error);
        shutdown.trigger(ShutdownReason::Interrupt);

        assert_eq!(shutdown.reason(), Some(error));
        assert_eq!(error.exit_code(), RUNTIME_FAILURE_EXIT_CODE);
        assert_eq!(ShutdownReason::Interrupt.exit_code(), 0);
    }

    #[test]
    fn pipeline_bus_error_triggers_shutdown() {
        gst::init().unwrap();
        let _event_loop = EventLoop::spawn().unwrap();
        let pipeline = gst::Pipeline::with_name("device");
        let shutdown = Shutdown::new();

        let _watch =
            crate::utils::watch_bus(&pipeline, on_pipeline_error(&shutdown, "device")).unwrap();
        let msg = gst::message::Error::builder(gst::CoreError::Failed, "stream lost")
            .src(&pipeline)
            .build();
        pipeline.post_message(msg).unwrap();

        let started = Instant::now();
        while !shutdown.is_triggered() && started.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(
            shutdown.reason(),
            Some(ShutdownReason::PipelineError { pipeline: "device" })
        );
    }

    #[test]
    fn event_loop_quits_on_drop() {
        let event_loop = EventLoop::spawn().unwrap();
        drop(event_loop);
    }
}
