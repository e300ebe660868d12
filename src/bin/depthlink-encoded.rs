//! Streams H.264 from the camera's hardware encoder into a decode-and-display pipeline

use color_eyre::Result;
use depthlink::{lifecycle, FrameType};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    depthlink::utils::init_tracing();

    info!("depthlink (H.264) launching...");

    let code = lifecycle::launch(FrameType::H264).await;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
