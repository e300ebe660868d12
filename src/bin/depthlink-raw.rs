//! Streams raw NV12 camera video straight into a display pipeline

use color_eyre::Result;
use depthlink::{lifecycle, FrameType};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    depthlink::utils::init_tracing();

    info!("depthlink (NV12) launching...");

    let code = lifecycle::launch(FrameType::Nv12).await;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
