//! Background removal service CLI
//!
//! Runs image requests and video jobs through the request dispatcher locally.

#[cfg(feature = "cli")]
use bgremove_service::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    panic!("CLI feature not enabled. Please rebuild with --features cli");
}
