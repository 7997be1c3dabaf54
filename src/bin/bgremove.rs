//! Background removal CLI tool
//!
//! Tries the remove.bg API first and falls back to a local segmentation model.

#[cfg(feature = "cli")]
use bgremove_fallback::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(1);
}
