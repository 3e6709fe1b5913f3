use anyhow::Context;
use log::{error, info, warn};
use std::path::PathBuf;

mod artifact;
mod config;
mod error;
mod prober;
mod runner;
mod server;
mod session;
mod stager;

#[cfg(test)]
mod testutil;

use prober::EnvironmentReport;
use session::Session;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let config = config::load_config(explicit.as_deref())?;

    info!("Starting Kivy to Android APK forge");
    info!("Projects are staged under {:?}", config.workspace);

    // Kill a running build on SIGINT/SIGTERM so it does not outlive us
    setup_signal_handlers()?;

    let missing = prober::probe_system(&config.requirements).await;
    if !missing.is_empty() {
        error!("The following dependencies are missing:");
        for dependency in &missing {
            error!("  {}", dependency);
        }
        warn!("Uploads and builds are disabled until they are installed");
    }

    let session = Session::new(config, EnvironmentReport::from(missing));
    server::serve(session).await
}

fn setup_signal_handlers() -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicBool, Ordering};

    static CLEANUP_DONE: AtomicBool = AtomicBool::new(false);

    ctrlc::set_handler(|| {
        if !CLEANUP_DONE.swap(true, Ordering::SeqCst) {
            info!("Signal received, cleaning up...");
            if runner::kill_active_build() {
                info!("Killed the running build");
            }
        }
        std::process::exit(0);
    })
    .context("Error setting Ctrl-C handler")
}
