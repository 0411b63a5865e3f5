//! container-init
//!
//! Pid 1 of a sandbox namespace. Serves controller commands over the
//! inherited control socket; exiting tears the namespace down.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use container_init::config::Config;
use container_init::init;

fn main() {
    if !init::should_activate(std::process::id(), std::env::args_os()) {
        return;
    }

    let (code, line) = init::exit_status(std::panic::catch_unwind(serve));
    eprintln!("{line}");
    std::process::exit(code)
}

fn serve() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    // stderr: stdout is not ours to write to.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!(
        tmp_dir = %config.tmp_dir.display(),
        work_dir = %config.work_dir.display(),
        "loaded configuration"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let result = runtime.block_on(init::run(&config));
    // A blocking task may still be parked in recvmsg or waitpid.
    runtime.shutdown_background();
    Ok(result?)
}
