use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use webtty::config::{Cli, Config};
use webtty::registry::Registry;
use webtty::{server, signals};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("webtty: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.log);

    let runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    runtime.block_on(run(config))
}

async fn run(config: Config) -> ExitCode {
    let config = Arc::new(config);
    let registry = Registry::new(config.clone());

    if config.browser {
        open_browser(&config);
    }

    let shutdown_registry = registry.clone();
    tokio::spawn(async move {
        signals::wait_for_shutdown(shutdown_registry).await;
    });

    match server::run(config, registry).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("server error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_browser(config: &Config) {
    let scheme = if config.tls.is_some() { "https" } else { "http" };
    let port = match &config.bind {
        webtty::config::BindTarget::Tcp { port, .. } => *port,
        webtty::config::BindTarget::UnixSocket(_) => {
            tracing::warn!("--browser has no effect with a unix-socket interface");
            return;
        }
    };
    let url = format!("{scheme}://localhost:{port}/");
    if let Err(e) = webbrowser_open(&url) {
        tracing::warn!("failed to open browser at {url}: {e}");
    }
}

/// Shells out to the platform opener rather than pulling in a dedicated
/// crate for this one best-effort convenience flag.
fn webbrowser_open(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    let program = "open";
    #[cfg(target_os = "linux")]
    let program = "xdg-open";
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    let program = "xdg-open";

    std::process::Command::new(program).arg(url).spawn()?;
    Ok(())
}
