//! line-echo: a newline-delimited TCP echo server
//!
//! Every line a client sends is answered with `Echo: <line>`.
//!
//! Features:
//! - One independent task per connection
//! - Connect, receive and disconnect events logged to stdout
//! - Bounded backoff when accepting connections fails
//! - Configuration via CLI arguments or TOML file

mod backoff;
mod config;
mod connection;
mod protocols;
mod server;
#[cfg(test)]
mod test_support;

use config::Config;
use server::{Listener, Server};
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    log_startup(&config);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async {
        // Bind failure is fatal: no retry, no alternate port
        let listener = Listener::bind(config.listen, config.backlog)?;
        Server::new(&config).run(listener).await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Settings banner; `Listening on` stays the only INFO line at startup.
fn log_startup(config: &Config) {
    debug!(
        listen = %config.listen,
        workers = ?config.workers,
        max_line_length = config.max_line_length,
        "Starting line-echo server"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::capture_logs;

    #[test]
    fn test_startup_banner_is_debug_only() {
        let (logs, _guard) = capture_logs();
        let config = Config::from_args(config::CliArgs::default()).unwrap();

        log_startup(&config);

        let contents = logs.contents();
        let banner = contents
            .lines()
            .find(|line| line.contains("Starting line-echo server"))
            .expect("banner not logged");
        assert!(banner.contains("DEBUG"), "logs: {}", contents);
        assert!(!contents.contains("INFO"), "logs: {}", contents);
    }
}
