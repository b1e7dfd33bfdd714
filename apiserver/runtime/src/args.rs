use crate::Server;
use anyhow::{anyhow, Result};
use clap::Parser;
use kubemem_k8s_store::{ViewConfig, WatchConfig};
use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "kubemem", about = "An in-memory Kubernetes API server")]
pub struct Args {
    #[clap(long, default_value = "kubemem=info,warn", env = "KUBEMEM_LOG")]
    log_level: String,

    #[clap(long, default_value = "plain")]
    log_format: LogFormat,

    /// The number of undelivered events a watcher may hold before it is disconnected.
    #[clap(long, default_value = "1024")]
    watch_queue_capacity: usize,

    /// The maximum lifetime of a watch, in seconds.
    #[clap(long, default_value = "1800")]
    watch_timeout: u64,

    /// The number of changes retained per kind for watches that resume from an earlier version.
    #[clap(long, default_value = "1024")]
    watch_history: usize,

    /// The path prefix that addresses derived views.
    #[clap(long, default_value = "/views")]
    view_prefix: String,

    /// The label that marks objects created through a derived view.
    #[clap(long, default_value = "kubemem.io/view")]
    view_label: String,

    /// Derived views to create at startup.
    #[clap(long, value_delimiter = ',')]
    views: Vec<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            watch_queue_capacity,
            watch_timeout,
            watch_history,
            view_prefix,
            view_label,
            views,
        } = self;

        log_format.try_init(&log_level)?;

        let mut builder = Server::builder()
            .with_watch_config(WatchConfig {
                queue_capacity: watch_queue_capacity,
                timeout: Duration::from_secs(watch_timeout),
                history: watch_history,
            })
            .with_view_config(ViewConfig {
                prefix: view_prefix,
                label: view_label,
            });
        for name in views.iter().filter(|name| !name.is_empty()) {
            builder = builder.with_view(name);
        }
        let server = builder.start();

        // Block the main thread on the shutdown signal.
        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
        server.stop();

        Ok(())
    }
}

// === impl LogFormat ===

impl LogFormat {
    /// Installs the global subscriber.
    pub fn try_init(self, filter: &str) -> Result<()> {
        let filter = EnvFilter::try_new(filter)?;
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        match self {
            Self::Plain => builder.try_init(),
            Self::Json => builder.json().try_init(),
        }
        .map_err(|error| anyhow!("failed to initialize logging: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["kubemem"]).unwrap();
        assert_eq!(args.log_format, LogFormat::Plain);
        assert_eq!(args.watch_queue_capacity, 1024);
        assert_eq!(args.watch_timeout, 1800);
        assert_eq!(args.watch_history, 1024);
        assert_eq!(args.view_prefix, "/views");
        assert_eq!(args.view_label, "kubemem.io/view");
        assert!(args.views.is_empty());
    }

    #[test]
    fn overrides() {
        let args = Args::try_parse_from([
            "kubemem",
            "--log-format=json",
            "--watch-queue-capacity=8",
            "--watch-timeout=60",
            "--watch-history=16",
            "--views=team-a,team-b",
        ])
        .unwrap();
        assert_eq!(args.log_format, LogFormat::Json);
        assert_eq!(args.watch_queue_capacity, 8);
        assert_eq!(args.watch_timeout, 60);
        assert_eq!(args.watch_history, 16);
        assert_eq!(args.views, vec!["team-a", "team-b"]);
    }

    #[test]
    fn rejects_unknown_log_formats() {
        assert!(Args::try_parse_from(["kubemem", "--log-format=xml"]).is_err());
    }
}
