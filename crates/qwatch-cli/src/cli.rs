//! Flag parsing for the exporter binary (spec.md §6). Translated into
//! `qwatch_core::ExporterConfig` by [`Cli::into_config`]; nothing here
//! performs I/O.

use clap::Parser;
use qwatch_core::config::{parse_ssl_option_value, parse_transport_option_value, split_kv, StaticLabels, DEFAULT_RUNTIME_BUCKETS};
use qwatch_core::{ExporterConfig, ExporterError};

/// Prometheus exporter for a Celery-compatible distributed task queue.
#[derive(Parser, Debug)]
#[command(name = "qwatch-exporter", about = "Prometheus exporter for a broker-backed task queue")]
pub struct Cli {
    /// Broker connection string (e.g. redis://host:6379/0, amqp://host//).
    #[arg(long, env = "BROKER_URL")]
    pub broker_url: String,

    /// Transport option forwarded to the broker client, `k=v`. Repeatable.
    #[arg(long = "broker-transport-option")]
    pub broker_transport_option: Vec<String>,

    /// TLS option forwarded to the broker client, `k=v`. Repeatable.
    #[arg(long = "broker-ssl-option")]
    pub broker_ssl_option: Vec<String>,

    /// Comma-separated payload content types the exporter will decode.
    #[arg(long = "accept-content", value_delimiter = ',')]
    pub accept_content: Vec<String>,

    /// Reconnect delay in seconds after a broker connection fault. 0 disables retry.
    #[arg(long = "retry-interval", default_value_t = 0)]
    pub retry_interval: u64,

    /// HTTP bind host.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP bind port.
    #[arg(long, env = "PORT", default_value_t = 9808)]
    pub port: u16,

    /// Comma-separated histogram bucket boundaries (seconds) for task runtime.
    #[arg(long, value_delimiter = ',')]
    pub buckets: Vec<f64>,

    /// Log verbosity (passed through to `tracing_subscriber::EnvFilter`).
    #[arg(long = "log-level", default_value = "INFO")]
    pub log_level: String,

    /// Worker liveness timeout in seconds. 0 disables the timeout.
    #[arg(long = "worker-timeout", default_value_t = 300)]
    pub worker_timeout: u64,

    /// Seconds of worker silence before purging its metrics entirely. 0 disables purging.
    #[arg(long = "purge-offline-worker-metrics", default_value_t = 600)]
    pub purge_offline_worker_metrics: u64,

    /// Replace the `hostname` label on `task-sent` with the literal `generic`.
    #[arg(long = "generic-hostname-task-sent-metric")]
    pub generic_hostname_task_sent_metric: bool,

    /// Comma-separated initial queue names to seed the discovered-queue set with.
    #[arg(long, value_delimiter = ',')]
    pub queues: Vec<String>,

    /// Prefix applied to every metric family name.
    #[arg(long = "metric-prefix", default_value = "celery_")]
    pub metric_prefix: String,

    /// Extra label appended to every metric, `k=v`. Repeatable.
    #[arg(long = "static-label")]
    pub static_label: Vec<String>,

    /// Disable the task_queuing_time_seconds gauge (ambient, enabled by default).
    #[arg(long = "no-queue-time-gauge")]
    pub no_queue_time_gauge: bool,

    /// Log output format (ambient; ["compact", "json"]).
    #[arg(long = "log-format", default_value = "compact")]
    pub log_format: String,
}

impl Cli {
    pub fn into_config(self) -> Result<ExporterConfig, ExporterError> {
        let mut broker_transport_options = std::collections::BTreeMap::new();
        for raw in &self.broker_transport_option {
            let (k, v) = split_kv(raw)?;
            broker_transport_options.insert(k, parse_transport_option_value(&v));
        }

        let mut broker_ssl_options = std::collections::BTreeMap::new();
        for raw in &self.broker_ssl_option {
            let (k, v) = split_kv(raw)?;
            broker_ssl_options.insert(k, parse_ssl_option_value(&v));
        }

        let mut static_labels = std::collections::BTreeMap::new();
        for raw in &self.static_label {
            let (k, v) = split_kv(raw)?;
            static_labels.insert(k, v);
        }

        let buckets = if self.buckets.is_empty() {
            DEFAULT_RUNTIME_BUCKETS.to_vec()
        } else {
            self.buckets
        };

        let config = ExporterConfig {
            broker_url: self.broker_url,
            broker_transport_options,
            broker_ssl_options,
            accept_content: self.accept_content,
            retry_interval_secs: self.retry_interval,
            host: self.host,
            port: self.port,
            buckets,
            log_level: self.log_level,
            worker_timeout_secs: self.worker_timeout,
            purge_offline_worker_metrics_secs: self.purge_offline_worker_metrics,
            generic_hostname_task_sent_metric: self.generic_hostname_task_sent_metric,
            queues: self.queues,
            metric_prefix: self.metric_prefix,
            static_labels: StaticLabels::new(static_labels),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeatable_kv_options_and_defaults() {
        let cli = Cli::parse_from([
            "qwatch-exporter",
            "--broker-url",
            "redis://localhost:6379/0",
            "--broker-transport-option",
            "visibility_timeout=3600",
            "--static-label",
            "env=prod",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9808);
        assert_eq!(config.metric_prefix, "celery_");
        assert_eq!(
            config.broker_transport_options.get("visibility_timeout"),
            Some(&serde_json::json!(3600))
        );
        assert_eq!(config.static_labels.keys().collect::<Vec<_>>(), vec!["env"]);
    }

    #[test]
    fn log_format_defaults_to_compact() {
        let cli = Cli::parse_from(["qwatch-exporter", "--broker-url", "redis://localhost"]);
        assert_eq!(cli.log_format, "compact");
    }

    #[test]
    fn rejects_malformed_kv() {
        let cli = Cli::parse_from(["qwatch-exporter", "--broker-url", "redis://localhost", "--static-label", "no-equals-sign"]);
        assert!(cli.into_config().is_err());
    }
}
