use std::str::FromStr;
use std::time::Duration;

use linewatch_broker::reconnect::ReconnectConfig;
use linewatch_broker::{CircuitConfig, RetryPolicy, Topology, WorkerConfig};

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// Upper bound on each post-shutdown cleanup step, in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `3000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `30`                       |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let shutdown_timeout_secs: u64 = std::env::var("SHUTDOWN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("SHUTDOWN_TIMEOUT_SECS must be a valid u64");

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
        }
    }
}

/// Tuning for the broker, consumer and notification stages.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub exchange: String,
    pub routing_key: String,
    pub request_queue: String,
    pub results_queue: String,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub prefetch: u16,
    /// Total publish attempts, the first one included.
    pub publish_max_attempts: u32,
    pub publish_base_delay: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
    /// Redeliveries before a request is dead-lettered.
    pub consumer_max_retry_attempts: u32,
    pub idempotency_window: Duration,
    pub event_retention: Duration,
    pub catch_up_max_count: usize,
    /// Fixed seed for the simulated strategy. `None` draws from OS entropy.
    pub simulation_seed: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let topology = Topology::default();
        Self {
            exchange: topology.exchange,
            routing_key: topology.routing_key,
            request_queue: topology.request_queue,
            results_queue: topology.results_queue,
            dead_letter_exchange: topology.dead_letter_exchange,
            dead_letter_queue: topology.dead_letter_queue,
            prefetch: 10,
            publish_max_attempts: 3,
            publish_base_delay: Duration::from_millis(1000),
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(30),
            consumer_max_retry_attempts: 3,
            idempotency_window: Duration::from_secs(3600),
            event_retention: Duration::from_secs(24 * 3600),
            catch_up_max_count: 100,
            simulation_seed: None,
        }
    }
}

impl PipelineConfig {
    /// Load pipeline tuning from environment variables with defaults.
    ///
    /// | Env Var                         | Default                        |
    /// |---------------------------------|--------------------------------|
    /// | `BROKER_EXCHANGE`               | `quality-events`               |
    /// | `BROKER_ROUTING_KEY`            | `quality.inspection.requested` |
    /// | `BROKER_QUEUE`                  | `inspection-requests`          |
    /// | `BROKER_RESULTS_QUEUE`          | `inspection-results`           |
    /// | `BROKER_DLX`                    | `inspection-dlx`               |
    /// | `BROKER_DLQ`                    | `inspection-dlq`               |
    /// | `BROKER_PREFETCH`               | `10`                           |
    /// | `PUBLISH_MAX_ATTEMPTS`          | `3`                            |
    /// | `PUBLISH_BASE_DELAY_MS`         | `1000`                         |
    /// | `CIRCUIT_BREAKER_THRESHOLD`     | `5`                            |
    /// | `CIRCUIT_BREAKER_COOLDOWN_SECS` | `30`                           |
    /// | `CONSUMER_MAX_RETRY_ATTEMPTS`   | `3`                            |
    /// | `IDEMPOTENCY_WINDOW_SECS`       | `3600`                         |
    /// | `EVENT_RETENTION_HOURS`         | `24`                           |
    /// | `CATCH_UP_MAX_COUNT`            | `100`                          |
    /// | `SIMULATION_SEED`               | unset (OS entropy)             |
    ///
    /// Malformed numbers abort startup.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let simulation_seed = std::env::var("SIMULATION_SEED").ok().map(|raw| {
            raw.parse()
                .unwrap_or_else(|e| panic!("SIMULATION_SEED must be a valid u64: {e}"))
        });

        Self {
            exchange: env_string("BROKER_EXCHANGE", defaults.exchange),
            routing_key: env_string("BROKER_ROUTING_KEY", defaults.routing_key),
            request_queue: env_string("BROKER_QUEUE", defaults.request_queue),
            results_queue: env_string("BROKER_RESULTS_QUEUE", defaults.results_queue),
            dead_letter_exchange: env_string("BROKER_DLX", defaults.dead_letter_exchange),
            dead_letter_queue: env_string("BROKER_DLQ", defaults.dead_letter_queue),
            prefetch: env_parse("BROKER_PREFETCH", defaults.prefetch),
            publish_max_attempts: env_parse("PUBLISH_MAX_ATTEMPTS", defaults.publish_max_attempts),
            publish_base_delay: Duration::from_millis(env_parse("PUBLISH_BASE_DELAY_MS", 1000)),
            circuit_breaker_threshold: env_parse(
                "CIRCUIT_BREAKER_THRESHOLD",
                defaults.circuit_breaker_threshold,
            ),
            circuit_breaker_cooldown: Duration::from_secs(env_parse(
                "CIRCUIT_BREAKER_COOLDOWN_SECS",
                30,
            )),
            consumer_max_retry_attempts: env_parse(
                "CONSUMER_MAX_RETRY_ATTEMPTS",
                defaults.consumer_max_retry_attempts,
            ),
            idempotency_window: Duration::from_secs(env_parse("IDEMPOTENCY_WINDOW_SECS", 3600)),
            event_retention: Duration::from_secs(env_parse::<u64>("EVENT_RETENTION_HOURS", 24) * 3600),
            catch_up_max_count: env_parse("CATCH_UP_MAX_COUNT", defaults.catch_up_max_count),
            simulation_seed,
        }
    }

    pub fn topology(&self) -> Topology {
        Topology {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            request_queue: self.request_queue.clone(),
            results_queue: self.results_queue.clone(),
            dead_letter_exchange: self.dead_letter_exchange.clone(),
            dead_letter_queue: self.dead_letter_queue.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.publish_max_attempts,
            base_delay: self.publish_base_delay,
            ..RetryPolicy::default()
        }
    }

    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_breaker_threshold,
            cooldown: self.circuit_breaker_cooldown,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            prefetch: self.prefetch,
            max_retry_attempts: self.consumer_max_retry_attempts,
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name).unwrap_or(default)
}

fn env_parse<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|e| panic!("{name} must be a valid {}: {e}", std::any::type_name::<T>())),
        Err(_) => default,
    }
}
