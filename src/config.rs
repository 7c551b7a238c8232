//! Configuration for the durable event store.
//!
//! Wiring-level settings (database URL, pool size, retry budgets) are
//! consumed once at startup by the surrounding service and passed in here;
//! the core never reads the environment on its own beyond the explicit
//! [`StoreConfig::from_env`] constructor.

use tokio::time::Duration;

use crate::delay::RetryDelay;
use crate::error::Error;

/// Configuration for a [`PostgresStore`](crate::PostgresStore).
///
/// # Examples
///
/// ```rust
/// use everlog::StoreConfig;
///
/// let config = StoreConfig::builder("postgres://localhost/events")
///     .max_save_attempts(5)
///     .max_connections(20)
///     .build()
///     .unwrap();
///
/// assert_eq!(config.max_save_attempts(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    url: String,
    max_connections: u32,
    connect_retry_delay: Duration,
    max_save_attempts: u32,
    retry_delay: RetryDelay,
}

impl StoreConfig {
    /// Creates a configuration with defaults for everything but the URL.
    pub fn new(url: impl Into<String>) -> Result<Self, Error> {
        Self::builder(url).build()
    }

    /// Creates a configuration from the `DATABASE_URL` environment variable.
    pub fn from_env() -> Result<Self, Error> {
        let url = std::env::var("DATABASE_URL").map_err(|_| Error::InvalidConfig {
            message: "DATABASE_URL is not set".to_string(),
            parameter: Some("url".to_string()),
        })?;
        Self::new(url)
    }

    /// Returns a builder seeded with the given connection URL.
    pub fn builder(url: impl Into<String>) -> StoreConfigBuilder {
        StoreConfigBuilder {
            url: url.into(),
            max_connections: 10,
            connect_retry_delay: Duration::from_secs(3),
            max_save_attempts: 3,
            retry_delay: RetryDelay::default(),
        }
    }

    /// The database connection URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Maximum size of the shared connection pool.
    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    /// Fixed delay between reconnection attempts of the background
    /// connection loop. Deliberately not exponential: the store should come
    /// back promptly after a database restart.
    pub fn connect_retry_delay(&self) -> Duration {
        self.connect_retry_delay
    }

    /// How many times a save is attempted when the storage engine reports a
    /// transient serialization conflict. Domain-level version conflicts are
    /// never retried.
    pub fn max_save_attempts(&self) -> u32 {
        self.max_save_attempts
    }

    /// Backoff applied between transient save retries.
    pub fn retry_delay(&self) -> RetryDelay {
        self.retry_delay
    }
}

/// Builder for [`StoreConfig`], validating parameters on `build`.
#[derive(Debug, Clone)]
pub struct StoreConfigBuilder {
    url: String,
    max_connections: u32,
    connect_retry_delay: Duration,
    max_save_attempts: u32,
    retry_delay: RetryDelay,
}

impl StoreConfigBuilder {
    pub fn max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn connect_retry_delay(mut self, delay: Duration) -> Self {
        self.connect_retry_delay = delay;
        self
    }

    pub fn max_save_attempts(mut self, attempts: u32) -> Self {
        self.max_save_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn build(self) -> Result<StoreConfig, Error> {
        if self.url.is_empty() {
            return Err(Error::InvalidConfig {
                message: "connection URL must not be empty".to_string(),
                parameter: Some("url".to_string()),
            });
        }
        if self.max_connections == 0 {
            return Err(Error::InvalidConfig {
                message: "connection pool must allow at least one connection".to_string(),
                parameter: Some("max_connections".to_string()),
            });
        }
        if self.max_save_attempts == 0 {
            return Err(Error::InvalidConfig {
                message: "at least one save attempt is required".to_string(),
                parameter: Some("max_save_attempts".to_string()),
            });
        }
        Ok(StoreConfig {
            url: self.url,
            max_connections: self.max_connections,
            connect_retry_delay: self.connect_retry_delay,
            max_save_attempts: self.max_save_attempts,
            retry_delay: self.retry_delay,
        })
    }
}
