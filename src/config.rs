use std::{fmt, sync::Arc, time::Duration};

use crate::{
    query::QueryOptions, retry::RetryPolicy, Client, FeatureContext, Features, Plugin, Result,
};

/// Configuration for [`Client`].
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) api_key: String,
    pub(crate) environment: String,
    pub(crate) base_url: String,
    pub(crate) context: Option<FeatureContext>,
    pub(crate) features: Features,
    pub(crate) retry: RetryConfig,
    pub(crate) cache: CacheConfig,
    pub(crate) plugins: Vec<Arc<dyn Plugin>>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) coerce_string_variations: bool,
}

impl ClientConfig {
    /// Create a default configuration using the specified API key and environment.
    ///
    /// ```
    /// # use feature_client::ClientConfig;
    /// ClientConfig::new("api-key", "production");
    /// ```
    pub fn new(api_key: impl Into<String>, environment: impl Into<String>) -> Self {
        ClientConfig {
            api_key: api_key.into(),
            environment: environment.into(),
            base_url: ClientConfig::DEFAULT_BASE_URL.to_owned(),
            context: None,
            features: Features::new(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            plugins: Vec::new(),
            request_timeout: None,
            coerce_string_variations: false,
        }
    }

    /// Default base URL for API calls.
    pub const DEFAULT_BASE_URL: &'static str = "https://api.featureflags.dev/v1";

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn base_url(&mut self, base_url: impl Into<String>) -> &mut Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the default context sent with every request.
    pub fn context(&mut self, context: FeatureContext) -> &mut Self {
        self.context = Some(context);
        self
    }

    /// Register the features used by the application together with their fallback values.
    ///
    /// These are resolved by [`Client::get_all_features`] and reported to plugins on
    /// initialization.
    pub fn features(&mut self, features: Features) -> &mut Self {
        self.features = features;
        self
    }

    /// Configure network-level retries.
    pub fn retry(&mut self, retry: RetryConfig) -> &mut Self {
        self.retry = retry;
        self
    }

    /// Configure freshness and lifetime of cached results.
    pub fn cache(&mut self, cache: CacheConfig) -> &mut Self {
        self.cache = cache;
        self
    }

    /// Append a plugin. Plugins are invoked in the order they were added.
    ///
    /// ```
    /// # use feature_client::{ClientConfig, plugins::LoggingPlugin};
    /// let mut config = ClientConfig::new("api-key", "production");
    /// config.plugin(LoggingPlugin::new());
    /// ```
    pub fn plugin(&mut self, plugin: impl Plugin + 'static) -> &mut Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Append plugins that are already shared.
    pub fn plugins(&mut self, plugins: impl IntoIterator<Item = Arc<dyn Plugin>>) -> &mut Self {
        self.plugins.extend(plugins);
        self
    }

    /// Abort requests that take longer than `timeout`. A timed out request is retried like any
    /// other network failure.
    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Convert string variations `"true"`/`"false"` to booleans and numeric strings to numbers.
    /// Off by default.
    pub fn coerce_string_variations(&mut self, coerce: bool) -> &mut Self {
        self.coerce_string_variations = coerce;
        self
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use feature_client::{ClientConfig, Client};
    /// let client: Client = ClientConfig::new("api-key", "production").to_client().unwrap();
    /// ```
    pub fn to_client(&self) -> Result<Client> {
        Client::new(self.clone())
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("environment", &self.environment)
            .field("base_url", &self.base_url)
            .field("context", &self.context)
            .field("features", &self.features)
            .field("retry", &self.retry)
            .field("cache", &self.cache)
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("request_timeout", &self.request_timeout)
            .field("coerce_string_variations", &self.coerce_string_variations)
            .finish_non_exhaustive()
    }
}

/// Network-level retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// When `false`, every request is attempted exactly once.
    pub enabled: bool,
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for every following one.
    pub backoff: Duration,
}

impl RetryConfig {
    /// Configuration with retries turned off.
    pub fn disabled() -> RetryConfig {
        RetryConfig {
            enabled: false,
            ..RetryConfig::default()
        }
    }

    pub(crate) fn to_policy(self) -> RetryPolicy {
        if self.enabled {
            RetryPolicy::new(self.max_attempts, self.backoff)
        } else {
            RetryPolicy::single_attempt()
        }
    }
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig {
            enabled: true,
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            backoff: RetryPolicy::DEFAULT_BACKOFF,
        }
    }
}

/// Freshness and lifetime of cached feature results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Results younger than this are served without a request.
    pub stale_time: Duration,
    /// Results are dropped this long after they were last fetched.
    pub cache_time: Duration,
}

impl CacheConfig {
    /// Default value for [`CacheConfig::stale_time`].
    pub const DEFAULT_STALE_TIME: Duration = Duration::from_secs(60);
    /// Default value for [`CacheConfig::cache_time`].
    pub const DEFAULT_CACHE_TIME: Duration = Duration::from_secs(5 * 60);

    pub(crate) fn query_options(self) -> QueryOptions {
        QueryOptions::new()
            .with_stale_time(self.stale_time)
            .with_cache_time(self.cache_time)
    }
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig {
            stale_time: CacheConfig::DEFAULT_STALE_TIME,
            cache_time: CacheConfig::DEFAULT_CACHE_TIME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_retry_makes_a_single_attempt() {
        assert_eq!(RetryConfig::disabled().to_policy().max_attempts, 1);
        assert_eq!(RetryConfig::default().to_policy(), RetryPolicy::default());
    }

    #[test]
    fn builder_collects_settings() {
        let mut config = ClientConfig::new("key", "staging");
        config
            .base_url("http://localhost:8080")
            .request_timeout(Duration::from_secs(2))
            .coerce_string_variations(true);

        assert_eq!(config.base_url, "http://localhost:8080");
        assert_eq!(config.request_timeout, Some(Duration::from_secs(2)));
        assert!(config.coerce_string_variations);
        assert!(config.plugins.is_empty());
    }
}
