use std::{collections::HashMap, sync::Arc};

use futures::FutureExt;

use crate::{
    context::{ContextStore, ContextUpdateSource},
    fetcher::{FeatureFetcher, FeatureFetcherConfig, FeaturesRequest},
    plugin::{ClientSnapshot, FallbackReason, PluginChain},
    query::{Query, QueryCache, QueryFn, QueryKey, QueryOptions},
    retry::{retry_with_callback, RetryPolicy},
    ClientConfig, Error, FeatureContext, FeatureValue, FeatureValueKind, FeatureValues, Features,
    Result,
};

/// Options of [`Client::get_feature`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureOptions {
    /// Value returned when the feature cannot be resolved. Without a fallback, failures
    /// propagate to the caller.
    pub fallback: Option<FeatureValue>,
    /// Context merged on top of the client default context for this call.
    pub context: Option<FeatureContext>,
}

impl FeatureOptions {
    /// Options without fallback and context.
    pub fn new() -> FeatureOptions {
        FeatureOptions::default()
    }

    /// Set [`FeatureOptions::fallback`].
    pub fn with_fallback(mut self, fallback: impl Into<FeatureValue>) -> FeatureOptions {
        self.fallback = Some(fallback.into());
        self
    }

    /// Set [`FeatureOptions::context`].
    pub fn with_context(mut self, context: FeatureContext) -> FeatureOptions {
        self.context = Some(context);
        self
    }
}

/// Per-feature fallbacks of a single call. `None` means the caller supplied no fallback.
type Fallbacks = HashMap<String, Option<FeatureValue>>;

/// A client for the feature evaluation service.
///
/// In order to create a client instance, first create [`ClientConfig`]. The client is cheap to
/// clone; clones share the default context, plugins and cache.
///
/// # Examples
/// ```
/// # use feature_client::{Client, ClientConfig};
/// let client = Client::new(ClientConfig::new("api-key", "production")).unwrap();
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    environment: String,
    base_url: String,
    features: Features,
    context: ContextStore,
    plugins: PluginChain,
    fetcher: FeatureFetcher,
    retry: RetryPolicy,
    cache: QueryCache<FeatureValues>,
    query_options: QueryOptions,
    coerce_string_variations: bool,
}

impl Client {
    /// Create a new `Client` using the specified configuration.
    ///
    /// Fails with [`Error::Configuration`] if the API key or the environment is empty and with
    /// [`Error::InvalidBaseUrl`] if the base URL cannot be parsed.
    ///
    /// ```
    /// # use feature_client::{ClientConfig, Client, Error};
    /// let client = Client::new(ClientConfig::new("", "production"));
    /// assert!(matches!(client, Err(Error::Configuration(_))));
    /// ```
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(Error::Configuration("api_key is required".into()));
        }
        if config.environment.trim().is_empty() {
            return Err(Error::Configuration("environment is required".into()));
        }

        let fetcher = FeatureFetcher::new(FeatureFetcherConfig {
            base_url: config.base_url.clone(),
            api_key: config.api_key,
            request_timeout: config.request_timeout,
        })?;

        Ok(Client {
            inner: Arc::new(ClientInner {
                environment: config.environment,
                base_url: config.base_url,
                features: config.features,
                context: ContextStore::new(config.context),
                plugins: PluginChain::new(config.plugins),
                fetcher,
                retry: config.retry.to_policy(),
                cache: QueryCache::new(),
                query_options: config.cache.query_options(),
                coerce_string_variations: config.coerce_string_variations,
            }),
        })
    }

    /// Run [`Plugin::initialize`](crate::Plugin::initialize) of every plugin with a snapshot of
    /// the client.
    pub async fn initialize(&self) -> Result<()> {
        let snapshot = ClientSnapshot {
            environment: self.inner.environment.clone(),
            base_url: self.inner.base_url.clone(),
            features: self.inner.features.clone(),
            context: self.get_context(),
        };
        log::debug!(target: "feature_client",
                    environment = snapshot.environment.as_str(),
                    plugins = self.inner.plugins.len();
                    "initializing client");
        self.inner.plugins.initialize(&snapshot).await
    }

    /// Resolve a single feature.
    ///
    /// When resolution fails and `options.fallback` is set, the fallback is returned. Without a
    /// fallback the error is returned. A feature the server has no value for resolves to the
    /// fallback, or [`FeatureValue::Null`] without one.
    ///
    /// ```no_run
    /// # use feature_client::{ClientConfig, FeatureOptions};
    /// # async fn test() -> feature_client::Result<()> {
    /// let client = ClientConfig::new("api-key", "production").to_client()?;
    /// let dark_mode = client
    ///     .get_feature("dark-mode", FeatureOptions::new().with_fallback(false))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get_feature(&self, name: &str, options: FeatureOptions) -> Result<FeatureValue> {
        let fallbacks = Fallbacks::from([(name.to_owned(), options.fallback)]);
        let mut results = self.resolve(&fallbacks, options.context.as_ref()).await?;
        Ok(results.remove(name).unwrap_or_default())
    }

    /// Resolve a single feature with the default context, returning `fallback` on failure.
    pub async fn get_feature_or(
        &self,
        name: &str,
        fallback: impl Into<FeatureValue>,
    ) -> Result<FeatureValue> {
        self.get_feature(name, FeatureOptions::new().with_fallback(fallback))
            .await
    }

    /// Resolve a batch of features with a single request.
    ///
    /// `features` maps every requested feature to its fallback value. If the request fails,
    /// `features` is returned unchanged, unless it is empty or the error is a
    /// [contract violation](Error::is_contract_violation), in which case the error is returned.
    pub async fn get_features(
        &self,
        features: &Features,
        context: Option<&FeatureContext>,
    ) -> Result<FeatureValues> {
        let fallbacks: Fallbacks = features
            .iter()
            .map(|(name, fallback)| (name.clone(), Some(fallback.clone())))
            .collect();
        self.resolve(&fallbacks, context).await
    }

    /// Resolve every feature registered with [`ClientConfig::features`].
    pub async fn get_all_features(&self, context: Option<&FeatureContext>) -> Result<FeatureValues> {
        self.get_features(&self.inner.features, context).await
    }

    /// Resolve a boolean feature. Fails with [`Error::TypeMismatch`] if the feature resolves to
    /// anything else, even though a fallback is given.
    pub async fn get_boolean_feature(
        &self,
        name: &str,
        fallback: bool,
        context: Option<&FeatureContext>,
    ) -> Result<bool> {
        self.get_typed_feature(name, fallback.into(), context, FeatureValueKind::Boolean, |v| {
            v.as_boolean()
        })
        .await
    }

    /// Resolve a numeric feature. Fails with [`Error::TypeMismatch`] for other types.
    pub async fn get_number_feature(
        &self,
        name: &str,
        fallback: f64,
        context: Option<&FeatureContext>,
    ) -> Result<f64> {
        self.get_typed_feature(name, fallback.into(), context, FeatureValueKind::Number, |v| {
            v.as_number()
        })
        .await
    }

    /// Resolve a string feature. Fails with [`Error::TypeMismatch`] for other types.
    pub async fn get_string_feature(
        &self,
        name: &str,
        fallback: impl Into<String>,
        context: Option<&FeatureContext>,
    ) -> Result<String> {
        self.get_typed_feature(
            name,
            FeatureValue::String(fallback.into()),
            context,
            FeatureValueKind::String,
            |v| match v {
                FeatureValue::String(s) => Some(s),
                _ => None,
            },
        )
        .await
    }

    /// Resolve a structured (object or array) feature as JSON. Fails with
    /// [`Error::TypeMismatch`] for scalar values.
    pub async fn get_json_feature(
        &self,
        name: &str,
        fallback: serde_json::Value,
        context: Option<&FeatureContext>,
    ) -> Result<serde_json::Value> {
        self.get_typed_feature(
            name,
            fallback.into(),
            context,
            FeatureValueKind::Object,
            |v| match v {
                FeatureValue::Object(_) | FeatureValue::Array(_) => Some(v.to_json()),
                _ => None,
            },
        )
        .await
    }

    async fn get_typed_feature<T>(
        &self,
        name: &str,
        fallback: FeatureValue,
        context: Option<&FeatureContext>,
        expected: FeatureValueKind,
        extract: impl FnOnce(FeatureValue) -> Option<T>,
    ) -> Result<T> {
        let options = FeatureOptions {
            fallback: Some(fallback),
            context: context.cloned(),
        };
        let value = self.get_feature(name, options).await?;
        let actual = value.kind();

        extract(value).ok_or_else(|| {
            log::warn!(target: "feature_client",
                       feature = name,
                       expected:display = expected,
                       actual:display = actual;
                       "feature resolved to an unexpected type");
            Error::TypeMismatch {
                feature: name.to_owned(),
                expected,
                actual,
            }
        })
    }

    /// Replace (`merge = false`) or extend (`merge = true`) the default context.
    ///
    /// Fires `on_context_update` hooks and makes active [watches](Client::watch_features)
    /// refetch with the new context.
    pub async fn update_context(&self, context: FeatureContext, merge: bool) -> Result<()> {
        let (old_context, new_context) = self.inner.context.update(context, merge);
        log::debug!(target: "feature_client",
                    context:serde = new_context.as_ref(),
                    merge;
                    "updated default context");

        self.inner
            .cache
            .invalidate_by_prefix(&QueryKey::kind_prefix(QueryKey::RESOLVED));

        self.inner
            .plugins
            .on_context_update(
                old_context.as_deref(),
                &new_context,
                ContextUpdateSource::UpdateContext,
            )
            .await
    }

    /// Current default context.
    pub fn get_context(&self) -> Option<FeatureContext> {
        self.inner.context.get().map(|context| (*context).clone())
    }

    /// Run [`Plugin::cleanup`](crate::Plugin::cleanup) of every plugin. Call before dropping
    /// the client to flush buffered plugin state.
    pub async fn cleanup(&self) -> Result<()> {
        log::debug!(target: "feature_client", "cleaning up plugins");
        self.inner.plugins.cleanup().await
    }

    /// Drop cached results that include `feature`. Active [watches](Client::watch_features)
    /// of the feature refetch immediately.
    pub fn invalidate_feature(&self, feature: &str) -> usize {
        self.inner.cache.invalidate_matching(|key| {
            QueryKey::parse(key).is_some_and(|key| key.contains_feature(feature))
        })
    }

    /// Drop all cached results. Active watches refetch immediately.
    pub fn invalidate_all(&self) -> usize {
        self.inner.cache.invalidate_matching(|_| true)
    }

    /// Notify the client that the application regained focus. Stale watches refetch.
    pub fn focus_gained(&self) -> usize {
        self.inner.cache.focus_gained()
    }

    /// The cache shared by this client and its clones.
    pub fn query_cache(&self) -> &QueryCache<FeatureValues> {
        &self.inner.cache
    }

    /// Keep `features` resolved as a reactive [`Query`].
    ///
    /// The query runs the full [`Client::get_features`] pipeline (fallbacks and plugins
    /// included) and refetches when any of its features is invalidated, when the default
    /// context changes, and on [`Client::focus_gained`] once stale.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn watch_features(
        &self,
        features: Features,
        context: Option<FeatureContext>,
    ) -> Query<FeatureValues> {
        let merged = crate::merge_context(self.inner.context.get().as_deref(), context.as_ref());
        let key = QueryKey::resolved(&features, &merged).to_string();

        let client = self.clone();
        let features = Arc::new(features);
        let context = Arc::new(context);
        let fetcher: QueryFn<FeatureValues> = Arc::new(move || {
            let client = client.clone();
            let features = features.clone();
            let context = context.clone();
            async move { client.get_features(&features, Option::as_ref(&context)).await }.boxed()
        });

        self.inner
            .cache
            .subscribe(key, fetcher, self.inner.query_options.clone())
    }

    async fn resolve(
        &self,
        fallbacks: &Fallbacks,
        context: Option<&FeatureContext>,
    ) -> Result<FeatureValues> {
        let default_context = self.inner.context.get();
        let merged = crate::merge_context(default_context.as_deref(), context);

        let result = self
            .resolve_with_context(fallbacks, default_context.as_deref(), context, &merged)
            .await;

        let err = match result {
            Ok(results) => return Ok(results),
            Err(err) => err,
        };

        // Hook failures are logged by the chain; the original error wins.
        let _ = self.inner.plugins.on_error(&err, &merged).await;

        let has_fallback = fallbacks.values().any(Option::is_some);
        if err.is_contract_violation() || !has_fallback {
            return Err(err);
        }

        log::warn!(target: "feature_client",
                   features:serde = fallbacks.keys().collect::<Vec<_>>();
                   "failed to resolve features, using fallbacks: {}", err);

        let results: FeatureValues = fallbacks
            .iter()
            .map(|(name, fallback)| (name.clone(), fallback.clone().unwrap_or_default()))
            .collect();
        for (name, value) in &results {
            let _ = self
                .inner
                .plugins
                .on_fallback_used(name, value, FallbackReason::Error)
                .await;
        }

        Ok(results)
    }

    async fn resolve_with_context(
        &self,
        fallbacks: &Fallbacks,
        default_context: Option<&FeatureContext>,
        context: Option<&FeatureContext>,
        merged: &FeatureContext,
    ) -> Result<FeatureValues> {
        let plugins = &self.inner.plugins;

        if context.is_some() {
            plugins
                .on_context_update(default_context, merged, ContextUpdateSource::Request)
                .await?;
        }

        let mut names: Vec<String> = fallbacks.keys().cloned().collect();
        names.sort();
        plugins.before_get_features(&names, merged).await?;

        let key = QueryKey::features(names.iter().map(String::as_str), merged).to_string();
        let variations = self
            .inner
            .cache
            .fetch(&key, self.fetch_fn(names, merged.clone()), &self.inner.query_options)
            .await?;

        let mut results = FeatureValues::with_capacity(fallbacks.len());
        for (name, fallback) in fallbacks {
            let value = match (variations.get(name), fallback) {
                (Some(variation), _) => variation.clone(),
                (None, Some(fallback)) => {
                    plugins
                        .on_fallback_used(name, fallback, FallbackReason::MissingVariation)
                        .await?;
                    fallback.clone()
                }
                (None, None) => FeatureValue::Null,
            };
            results.insert(name.clone(), value);
        }

        plugins.after_get_features(&mut results, merged).await?;

        log::trace!(target: "feature_client",
                    results:serde = results;
                    "resolved features");

        Ok(results)
    }

    fn fetch_fn(&self, features: Vec<String>, context: FeatureContext) -> QueryFn<FeatureValues> {
        let inner = self.inner.clone();
        let request = Arc::new(FeaturesRequest {
            features,
            environment: inner.environment.clone(),
            context,
        });

        Arc::new(move || {
            let inner = inner.clone();
            let request = request.clone();
            async move { inner.fetch_variations(&request).await }.boxed()
        })
    }
}

impl ClientInner {
    /// Fetch server variations for `request`, retrying per the client policy. Only non-null
    /// variations of requested features are returned.
    async fn fetch_variations(&self, request: &FeaturesRequest) -> Result<FeatureValues> {
        let plugins = &self.plugins;

        let response = retry_with_callback(
            &self.retry,
            || self.fetcher.fetch(request, plugins),
            |attempt, err: Error, will_retry| async move {
                let _ = plugins.on_retry_attempt(attempt, &err, will_retry).await;
            },
        )
        .await?;

        let variations = response
            .features
            .into_iter()
            .filter(|(name, evaluation)| {
                request.features.contains(name) && !evaluation.variation.is_null()
            })
            .map(|(name, evaluation)| {
                let value = if self.coerce_string_variations {
                    evaluation.variation.coerce_wire_string()
                } else {
                    evaluation.variation
                };
                (name, value)
            })
            .collect();

        Ok(variations)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("environment", &self.inner.environment)
            .field("base_url", &self.inner.base_url)
            .field("plugins", &self.inner.plugins)
            .field("cache", &self.inner.cache)
            .finish_non_exhaustive()
    }
}
