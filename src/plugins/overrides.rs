use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::{FeatureContext, FeatureValue, FeatureValues, Plugin, Result};

/// Replaces resolved values with locally configured overrides.
///
/// Only features that were requested are overridden; overrides never add keys to a result.
/// Cached results are not touched, so after changing an override call
/// [`Client::invalidate_feature`](crate::Client::invalidate_feature) to make active watches
/// pick it up.
///
/// `OverridesPlugin` is cheap to clone and clones share the same overrides: keep one clone and
/// register another with [`ClientConfig::plugin`](crate::ClientConfig::plugin).
///
/// # Examples
/// ```
/// # use feature_client::{ClientConfig, plugins::OverridesPlugin};
/// let overrides = OverridesPlugin::new();
/// overrides.set("dark-mode", true);
///
/// let mut config = ClientConfig::new("api-key", "production");
/// config.plugin(overrides.clone());
/// ```
#[derive(Debug, Clone, Default)]
pub struct OverridesPlugin {
    overrides: Arc<RwLock<FeatureValues>>,
}

impl OverridesPlugin {
    /// Create a plugin without overrides.
    pub fn new() -> OverridesPlugin {
        OverridesPlugin::default()
    }

    /// Create a plugin with initial overrides.
    pub fn with_overrides(overrides: FeatureValues) -> OverridesPlugin {
        OverridesPlugin {
            overrides: Arc::new(RwLock::new(overrides)),
        }
    }

    /// Override `feature` with `value`. Returns the previous override.
    pub fn set(
        &self,
        feature: impl Into<String>,
        value: impl Into<FeatureValue>,
    ) -> Option<FeatureValue> {
        self.write().insert(feature.into(), value.into())
    }

    /// Remove the override of `feature`.
    pub fn remove(&self, feature: &str) -> Option<FeatureValue> {
        self.write().remove(feature)
    }

    /// Remove all overrides.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Current override of `feature`.
    pub fn get(&self, feature: &str) -> Option<FeatureValue> {
        self.read().get(feature).cloned()
    }

    /// Snapshot of all overrides.
    pub fn overrides(&self) -> FeatureValues {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, FeatureValues> {
        self.overrides.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, FeatureValues> {
        self.overrides.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Plugin for OverridesPlugin {
    fn name(&self) -> &str {
        "overrides"
    }

    async fn after_get_features(
        &self,
        results: &mut FeatureValues,
        _context: &FeatureContext,
    ) -> Result<()> {
        let overrides = self.read();
        for (feature, value) in results.iter_mut() {
            if let Some(override_value) = overrides.get(feature) {
                log::trace!(target: "feature_client",
                            feature:display = feature;
                            "applying local override");
                *value = override_value.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overrides_only_requested_features() {
        let plugin = OverridesPlugin::new();
        plugin.set("dark-mode", true);
        plugin.set("unrelated", "x");

        let mut results: FeatureValues = [
            ("dark-mode".to_owned(), false.into()),
            ("limit".to_owned(), 5.into()),
        ]
        .into();
        plugin
            .after_get_features(&mut results, &FeatureContext::new())
            .await
            .unwrap();

        assert_eq!(results["dark-mode"], FeatureValue::Boolean(true));
        assert_eq!(results["limit"], FeatureValue::Number(5.0));
        assert!(!results.contains_key("unrelated"));
    }

    #[test]
    fn clones_share_overrides() {
        let plugin = OverridesPlugin::new();
        let registered = plugin.clone();

        plugin.set("a", 1);
        assert_eq!(registered.get("a"), Some(FeatureValue::Number(1.0)));

        assert_eq!(registered.remove("a"), Some(FeatureValue::Number(1.0)));
        assert!(plugin.overrides().is_empty());
    }
}
