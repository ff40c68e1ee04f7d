use std::{collections::BTreeMap, fmt};

use crate::{ContextValue, FeatureContext, FeatureValue, Features};

/// Stable, order-independent cache key of a feature request.
///
/// Serialized as `<kind>:<sorted JSON array of feature names>:<JSON context with sorted keys>`,
/// so requests for the same features in a different order share one cache entry. Keys of
/// resolved results additionally carry the fallbacks as a fourth `:<JSON object>` segment.
///
/// ```
/// # use feature_client::{query::QueryKey, FeatureContext};
/// let context = FeatureContext::new();
/// assert_eq!(
///     QueryKey::features(["b", "a"], &context).to_string(),
///     QueryKey::features(["a", "b"], &context).to_string(),
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct QueryKey {
    kind: String,
    features: Vec<String>,
    context: BTreeMap<String, ContextValue>,
    fallbacks: Option<BTreeMap<String, FeatureValue>>,
}

impl QueryKey {
    /// Kind of keys produced by [`QueryKey::features`]: raw server variations.
    pub const FEATURES: &'static str = "features";
    /// Kind of keys produced by [`QueryKey::resolved`]: values after fallbacks and plugins.
    pub const RESOLVED: &'static str = "resolved";

    /// Key of a batch feature request.
    pub fn features<I, S>(names: I, context: &FeatureContext) -> QueryKey
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut features: Vec<String> = names.into_iter().map(Into::into).collect();
        features.sort();
        features.dedup();

        QueryKey {
            kind: QueryKey::FEATURES.to_owned(),
            features,
            context: sorted_context(context),
            fallbacks: None,
        }
    }

    /// Key of fully resolved values for `fallbacks` under `context`.
    pub fn resolved(fallbacks: &Features, context: &FeatureContext) -> QueryKey {
        let fallbacks: BTreeMap<String, FeatureValue> = fallbacks
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        QueryKey {
            kind: QueryKey::RESOLVED.to_owned(),
            features: fallbacks.keys().cloned().collect(),
            context: sorted_context(context),
            fallbacks: Some(fallbacks),
        }
    }

    /// Parse a serialized key back. Returns `None` for keys not produced by [`QueryKey`].
    pub fn parse(key: &str) -> Option<QueryKey> {
        let (kind, rest) = key.split_once(':')?;

        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Vec<String>>();
        let features = stream.next()?.ok()?;
        let rest = rest[stream.byte_offset()..].strip_prefix(':')?;

        let mut stream = serde_json::Deserializer::from_str(rest)
            .into_iter::<BTreeMap<String, ContextValue>>();
        let context = stream.next()?.ok()?;
        let rest = &rest[stream.byte_offset()..];

        let fallbacks = match rest {
            "" => None,
            rest => Some(serde_json::from_str(rest.strip_prefix(':')?).ok()?),
        };

        Some(QueryKey {
            kind: kind.to_owned(),
            features,
            context,
            fallbacks,
        })
    }

    /// Kind of the key.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Sorted feature names covered by this key.
    pub fn feature_names(&self) -> &[String] {
        &self.features
    }

    /// Returns `true` if the key covers `feature`.
    pub fn contains_feature(&self, feature: &str) -> bool {
        self.features
            .binary_search_by(|name| name.as_str().cmp(feature))
            .is_ok()
    }

    /// Prefix shared by all keys of `kind`, for
    /// [`QueryCache::invalidate_by_prefix`](super::QueryCache::invalidate_by_prefix).
    pub fn kind_prefix(kind: &str) -> String {
        format!("{kind}:")
    }
}

fn sorted_context(context: &FeatureContext) -> BTreeMap<String, ContextValue> {
    context
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Maps with string keys always serialize.
        let features = serde_json::to_string(&self.features).map_err(|_| fmt::Error)?;
        let context = serde_json::to_string(&self.context).map_err(|_| fmt::Error)?;
        write!(f, "{}:{}:{}", self.kind, features, context)?;

        if let Some(fallbacks) = &self.fallbacks {
            let fallbacks = serde_json::to_string(fallbacks).map_err(|_| fmt::Error)?;
            write!(f, ":{}", fallbacks)?;
        }
        Ok(())
    }
}
