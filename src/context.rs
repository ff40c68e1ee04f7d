//! Evaluation context attached to every request, and the thread-safe holder of the client-level
//! default context.
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Key-value pairs describing the evaluation subject (user, session, environment).
///
/// # Examples
/// ```
/// # use feature_client::{FeatureContext, ContextValue};
/// let context = [
///     ("user_id".to_owned(), "user-42".into()),
///     ("age".to_owned(), 30.0.into()),
///     ("beta".to_owned(), true.into()),
/// ].into_iter().collect::<FeatureContext>();
/// ```
pub type FeatureContext = HashMap<String, ContextValue>;

/// A scalar context value.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum ContextValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for ContextValue {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

/// What triggered a context change reported to `on_context_update` hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextUpdateSource {
    /// A per-call context was merged into the default context for a single request.
    Request,
    /// [`Client::update_context`](crate::Client::update_context) changed the default context.
    UpdateContext,
}

impl fmt::Display for ContextUpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextUpdateSource::Request => f.write_str("request"),
            ContextUpdateSource::UpdateContext => f.write_str("updateContext"),
        }
    }
}

/// Shallow-merge `overrides` on top of `base`. Keys present in `overrides` win.
///
/// ```
/// # use feature_client::{merge_context, FeatureContext};
/// let base: FeatureContext = [("x".to_owned(), 0.into()), ("y".to_owned(), 2.into())].into();
/// let overrides: FeatureContext = [("x".to_owned(), 1.into())].into();
///
/// let merged = merge_context(Some(&base), Some(&overrides));
/// let expected: FeatureContext = [("x".to_owned(), 1.into()), ("y".to_owned(), 2.into())].into();
/// assert_eq!(merged, expected);
/// ```
pub fn merge_context(
    base: Option<&FeatureContext>,
    overrides: Option<&FeatureContext>,
) -> FeatureContext {
    let mut merged = base.cloned().unwrap_or_default();
    if let Some(overrides) = overrides {
        merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    merged
}

/// `ContextStore` holds the client default context and allows concurrent access for readers
/// (every evaluation) and writers (`update_context`).
///
/// The context itself is immutable and can only be replaced completely. Readers receive a
/// snapshot that is not affected by further writes.
#[derive(Debug, Default)]
pub(crate) struct ContextStore {
    context: RwLock<Option<Arc<FeatureContext>>>,
}

impl ContextStore {
    pub fn new(initial: Option<FeatureContext>) -> Self {
        ContextStore {
            context: RwLock::new(initial.map(Arc::new)),
        }
    }

    /// Get currently-active default context.
    pub fn get(&self) -> Option<Arc<FeatureContext>> {
        // A poisoned lock means a writer panicked mid-replace. Replacing an `Arc` cannot leave
        // the slot half-written, so the inner value is still usable.
        let context = self
            .context
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        context.clone()
    }

    /// Replace the default context (`merge = false`) or merge `context` on top of it, returning
    /// the previous and the new snapshots.
    pub fn update(
        &self,
        context: FeatureContext,
        merge: bool,
    ) -> (Option<Arc<FeatureContext>>, Arc<FeatureContext>) {
        let mut slot = self
            .context
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let new_value = if merge {
            Arc::new(merge_context(slot.as_deref(), Some(&context)))
        } else {
            Arc::new(context)
        };

        let old_value = std::mem::replace(&mut *slot, Some(new_value.clone()));
        (old_value, new_value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn ctx(pairs: &[(&str, ContextValue)]) -> FeatureContext {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn override_wins_on_conflict() {
        let base = ctx(&[("x", 0.into()), ("y", 2.into())]);
        let overrides = ctx(&[("x", 1.into())]);

        assert_eq!(
            merge_context(Some(&base), Some(&overrides)),
            ctx(&[("x", 1.into()), ("y", 2.into())])
        );
    }

    #[test]
    fn merge_with_missing_sides() {
        let base = ctx(&[("plan", "pro".into())]);

        assert_eq!(merge_context(Some(&base), None), base);
        assert_eq!(merge_context(None, Some(&base)), base);
        assert!(merge_context(None, None).is_empty());
    }

    #[test]
    fn update_merges_or_replaces() {
        let store = ContextStore::new(Some(ctx(&[("x", 0.into()), ("y", 2.into())])));

        let (old, new) = store.update(ctx(&[("x", 1.into())]), true);
        assert_eq!(*old.unwrap(), ctx(&[("x", 0.into()), ("y", 2.into())]));
        assert_eq!(*new, ctx(&[("x", 1.into()), ("y", 2.into())]));

        let (_, new) = store.update(ctx(&[("z", true.into())]), false);
        assert_eq!(*new, ctx(&[("z", true.into())]));
        assert_eq!(*store.get().unwrap(), ctx(&[("z", true.into())]));
    }

    #[test]
    fn can_update_context_from_another_thread() {
        let store = Arc::new(ContextStore::new(None));

        assert!(store.get().is_none());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.update(ctx(&[("user_id", "u1".into())]), true);
            })
            .join();
        }

        assert!(store.get().is_some());
    }
}
