use std::sync::Arc;

use crate::value::FeatureValueKind;

/// Represents a result type for operations in the feature client.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur while resolving features.
///
/// Errors fall into two groups. *Availability* failures ([`Error::Http`], [`Error::Network`],
/// [`Error::Parse`], [`Error::Cancelled`], [`Error::Plugin`]) are converted into fallback values
/// by [`Client::get_features`](crate::Client::get_features) whenever the caller supplied a
/// fallback. *Contract* violations ([`Error::TypeMismatch`], [`Error::Configuration`],
/// [`Error::InvalidBaseUrl`]) always propagate.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The evaluation service answered with a non-2xx status.
    #[error("Failed to fetch features: {status_text}")]
    Http {
        /// Numeric HTTP status code.
        status: u16,
        /// Canonical reason phrase for the status.
        status_text: String,
    },

    /// Network-level failure (connection refused, timeout, TLS, ...).
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// The response body could not be decoded.
    #[error("malformed features response: {0}")]
    Parse(Arc<serde_json::Error>),

    /// Resolved value's type disagrees with the type requested by a typed getter.
    #[error("feature {feature:?} resolved to {actual} but {expected} was requested")]
    TypeMismatch {
        /// Name of the feature.
        feature: String,
        /// Type requested by the caller.
        expected: FeatureValueKind,
        /// Type of the resolved value.
        actual: FeatureValueKind,
    },

    /// Required client configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The fetch was stopped before it completed, e.g. because the runtime shut down.
    #[error("feature fetch was cancelled")]
    Cancelled,

    /// A plugin hook failed.
    #[error("plugin {plugin:?} failed: {message}")]
    Plugin {
        /// Name of the failing plugin.
        plugin: String,
        /// Error message reported by the plugin.
        message: String,
    },
}

impl Error {
    /// Create a plugin error. Intended for use by [`Plugin`](crate::Plugin) implementations.
    pub fn plugin(plugin: impl Into<String>, message: impl ToString) -> Error {
        Error::Plugin {
            plugin: plugin.into(),
            message: message.to_string(),
        }
    }

    /// Returns `true` for errors that indicate a bug on the caller side rather than a transient
    /// service failure. Such errors are never replaced with fallback values.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::TypeMismatch { .. } | Error::Configuration(_) | Error::InvalidBaseUrl(_)
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Parse(Arc::new(value))
    }
}
