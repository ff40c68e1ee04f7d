//! An HTTP client that resolves features against the evaluation service.
use std::{collections::HashMap, time::Duration};

use chrono::Utc;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Url,
};
use serde::{Deserialize, Serialize};

use crate::{
    plugin::{HttpRequest, HttpResponse, PluginChain, ResponseTiming},
    Error, FeatureContext, FeatureValue, Result,
};

const FEATURES_ENDPOINT: &str = "features";

/// Body of `POST {base_url}/features`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesRequest {
    /// Names of the requested features.
    pub features: Vec<String>,
    /// Environment identifier.
    pub environment: String,
    /// Merged evaluation context.
    pub context: FeatureContext,
}

/// Response of `POST {base_url}/features`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeaturesResponse {
    /// Per-feature evaluation results.
    #[serde(default)]
    pub features: HashMap<String, FeatureEvaluation>,
}

/// Server evaluation of a single feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEvaluation {
    /// Server-selected value. `null` or missing means "no value".
    #[serde(default)]
    pub variation: FeatureValue,
    /// Additional server-provided data (rule ids, reasons, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

pub(crate) struct FeatureFetcherConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Option<Duration>,
}

/// A client that fetches feature evaluations from the server.
pub(crate) struct FeatureFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    request_timeout: Option<Duration>,
}

impl FeatureFetcher {
    pub fn new(config: FeatureFetcherConfig) -> Result<FeatureFetcher> {
        let url = endpoint_url(&config.base_url)?;

        let mut headers = HeaderMap::new();
        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| Error::Configuration("api_key contains invalid characters".into()))?;
        authorization.set_sensitive(true);
        headers.insert(AUTHORIZATION, authorization);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(FeatureFetcher {
            client: reqwest::Client::new(),
            url,
            headers,
            request_timeout: config.request_timeout,
        })
    }

    /// Perform a single request. `before_request` and `after_response` hooks fire around the
    /// transport call.
    pub async fn fetch(
        &self,
        request: &FeaturesRequest,
        plugins: &PluginChain,
    ) -> Result<FeaturesResponse> {
        let http_request = HttpRequest {
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: request.clone(),
        };
        plugins.before_request(&http_request).await?;

        log::debug!(target: "feature_client",
                    features:serde = request.features;
                    "fetching features");

        let mut builder = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .json(request);
        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        let started = tokio::time::Instant::now();
        let response = builder.send().await.inspect_err(|err| {
            log::warn!(target: "feature_client", "error while fetching features: {:?}", err);
        })?;
        let timing = ResponseTiming {
            duration: started.elapsed(),
        };

        let status = response.status();
        let http_response = HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_owned(),
            received_at: Utc::now(),
        };
        plugins.after_response(&http_response, timing).await?;

        if !status.is_success() {
            log::warn!(target: "feature_client",
                       status = status.as_u16();
                       "received non-2xx response while fetching features");
            return Err(Error::Http {
                status: http_response.status,
                status_text: http_response.status_text,
            });
        }

        let body = response.bytes().await?;
        let features: FeaturesResponse = serde_json::from_slice(&body).inspect_err(|err| {
            log::warn!(target: "feature_client", "failed to parse features response body: {:?}", err);
        })?;

        log::debug!(target: "feature_client",
                    duration_ms = timing.duration.as_millis() as u64;
                    "successfully fetched features");

        Ok(features)
    }
}

/// `{base_url}/features`, tolerating a trailing slash on `base_url`.
fn endpoint_url(base_url: &str) -> Result<Url> {
    let base = format!("{}/", base_url.trim_end_matches('/'));
    Url::parse(&base)
        .and_then(|base| base.join(FEATURES_ENDPOINT))
        .map_err(Error::InvalidBaseUrl)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn endpoint_url_handles_trailing_slash() {
        assert_eq!(
            endpoint_url("https://flags.example.com/api").unwrap().as_str(),
            "https://flags.example.com/api/features"
        );
        assert_eq!(
            endpoint_url("https://flags.example.com/api/").unwrap().as_str(),
            "https://flags.example.com/api/features"
        );
    }

    #[test]
    fn invalid_base_url() {
        assert!(matches!(
            endpoint_url("not a url"),
            Err(Error::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn request_serialization() {
        let request = FeaturesRequest {
            features: vec!["dark-mode".to_owned()],
            environment: "production".to_owned(),
            context: [("user_id".to_owned(), "u1".into())].into(),
        };

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "features": ["dark-mode"],
                "environment": "production",
                "context": {"user_id": "u1"},
            })
        );
    }

    #[test]
    fn response_tolerates_missing_and_null_variations() {
        let response: FeaturesResponse = serde_json::from_value(json!({
            "features": {
                "a": {"variation": false},
                "b": {"variation": null},
                "c": {"metadata": {"reason": "default"}},
            }
        }))
        .unwrap();

        assert_eq!(response.features["a"].variation, FeatureValue::Boolean(false));
        assert_eq!(response.features["b"].variation, FeatureValue::Null);
        assert_eq!(response.features["c"].variation, FeatureValue::Null);
        assert!(response.features["c"].metadata.is_some());
    }
}
