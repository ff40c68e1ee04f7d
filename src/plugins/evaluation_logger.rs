use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ClientSnapshot, FeatureContext, FeatureValues, Plugin, Result};

/// A resolved batch of features, as returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationEvent {
    /// Environment of the client, known once the client is initialized.
    pub environment: Option<String>,
    /// Resolved values, including changes made by plugins registered earlier.
    pub features: FeatureValues,
    /// Merged context the features were resolved with.
    pub context: FeatureContext,
    /// When the batch was resolved.
    pub timestamp: DateTime<Utc>,
}

/// Receives evaluation events, e.g. to store them in your data warehouse.
pub trait EvaluationLogger: Send + Sync {
    /// Log a single event.
    fn log_evaluation(&self, event: EvaluationEvent);

    /// Log a batch of events. Calls [`EvaluationLogger::log_evaluation`] for each event by
    /// default.
    fn log_evaluations(&self, events: Vec<EvaluationEvent>) {
        for event in events {
            self.log_evaluation(event);
        }
    }
}

impl<T: Fn(EvaluationEvent) + Send + Sync> EvaluationLogger for T {
    fn log_evaluation(&self, event: EvaluationEvent) {
        self(event);
    }
}

/// Passes every resolved batch to an [`EvaluationLogger`].
///
/// Register it after plugins that modify results to log the values callers actually see.
///
/// With [`EvaluationLoggerPlugin::with_batch_size`], events are buffered and handed over in
/// batches. Remaining events are flushed on [`Client::cleanup`](crate::Client::cleanup).
///
/// ```
/// # use feature_client::{ClientConfig, plugins::EvaluationLoggerPlugin};
/// let mut config = ClientConfig::new("api-key", "production");
/// config.plugin(EvaluationLoggerPlugin::new(|event| {
///     println!("{:?}", event);
/// }));
/// ```
pub struct EvaluationLoggerPlugin {
    logger: Box<dyn EvaluationLogger>,
    batch_size: usize,
    environment: Mutex<Option<String>>,
    queue: Mutex<VecDeque<EvaluationEvent>>,
}

const MAX_BATCH_SIZE: usize = 10_000;

impl EvaluationLoggerPlugin {
    /// Create a plugin that logs every event as soon as it is produced.
    pub fn new(logger: impl EvaluationLogger + 'static) -> Self {
        EvaluationLoggerPlugin {
            logger: Box::new(logger),
            batch_size: 1,
            environment: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Buffer events and log them in batches of `batch_size` (clamped to `1..=10000`).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    /// Number of buffered events.
    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Log all buffered events now.
    pub fn flush(&self) {
        let batch: Vec<EvaluationEvent> = lock(&self.queue).drain(..).collect();
        if !batch.is_empty() {
            log::trace!(target: "feature_client", events = batch.len(); "flushing evaluation events");
            self.logger.log_evaluations(batch);
        }
    }

    fn push(&self, event: EvaluationEvent) {
        let batch = {
            let mut queue = lock(&self.queue);
            queue.push_back(event);
            if queue.len() < self.batch_size {
                return;
            }
            queue.drain(..).collect::<Vec<_>>()
        };
        self.logger.log_evaluations(batch);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Plugin for EvaluationLoggerPlugin {
    fn name(&self) -> &str {
        "evaluation-logger"
    }

    async fn initialize(&self, client: &ClientSnapshot) -> Result<()> {
        *lock(&self.environment) = Some(client.environment.clone());
        Ok(())
    }

    async fn after_get_features(
        &self,
        results: &mut FeatureValues,
        context: &FeatureContext,
    ) -> Result<()> {
        let environment = lock(&self.environment).clone();
        self.push(EvaluationEvent {
            environment,
            features: results.clone(),
            context: context.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.flush();
        Ok(())
    }
}
