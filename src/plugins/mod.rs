//! Plugins bundled with the client.
//!
//! - [`OverridesPlugin`] replaces resolved values with local overrides.
//! - [`EvaluationLoggerPlugin`] passes resolved batches to an [`EvaluationLogger`].
//! - [`LoggingPlugin`] writes every lifecycle event to the `log` facade.
mod evaluation_logger;
mod logging;
mod overrides;

pub use evaluation_logger::{EvaluationEvent, EvaluationLogger, EvaluationLoggerPlugin};
pub use logging::LoggingPlugin;
pub use overrides::OverridesPlugin;
