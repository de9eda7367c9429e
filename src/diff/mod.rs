pub mod line;
pub mod market;
pub mod selection;

use thiserror::Error;

pub use line::normalize_metric_line;
pub use market::{diff_market, CleanupDirective, MarketDiff};
pub use selection::{diff_selections, SelectionDiff};

/// Failure scoped to a single market or selection. Logged and skipped; never
/// aborts the batch.
#[derive(Debug, Error)]
pub enum DiffError {
    #[error("{entity} {id} missing required field `{field}`")]
    MissingField {
        entity: &'static str,
        id: String,
        field: &'static str,
    },

    #[error("cached {entity} row {id} is malformed: {reason}")]
    MalformedCache {
        entity: &'static str,
        id: String,
        reason: String,
    },
}
