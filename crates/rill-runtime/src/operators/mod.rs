//! Plan operators
//!
//! Each operator is a pure function from one pipeline item to at most one
//! item. The topology runs them in plan order after the window and join
//! stages:
//!
//! ```text
//! preprocessor -> [filter] -> window -> join -> [filter] -> aggregate
//!     -> having -> order -> project -> sinks
//! ```
//!
//! Errors are per item: an operator returns the error, the topology turns it
//! into an error item for the sinks and keeps running.

mod aggregate;
mod filter;
mod having;
mod order;
mod preprocessor;
mod project;

pub use aggregate::AggregateOperator;
pub use filter::FilterOperator;
pub use having::HavingOperator;
pub use order::{sort_data, OrderOperator, SortingData};
pub use preprocessor::Preprocessor;
pub use project::ProjectOperator;

use crate::error::EvalResult;
use crate::functions::AnalyticFunctions;
use crate::join::JoinOperator;
use crate::tuple::Data;

/// One stage of a rule's plan.
pub trait Operation: Send + Sync {
    /// Stable name used in operator ids and logs.
    fn name(&self) -> &'static str;

    /// Transform one item. `Ok(None)` drops it.
    fn apply(&self, data: Data) -> EvalResult<Option<Data>>;

    /// State acknowledged with each checkpoint barrier.
    fn snapshot(&self) -> Option<serde_json::Value> {
        None
    }

    /// Reload the state of a previous [`Operation::snapshot`] before the first item.
    fn restore(&self, _state: serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}

fn snapshot_analytic(functions: &AnalyticFunctions) -> Option<serde_json::Value> {
    functions
        .snapshot()
        .and_then(|slots| serde_json::to_value(slots).ok())
}

fn restore_analytic(functions: &AnalyticFunctions, state: serde_json::Value) -> Result<(), String> {
    let slots = serde_json::from_value(state).map_err(|e| e.to_string())?;
    functions.restore(slots);
    Ok(())
}

impl Operation for JoinOperator {
    fn name(&self) -> &'static str {
        "join"
    }

    fn apply(&self, data: Data) -> EvalResult<Option<Data>> {
        match data {
            Data::Window(set) => Ok(JoinOperator::apply(self, set)?.map(Data::Join)),
            other => Err(crate::error::EvalError::msg(format!(
                "run Join error: join is only supported in window, got {}",
                other.kind()
            ))),
        }
    }
}
