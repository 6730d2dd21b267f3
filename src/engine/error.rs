use thiserror::Error;

use crate::config::ConfigError;
use crate::db::DbError;
use crate::engine::predicate::PredicateError;
use crate::engine::process::ProcessError;

/// The engine's error taxonomy (SPEC_FULL.md §7). Variants that are
/// recovered locally by the runner (predicate/template errors) are folded
/// into an `unresolved` item transition before they would ever reach a
/// command boundary as an `Err` — see `engine::runner`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] DbError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("template error: unknown variable {{{{{0}}}}}")]
    TemplateError(String),

    #[error("predicate error: {0}")]
    Predicate(#[from] PredicateError),

    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("no healthy agent available in group {0}")]
    NoAgentAvailable(String),
}

impl From<EngineError> for String {
    fn from(err: EngineError) -> Self {
        err.to_string()
    }
}
