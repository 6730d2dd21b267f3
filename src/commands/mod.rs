//! Tauri command handlers (SPEC_FULL.md §6). One file per command surface
//! area, grounded on the teacher's `#[tauri::command] fn(state: State<'_,
//! T>, ...) -> Result<T, String>` template and `pub use` re-export style.

pub mod config;
pub mod predicate;
pub mod tasks;

use std::sync::Arc;

use crate::config::ConfigManager;
use crate::engine::coordinator::Coordinator;

/// Shared application state handed to every command handler via
/// `tauri::State`. Both fields are cheaply cloneable handles (`Coordinator`
/// itself owns an `Arc`-backed `Database`/`EventBus`/`ConfigManager`), so
/// `AppState` is managed once at startup and never reconstructed.
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub config: Arc<ConfigManager>,
}

pub use config::*;
pub use predicate::*;
pub use tasks::*;
