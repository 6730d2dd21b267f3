#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use std::sync::Arc;
use tauri::Manager;

use qa_orchestrator::commands::{self, AppState};
use qa_orchestrator::config::ConfigManager;
use qa_orchestrator::db::Database;
use qa_orchestrator::engine::{Coordinator, EventBus};
use qa_orchestrator::logging;

/// Forward every envelope published on the bus to the GUI as a Tauri event
/// (§6 "Event stream"). Durable events and `log_chunk` events ride separate
/// bus channels (engine::bus::EventBus) but are republished under the same
/// `engine-event` channel name — the GUI distinguishes them by `event_type`
/// in the envelope, same as it would reconstructing an `Event` row.
fn spawn_event_bridge(app_handle: tauri::AppHandle, bus: Arc<EventBus>) {
    let mut subscription = bus.subscribe();
    tauri::async_runtime::spawn(async move {
        loop {
            tokio::select! {
                durable = subscription.durable.recv() => {
                    match durable {
                        Ok(dispatched) => {
                            if let Err(e) = app_handle.emit_all("engine-event", &dispatched) {
                                tracing::warn!(error = %e, "failed to emit durable engine event");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "durable event subscriber lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                log_chunk = subscription.log.recv() => {
                    match log_chunk {
                        Ok(dispatched) => {
                            let _ = app_handle.emit_all("engine-event", &dispatched);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            // log_chunk is the one droppable event type (SPEC_FULL.md §4.B).
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    });
}

fn main() {
    tauri::Builder::default()
        .setup(|app| {
            let app_data_dir = app
                .path_resolver()
                .app_data_dir()
                .expect("Failed to get app data directory");
            std::fs::create_dir_all(&app_data_dir).expect("Failed to create app data directory");

            if let Err(e) = logging::init_logging(app_data_dir.clone()) {
                eprintln!("Failed to initialize logging: {}", e);
            }

            tracing::info!("QA Orchestrator starting up...");
            tracing::info!("App data directory: {:?}", app_data_dir);

            let db_path = app_data_dir.join("state.db");
            let database = Database::open(db_path).expect("Failed to open database");

            let config_dir = app
                .path_resolver()
                .app_config_dir()
                .expect("Failed to get app config directory");
            std::fs::create_dir_all(&config_dir).expect("Failed to create app config directory");
            let config_path = config_dir.join("config.yaml");
            let config_manager = Arc::new(
                ConfigManager::load(config_path, database.clone()).expect("Failed to load config"),
            );

            let bus = Arc::new(EventBus::new());
            spawn_event_bridge(app.handle(), bus.clone());

            let coordinator = Arc::new(Coordinator::new(
                database,
                bus,
                config_manager.clone(),
                app_data_dir.clone(),
            ));

            app.manage(AppState { coordinator: coordinator.clone(), config: config_manager });

            // Crash recovery + auto-resume (SPEC_FULL.md §4.A, §4.H) happens
            // off the setup-hook's synchronous path so a slow resumed task
            // never delays window creation.
            tauri::async_runtime::spawn(async move {
                match coordinator.bootstrap().await {
                    Ok(Some(task_id)) => tracing::info!(task_id, "resumed interrupted task on startup"),
                    Ok(None) => tracing::info!("no task resumed on startup"),
                    Err(e) => tracing::error!(error = %e, "startup bootstrap failed"),
                }
            });

            tracing::info!("QA Orchestrator initialized successfully");

            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::bootstrap,
            commands::list_tasks,
            commands::get_task_details,
            commands::create_task,
            commands::start_task,
            commands::pause_task,
            commands::resume_task,
            commands::retry_task_item,
            commands::delete_task,
            commands::stream_task_logs,
            commands::get_create_task_options,
            commands::get_config_overview,
            commands::save_config_from_form,
            commands::save_config_from_yaml,
            commands::validate_config_yaml,
            commands::list_config_versions,
            commands::get_config_version,
            commands::simulate_prehook,
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
