//! `simulate_prehook` (SPEC_FULL.md §4.E, §6): lets the GUI dry-run a step's
//! prehook expression against an arbitrary context without a live task.

use serde::{Deserialize, Serialize};

use crate::engine::predicate::{self, Bindings, Value};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateContext {
    #[serde(default)]
    pub cycle: i64,
    #[serde(default)]
    pub active_ticket_count: i64,
    #[serde(default)]
    pub new_ticket_count: i64,
    #[serde(default = "default_unset_exit_code")]
    pub qa_exit_code: i64,
    #[serde(default = "default_unset_exit_code")]
    pub fix_exit_code: i64,
    #[serde(default = "default_unset_exit_code")]
    pub retest_exit_code: i64,
    #[serde(default)]
    pub qa_failed: bool,
    #[serde(default)]
    pub fix_required: bool,
}

fn default_unset_exit_code() -> i64 {
    -1
}

impl From<SimulateContext> for Bindings {
    fn from(ctx: SimulateContext) -> Self {
        Bindings::new()
            .with("cycle", Value::Int(ctx.cycle))
            .with("active_ticket_count", Value::Int(ctx.active_ticket_count))
            .with("new_ticket_count", Value::Int(ctx.new_ticket_count))
            .with("qa_exit_code", Value::Int(ctx.qa_exit_code))
            .with("fix_exit_code", Value::Int(ctx.fix_exit_code))
            .with("retest_exit_code", Value::Int(ctx.retest_exit_code))
            .with("qa_failed", Value::Bool(ctx.qa_failed))
            .with("fix_required", Value::Bool(ctx.fix_required))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatePrehookResponse {
    pub result: bool,
    pub expression: String,
}

#[tauri::command]
pub fn simulate_prehook(
    expression: String,
    #[allow(unused_variables)] step: Option<String>,
    context: SimulateContext,
) -> Result<SimulatePrehookResponse, String> {
    let bindings: Bindings = context.into();
    let outcome = predicate::simulate(&expression, &bindings).map_err(|e| e.to_string())?;
    Ok(SimulatePrehookResponse { result: outcome.decision, expression })
}
