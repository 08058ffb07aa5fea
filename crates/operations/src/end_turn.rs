//! `end_turn`: the model's explicit signal that the turn is complete.
//!
//! The handler only acknowledges; the orchestrator reacts to the kind.

use async_trait::async_trait;
use parley_core::error::OperationError;
use parley_core::operation::{
    OperationContext, OperationHandler, OperationKind, OperationOutput, OperationRequest,
};

pub struct EndTurnHandler;

#[async_trait]
impl OperationHandler for EndTurnHandler {
    fn kind(&self) -> OperationKind {
        OperationKind::EndTurn
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "summary": {
                    "type": "string",
                    "description": "Optional one-line summary of what was done"
                }
            }
        })
    }

    async fn handle(
        &self,
        _context: &OperationContext,
        request: &OperationRequest,
    ) -> Result<OperationOutput, OperationError> {
        let summary = request
            .parameters
            .get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(OperationOutput::json(serde_json::json!({
            "ended": true,
            "summary": summary,
        })))
    }
}
