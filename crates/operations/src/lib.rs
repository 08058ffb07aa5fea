//! Operation dispatch for Parley.
//!
//! The [`OperationDispatcher`] routes model-requested operations to the
//! handler registered for their kind. External collaborators (mail,
//! calendar, storage, telephony, ...) plug in by implementing
//! [`OperationHandler`](parley_core::OperationHandler); two handlers ship
//! with the runtime itself.

pub mod dispatcher;
pub mod end_turn;
pub mod knowledge_search;

use std::sync::Arc;

use parley_retrieval::{RetrievalOptions, RetrievalPipeline};

pub use dispatcher::{DEFAULT_TIMEOUT, OperationDispatcher};
pub use end_turn::EndTurnHandler;
pub use knowledge_search::KnowledgeSearchHandler;

/// Create a dispatcher with the built-in handlers registered.
pub fn default_dispatcher(
    pipeline: Arc<RetrievalPipeline>,
    options: RetrievalOptions,
) -> OperationDispatcher {
    let mut dispatcher = OperationDispatcher::new();
    dispatcher.register(Arc::new(EndTurnHandler));
    dispatcher.register(Arc::new(KnowledgeSearchHandler::new(pipeline, options)));
    dispatcher
}
