//! Dispatch engine for a tool-calling assistant.
//!
//! One turn runs in fixed order and stops at the first step that consumes
//! the message:
//! 1. **Reset** (`conversation`): clears references, history and pending actions
//! 2. **Pending confirmation** (`confirmation`, `pending`): an outstanding sensitive
//!    action is confirmed or denied by an exact-phrase reply
//! 3. **Precheck** (`precheck`): literal requests skip the model
//! 4. **Model** (`llm`): tool calls are requested from a bounded catalog (`catalog`)
//! 5. **Dispatch** (`context`, `tools`): missing arguments are filled from session
//!    references, then each call is routed to its handler group
//! 6. **Output** (`sanitizer`, `stream`): results are combined and streamed with a
//!    holdback window
//!
//! # Safety Principle
//!
//! The model only proposes calls. Whether a payment runs is decided by the
//! user's explicit confirmation and the handler, never by the model.

pub mod catalog;
pub mod confirmation;
pub mod context;
pub mod conversation;
pub mod llm;
pub mod pending;
pub mod pipeline;
pub mod precheck;
pub mod sanitizer;
pub mod stream;
pub mod tools;

pub use catalog::{CatalogPriority, ToolCatalog, ToolSpec};
pub use confirmation::{ConfirmationMatcher, ConfirmationVerdict, Vocabulary};
pub use context::{ContextInjection, ContextPolicy, ContextResolver, Resolution, ResolutionError};
pub use llm::{LlmClient, ModelRequest, ModelResponse};
pub use pending::{PendingActionStore, PendingLookup};
pub use pipeline::{ConversationPipeline, PipelineBuilder, PipelineError};
pub use precheck::{PrecheckRule, PrecheckRules};
pub use sanitizer::{BoilerplateSanitizer, Sanitize, StreamingSanitizer};
pub use stream::{StreamEvent, TurnStatus, TurnSummary};
pub use tools::{
    HandlerError, HandlerFactory, HandlerGroup, ReadyHandler, RegistryError, RouteOutcome,
    ToolDispatchRegistry,
};
