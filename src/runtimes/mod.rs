//! Runtime execution: contexts, expressions, histories, the scheduler, and
//! the workflow facade.

pub mod context;
pub mod executors;
pub mod expression;
pub mod history;
pub mod runner;
pub mod scheduler;

pub use context::{CallContext, CancelToken, LoopContext, NodeState, Registries, RunContext, RunState};
pub use executors::{ExecEnv, ExecScope, NodeExecutor, NodeInterrupt, NodeOutcome};
pub use history::{HistoryBackend, HistoryMessage, InMemoryHistoryBackend};
pub use runner::{Workflow, WorkflowError};
pub use scheduler::{RunFailure, RunOptions, RunResult, RunStatus, Scheduler};
