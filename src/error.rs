//! Errors reported by the request surface and the execution substrate.

use std::any::Any;
use std::ops::Range;
use std::path::PathBuf;

use thiserror::Error;

use crate::context::{ContextId, VisualizationId};
use crate::ir::{ModuleName, NodeId};

/// Result type of synchronous requests.
pub type Result<T> = std::result::Result<T, Error>;

/// An error answering a synchronous request or aborting a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("execution context {0} does not exist")]
    ContextNotFound(ContextId),

    #[error("execution context {0} has an empty stack")]
    EmptyStack(ContextId),

    #[error("invalid stack item: {0}")]
    InvalidStackItem(&'static str),

    #[error("visualization {0} does not exist")]
    VisualizationNotFound(VisualizationId),

    #[error("file {} is not open", .0.display())]
    FileNotOpen(PathBuf),

    #[error("module {0} does not exist")]
    ModuleNotFound(ModuleName),

    #[error("edit range {range:?} is invalid for a source of {len} bytes")]
    InvalidEdit { range: Range<usize>, len: usize },

    #[error("node {0} occurs more than once in the module IR")]
    DuplicateNode(NodeId),

    #[error("internal invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    /// Whether this error is a defect of the engine rather than of a request.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::DuplicateNode(_) | Self::Invariant(_))
    }
}

/// A condition raised by user code while the substrate ran a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Raised {
    /// An unrecoverable panic of user or runtime code.
    #[error("{message}")]
    Panic { message: String, node: Option<NodeId> },
    /// The run was interrupted from the outside. Not a failure of the program.
    #[error("execution interrupted")]
    Interrupted,
}

impl Raised {
    /// Shorthand for a panic that is not attributed to a node.
    pub fn panic(message: impl Into<String>) -> Self {
        Self::Panic { message: message.into(), node: None }
    }
}

/// Extract the message of a caught panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}
