//! Notifications pushed to the clients of the engine.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::mpsc::Sender;

use parking_lot::Mutex;

use crate::context::{ContextId, VisualizationId};
use crate::index::IndexUpdate;
use crate::ir::{ExternalId, ModuleName, NodeId};
use crate::value::{MethodCall, TypeTag};

/// How bad a diagnostic is.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Severity {
    Warning,
    Error,
}

/// A compiler or engine message attached to a location.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub file: Option<PathBuf>,
    pub range: Option<Range<usize>>,
    pub node: Option<NodeId>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            file: None,
            range: None,
            node: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self { severity: Severity::Warning, ..Self::error(message) }
    }

    pub fn with_file(mut self, file: PathBuf) -> Self {
        self.file = Some(file);
        self
    }

    pub fn with_range(mut self, range: Range<usize>) -> Self {
        self.range = Some(range);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// A value whose observable state was (re)computed or confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueUpdate {
    pub node: NodeId,
    pub external_id: Option<ExternalId>,
    pub ty: Option<TypeTag>,
    pub call: Option<MethodCall>,
    /// Whether the update was reconciled from the cache instead of computed.
    pub from_cache: bool,
}

/// Something a client may want to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ValueUpdated { context: ContextId, update: ValueUpdate },
    VisualizationUpdated {
        context: ContextId,
        visualization: VisualizationId,
        node: NodeId,
        data: Vec<u8>,
    },
    VisualizationFailed {
        context: ContextId,
        visualization: VisualizationId,
        message: String,
    },
    ExecutionFailed { context: ContextId, message: String, node: Option<NodeId> },
    /// A run finished and every update of it was emitted.
    ExecutionComplete { context: ContextId },
    ModuleIndexUpdated(IndexUpdate),
    /// Diagnostics of a module, addressed to a context depending on it or to
    /// nobody in particular.
    DiagnosticsUpdated {
        context: Option<ContextId>,
        module: ModuleName,
        diagnostics: Vec<Diagnostic>,
    },
}

/// Receives notifications.
pub trait Sink: Send + Sync {
    fn emit(&self, notification: Notification);
}

impl Sink for Mutex<Vec<Notification>> {
    fn emit(&self, notification: Notification) {
        self.lock().push(notification);
    }
}

impl Sink for Sender<Notification> {
    fn emit(&self, notification: Notification) {
        // A disconnected client is not the engine's problem.
        let _ = self.send(notification);
    }
}

/// Drops all notifications.
pub struct Discard;

impl Sink for Discard {
    fn emit(&self, _: Notification) {}
}
