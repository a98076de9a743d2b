//! Running the stack of an execution context.
//!
//! A run starts at the root frame and invokes its method. Every call the
//! invocation makes is collected by node id, and the next frame re-enters the
//! call made by its expression. Descent is a plain loop over the frames, so
//! deep stacks do not grow the host stack.

use std::panic::{AssertUnwindSafe, catch_unwind};

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, trace, warn};

use crate::cache::{Indexes, MethodCallsCache, RuntimeCache};
use crate::config::Config;
use crate::context::{ContextId, ExecutionContext, Frame, Visualization, VisualizationId};
use crate::error::{Error, Raised, Result, panic_message};
use crate::ir::{ModuleIr, NodeId};
use crate::module::Modules;
use crate::notify::{Notification, Sink, ValueUpdate};
use crate::value::{FunctionCall, MethodCall, TypeTag, Value};

/// A value the substrate computed for an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedValue {
    pub node: NodeId,
    pub value: Value,
    pub ty: Option<TypeTag>,
    /// The call the expression made, if it is a call.
    pub call: Option<FunctionCall>,
}

impl ComputedValue {
    /// A value typed with its builtin type.
    pub fn new(node: NodeId, value: Value) -> Self {
        let ty = Some(value.type_tag());
        Self { node, value, ty, call: None }
    }

    pub fn with_call(mut self, call: FunctionCall) -> Self {
        self.call = Some(call);
        self
    }
}

/// Watches one invocation on behalf of a frame.
///
/// The substrate reports the expressions of the invoked method only. Calls
/// it makes from there are reported as the `call` of the calling expression.
pub trait CallObserver {
    /// A value the invocation may use instead of evaluating the expression.
    fn cached(&mut self, node: NodeId) -> Option<Value>;

    /// Called for every expression the invocation evaluated.
    fn computed(&mut self, value: ComputedValue);
}

/// Executes calls of the program.
pub trait Substrate: Send + Sync {
    fn invoke(
        &self,
        call: &FunctionCall,
        observer: &mut dyn CallObserver,
    ) -> std::result::Result<Value, Raised>;
}

/// Serves nothing from a cache and ignores what is computed.
pub struct Unobserved;

impl CallObserver for Unobserved {
    fn cached(&mut self, _: NodeId) -> Option<Value> {
        None
    }

    fn computed(&mut self, _: ComputedValue) {}
}

/// How a run ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Outcome {
    /// Every frame was executed.
    Completed,
    /// The frame at `depth` is unreachable: the frame below did not make its
    /// call this time.
    Truncated { depth: usize },
    /// The frame at `depth` executes in a module that is not compiled.
    Skipped { depth: usize },
    /// User code panicked.
    Failed,
    Interrupted,
}

/// Runs execution contexts.
pub struct Engine<'a> {
    substrate: &'a dyn Substrate,
    modules: &'a Modules,
    sink: &'a dyn Sink,
    config: &'a Config,
}

impl<'a> Engine<'a> {
    pub fn new(
        substrate: &'a dyn Substrate,
        modules: &'a Modules,
        sink: &'a dyn Sink,
        config: &'a Config,
    ) -> Self {
        Self { substrate, modules, sink, config }
    }

    /// Execute the stack of a context from the root down.
    pub fn run(&self, ctx: &mut ExecutionContext) -> Result<Outcome> {
        let id = ctx.id();
        let (frames, visualizations) = ctx.split_mut();
        let Some(mut call) = frames.first().and_then(Frame::root_call) else {
            return Err(Error::EmptyStack(id));
        };

        let last = frames.len() - 1;
        let mut reached = 0;
        let outcome = loop {
            let depth = reached;
            let Some(snapshot) = self.modules.compiled(&call.method.module) else {
                debug!(context = %id, depth, module = %call.method.module, "module not compiled");
                break Outcome::Skipped { depth };
            };

            let descend = frames.get(depth + 1).and_then(Frame::expression_id);
            let frame = &mut frames[depth];
            frame.module = Some(call.method.module.clone());
            let weights_of = Some((snapshot.ir.name().clone(), snapshot.version));
            if frame.weights_of != weights_of {
                frame.cache.set_weights(snapshot.ir.weights());
                frame.weights_of = weights_of;
            }

            trace!(context = %id, depth, method = %call.method, "entering frame");
            let mut observer =
                FrameObserver::new(self, id, &snapshot.ir, frame, visualizations, descend);
            let invoked = catch_unwind(AssertUnwindSafe(|| {
                self.substrate.invoke(&call, &mut observer)
            }));
            let raised = match invoked {
                Ok(result) => result.err(),
                Err(payload) => Some(Raised::panic(panic_message(&*payload))),
            };
            match raised {
                None => {}
                Some(Raised::Panic { message, node }) => {
                    warn!(context = %id, depth, %message, "execution failed");
                    self.sink.emit(Notification::ExecutionFailed { context: id, message, node });
                    break Outcome::Failed;
                }
                Some(Raised::Interrupted) => {
                    debug!(context = %id, depth, "execution interrupted");
                    break Outcome::Interrupted;
                }
            }

            let (calls, executed) = observer.commit();
            reached = depth + 1;
            if reached > last {
                self.reconcile(id, &snapshot.ir, &frame.cache, &executed);
                break Outcome::Completed;
            }

            match descend.and_then(|node| calls.get(&node)) {
                Some(next) => call = next.clone(),
                None => {
                    debug!(
                        context = %id,
                        depth = reached,
                        expression = ?descend,
                        "frame not reachable",
                    );
                    break Outcome::Truncated { depth: reached };
                }
            }
        };

        ctx.set_reachable(reached);
        if let Some(capacity) = self.config.frame_cache_capacity {
            for frame in &mut ctx.stack_mut()[..reached] {
                let evicted = frame.cache.shrink(capacity);
                if evicted > 0 {
                    trace!(context = %id, evicted, "frame cache shrunk");
                }
            }
        }

        if matches!(outcome, Outcome::Completed | Outcome::Truncated { .. }) {
            self.sink.emit(Notification::ExecutionComplete { context: id });
        }
        info!(context = %id, ?outcome, frames = reached, "run finished");
        Ok(outcome)
    }

    /// Evaluate a visualization for a value and emit the encoded result.
    ///
    /// Failures of the evaluation, including panics of the substrate, are
    /// reported for this visualization only.
    pub fn visualize(&self, context: ContextId, visualization: &Visualization, value: Value) {
        let call = visualization.call(value);
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.substrate.invoke(&call, &mut Unobserved)
        }));

        let message = match result {
            Ok(Ok(result)) => match serde_json::to_vec(&result) {
                Ok(data) => {
                    trace!(
                        context = %context,
                        visualization = %visualization.id,
                        "visualization updated",
                    );
                    self.sink.emit(Notification::VisualizationUpdated {
                        context,
                        visualization: visualization.id,
                        node: visualization.expression_id,
                        data,
                    });
                    return;
                }
                Err(err) => format!("cannot encode visualization result: {err}"),
            },
            Ok(Err(Raised::Panic { message, .. })) => message,
            Ok(Err(Raised::Interrupted)) => return,
            Err(payload) => panic_message(&*payload),
        };

        warn!(
            context = %context,
            visualization = %visualization.id,
            %message,
            "visualization failed",
        );
        self.sink.emit(Notification::VisualizationFailed {
            context,
            visualization: visualization.id,
            message,
        });
    }

    /// Report the calls that kept their cached results during the run.
    fn reconcile(
        &self,
        context: ContextId,
        ir: &ModuleIr,
        cache: &RuntimeCache,
        executed: &MethodCallsCache,
    ) {
        for node in executed.not_executed(cache) {
            trace!(context = %context, %node, "reporting cached call");
            self.sink.emit(Notification::ValueUpdated {
                context,
                update: ValueUpdate {
                    node,
                    external_id: ir.external_id(node),
                    ty: cache.ty(node).cloned(),
                    call: cache.call(node).cloned(),
                    from_cache: true,
                },
            });
        }
    }
}

/// Serves and records values of one frame during one invocation.
///
/// Results are buffered and only written to the frame's cache once the
/// invocation returned normally.
struct FrameObserver<'e> {
    engine: &'e Engine<'e>,
    context: ContextId,
    ir: &'e ModuleIr,
    frame: &'e mut Frame,
    visualizations: &'e IndexMap<VisualizationId, Visualization>,
    /// The expression whose call the next frame enters. It is always
    /// evaluated so that the call is made.
    descend: Option<NodeId>,
    values: FxHashMap<NodeId, Value>,
    meta: FxHashMap<NodeId, (Option<TypeTag>, Option<MethodCall>)>,
    calls: FxHashMap<NodeId, FunctionCall>,
    executed: MethodCallsCache,
    visualized: FxHashSet<NodeId>,
}

impl<'e> FrameObserver<'e> {
    fn new(
        engine: &'e Engine<'e>,
        context: ContextId,
        ir: &'e ModuleIr,
        frame: &'e mut Frame,
        visualizations: &'e IndexMap<VisualizationId, Visualization>,
        descend: Option<NodeId>,
    ) -> Self {
        Self {
            engine,
            context,
            ir,
            frame,
            visualizations,
            descend,
            values: FxHashMap::default(),
            meta: FxHashMap::default(),
            calls: FxHashMap::default(),
            executed: MethodCallsCache::new(),
            visualized: FxHashSet::default(),
        }
    }

    fn fire(&self, node: NodeId, value: &Value) {
        for visualization in self.visualizations.values() {
            if visualization.expression_id == node {
                self.engine.visualize(self.context, visualization, value.clone());
            }
        }
    }

    /// Write the buffered results to the cache. Returns the calls made by
    /// node and which of them were executed.
    fn commit(self) -> (FxHashMap<NodeId, FunctionCall>, MethodCallsCache) {
        let Self { frame, mut values, meta, calls, executed, .. } = self;
        let cache = &mut frame.cache;
        for (node, (ty, call)) in meta {
            match values.remove(&node) {
                Some(value) => {
                    let weight = cache.weight(node);
                    cache.put(node, value, ty, call, weight);
                }
                None => {
                    cache.invalidate_indexes([&node], Indexes::VALUES);
                    cache.record(node, ty, call);
                }
            }
        }
        (calls, executed)
    }
}

impl CallObserver for FrameObserver<'_> {
    fn cached(&mut self, node: NodeId) -> Option<Value> {
        if self.descend == Some(node) {
            return None;
        }
        let value = self.values.get(&node).or_else(|| self.frame.cache.value(node))?.clone();
        if self.visualized.insert(node) {
            self.fire(node, &value);
        }
        Some(value)
    }

    fn computed(&mut self, computed: ComputedValue) {
        let ComputedValue { node, value, ty, call } = computed;
        let target = call.as_ref().map(FunctionCall::target);
        let (old_ty, old_call) = match self.meta.get(&node) {
            Some((ty, call)) => (ty.as_ref(), call.as_ref()),
            None => (self.frame.cache.ty(node), self.frame.cache.call(node)),
        };

        let innermost = self.descend.is_none();
        if innermost || old_ty != ty.as_ref() || old_call != target.as_ref() {
            trace!(context = %self.context, %node, "value updated");
            self.engine.sink.emit(Notification::ValueUpdated {
                context: self.context,
                update: ValueUpdate {
                    node,
                    external_id: self.ir.external_id(node),
                    ty: ty.clone(),
                    call: target.clone(),
                    from_cache: false,
                },
            });
        }

        if let Some(call) = call {
            self.executed.set_executed(node);
            self.calls.insert(node, call);
        }
        if self.frame.cache.weight(node) > 0 {
            self.values.insert(node, value.clone());
        } else {
            self.values.remove(&node);
        }
        self.meta.insert(node, (ty, target));
        self.visualized.insert(node);
        self.fire(node, &value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::context::StackItem;
    use crate::graph::DependencyGraph;
    use crate::ir::{Expr, Method, ModuleName};
    use crate::value::MethodPointer;

    fn pointer(name: &str) -> MethodPointer {
        MethodPointer::new("Main", "Main", name)
    }

    /// main = { a = x; b = y; a }
    fn modules() -> Modules {
        let body = Expr::block(
            2,
            vec![
                Expr::binding(3, Expr::name(4, "a"), Expr::apply(5, Expr::name(6, "x"), vec![])),
                Expr::binding(7, Expr::name(8, "b"), Expr::apply(9, Expr::name(10, "y"), vec![])),
            ],
            Expr::name(11, "a"),
        );
        let ir = ModuleIr::new(
            "Main".into(),
            vec![Method::new(1, "Main", "main", &[], body)],
            vec![],
        )
        .unwrap();
        let modules = Modules::new();
        modules
            .open("Main.src".into(), ModuleName::new("Main"), String::new())
            .lock()
            .install(Arc::new(ir), Arc::new(DependencyGraph::new()));
        modules
    }

    #[derive(Default)]
    struct Scripted {
        invoked: Mutex<Vec<MethodPointer>>,
        fail_main: bool,
        /// `y` returns text instead of an integer.
        retyped: bool,
    }

    impl Scripted {
        fn steps(&self, method: &MethodPointer) -> Vec<ComputedValue> {
            let call = |name| FunctionCall::new(pointer(name), vec![]);
            let y = if self.retyped { Value::Text("two".into()) } else { Value::Int(2) };
            match method.name.as_str() {
                "main" => vec![
                    ComputedValue::new(NodeId(5), Value::Int(1)).with_call(call("x")),
                    ComputedValue::new(NodeId(9), y).with_call(call("y")),
                    ComputedValue::new(NodeId(11), Value::Int(1)),
                ],
                "x" => vec![ComputedValue::new(NodeId(21), Value::Int(1))],
                _ => vec![],
            }
        }
    }

    impl Substrate for Scripted {
        fn invoke(
            &self,
            call: &FunctionCall,
            observer: &mut dyn CallObserver,
        ) -> std::result::Result<Value, Raised> {
            self.invoked.lock().push(call.method.clone());
            match call.method.name.as_str() {
                "show" => return Ok(call.args[0].clone()),
                "fail" => return Err(Raised::panic("cannot show")),
                "explode" => panic!("exploded"),
                _ => {}
            }
            let mut last = Value::Unit;
            for step in self.steps(&call.method) {
                last = match observer.cached(step.node) {
                    Some(value) => value,
                    None => {
                        if self.fail_main && step.node == NodeId(9) {
                            let message = "boom".into();
                            return Err(Raised::Panic { message, node: Some(step.node) });
                        }
                        observer.computed(step.clone());
                        step.value
                    }
                };
            }
            Ok(last)
        }
    }

    fn context(locals: &[u64]) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(ContextId(0));
        ctx.push(StackItem::explicit(pointer("main"))).unwrap();
        for &local in locals {
            ctx.push(StackItem::local(NodeId(local))).unwrap();
        }
        ctx
    }

    fn run(
        substrate: &Scripted,
        modules: &Modules,
        ctx: &mut ExecutionContext,
    ) -> (Outcome, Vec<Notification>) {
        let sink = Mutex::new(vec![]);
        let config = Config::default();
        let outcome = Engine::new(substrate, modules, &sink, &config).run(ctx).unwrap();
        (outcome, sink.into_inner())
    }

    fn computed_updates(notifications: &[Notification]) -> Vec<(NodeId, Option<TypeTag>)> {
        notifications
            .iter()
            .filter_map(|n| match n {
                Notification::ValueUpdated { update, .. } if !update.from_cache => {
                    Some((update.node, update.ty.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn cached_updates(notifications: &[Notification]) -> Vec<NodeId> {
        notifications
            .iter()
            .filter_map(|n| match n {
                Notification::ValueUpdated { update, .. } if update.from_cache => Some(update.node),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_descends_only_into_the_frames_call() {
        let (substrate, modules) = (Scripted::default(), modules());
        let mut ctx = context(&[5]);
        let (outcome, notifications) = run(&substrate, &modules, &mut ctx);
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(*substrate.invoked.lock(), vec![pointer("main"), pointer("x")]);
        assert_eq!(ctx.reachable(), 2);
        assert_eq!(ctx.stack()[1].module, Some(ModuleName::new("Main")));
        let complete = Notification::ExecutionComplete { context: ContextId(0) };
        assert_eq!(notifications.last(), Some(&complete));

        // The entered call is made again even though its value is cached.
        let (outcome, _) = run(&substrate, &modules, &mut ctx);
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(substrate.invoked.lock().len(), 4);
    }

    #[test]
    fn test_missing_call_truncates_the_stack() {
        let (substrate, modules) = (Scripted::default(), modules());
        let mut ctx = context(&[42, 5]);
        let (outcome, _) = run(&substrate, &modules, &mut ctx);
        assert_eq!(outcome, Outcome::Truncated { depth: 1 });
        assert_eq!(ctx.reachable(), 1);
        assert_eq!(substrate.invoked.lock().len(), 1);
    }

    #[test]
    fn test_only_weighted_values_are_cached() {
        let (substrate, modules) = (Scripted::default(), modules());
        let mut ctx = context(&[]);
        run(&substrate, &modules, &mut ctx);
        let cache = &ctx.stack()[0].cache;
        assert_eq!(cache.value(NodeId(5)), Some(&Value::Int(1)));
        assert_eq!(cache.value(NodeId(11)), Some(&Value::Int(1)));
        assert_eq!(cache.call(NodeId(9)).map(|c| c.method.name.as_str()), Some("y"));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_skipped_calls_are_reconciled_once() {
        let (substrate, modules) = (Scripted::default(), modules());
        let mut ctx = context(&[]);
        let (_, first) = run(&substrate, &modules, &mut ctx);
        assert!(cached_updates(&first).is_empty());

        let (_, second) = run(&substrate, &modules, &mut ctx);
        assert_eq!(cached_updates(&second), vec![NodeId(5), NodeId(9)]);

        ctx.stack_mut()[0].cache.invalidate(&[NodeId(5)]);
        let (_, third) = run(&substrate, &modules, &mut ctx);
        assert_eq!(cached_updates(&third), vec![NodeId(9)]);
    }

    #[test]
    fn test_outer_frames_report_only_changes() {
        let (substrate, modules) = (Scripted::default(), modules());
        let mut ctx = context(&[5]);
        let (_, first) = run(&substrate, &modules, &mut ctx);
        // Three new values in the root frame, one in the innermost.
        assert_eq!(computed_updates(&first).len(), 4);

        ctx.stack_mut()[0].cache.invalidate_all_indexes(Indexes::VALUES);
        let (_, second) = run(&substrate, &modules, &mut ctx);
        // The root frame recomputed its values, but types and calls stayed.
        assert_eq!(computed_updates(&second), vec![(NodeId(21), Some(TypeTag::new("Integer")))]);
    }

    #[test]
    fn test_outer_frames_report_changed_types() {
        let modules = modules();
        let mut ctx = context(&[5]);
        run(&Scripted::default(), &modules, &mut ctx);

        let retyped = Scripted { retyped: true, ..Scripted::default() };
        let (outcome, notifications) = run(&retyped, &modules, &mut ctx);
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(
            computed_updates(&notifications),
            vec![
                (NodeId(9), Some(TypeTag::new("Text"))),
                (NodeId(21), Some(TypeTag::new("Integer"))),
            ],
        );
        assert_eq!(ctx.stack()[0].cache.ty(NodeId(9)), Some(&TypeTag::new("Text")));
    }

    #[test]
    fn test_unwinding_substrate_fails_the_run() {
        let modules = modules();
        let mut ctx = ExecutionContext::new(ContextId(0));
        ctx.push(StackItem::explicit(pointer("explode"))).unwrap();
        let (outcome, notifications) = run(&Scripted::default(), &modules, &mut ctx);
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(
            notifications,
            vec![Notification::ExecutionFailed {
                context: ContextId(0),
                message: "exploded".into(),
                node: None,
            }],
        );
        assert_eq!(ctx.reachable(), 0);
    }

    #[test]
    fn test_panic_leaves_cache_untouched() {
        let modules = modules();
        let mut ctx = context(&[]);
        run(&Scripted::default(), &modules, &mut ctx);
        ctx.stack_mut()[0].cache.invalidate(&[NodeId(5), NodeId(9)]);

        let failing = Scripted { fail_main: true, ..Scripted::default() };
        let (outcome, notifications) = run(&failing, &modules, &mut ctx);
        assert_eq!(outcome, Outcome::Failed);
        assert!(notifications.contains(&Notification::ExecutionFailed {
            context: ContextId(0),
            message: "boom".into(),
            node: Some(NodeId(9)),
        }));
        let complete = |n: &Notification| matches!(n, Notification::ExecutionComplete { .. });
        assert!(!notifications.iter().any(complete));
        assert_eq!(ctx.stack()[0].cache.value(NodeId(5)), None);
        assert_eq!(ctx.stack()[0].cache.value(NodeId(11)), Some(&Value::Int(1)));
    }

    #[test]
    fn test_visualizations_fire_and_fail_in_isolation() {
        let (substrate, modules) = (Scripted::default(), modules());
        let mut ctx = context(&[]);
        for (id, name) in [(0, "show"), (1, "fail"), (2, "explode")] {
            ctx.attach(Visualization {
                id: VisualizationId(id),
                expression_id: NodeId(5),
                method: pointer(name),
                args: vec![],
            });
        }

        let (outcome, notifications) = run(&substrate, &modules, &mut ctx);
        assert_eq!(outcome, Outcome::Completed);
        assert!(notifications.contains(&Notification::VisualizationUpdated {
            context: ContextId(0),
            visualization: VisualizationId(0),
            node: NodeId(5),
            data: serde_json::to_vec(&Value::Int(1)).unwrap(),
        }));
        let failed: Vec<_> = notifications
            .iter()
            .filter_map(|n| match n {
                Notification::VisualizationFailed { visualization, message, .. } => {
                    Some((visualization.0, message.as_str()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![(1, "cannot show"), (2, "exploded")]);

        // Cache hits fire as well.
        let (_, second) = run(&substrate, &modules, &mut ctx);
        assert!(second.iter().any(|n| matches!(n, Notification::VisualizationUpdated { .. })));
    }

    #[test]
    fn test_uncompiled_module_is_skipped() {
        let substrate = Scripted::default();
        let mut ctx = context(&[]);
        let (outcome, notifications) = run(&substrate, &Modules::new(), &mut ctx);
        assert_eq!(outcome, Outcome::Skipped { depth: 0 });
        assert!(notifications.is_empty());
        assert!(substrate.invoked.lock().is_empty());
    }

    #[test]
    fn test_empty_stack_is_an_error() {
        let sink = Mutex::new(vec![]);
        let config = Config::default();
        let (substrate, modules) = (Scripted::default(), Modules::new());
        let engine = Engine::new(&substrate, &modules, &sink, &config);
        let mut ctx = ExecutionContext::new(ContextId(3));
        assert_eq!(engine.run(&mut ctx), Err(Error::EmptyStack(ContextId(3))));
    }
}
