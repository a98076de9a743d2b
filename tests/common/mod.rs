#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use retrace::{
    CallObserver, Collaborators, Compiled, Compiler, ComputedValue, Config, ContextId, Diagnostic,
    Expr, FunctionCall, IndexUpdate, Method, MethodPointer, ModuleIr, ModuleName, NodeId,
    Notification, Raised, Runtime, Sink, StackItem, Substrate, Symbol, SymbolIndex, Value,
};

pub const MAIN: &str = "Main.src";
pub const LIB: &str = "Lib.src";

/// `main = { a = 1; c = 7; b = inc a; b }` with `1` replaced by `a`.
pub fn main_source(a: i64) -> String {
    format!("main = {{ a = {a}; c = 7; b = inc a; b }}")
}

/// The IR of [`main_source`] for a single digit `a`.
pub fn main_ir(a: i64) -> ModuleIr {
    let body = Expr::block(
        2,
        vec![
            Expr::binding(
                3,
                Expr::name(4, "a").with_span(9..10),
                Expr::literal(5, Value::Int(a)).with_span(13..14),
            )
            .with_span(9..14),
            Expr::binding(
                12,
                Expr::name(13, "c").with_span(16..17),
                Expr::literal(14, Value::Int(7)).with_span(20..21),
            )
            .with_span(16..21),
            Expr::binding(
                6,
                Expr::name(7, "b").with_span(23..24),
                Expr::apply(
                    8,
                    Expr::name(9, "inc").with_span(27..30),
                    vec![Expr::name(10, "a").with_span(31..32)],
                )
                .with_span(27..32),
            )
            .with_span(23..32),
        ],
        Expr::name(11, "b").with_span(34..35),
    )
    .with_span(7..37);
    let main = Method::new(1, "Main", "main", &[], body).with_span(0..37).with_external_id(1001);
    ModuleIr::new("Main".into(), vec![main], vec![Symbol::new("main")]).unwrap()
}

/// `inc x = add x 1` with `1` replaced by `n`.
pub fn lib_source(n: i64) -> String {
    format!("inc x = add x {n}")
}

pub fn lib_ir(n: i64) -> ModuleIr {
    let body = Expr::apply(
        51,
        Expr::name(52, "add").with_span(8..11),
        vec![
            Expr::name(53, "x").with_span(12..13),
            Expr::literal(54, Value::Int(n)).with_span(14..15),
        ],
    )
    .with_span(8..15);
    let inc = Method::new(50, "Lib", "inc", &["x"], body).with_span(0..15).with_external_id(1050);
    ModuleIr::new("Lib".into(), vec![inc], vec![Symbol::new("inc")]).unwrap()
}

pub fn method(module: &str, name: &str) -> MethodPointer {
    MethodPointer::new(module, module, name)
}

/// Maps known sources to IR. Every other source fails to compile.
#[derive(Clone, Default)]
pub struct TestCompiler {
    programs: Arc<Mutex<HashMap<String, ModuleIr>>>,
    compiled: Arc<Mutex<Vec<String>>>,
    gate: Arc<Mutex<()>>,
}

impl TestCompiler {
    pub fn define(&self, source: impl Into<String>, ir: ModuleIr) {
        self.programs.lock().insert(source.into(), ir);
    }

    /// The names of the modules compiled so far, in order.
    pub fn compiled(&self) -> Vec<String> {
        self.compiled.lock().clone()
    }

    /// Compilations that start while the guard is alive wait for it.
    pub fn hold(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }
}

impl Compiler for TestCompiler {
    fn compile(&self, module: &ModuleName, source: &str) -> Result<Compiled, Vec<Diagnostic>> {
        self.compiled.lock().push(module.to_string());
        drop(self.gate.lock());
        match self.programs.lock().get(source) {
            Some(ir) => Ok(Compiled { ir: ir.clone(), diagnostics: vec![] }),
            None => Err(vec![Diagnostic::error(format!("cannot parse `{source}`"))]),
        }
    }
}

/// What a scripted method does for one expression.
#[derive(Debug, Clone)]
pub enum Step {
    Value(u64, Value),
    Call(u64, MethodPointer, Value),
    /// Raise a panic of user code.
    Panic(u64, &'static str),
    /// Unwind out of the substrate.
    Crash(u64, &'static str),
}

/// Executes methods by replaying scripted steps. Steps whose node has a cached
/// value are skipped.
#[derive(Clone, Default)]
pub struct Script {
    methods: Arc<Mutex<HashMap<String, Vec<Step>>>>,
    invoked: Arc<Mutex<Vec<String>>>,
    computed: Arc<Mutex<Vec<u64>>>,
}

impl Script {
    pub fn define(&self, method: &str, steps: Vec<Step>) {
        self.methods.lock().insert(method.into(), steps);
    }

    /// The names of the invoked methods, in order.
    pub fn invoked(&self) -> Vec<String> {
        self.invoked.lock().clone()
    }

    /// Take the nodes that were computed instead of served from a cache.
    pub fn take_computed(&self) -> Vec<u64> {
        std::mem::take(&mut *self.computed.lock())
    }
}

impl Substrate for Script {
    fn invoke(
        &self,
        call: &FunctionCall,
        observer: &mut dyn CallObserver,
    ) -> Result<Value, Raised> {
        let name = call.method.name.clone();
        self.invoked.lock().push(name.clone());
        match name.as_str() {
            "show" => return Ok(call.args[0].clone()),
            "fail" => return Err(Raised::panic("visualization failed")),
            _ => {}
        }

        let steps = self.methods.lock().get(&name).cloned();
        let Some(steps) = steps else {
            return Err(Raised::panic(format!("no method {}", call.method)));
        };

        let mut last = Value::Unit;
        for step in steps {
            let node = match &step {
                Step::Value(node, _)
                | Step::Call(node, ..)
                | Step::Panic(node, _)
                | Step::Crash(node, _) => NodeId(*node),
            };
            if let Some(value) = observer.cached(node) {
                last = value;
                continue;
            }
            self.computed.lock().push(node.0);
            let computed = match step {
                Step::Value(_, value) => ComputedValue::new(node, value),
                Step::Call(_, method, value) => {
                    ComputedValue::new(node, value).with_call(FunctionCall::new(method, vec![]))
                }
                Step::Panic(_, message) => {
                    return Err(Raised::Panic { message: message.into(), node: Some(node) });
                }
                Step::Crash(_, message) => panic!("{message}"),
            };
            last = computed.value.clone();
            observer.computed(computed);
        }
        Ok(last)
    }
}

/// Records notifications.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Notification>>>);

impl Recorder {
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Sink for Recorder {
    fn emit(&self, notification: Notification) {
        self.0.lock().push(notification);
    }
}

/// Records index updates.
#[derive(Clone, Default)]
pub struct Index(Arc<Mutex<Vec<IndexUpdate>>>);

impl Index {
    pub fn take(&self) -> Vec<IndexUpdate> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl SymbolIndex for Index {
    fn apply(&self, update: &IndexUpdate) {
        self.0.lock().push(update.clone());
    }
}

/// A runtime over the two test modules.
pub struct Harness {
    pub runtime: Runtime,
    pub compiler: TestCompiler,
    pub script: Script,
    pub sink: Recorder,
    pub index: Index,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default().with_workers(2))
    }

    pub fn with_config(config: Config) -> Self {
        let (compiler, script, sink, index) =
            (TestCompiler::default(), Script::default(), Recorder::default(), Index::default());
        compiler.define(main_source(1), main_ir(1));
        compiler.define(lib_source(1), lib_ir(1));
        script.define("main", main_steps(1));
        script.define("inc", vec![Step::Value(51, Value::Int(2))]);

        let collaborators = Collaborators::new(compiler.clone(), script.clone(), sink.clone())
            .with_index(index.clone());
        let runtime = Runtime::new(config, collaborators);
        runtime.open_file(MAIN, "Main", &main_source(1));
        runtime.open_file(LIB, "Lib", &lib_source(1));
        Self { runtime, compiler, script, sink, index }
    }

    /// Compile both modules.
    pub fn compile(&self) {
        for path in [LIB, MAIN] {
            self.runtime.edit_file(Path::new(path), vec![]).unwrap();
        }
        self.runtime.wait_idle();
    }

    /// A context running `Main.main`, after its first run.
    pub fn context(&self) -> ContextId {
        let id = self.runtime.create_context();
        self.runtime.push_frame(id, StackItem::explicit(method("Main", "main"))).unwrap();
        self.runtime.wait_idle();
        id
    }

    pub fn take(&self) -> Vec<Notification> {
        self.runtime.wait_idle();
        self.sink.take()
    }
}

pub fn path(path: &str) -> PathBuf {
    PathBuf::from(path)
}

/// The steps of `main` for a given `a`.
pub fn main_steps(a: i64) -> Vec<Step> {
    vec![
        Step::Value(5, Value::Int(a)),
        Step::Value(14, Value::Int(7)),
        Step::Call(8, method("Lib", "inc"), Value::Int(a + 1)),
        Step::Value(11, Value::Int(a + 1)),
    ]
}

/// The nodes of freshly computed value updates of a context.
pub fn computed(notifications: &[Notification], context: ContextId) -> Vec<u64> {
    notifications
        .iter()
        .filter_map(|n| match n {
            Notification::ValueUpdated { context: c, update }
                if *c == context && !update.from_cache =>
            {
                Some(update.node.0)
            }
            _ => None,
        })
        .collect()
}

/// The nodes of value updates reconciled from the cache.
pub fn from_cache(notifications: &[Notification], context: ContextId) -> Vec<u64> {
    notifications
        .iter()
        .filter_map(|n| match n {
            Notification::ValueUpdated { context: c, update }
                if *c == context && update.from_cache =>
            {
                Some(update.node.0)
            }
            _ => None,
        })
        .collect()
}

pub fn completed(notifications: &[Notification], context: ContextId) -> bool {
    notifications.contains(&Notification::ExecutionComplete { context })
}
