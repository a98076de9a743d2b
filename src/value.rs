//! Runtime values and call descriptors exchanged with the execution substrate.

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use serde::Serialize;

use crate::ir::ModuleName;

/// A value produced by the execution substrate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<Value>),
    Atom { constructor: String, fields: Vec<Value> },
}

impl Value {
    /// The builtin type of the value.
    pub fn type_tag(&self) -> TypeTag {
        TypeTag::new(match self {
            Self::Unit => "Nothing",
            Self::Bool(_) => "Boolean",
            Self::Int(_) => "Integer",
            Self::Float(_) => "Float",
            Self::Text(_) => "Text",
            Self::Array(_) => "Vector",
            Self::Atom { constructor, .. } => constructor,
        })
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.into())
    }
}

/// The name of a value's type.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct TypeTag(Arc<str>);

impl TypeTag {
    pub fn new(name: &str) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for TypeTag {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl Display for TypeTag {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for TypeTag {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Points to a method definition.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct MethodPointer {
    pub module: ModuleName,
    pub defined_on: String,
    pub name: String,
}

impl MethodPointer {
    pub fn new(module: &str, defined_on: &str, name: &str) -> Self {
        Self {
            module: ModuleName::new(module),
            defined_on: defined_on.into(),
            name: name.into(),
        }
    }
}

impl Display for MethodPointer {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}::{}.{}", self.module, self.defined_on, self.name)
    }
}

/// What an expression called: the call-target descriptor stored in caches.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct MethodCall {
    pub method: MethodPointer,
    /// Positions of arguments that were not applied.
    pub not_applied: Vec<usize>,
}

/// A call that was made during a run and can be re-entered.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub method: MethodPointer,
    pub args: Vec<Value>,
    pub not_applied: Vec<usize>,
}

impl FunctionCall {
    pub fn new(method: MethodPointer, args: Vec<Value>) -> Self {
        Self { method, args, not_applied: vec![] }
    }

    /// The call-target descriptor of this call.
    pub fn target(&self) -> MethodCall {
        MethodCall {
            method: self.method.clone(),
            not_applied: self.not_applied.clone(),
        }
    }
}
