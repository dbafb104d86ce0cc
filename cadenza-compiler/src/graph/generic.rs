//! Untyped node kinds. Every kind declares how it specializes against
//! the current argument type; the implementations live in the
//! specialization transform.

use crate::{rx::DriverSignature, typ::{Tag, Type}};
use arcstr::ArcStr;
use fxhash::FxHasher64;
use std::hash::{Hash, Hasher};

/// Polymorphic arithmetic and comparison. A math node partially
/// evaluates on invariant arguments, lifts onto rule generators during
/// speculation, and lowers to a native binary op otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Equal,
    Greater,
    Less,
}

impl MathOp {
    pub fn is_comparison(&self) -> bool {
        matches!(self, MathOp::Equal | MathOp::Greater | MathOp::Less)
    }

    pub fn name(&self) -> &'static str {
        match self {
            MathOp::Add => "add",
            MathOp::Sub => "sub",
            MathOp::Mul => "mul",
            MathOp::Div => "div",
            MathOp::Mod => "mod",
            MathOp::Equal => "eq",
            MathOp::Greater => "gt",
            MathOp::Less => "lt",
        }
    }
}

/// how a ring buffer order argument is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeBase {
    Samples,
    Seconds,
}

/// which runtime slot class an external input binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variety {
    Argument,
    Stream,
    Configuration,
    External,
    UnsafeExternal,
    Internal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenericOp {
    /// the lambda argument of the expression under specialization
    Argument,
    /// compile time constant embedded in the graph
    Constant(Type),
    Pair,
    First,
    Rest,
    /// drop a number of leading elements; upstreams are
    /// `[source, count]`
    Skip,
    /// build a chain of repeated elements; upstreams are
    /// `[element, count, trailing]`
    Repeat,
    Math(MathOp),
    /// universal call site; upstreams are `[function, argument]`
    Evaluate { label: ArcStr },
    /// wrap the upstream in a nominal user type
    MakeUser(Tag),
    /// project the content out of a nominal user type
    UnwrapUser(Tag),
    /// compile time case analysis over a union argument; upstreams are
    /// `[function, argument]`
    Dispatch { label: ArcStr },
    /// stateful delay line; upstreams are `[initializer, order, signal]`
    /// where the signal edge may close a cycle
    RingBuffer { time_base: TimeBase },
    /// external input leaf carrying its clock
    Input { key: ArcStr, ty: Type, variety: Variety, driver: DriverSignature },
    /// raise a user exception carrying the upstream type
    Raise,
    /// upstreams are `[body, handler]`; a raised exception in the body
    /// re-specializes the handler with the exception payload
    Handle,
}

impl GenericOp {
    /// pure nodes may be hash consed; stateful ones keep their identity
    pub fn pure(&self) -> bool {
        !matches!(self, GenericOp::RingBuffer { .. } | GenericOp::Input { .. })
    }

    pub fn local_hash(&self) -> u64 {
        let mut h = FxHasher64::default();
        std::mem::discriminant(self).hash(&mut h);
        match self {
            GenericOp::Argument
            | GenericOp::Pair
            | GenericOp::First
            | GenericOp::Rest
            | GenericOp::Skip
            | GenericOp::Repeat
            | GenericOp::Raise
            | GenericOp::Handle => (),
            GenericOp::Constant(t) => t.type_hash().hash(&mut h),
            GenericOp::Math(op) => op.hash(&mut h),
            GenericOp::Evaluate { label } | GenericOp::Dispatch { label } => {
                label.hash(&mut h)
            }
            GenericOp::MakeUser(t) | GenericOp::UnwrapUser(t) => t.hash(&mut h),
            GenericOp::RingBuffer { time_base } => time_base.hash(&mut h),
            GenericOp::Input { key, ty, variety, driver: _ } => {
                key.hash(&mut h);
                ty.type_hash().hash(&mut h);
                variety.hash(&mut h);
            }
        }
        h.finish()
    }
}
