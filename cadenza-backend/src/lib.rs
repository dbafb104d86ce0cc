//! Code generation backends for the cadenza compiler core. The
//! [Backend] trait is the only seam backend implementations see; all
//! upstream passes produce backend agnostic IR.

#[macro_use]
extern crate serde_derive;

pub mod abi;
pub mod callgraph;
pub mod emit;
pub mod module;
pub mod server;
pub mod ssa;

use enumflags2::bitflags;
use std::fmt::Debug;

/// driver build flags
#[derive(Debug, Clone, Copy)]
#[bitflags]
#[repr(u64)]
pub enum BuildFlag {
    StrictFloatingPoint,
    /// do not emit the ungated `Evaluate` entry point
    OmitEvaluate,
    /// do not emit per driver `Tick` entry points
    OmitReactiveDrivers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptLevel {
    O0,
    O1,
    O2,
    O3,
}

impl OptLevel {
    pub fn from_level(l: u8) -> OptLevel {
        match l {
            0 => OptLevel::O0,
            1 => OptLevel::O1,
            2 => OptLevel::O2,
            _ => OptLevel::O3,
        }
    }
}

/// environment derived configuration with compiled in defaults
#[derive(Debug, Clone)]
pub struct CoreLibrary {
    pub repository: String,
    pub version: String,
}

pub const DEFAULT_LIBRARY_REPOSITORY: &str = "https://github.com/cadenza-dsp/core-library";
pub const DEFAULT_LIBRARY_VERSION: &str = "0.5";

impl CoreLibrary {
    pub fn from_env() -> CoreLibrary {
        CoreLibrary {
            repository: std::env::var("CADENZA_LIBRARY_REPOSITORY")
                .unwrap_or_else(|_| DEFAULT_LIBRARY_REPOSITORY.to_string()),
            version: std::env::var("CADENZA_LIBRARY_VERSION")
                .unwrap_or_else(|_| DEFAULT_LIBRARY_VERSION.to_string()),
        }
    }
}

/// binary operations a backend must provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// The capabilities a code generation target provides. The generic
/// emitter is parametric in this trait and is the only component that
/// sees backend tokens.
pub trait Backend {
    type Ty: Clone + PartialEq + Debug;
    type Val: Clone + Debug;
    type Func: Clone + Debug;

    fn int_ty(&mut self, bits: u8) -> Self::Ty;
    fn float_ty(&mut self, bits: u8) -> Self::Ty;
    fn ptr_ty(&mut self) -> Self::Ty;
    fn vector_ty(&mut self, elem: Self::Ty, width: u16) -> Self::Ty;
    fn void_ty(&mut self) -> Self::Ty;

    fn declare_function(
        &mut self,
        name: &str,
        params: &[Self::Ty],
        ret: Self::Ty,
    ) -> Self::Func;
    /// open the body of a declared function; emission happens between
    /// begin and end
    fn begin_function(&mut self, f: &Self::Func);
    fn end_function(&mut self, ret: Option<Self::Val>);
    fn fn_arg(&mut self, index: usize) -> Self::Val;

    fn const_int(&mut self, ty: &Self::Ty, v: i64) -> Self::Val;
    fn const_float(&mut self, ty: &Self::Ty, v: f64) -> Self::Val;
    /// intern an immutable data blob, keyed so identical sources share
    /// storage
    fn intern_blob(&mut self, key: u64, data: &[u8]) -> Self::Val;
    /// named mutable global; returns its address
    fn global(&mut self, name: &str, size: usize) -> Self::Val;
    /// bind a named global constant (the sizing pass writes these)
    fn set_global_const(&mut self, name: &str, v: i64);
    fn global_const(&mut self, name: &str) -> Option<i64>;
    /// external symbol import
    fn external(&mut self, name: &str) -> Self::Val;

    fn binop(&mut self, op: BinOp, ty: &Self::Ty, l: Self::Val, r: Self::Val)
        -> Self::Val;
    fn select(&mut self, c: Self::Val, t: Self::Val, e: Self::Val) -> Self::Val;
    fn bitcast(&mut self, to: &Self::Ty, v: Self::Val) -> Self::Val;
    fn convert(&mut self, to: &Self::Ty, v: Self::Val) -> Self::Val;
    fn undef(&mut self, ty: &Self::Ty) -> Self::Val;

    fn alloca(&mut self, size: usize, align: usize, zeroed: bool) -> Self::Val;
    fn load(&mut self, ty: &Self::Ty, ptr: Self::Val) -> Self::Val;
    fn store(&mut self, v: Self::Val, ptr: Self::Val);
    fn memcpy(&mut self, dst: Self::Val, src: Self::Val, bytes: usize);
    fn memset(&mut self, dst: Self::Val, byte: u8, bytes: usize);
    /// pointer displacement in bytes
    fn gep(&mut self, ptr: Self::Val, offset: Self::Val) -> Self::Val;
    fn stack_save(&mut self) -> Self::Val;
    fn stack_restore(&mut self, v: Self::Val);

    /// structured conditional; the else arm is optional but must be
    /// opened before `end_if` when used
    fn begin_if(&mut self, cond: Self::Val);
    fn begin_else(&mut self);
    fn end_if(&mut self);
    /// a counted loop with a break label; returns the induction value
    fn begin_loop(&mut self, count: Self::Val) -> Self::Val;
    fn end_loop(&mut self);
    /// structured switch over a selector in `0..cases`
    fn begin_switch(&mut self, sel: Self::Val);
    fn begin_case(&mut self, i: usize);
    fn end_case(&mut self);
    fn end_switch(&mut self);
    /// hint that the following call is a tail call and may become a
    /// loop back branch
    fn tail_call_hint(&mut self);
    fn call(
        &mut self,
        f: &Self::Func,
        args: &[Self::Val],
        ret: Option<&Self::Ty>,
    ) -> Option<Self::Val>;
    fn external_call(
        &mut self,
        name: &str,
        args: &[Self::Val],
        ret: Option<&Self::Ty>,
    ) -> Option<Self::Val>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opt_levels_clamp() {
        assert_eq!(OptLevel::from_level(0), OptLevel::O0);
        assert_eq!(OptLevel::from_level(2), OptLevel::O2);
        assert_eq!(OptLevel::from_level(9), OptLevel::O3);
    }

    #[test]
    fn library_defaults_compile_in() {
        // no env override in the test environment
        let lib = CoreLibrary::from_env();
        assert!(!lib.repository.is_empty());
        assert!(!lib.version.is_empty());
    }
}
