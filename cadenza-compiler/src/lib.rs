//! Cadenza compiler core: the layered transformation from a generic
//! expression graph through type specialization, reactive clock
//! analysis and side effect lowering to a typed, scheduled IR a
//! backend consumes.

#[macro_use]
extern crate serde_derive;

pub mod diag;
pub mod graph;
pub mod module;
pub mod repo;
pub mod rules;
pub mod rx;
pub mod sfx;
pub mod spec;
pub mod typ;

use crate::{
    graph::{GenericGraph, GenericId, TypedGraph, TypedId},
    module::BuildModule,
    rx::RxOutput,
    spec::{Failure, JobCtx},
    typ::Type,
};
use anyhow::{bail, Result};
use log::info;
use std::fmt;

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Specialization => write!(f, "no form matched the argument"),
            Failure::Propagate => write!(f, "propagated specialization failure"),
            Failure::NoEvalFallback => write!(f, "form search abandoned"),
            Failure::Fatal(msg) => write!(f, "{msg}"),
            Failure::RecursionTrap(_) => write!(f, "unconsumed recursion trap"),
            Failure::Monitored { key, inner } => write!(f, "{inner} (monitored {key})"),
            Failure::User(t) => write!(f, "user exception {t}"),
        }
    }
}

impl std::error::Error for Failure {}

/// Everything the backend needs: the lowered typed graph with its
/// evaluation root and reactivity annotations, the module symbol and
/// slot tables, and the generic arena holding solved sequence
/// formulas.
pub struct CompileOutput {
    pub typed: TypedGraph,
    pub root: TypedId,
    pub result_type: Type,
    pub rx: RxOutput,
    pub module: BuildModule,
    pub formulas: GenericGraph,
}

/// Run the core pipeline over the program rooted at `root` in the
/// context's generic arena: specialization, reactive analysis, side
/// effect lowering and copy elision.
pub fn compile(
    mut ctx: JobCtx,
    root: GenericId,
    argument: Type,
) -> Result<CompileOutput> {
    let mut typed = TypedGraph::new();
    let spec = match spec::specialize(&mut ctx, &mut typed, root, argument.clone()) {
        Ok(s) => s,
        Err(e) => bail!("specialization failed: {e}"),
    };
    info!("specialized to {} ({} nodes)", spec.ty, typed.len());
    let mut rxout = rx::analyze(&mut typed, spec.node)?;
    info!("reactive analysis found {} drivers", rxout.drivers.len());
    let mut module = BuildModule::new(argument, spec.ty.clone());
    let lowered = sfx::lower(&mut typed, &mut rxout.rx, &mut module, spec.node)?;
    let root = sfx::elide_copies(&mut typed, lowered.root);
    info!(
        "lowered: {} state slots, {} symbols",
        module.slot_count(),
        module.symbol_count()
    );
    let JobCtx { graphs, .. } = ctx;
    Ok(CompileOutput {
        typed,
        root,
        result_type: spec.ty,
        rx: rxout,
        module,
        formulas: graphs,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::{typed::TypedOp, GenericOp};
    use crate::repo::function_value;
    use smallvec::smallvec;

    #[test]
    fn scalar_identity_end_to_end() {
        // λx. x applied to Float32: the body is the argument itself,
        // no call wrapper, no state
        let mut ctx = JobCtx::without_symbols();
        let body = ctx.graphs.add(GenericOp::Argument, smallvec![]);
        let fv = function_value(&arcstr::literal!("id"), &[], &[body]);
        let fconst = ctx.graphs.add(GenericOp::Constant(fv), smallvec![]);
        let arg = ctx.graphs.add(GenericOp::Argument, smallvec![]);
        let call = ctx.graphs.add(
            GenericOp::Evaluate { label: arcstr::literal!("id") },
            smallvec![fconst, arg],
        );
        let out = compile(ctx, call, Type::Float32).unwrap();
        assert_eq!(out.result_type, Type::Float32);
        assert!(matches!(out.typed.op(out.root), TypedOp::Argument));
        assert_eq!(out.module.slot_count(), 0);
        let calls = out
            .typed
            .postorder(out.root)
            .into_iter()
            .filter(|id| matches!(out.typed.op(*id), TypedOp::FunctionCall { .. }))
            .count();
        assert_eq!(calls, 0);
    }

    #[test]
    fn invariant_arithmetic_emits_no_runtime_code() {
        // λx. x + 2 at Invariant(3) is Invariant(5), a pure compile
        // time result
        let mut ctx = JobCtx::without_symbols();
        let x = ctx.graphs.add(GenericOp::Argument, smallvec![]);
        let two = ctx
            .graphs
            .add(GenericOp::Constant(Type::invariant_i64(2)), smallvec![]);
        let body = ctx
            .graphs
            .add(GenericOp::Math(crate::graph::MathOp::Add), smallvec![x, two]);
        let fv = function_value(&arcstr::literal!("add2"), &[], &[body]);
        let fconst = ctx.graphs.add(GenericOp::Constant(fv), smallvec![]);
        let arg = ctx.graphs.add(GenericOp::Argument, smallvec![]);
        let call = ctx.graphs.add(
            GenericOp::Evaluate { label: arcstr::literal!("add2") },
            smallvec![fconst, arg],
        );
        let out = compile(ctx, call, Type::invariant_i64(3)).unwrap();
        assert_eq!(out.result_type, Type::invariant_i64(5));
        match out.typed.op(out.root) {
            TypedOp::Constant { data } => assert!(data.is_empty()),
            op => panic!("expected constant, got {op:?}"),
        }
    }
}
