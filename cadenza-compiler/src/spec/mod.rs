//! The specialization transform: monomorphizes a generic graph against
//! a concrete argument type, partially evaluating invariant
//! computation along the way. Failures are values threaded through
//! [SpecResult]; the taxonomy decides how the evaluate form search
//! reacts.

use crate::{
    diag::DiagnosticSink,
    graph::{
        generic::{MathOp, TimeBase},
        typed::{encode_scalar, TypedOp},
        GenericGraph, GenericId, GenericOp, TypedGraph, TypedId,
    },
    repo::{NoSymbols, SymbolSource},
    typ::{self, Fixing, NativeTy, Scalar, Type},
};
use arcstr::ArcStr;
use fxhash::FxHashMap;
use smallvec::smallvec;
use std::cmp::Ordering;

mod evaluate;

pub use evaluate::INLINE_THRESHOLD;

/// grow the stack when less than this much remains
const RED_ZONE: usize = 64 * 1024;
/// allocation size of each new stack segment
const STACK_SEGMENT: usize = 1024 * 1024;
/// hard bound on specialization nesting
const MAX_FRAMES: usize = 10_000;

/// Run `f` with stack headroom guaranteed; the specializer may nest
/// arbitrarily deep for user programs, so every recursion step passes
/// through here instead of trusting the host stack.
pub fn with_new_stack<R, F: FnOnce() -> R>(f: F) -> R {
    stacker::maybe_grow(RED_ZONE, STACK_SEGMENT, f)
}

/// specialization failure taxonomy; see the form search in `evaluate`
#[derive(Debug, Clone)]
pub enum Failure {
    /// the form did not match; the next form may still fire
    Specialization,
    /// any failure propagates, no fallback
    Propagate,
    /// abandon all forms but report a plain mismatch to the parent
    NoEvalFallback,
    /// unrecoverable: malformed input, undefined symbol, nesting bound
    Fatal(ArcStr),
    /// speculative recursion trap consumed by the solver
    RecursionTrap(Box<Trap>),
    /// wraps a downstream failure for callback reporting
    Monitored { key: Type, inner: Box<Failure> },
    /// raised by user code, catchable by `Handle`
    User(Type),
}

impl Failure {
    pub fn fatal(msg: &str) -> Failure {
        Failure::Fatal(ArcStr::from(msg))
    }
}

/// explicit payload of a recursion trap; the saved memo table is the
/// only cache handed back to the partial respecialization
#[derive(Debug, Clone)]
pub struct Trap {
    pub recur_point: GenericId,
    pub form: GenericId,
    pub recursive_arg: Type,
    pub eval_point: Spec,
    pub saved: Memo,
}

/// a successful specialization: a typed node and its result type
#[derive(Debug, Clone)]
pub struct Spec {
    pub node: TypedId,
    pub ty: Type,
}

pub type SpecResult = Result<Spec, Failure>;
pub type Memo = FxHashMap<GenericId, SpecResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Normal,
    /// compile time configuration evaluation; stateful constructs are
    /// forbidden
    Configuration,
}

/// evaluate level cache key: form graph hash and argument type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub graph: u64,
    pub argument: Type,
}

#[derive(Debug, Clone)]
pub struct CachedForm {
    pub body: TypedId,
    pub result: Type,
    pub should_inline: bool,
    pub used_fallback: bool,
}

/// Per job compiler context: the generic expression arena, the
/// evaluate cache with its backing arena, the diagnostic sink and the
/// symbol source. All of it is local to the thread running the job.
pub struct JobCtx<'s> {
    /// the generic arena; programs, solved formulas and generator
    /// rewrites all live here
    pub graphs: GenericGraph,
    pub cache: FxHashMap<CacheKey, CachedForm>,
    /// cached bodies live here and are identity copied out on a hit
    pub cache_graph: TypedGraph,
    pub diag: DiagnosticSink,
    pub symbols: &'s dyn SymbolSource,
    uid: u64,
}

impl<'s> JobCtx<'s> {
    pub fn new(symbols: &'s dyn SymbolSource) -> Self {
        JobCtx {
            graphs: GenericGraph::new(),
            cache: FxHashMap::default(),
            cache_graph: TypedGraph::new(),
            diag: DiagnosticSink::disabled(),
            symbols,
            uid: 0,
        }
    }

    pub fn without_symbols() -> JobCtx<'static> {
        JobCtx::new(&NoSymbols)
    }

    pub fn next_uid(&mut self) -> u64 {
        self.uid += 1;
        self.uid
    }
}

/// recursion point interception installed by the evaluator
#[derive(Debug, Clone)]
pub enum RecurHook {
    /// speculative pass: trap when a listed call site is reached with
    /// a solvable argument evolution
    Trap { points: Vec<GenericId>, form: GenericId, outer_arg: Type },
    /// partial respecialization: the trapped call site resolves to an
    /// already specialized upstream
    Substitute { point: GenericId, with: Spec },
}

pub struct SpecializationTransform<'a, 's> {
    pub ctx: &'a mut JobCtx<'s>,
    pub out: &'a mut TypedGraph,
    pub arg: Type,
    pub mode: Mode,
    pub memo: Memo,
    pub recur: Option<RecurHook>,
    depth: usize,
}

impl<'a, 's> SpecializationTransform<'a, 's> {
    pub fn new(
        ctx: &'a mut JobCtx<'s>,
        out: &'a mut TypedGraph,
        arg: Type,
        mode: Mode,
    ) -> Self {
        SpecializationTransform {
            ctx,
            out,
            arg,
            mode,
            memo: Memo::default(),
            recur: None,
            depth: 0,
        }
    }

    pub fn go(&mut self, root: GenericId) -> SpecResult {
        self.spec(root)
    }

    pub(crate) fn gop(&self, id: GenericId) -> GenericOp {
        self.ctx.graphs.op(id).clone()
    }

    pub(crate) fn gup(&self, id: GenericId, i: usize) -> GenericId {
        self.ctx.graphs.up(id, i)
    }

    pub(crate) fn spec(&mut self, id: GenericId) -> SpecResult {
        if self.depth >= MAX_FRAMES {
            return Err(Failure::fatal("specialization nesting too deep"));
        }
        self.depth += 1;
        let r = with_new_stack(|| self.operate_memo(id));
        self.depth -= 1;
        r
    }

    fn operate_memo(&mut self, id: GenericId) -> SpecResult {
        if let Some(r) = self.memo.get(&id) {
            return r.clone();
        }
        if let Some(RecurHook::Substitute { point, with }) = &self.recur {
            if *point == id {
                return Ok(with.clone());
            }
        }
        let r = self.operate(id);
        if self.ctx.graphs.node(id).refs() > 1 || !self.ctx.graphs.op(id).pure() {
            self.memo.insert(id, r.clone());
        }
        r
    }

    /// a typed node for a value of `ty`; zero sized fixed results
    /// collapse to constants
    pub(crate) fn value(
        &mut self,
        ty: Type,
        mk: impl FnOnce(&mut TypedGraph, &Type) -> TypedId,
    ) -> Spec {
        let node = if ty.is_fixed() && ty.size() == 0 {
            self.out.add(TypedOp::constant(ty.clone()), smallvec![], ty.clone())
        } else {
            mk(self.out, &ty)
        };
        Spec { node, ty }
    }

    pub(crate) fn constant(&mut self, ty: Type) -> Spec {
        let node =
            self.out.add(TypedOp::constant(ty.clone()), smallvec![], ty.clone());
        Spec { node, ty }
    }

    fn operate(&mut self, id: GenericId) -> SpecResult {
        use GenericOp as G;
        match self.gop(id) {
            G::Argument => {
                let ty = self.arg.clone();
                Ok(self.value(ty, |g, ty| {
                    g.add(TypedOp::Argument, smallvec![], ty.clone())
                }))
            }
            G::Constant(t) => Ok(self.constant(t)),
            G::Pair => {
                let l = self.spec(self.gup(id, 0))?;
                let r = self.spec(self.gup(id, 1))?;
                let ty = typ::pair(l.ty.clone(), r.ty.clone());
                Ok(self.value(ty, |g, ty| {
                    g.add(TypedOp::Pair, smallvec![l.node, r.node], ty.clone())
                }))
            }
            G::First => {
                let a = self.spec(self.gup(id, 0))?;
                let ty = a.ty.first().ok_or(Failure::Specialization)?;
                Ok(self.project(a.node, ty, true))
            }
            G::Rest => {
                let a = self.spec(self.gup(id, 0))?;
                let ty = a.ty.rest().ok_or(Failure::Specialization)?;
                Ok(self.project(a.node, ty, false))
            }
            G::Skip => {
                let a = self.spec(self.gup(id, 0))?;
                let n = self.spec(self.gup(id, 1))?;
                let n = n
                    .ty
                    .invariant_i64_value()
                    .and_then(|v| usize::try_from(v).ok())
                    .ok_or(Failure::Specialization)?;
                let mut cur = a;
                for _ in 0..n {
                    let ty = cur.ty.rest().ok_or(Failure::Specialization)?;
                    cur = self.project(cur.node, ty, false);
                }
                Ok(cur)
            }
            G::Repeat => {
                let e = self.spec(self.gup(id, 0))?;
                let n = self.spec(self.gup(id, 1))?;
                let t = self.spec(self.gup(id, 2))?;
                let n = n
                    .ty
                    .invariant_i64_value()
                    .and_then(|v| usize::try_from(v).ok())
                    .ok_or(Failure::Specialization)?;
                let mut cur = t;
                for _ in 0..n {
                    let ty = typ::pair(e.ty.clone(), cur.ty.clone());
                    let node = cur.node;
                    cur = self.value(ty, |g, ty| {
                        g.add(TypedOp::Pair, smallvec![e.node, node], ty.clone())
                    });
                }
                Ok(cur)
            }
            G::Math(op) => {
                let l = self.spec(self.gup(id, 0))?;
                let r = self.spec(self.gup(id, 1))?;
                self.math(op, l, r)
            }
            G::MakeUser(tag) => {
                let a = self.spec(self.gup(id, 0))?;
                let ty = Type::user(&tag, a.ty.clone());
                Ok(Spec { node: a.node, ty })
            }
            G::UnwrapUser(tag) => {
                let a = self.spec(self.gup(id, 0))?;
                if !a.ty.is_user_type_of(&tag) {
                    return Err(Failure::Specialization);
                }
                let ty = a.ty.unwrap_user().ok_or(Failure::Specialization)?;
                Ok(Spec { node: a.node, ty })
            }
            G::Evaluate { label } => {
                if let Some(trap) = self.try_recursion_trap(id)? {
                    return Err(Failure::RecursionTrap(Box::new(trap)));
                }
                let f = self.spec(self.gup(id, 0))?;
                let a = self.spec(self.gup(id, 1))?;
                self.call_function(label, &f, a)
            }
            G::Dispatch { label } => self.spec_dispatch(id, label),
            G::RingBuffer { time_base } => self.spec_ring_buffer(id, time_base),
            G::Input { key, ty, variety, driver } => {
                if self.mode == Mode::Configuration {
                    return Err(Failure::fatal(
                        "external inputs are not allowed in configuration context",
                    ));
                }
                let op = TypedOp::Input { key, variety, driver };
                let node = self.out.add(op, smallvec![], ty.clone());
                Ok(Spec { node, ty })
            }
            G::Raise => {
                let a = self.spec(self.gup(id, 0))?;
                Err(Failure::User(a.ty.fix(Fixing::NoRules)))
            }
            G::Handle => match self.spec(self.gup(id, 0)) {
                Ok(s) => Ok(s),
                Err(Failure::User(payload)) => {
                    let handler = self.spec(self.gup(id, 1))?;
                    let arg = self.constant(payload);
                    self.call_function(arcstr::literal!("handle"), &handler, arg)
                }
                Err(e) => Err(e),
            },
        }
    }

    /// when speculating, a listed recursion point with a solvable
    /// argument evolution traps instead of recursing
    fn try_recursion_trap(&mut self, id: GenericId) -> Result<Option<Trap>, Failure> {
        let (form, outer) = match &self.recur {
            Some(RecurHook::Trap { points, form, outer_arg }) if points.contains(&id) => {
                (*form, outer_arg.clone())
            }
            _ => return Ok(None),
        };
        let upstream = self.spec(self.gup(id, 1))?;
        if !evaluate::should_try_argument_evolution(
            &outer.fix(Fixing::NoRules),
            &upstream.ty.fix(Fixing::NoRules),
        ) {
            return Ok(None);
        }
        Ok(Some(Trap {
            recur_point: id,
            form,
            recursive_arg: upstream.ty.clone(),
            eval_point: upstream,
            saved: self.memo.clone(),
        }))
    }

    /// First/Rest with graph level folding: projecting a fresh pair
    /// reuses its upstream directly
    pub(crate) fn project(&mut self, node: TypedId, ty: Type, first: bool) -> Spec {
        if let TypedOp::Pair = self.out.op(node) {
            let up = self.out.up(node, if first { 0 } else { 1 });
            return Spec { node: up, ty };
        }
        self.value(ty, |g, ty| {
            let op = if first { TypedOp::First } else { TypedOp::Rest };
            g.add(op, smallvec![node], ty.clone())
        })
    }

    fn math(&mut self, op: MathOp, l: Spec, r: Spec) -> SpecResult {
        // a speculative non invariant operand is pinned to its
        // template; the recorded rule keeps the pin honest across the
        // solved repeat range
        let pin = |s: Spec| match &s.ty {
            Type::RuleGen(g) if !g.template().is_invariant() => {
                Spec { node: s.node, ty: g.fix(Fixing::WithRules) }
            }
            _ => s,
        };
        let l = pin(l);
        let r = pin(r);
        // invariant partial evaluation, with rule lifting during
        // speculation
        if l.ty.is_invariant() && r.ty.is_invariant() {
            if op.is_comparison() {
                let o = l.ty.ordinal_probe(&r.ty);
                return Ok(self.constant(Type::boolean(cmp_outcome(op, o))));
            }
            let ty = match op {
                MathOp::Add => typ::invariant_add(&l.ty, &r.ty),
                MathOp::Sub => typ::invariant_sub(&l.ty, &r.ty),
                MathOp::Mul => typ::invariant_mul(&l.ty, &r.ty),
                MathOp::Div => typ::invariant_div(&l.ty, &r.ty),
                MathOp::Mod => typ::invariant_mod(&l.ty, &r.ty),
                _ => unreachable!(),
            }
            .ok_or_else(|| Failure::fatal("invariant arithmetic overflow"))?;
            let node = self.out.add(
                TypedOp::constant(ty.fix(Fixing::NoRules)),
                smallvec![],
                ty.clone(),
            );
            return Ok(Spec { node, ty });
        }
        // structural comparison of other compile time values
        if l.ty.size() == 0 && r.ty.size() == 0 && op.is_comparison() {
            let o = l.ty.ordinal_probe(&r.ty);
            return Ok(self.constant(Type::boolean(cmp_outcome(op, o))));
        }
        let (l, r, ty) = self.promote(l, r)?;
        let node =
            self.out.add(TypedOp::Native { op, ty }, smallvec![l, r], Type::native(ty));
        Ok(Spec { node, ty: Type::native(ty) })
    }

    /// unify two operands onto a common native type, materializing
    /// invariant operands and inserting conversions
    fn promote(
        &mut self,
        l: Spec,
        r: Spec,
    ) -> Result<(TypedId, TypedId, NativeTy), Failure> {
        fn order(s: Scalar) -> u8 {
            match s {
                Scalar::Int32 => 0,
                Scalar::Int64 => 1,
                Scalar::Float32 => 2,
                Scalar::Float64 => 3,
            }
        }
        let lt = l.ty.native_ty();
        let rt = r.ty.native_ty();
        let common = match (lt, rt) {
            (Some(a), Some(b)) => {
                if a.width != b.width && a.width != 1 && b.width != 1 {
                    return Err(Failure::Specialization);
                }
                NativeTy {
                    elem: if order(a.elem) >= order(b.elem) { a.elem } else { b.elem },
                    width: a.width.max(b.width),
                }
            }
            (Some(a), None) if r.ty.is_invariant() => a,
            (None, Some(b)) if l.ty.is_invariant() => b,
            _ => return Err(Failure::Specialization),
        };
        let ln = self.coerce(l, common)?;
        let rn = self.coerce(r, common)?;
        Ok((ln, rn, common))
    }

    fn coerce(&mut self, s: Spec, to: NativeTy) -> Result<TypedId, Failure> {
        if let Some(v) = s.ty.invariant_value() {
            if s.ty.is_rule_generator() {
                // the baked constant is only valid while the evolving
                // value stays put
                let _ = s.ty.fix(Fixing::WithRules);
            }
            let data = encode_scalar(to, f64::try_from(v).unwrap_or(0.0));
            return Ok(self.out.add(
                TypedOp::Constant { data },
                smallvec![],
                Type::native(to),
            ));
        }
        match s.ty.native_ty() {
            Some(nt) if nt == to => Ok(s.node),
            Some(_) => Ok(self.out.add(
                TypedOp::Convert { to },
                smallvec![s.node],
                Type::native(to),
            )),
            None => Err(Failure::Specialization),
        }
    }

    fn spec_ring_buffer(&mut self, id: GenericId, time_base: TimeBase) -> SpecResult {
        if self.mode == Mode::Configuration {
            return Err(Failure::fatal(
                "stateful constructs are not allowed in configuration context",
            ));
        }
        let init = self.spec(self.gup(id, 0))?;
        let order = self.spec(self.gup(id, 1))?;
        let mut len = order
            .ty
            .invariant_i64_value()
            .and_then(|v| usize::try_from(v).ok())
            .filter(|v| *v >= 1)
            .ok_or_else(|| {
                Failure::fatal("ring buffer order must be a positive invariant")
            })?;
        if let TimeBase::Seconds = time_base {
            let sig = self.gup(id, 2);
            match self.ctx.graphs.op(sig) {
                GenericOp::Input { driver, .. } => {
                    len = (len as f64 * driver.ratio()).ceil() as usize;
                }
                _ => {
                    return Err(Failure::fatal(
                        "ring buffer length in seconds requires a clocked input",
                    ))
                }
            }
        }
        let elem = init.ty.fix(Fixing::WithRules);
        let ty = if len > 1 {
            typ::chain(elem.clone(), len, Type::Nil)
        } else {
            elem.clone()
        };
        // break the feedback cycle: publish the buffer node before
        // walking the signal, then patch the edge
        let node = self.out.reserve(TypedOp::RingBuffer { len, elem }, 2, ty.clone());
        self.out.patch_up(node, 0, init.node);
        let me = Spec { node, ty };
        self.memo.insert(id, Ok(me.clone()));
        let sig = self.spec(self.gup(id, 2))?;
        self.out.patch_up(node, 1, sig.node);
        Ok(me)
    }

    fn spec_dispatch(&mut self, id: GenericId, label: ArcStr) -> SpecResult {
        let f = self.spec(self.gup(id, 0))?;
        let a = self.spec(self.gup(id, 1))?;
        let variants: Vec<Type> = match a.ty.union_variants() {
            Some(vs) => vs.to_vec(),
            // no runtime polymorphism involved, plain call
            None => return self.call_function(label, &f, a),
        };
        let mut branches = Vec::with_capacity(variants.len());
        let mut result: Option<Type> = None;
        for v in variants {
            let arg_node = self.out.add(TypedOp::Argument, smallvec![], v.clone());
            let arg = Spec { node: arg_node, ty: v };
            let body = self.call_function(label.clone(), &f, arg)?;
            result = Some(match result {
                None => body.ty.clone(),
                Some(r) => typ::union_merge(r, body.ty.clone(), true),
            });
            branches.push(body.node);
        }
        let result = result.ok_or(Failure::Specialization)?;
        let selector = self.out.add(TypedOp::UnionTag, smallvec![a.node], Type::Int32);
        let node = self.out.add(
            TypedOp::Switch {
                label,
                branches: branches.into_iter().collect(),
                result: result.clone(),
            },
            smallvec![selector, a.node],
            result.clone(),
        );
        Ok(Spec { node, ty: result })
    }
}

fn cmp_outcome(op: MathOp, o: Ordering) -> bool {
    match op {
        MathOp::Equal => o == Ordering::Equal,
        MathOp::Greater => o == Ordering::Greater,
        MathOp::Less => o == Ordering::Less,
        _ => false,
    }
}

/// Specialize `root` against `argument` into `out`, producing the
/// evaluation root. This is the pass entry the driver calls.
pub fn specialize(
    ctx: &mut JobCtx,
    out: &mut TypedGraph,
    root: GenericId,
    argument: Type,
) -> SpecResult {
    let mut t = SpecializationTransform::new(ctx, out, argument, Mode::Normal);
    t.go(root)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn argument_specializes_to_itself() {
        let mut ctx = JobCtx::without_symbols();
        let mut out = TypedGraph::new();
        let a = ctx.graphs.add(GenericOp::Argument, smallvec![]);
        let s = specialize(&mut ctx, &mut out, a, Type::Float32).unwrap();
        assert_eq!(s.ty, Type::Float32);
        assert!(matches!(out.op(s.node), TypedOp::Argument));
    }

    #[test]
    fn invariant_math_partially_evaluates() {
        let mut ctx = JobCtx::without_symbols();
        let mut out = TypedGraph::new();
        let a = ctx.graphs.add(GenericOp::Constant(Type::invariant_i64(3)), smallvec![]);
        let b = ctx.graphs.add(GenericOp::Constant(Type::invariant_i64(2)), smallvec![]);
        let m = ctx.graphs.add(GenericOp::Math(MathOp::Add), smallvec![a, b]);
        let s = specialize(&mut ctx, &mut out, m, Type::Nil).unwrap();
        assert_eq!(s.ty, Type::invariant_i64(5));
        assert!(matches!(out.op(s.node), TypedOp::Constant { .. }));
    }

    #[test]
    fn native_math_promotes_operands() {
        let mut ctx = JobCtx::without_symbols();
        let mut out = TypedGraph::new();
        let a = ctx.graphs.add(GenericOp::Argument, smallvec![]);
        let x = ctx.graphs.add(GenericOp::First, smallvec![a]);
        let y = ctx.graphs.add(GenericOp::Rest, smallvec![a]);
        let m = ctx.graphs.add(GenericOp::Math(MathOp::Add), smallvec![x, y]);
        let arg = typ::pair(Type::Float32, Type::Float64);
        let s = specialize(&mut ctx, &mut out, m, arg).unwrap();
        assert_eq!(s.ty, Type::Float64);
        match out.op(s.node) {
            TypedOp::Native { op: MathOp::Add, ty } => {
                assert_eq!(*ty, NativeTy::scalar(Scalar::Float64))
            }
            op => panic!("unexpected {op:?}"),
        }
    }

    #[test]
    fn pair_projection_folds() {
        // first(pair(x, y)) never materializes the pair
        let mut ctx = JobCtx::without_symbols();
        let mut out = TypedGraph::new();
        let a = ctx.graphs.add(GenericOp::Argument, smallvec![]);
        let x = ctx.graphs.add(GenericOp::First, smallvec![a]);
        let y = ctx.graphs.add(GenericOp::Rest, smallvec![a]);
        let p = ctx.graphs.add(GenericOp::Pair, smallvec![x, y]);
        let f = ctx.graphs.add(GenericOp::First, smallvec![p]);
        let arg = typ::pair(Type::Float32, Type::Int32);
        let s = specialize(&mut ctx, &mut out, f, arg).unwrap();
        assert_eq!(s.ty, Type::Float32);
        assert!(matches!(out.op(s.node), TypedOp::First));
        assert!(matches!(out.op(out.up(s.node, 0)), TypedOp::Argument));
    }

    #[test]
    fn configuration_mode_rejects_state() {
        let mut ctx = JobCtx::without_symbols();
        let mut out = TypedGraph::new();
        let init = ctx
            .graphs
            .add(GenericOp::Constant(Type::invariant_i64(0)), smallvec![]);
        let order = ctx
            .graphs
            .add(GenericOp::Constant(Type::invariant_i64(4)), smallvec![]);
        let rb = ctx.graphs.reserve(
            GenericOp::RingBuffer { time_base: TimeBase::Samples },
            3,
        );
        ctx.graphs.patch_up(rb, 0, init);
        ctx.graphs.patch_up(rb, 1, order);
        ctx.graphs.patch_up(rb, 2, init);
        let mut t = SpecializationTransform::new(
            &mut ctx,
            &mut out,
            Type::Nil,
            Mode::Configuration,
        );
        match t.go(rb) {
            Err(Failure::Fatal(_)) => (),
            r => panic!("expected fatal failure, got {r:?}"),
        }
    }

    #[test]
    fn raise_and_handle() {
        let mut ctx = JobCtx::without_symbols();
        let mut out = TypedGraph::new();
        let payload =
            ctx.graphs.add(GenericOp::Constant(Type::invariant_i64(13)), smallvec![]);
        let raise = ctx.graphs.add(GenericOp::Raise, smallvec![payload]);
        // handler: identity function value
        let hbody = ctx.graphs.add(GenericOp::Argument, smallvec![]);
        let hval =
            crate::repo::function_value(&arcstr::literal!("handler"), &[], &[hbody]);
        let h = ctx.graphs.add(GenericOp::Constant(hval), smallvec![]);
        let handled = ctx.graphs.add(GenericOp::Handle, smallvec![raise, h]);
        let s = specialize(&mut ctx, &mut out, handled, Type::Nil).unwrap();
        assert_eq!(s.ty, Type::invariant_i64(13));
    }
}
