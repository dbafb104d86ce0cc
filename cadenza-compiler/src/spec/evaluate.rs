//! The universal call site: form search, the closed form recursion
//! solver, inline decisions and the dataflow inliner.

use super::{
    CacheKey, CachedForm, Failure, Mode, RecurHook, Spec, SpecResult,
    SpecializationTransform, Trap,
};
use crate::{
    graph::{typed::TypedOp, GenericGraph, GenericId, GenericOp, TypedId},
    repo::function_value,
    rules::TypeRuleSet,
    typ::{self, Fixing, Type, FUNCTION},
};
use arcstr::ArcStr;
use compact_str::format_compact;
use fxhash::FxHashMap;
use log::debug;
use smallvec::smallvec;

/// accumulated node weight at or below which a specialized body is
/// inlined into its caller
pub const INLINE_THRESHOLD: i32 = 24;

/// one candidate form of a function value
enum FormRef {
    Graph(GenericId),
    /// not a graph: retried through the registered fallback evaluator
    Fallback(Type),
}

fn form_list(forms: &Type) -> Vec<FormRef> {
    let mut out = Vec::new();
    let mut t = forms.clone();
    loop {
        let (head, rest) = match (t.first(), t.rest()) {
            (Some(h), Some(r)) if t.is_tuple() => (h, r),
            _ => {
                if !t.is_nil() {
                    out.push(match t.graph_value() {
                        Some(g) => FormRef::Graph(g),
                        None => FormRef::Fallback(t.clone()),
                    });
                }
                break;
            }
        };
        out.push(match head.graph_value() {
            Some(g) => FormRef::Graph(g),
            None => FormRef::Fallback(head),
        });
        t = rest;
    }
    out
}

/// Does the step from `outer` to `inner` look like a recurrence the
/// solver can close? Invariant steps, homogeneous tuple sections and
/// matching user type wrappers qualify.
pub(super) fn should_try_argument_evolution(outer: &Type, inner: &Type) -> bool {
    if outer == inner {
        return true;
    }
    if outer.is_invariant() && inner.is_invariant() {
        return true;
    }
    if inner.is_tuple() && outer.is_tuple() {
        let (Some(ifst), Some(ofst)) = (inner.first(), outer.first()) else {
            return false;
        };
        let ic = inner.count_leading_elements(&ifst);
        let oc = outer.count_leading_elements(&ofst);
        if ifst == ofst
            && inner.rest_n(ic).as_ref() == outer.rest_n(oc).as_ref()
        {
            return true;
        }
        let (Some(irst), Some(orst)) = (inner.rest(), outer.rest()) else {
            return false;
        };
        return should_try_argument_evolution(&ifst, &ofst)
            && should_try_argument_evolution(&irst, &orst);
    }
    if inner.is_user_type() && outer.is_user_type() && inner.descriptor() == outer.descriptor()
    {
        if let (Some(i), Some(o)) = (inner.unwrap_user(), outer.unwrap_user()) {
            return should_try_argument_evolution(&o, &i);
        }
    }
    false
}

/// residual flows out of the dataflow inliner walk
struct Flows {
    inline: TypedId,
    outline: Option<TypedId>,
    ty: Type,
}

impl<'a, 's> SpecializationTransform<'a, 's> {
    /// The call algorithm: cache, recursion solving, form search,
    /// post processing and the inline decision.
    pub(crate) fn call_function(
        &mut self,
        label: ArcStr,
        f: &Spec,
        a: Spec,
    ) -> SpecResult {
        self.ctx.diag.open_block(crate::diag::Verbosity::LogAlways, &label);
        let r = self.call_function_inner(label, f, a);
        self.ctx.diag.close_block(crate::diag::Verbosity::LogAlways);
        r
    }

    fn call_function_inner(&mut self, label: ArcStr, f: &Spec, a: Spec) -> SpecResult {
        let fixed = f.ty.is_fixed() && a.ty.is_fixed();
        let key = CacheKey { graph: f.ty.type_hash(), argument: a.ty.clone() };
        if fixed {
            if let Some(c) = self.ctx.cache.get(&key).cloned() {
                debug!("specialization cache hit for {label}");
                let body = self.out.import(&self.ctx.cache_graph, c.body);
                let upstream =
                    if c.used_fallback { self.pack_pair(f, &a) } else { a.node };
                return self.complete_call(
                    &label,
                    body,
                    c.result,
                    a.ty.clone(),
                    upstream,
                    c.should_inline,
                );
            }
        }

        let (recur_pts, forms_ty) = if f.ty.is_user_type_of(&FUNCTION) {
            let content = f.ty.unwrap_user().ok_or(Failure::Specialization)?;
            (content.element(1), content.element(2))
        } else {
            (Type::Nil, f.ty.clone())
        };
        let forms = form_list(&forms_ty);

        // recursion solving only fires for named recursion points and
        // a sized argument
        if !recur_pts.is_nil() && a.ty.size() > 0 {
            let mut rpvec = Vec::new();
            let mut t = recur_pts.clone();
            while t.is_tuple() {
                if let Some(g) = t.first().and_then(|h| h.graph_value()) {
                    rpvec.push(g);
                }
                t = t.rest().unwrap_or(Type::Nil);
            }
            match self.spec_recursive(&label, &a, &rpvec, &forms)? {
                Some((body, result)) => {
                    if fixed && result.is_fixed() {
                        let cbody = self.ctx.cache_graph.import(self.out, body);
                        self.ctx.cache.insert(
                            key,
                            CachedForm {
                                body: cbody,
                                result: result.clone(),
                                should_inline: true,
                                used_fallback: false,
                            },
                        );
                    }
                    self.ctx.diag.success_form(&label, &a.ty, &result);
                    return self.complete_call(
                        &label,
                        body,
                        result,
                        a.ty.clone(),
                        a.node,
                        true,
                    );
                }
                // sequence construction failed: retry the plain forms
                None => (),
            }
        }

        let (body, result, used_fallback) = self.spec_body(None, &forms, &a)?;
        let should_inline = used_fallback || self.should_inline(body);
        if fixed && result.is_fixed() {
            let cbody = self.ctx.cache_graph.import(self.out, body);
            self.ctx.cache.insert(
                key,
                CachedForm {
                    body: cbody,
                    result: result.clone(),
                    should_inline,
                    used_fallback,
                },
            );
        }
        self.ctx.diag.success_form(
            &label,
            &a.ty.fix(Fixing::NoRules),
            &result.fix(Fixing::NoRules),
        );
        let upstream = if used_fallback { self.pack_pair(f, &a) } else { a.node };
        self.complete_call(&label, body, result, a.ty.clone(), upstream, should_inline)
    }

    fn pack_pair(&mut self, f: &Spec, a: &Spec) -> TypedId {
        let ty = typ::pair(f.ty.clone(), a.ty.clone());
        self.out.add(TypedOp::Pair, smallvec![f.node, a.node], ty)
    }

    /// Form by form specialization. Failure classes route the search:
    /// a plain mismatch lets the next form run, everything else stops
    /// it.
    fn spec_body(
        &mut self,
        recur_pts: Option<&[GenericId]>,
        forms: &[FormRef],
        a: &Spec,
    ) -> Result<(TypedId, Type, bool), Failure> {
        for form in forms {
            match form {
                FormRef::Graph(gid) => {
                    let hook = recur_pts.map(|points| RecurHook::Trap {
                        points: points.to_vec(),
                        form: *gid,
                        outer_arg: a.ty.clone(),
                    });
                    let mut t = self.nested(a.ty.clone(), Default::default(), hook);
                    match t.go(*gid) {
                        Ok(s) => return Ok((s.node, s.ty, false)),
                        Err(Failure::Specialization) => continue,
                        Err(Failure::Propagate) => {
                            return Err(Failure::Specialization)
                        }
                        Err(Failure::NoEvalFallback) => {
                            return Err(Failure::Specialization)
                        }
                        Err(e) => return Err(e),
                    }
                }
                FormRef::Fallback(form_ty) => {
                    return self.spec_fallback(form_ty, a);
                }
            }
        }
        Err(Failure::Specialization)
    }

    /// a non graph form retries through the registered fallback
    /// evaluator with `(form, argument)` as the packed argument
    fn spec_fallback(
        &mut self,
        form_ty: &Type,
        a: &Spec,
    ) -> Result<(TypedId, Type, bool), Failure> {
        let symbols = self.ctx.symbols;
        let def = match symbols.resolve(":fallback:eval") {
            Some(def) => def,
            None => return Err(Failure::fatal("not a function")),
        };
        let bodies: Vec<GenericId> = def.forms.iter().map(|f| f.body).collect();
        let fv = function_value(&def.qualified_name, &[], &bodies);
        let fconst = self.ctx.graphs.add(GenericOp::Constant(fv), smallvec![]);
        let argn = self.ctx.graphs.add(GenericOp::Argument, smallvec![]);
        let ev = self.ctx.graphs.add(
            GenericOp::Evaluate { label: arcstr::literal!(":fallback:eval") },
            smallvec![fconst, argn],
        );
        let arg_ty = typ::pair(form_ty.clone(), a.ty.clone());
        let mut t = self.nested(arg_ty, Default::default(), None);
        let s = t.go(ev)?;
        Ok((s.node, s.ty, true))
    }

    fn nested<'b>(
        &'b mut self,
        arg: Type,
        memo: super::Memo,
        recur: Option<RecurHook>,
    ) -> SpecializationTransform<'b, 's> {
        SpecializationTransform {
            ctx: &mut *self.ctx,
            out: &mut *self.out,
            arg,
            mode: self.mode,
            memo,
            recur,
            depth: self.depth,
        }
    }

    /// The recursion solver. Speculate with a rule generator wrapped
    /// argument; when the body traps at a recursion point, derive the
    /// closed form argument evolution, solve the depth, verify a
    /// closed form result evolution and emit a function sequence.
    /// `Ok(None)` means the sequence failed and the plain form search
    /// should run.
    fn spec_recursive(
        &mut self,
        label: &ArcStr,
        a: &Spec,
        recur_pts: &[GenericId],
        forms: &[FormRef],
    ) -> Result<Option<(TypedId, Type)>, Failure> {
        self.ctx.diag.diagnostic(crate::diag::Verbosity::LogEverything, "rec-solver");
        let rules = TypeRuleSet::new();
        let fixed_arg = a.ty.fix(Fixing::NoRules);
        let wrapped = rules.generator(fixed_arg.clone());
        let probe = Spec { node: a.node, ty: wrapped };
        let trap = match self.spec_body(Some(recur_pts), forms, &probe) {
            Ok((body, ty, _)) => {
                // the recursive form did not fire
                self.out.fix_types(body);
                return Ok(Some((body, ty.fix(Fixing::NoRules))));
            }
            Err(Failure::RecursionTrap(trap)) => trap,
            Err(e) => return Err(e),
        };

        rules.accept_more_rules(false);
        let bundle = rules
            .argument_bundle(&fixed_arg, &trap.recursive_arg.fix(Fixing::NoRules));
        let bundle = match bundle {
            Some(b) => b,
            None => {
                // no formal argument evolution: finish the trapped
                // form with the partial results restored
                rules.accept_more_rules(true);
                let hook = RecurHook::Substitute {
                    point: trap.recur_point,
                    with: trap.eval_point.clone(),
                };
                let mut t =
                    self.nested(a.ty.clone(), trap.saved.clone(), Some(hook));
                let s = t.go(trap.form)?;
                self.out.fix_types(s.node);
                return Ok(Some((s.node, s.ty.fix(Fixing::NoRules))));
            }
        };

        let mut n = rules.solve_recursion_depth(bundle);
        debug!("recursion solver: {label} depth {n}");
        while n > 1 {
            self.ctx.diag.diagnostic(
                crate::diag::Verbosity::LogEverything,
                &format_compact!("try seq {n}"),
            );
            // the argument for the body once the rules no longer hold
            let out_arg = match rules.infer(bundle, n) {
                Some(t) => t.fix(Fixing::NoRules),
                None => break,
            };
            let (tail_body, tail_ty, _) =
                match self.spec_body(None, forms, &Spec { node: a.node, ty: out_arg })
                {
                    Ok(t) => t,
                    Err(Failure::Specialization) => {
                        n /= 2;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

            // generator: the body re-expressed over (argument, recursive
            // result)
            let gen_root = rewrite_generator(
                &mut self.ctx.graphs,
                trap.form,
                trap.recur_point,
            );
            let final_arg = match rules.infer(bundle, n - 1) {
                Some(t) => t.fix(Fixing::NoRules),
                None => break,
            };
            let gen_rules = TypeRuleSet::new();
            let grgen =
                gen_rules.generator(typ::pair(final_arg, tail_ty.clone()));
            let lifter = typ::pair(
                grgen.first().ok_or(Failure::Specialization)?,
                grgen.rest().ok_or(Failure::Specialization)?,
            );
            let gen_spec = {
                let mut t = self.nested(lifter, Default::default(), None);
                t.go(gen_root)?
            };
            gen_rules.accept_more_rules(false);
            let res_bundle = gen_rules.argument_bundle(
                &tail_ty,
                &gen_spec.ty.fix(Fixing::NoRules),
            );
            let res_bundle = match res_bundle {
                Some(b) => b,
                None => {
                    n /= 2;
                    continue;
                }
            };
            // verify the generator holds for the whole sequence by
            // solving its rules over (arg(n - k), result(k))
            let check =
                gen_rules.sequence_check_bundle(&rules, bundle, n, res_bundle);
            let ng = gen_rules.solve_recursion_depth(check);
            if ng >= n {
                let result = gen_rules
                    .infer(res_bundle, n)
                    .map(|t| t.fix(Fixing::NoRules))
                    .ok_or(Failure::Specialization)?;
                let iterator_root = self.ctx.graphs.up(trap.recur_point, 1);
                let iterator = {
                    let mut t =
                        self.nested(fixed_arg.clone(), Default::default(), None);
                    t.go(iterator_root)?
                };
                let arg_formula =
                    rules.export_formula(&mut self.ctx.graphs, bundle);
                let res_formula =
                    gen_rules.export_formula(&mut self.ctx.graphs, res_bundle);
                for b in [tail_body, gen_spec.node, iterator.node] {
                    self.out.fix_types(b);
                }
                let arg_node = self.out.add(
                    TypedOp::Argument,
                    smallvec![],
                    fixed_arg.clone(),
                );
                let seq_label: ArcStr =
                    format_compact!("{label}_seq").as_str().into();
                self.ctx.diag.diagnostic(
                    crate::diag::Verbosity::LogEverything,
                    &format_compact!("seq {label}: len {n}"),
                );
                let node = self.out.add(
                    TypedOp::FunctionSequence {
                        label: seq_label,
                        arg_formula,
                        res_formula,
                        iterator: iterator.node,
                        generator: gen_spec.node,
                        tail: tail_body,
                        count: n,
                    },
                    smallvec![arg_node],
                    result.clone(),
                );
                return Ok(Some((node, result)));
            } else if ng > 0 {
                // the generator form fails inside this sequence
                // length, shorten it
                n -= ng;
            } else {
                break;
            }
        }
        self.ctx.diag.diagnostic(crate::diag::Verbosity::LogEverything, "seq failed");
        Ok(None)
    }

    /// weight bounded inline decision over the specialized body
    fn should_inline(&self, body: TypedId) -> bool {
        let mut wt = 0;
        for id in self.out.postorder(body) {
            wt += self.out.op(id).weight();
            if wt > INLINE_THRESHOLD {
                return false;
            }
        }
        true
    }

    /// Post processing of a successful specialization: identity and
    /// constant bodies collapse, zero sized results become constants,
    /// everything else becomes an out of line call run through the
    /// dataflow inliner.
    fn complete_call(
        &mut self,
        label: &ArcStr,
        body: TypedId,
        result: Type,
        arg_ty: Type,
        upstream: TypedId,
        should_inline: bool,
    ) -> SpecResult {
        if should_inline {
            let mut subst = FxHashMap::default();
            for id in self.out.postorder(body) {
                if matches!(self.out.op(id), TypedOp::Argument) {
                    subst.insert(id, upstream);
                }
            }
            let node = self.out.clone_subgraph(body, &subst);
            return Ok(Spec { node, ty: result });
        }
        if matches!(self.out.op(body), TypedOp::Argument) {
            // happy path for identity functions
            return Ok(Spec { node: upstream, ty: result });
        }
        if matches!(self.out.op(body), TypedOp::Constant { .. }) {
            return Ok(Spec { node: body, ty: result });
        }
        if result.size() == 0 {
            let ty = result.fix(Fixing::NoRules);
            return Ok(self.constant(ty));
        }
        let fc = self.out.reserve(
            TypedOp::FunctionCall {
                label: label.clone(),
                body,
                arg: arg_ty.fix(Fixing::NoRules),
                result: result.fix(Fixing::NoRules),
            },
            1,
            result.fix(Fixing::NoRules),
        );
        self.out.patch_up(fc, 0, upstream);
        // hoist the parts of the body that only shuffle the caller's
        // argument
        let flows = self.df_walk(body, upstream, fc, &result.fix(Fixing::NoRules));
        if let Some(outline) = flows.outline {
            if outline != body {
                let ty = flows.ty.fix(Fixing::NoRules);
                self.out.replace_op(
                    fc,
                    TypedOp::FunctionCall {
                        label: label.clone(),
                        body: outline,
                        arg: arg_ty.fix(Fixing::NoRules),
                        result: ty.clone(),
                    },
                    ty,
                );
            }
        }
        Ok(Spec { node: flows.inline, ty: result })
    }

    /// The dataflow inliner walk: sub expressions of the result that
    /// depend only on the caller's argument are hoisted out of the
    /// callee; the residual stays behind the call.
    fn df_walk(
        &mut self,
        body: TypedId,
        fn_arg: TypedId,
        fn_outline: TypedId,
        fn_res: &Type,
    ) -> Flows {
        match self.out.op(body).clone() {
            TypedOp::Argument => Flows { inline: fn_arg, outline: None, ty: Type::Nil },
            TypedOp::Pair => {
                let fo_f = self.graph_first(fn_outline);
                let l = self.df_walk(
                    self.out.up(body, 0),
                    fn_arg,
                    fo_f,
                    &fn_res.first().unwrap_or(Type::Nil),
                );
                let fo_r = self.graph_rest(fn_outline);
                let r = self.df_walk(
                    self.out.up(body, 1),
                    fn_arg,
                    fo_r,
                    &fn_res.rest().unwrap_or(Type::Nil),
                );
                let lo = l.outline.unwrap_or_else(|| self.out.nil());
                let ro = r.outline.unwrap_or_else(|| self.out.nil());
                let outline = self.fold_pair(lo, ro);
                let inline = self.fold_pair(l.inline, r.inline);
                Flows {
                    inline,
                    outline: Some(outline),
                    ty: typ::pair(l.ty, r.ty),
                }
            }
            TypedOp::First => {
                let nil = self.out.nil();
                let fo = self.fold_pair(fn_outline, nil);
                let f = self.df_walk(
                    self.out.up(body, 0),
                    fn_arg,
                    fo,
                    &typ::pair(fn_res.clone(), Type::Nil),
                );
                let (outline, ty) = match f.outline {
                    Some(o) => {
                        let o = self.graph_first(o);
                        (Some(o), f.ty.first().unwrap_or(f.ty))
                    }
                    None => (None, f.ty),
                };
                let inline = self.graph_first(f.inline);
                Flows { inline, outline, ty }
            }
            TypedOp::Rest => {
                let nil = self.out.nil();
                let fo = self.fold_pair(nil, fn_outline);
                let f = self.df_walk(
                    self.out.up(body, 0),
                    fn_arg,
                    fo,
                    &typ::pair(Type::Nil, fn_res.clone()),
                );
                let (outline, ty) = match f.outline {
                    Some(o) => {
                        let o = self.graph_rest(o);
                        (Some(o), f.ty.rest().unwrap_or(f.ty))
                    }
                    None => (None, f.ty),
                };
                let inline = self.graph_rest(f.inline);
                Flows { inline, outline, ty }
            }
            TypedOp::Constant { .. } => Flows {
                inline: body,
                outline: None,
                ty: self.out.ty(body).clone(),
            },
            _ => Flows { inline: fn_outline, outline: Some(body), ty: fn_res.clone() },
        }
    }

    fn graph_first(&mut self, node: TypedId) -> TypedId {
        if let TypedOp::Pair = self.out.op(node) {
            return self.out.up(node, 0);
        }
        let ty = self.out.ty(node).first().unwrap_or(Type::Nil);
        self.out.add(TypedOp::First, smallvec![node], ty)
    }

    fn graph_rest(&mut self, node: TypedId) -> TypedId {
        if let TypedOp::Pair = self.out.op(node) {
            return self.out.up(node, 1);
        }
        let ty = self.out.ty(node).rest().unwrap_or(Type::Nil);
        self.out.add(TypedOp::Rest, smallvec![node], ty)
    }

    /// `pair(first(x), rest(x))` reconstructs `x`
    fn fold_pair(&mut self, fst: TypedId, rst: TypedId) -> TypedId {
        if let (TypedOp::First, TypedOp::Rest) =
            (self.out.op(fst), self.out.op(rst))
        {
            if self.out.up(fst, 0) == self.out.up(rst, 0) {
                return self.out.up(fst, 0);
            }
        }
        let ty = typ::pair(
            self.out.ty(fst).clone(),
            self.out.ty(rst).clone(),
        );
        self.out.add(TypedOp::Pair, smallvec![fst, rst], ty)
    }
}

/// Rewrite a form body into its generator: the recursion point becomes
/// `rest(argument)` (the recursive result) and the original argument
/// becomes `first(argument)`.
fn rewrite_generator(
    g: &mut GenericGraph,
    form: GenericId,
    recur_point: GenericId,
) -> GenericId {
    let order = g.postorder(form);
    let mut map: FxHashMap<GenericId, GenericId> = FxHashMap::default();
    let arg = g.add(GenericOp::Argument, smallvec![]);
    let new_arg = g.add(GenericOp::First, smallvec![arg]);
    let new_recur = g.add(GenericOp::Rest, smallvec![arg]);
    for id in order {
        if id == recur_point {
            map.insert(id, new_recur);
            continue;
        }
        if matches!(g.op(id), GenericOp::Argument) {
            map.insert(id, new_arg);
            continue;
        }
        let node = g.node(id).clone();
        let ups: smallvec::SmallVec<[GenericId; 2]> = node
            .ups
            .iter()
            .map(|u| map.get(u).copied().unwrap_or(*u))
            .collect();
        let new = g.add_at(node.op, ups, node.pos);
        map.insert(id, new);
    }
    map.get(&form).copied().unwrap_or(form)
}
