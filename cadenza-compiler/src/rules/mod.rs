//! Speculative type constraints for closed form recursion solving.
//!
//! During a speculative specialization the recursion argument is
//! wrapped in a [RuleGenerator]. Every structural query against the
//! wrapper both answers the query (from the template type) and records
//! a rule into the shared [TypeRuleSet] keyed by the accessor
//! expression that produced the answer. When the speculation traps at
//! the recursive call, the recorded rules describe exactly the
//! assumptions the body made about its argument; the solver then finds
//! the largest induction depth for which every assumption still holds.

use crate::{
    graph::{generic::MathOp, GenericGraph, GenericId, GenericOp},
    typ::{self, Fixing, Tag, Type},
};
use fxhash::FxHashMap;
use log::trace;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use smallvec::smallvec;
use std::cmp::Ordering;
use triomphe::Arc;

/// upper bound on solvable recursion depth
pub const DEPTH_LIMIT: i64 = 1 << 31;

/// a structural fact the speculation observed about an accessor
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    IsPair,
    IsUser(Tag),
    Equals(Type),
    SizeEquals(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AxiomRule {
    pub key: GenericId,
    pub pred: Predicate,
    pub invert: bool,
}

/// numeric bounds on an invariant accessor; rules on the same key
/// merge by tightening
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeRule {
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
    pub closed_min: bool,
    pub closed_max: bool,
}

impl RangeRule {
    pub fn minimum(min: Decimal, open: bool) -> Self {
        RangeRule { min: Some(min), max: None, closed_min: !open, closed_max: true }
    }

    pub fn maximum(max: Decimal, open: bool) -> Self {
        RangeRule { min: None, max: Some(max), closed_min: true, closed_max: !open }
    }

    pub fn exactly(v: Decimal) -> Self {
        RangeRule { min: Some(v), max: Some(v), closed_min: true, closed_max: true }
    }

    pub fn merge(&mut self, other: &RangeRule) {
        match (self.min, other.min) {
            (None, Some(_)) => {
                self.min = other.min;
                self.closed_min = other.closed_min;
            }
            (Some(a), Some(b)) if b > a => {
                self.min = other.min;
                self.closed_min = other.closed_min;
            }
            (Some(a), Some(b)) if b == a => {
                self.closed_min &= other.closed_min;
            }
            _ => (),
        }
        match (self.max, other.max) {
            (None, Some(_)) => {
                self.max = other.max;
                self.closed_max = other.closed_max;
            }
            (Some(a), Some(b)) if b < a => {
                self.max = other.max;
                self.closed_max = other.closed_max;
            }
            (Some(a), Some(b)) if b == a => {
                self.closed_max &= other.closed_max;
            }
            _ => (),
        }
    }

    pub fn contains(&self, v: Decimal) -> bool {
        if let Some(min) = self.min {
            if v < min || (v == min && !self.closed_min) {
                return false;
            }
        }
        if let Some(max) = self.max {
            if v > max || (v == max && !self.closed_max) {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
struct RuleSetInner {
    /// arena for accessor and evolution expressions; hash consing
    /// makes rules on the same accessor share a key
    scev: GenericGraph,
    ranges: FxHashMap<GenericId, RangeRule>,
    axioms: Vec<AxiomRule>,
    accept: bool,
}

impl RuleSetInner {
    fn record_range(&mut self, key: GenericId, rule: RangeRule) {
        if !self.accept {
            return;
        }
        match self.ranges.get_mut(&key) {
            Some(r) => r.merge(&rule),
            None => {
                self.ranges.insert(key, rule);
            }
        }
    }

    fn record_axiom(&mut self, rule: AxiomRule) {
        if !self.accept {
            return;
        }
        if !self.axioms.contains(&rule) {
            self.axioms.push(rule);
        }
    }
}

/// The shared rule store of one speculative specialization attempt.
pub struct TypeRuleSet {
    inner: Arc<RwLock<RuleSetInner>>,
}

impl Default for TypeRuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRuleSet {
    pub fn new() -> Self {
        let inner = RuleSetInner { accept: true, ..Default::default() };
        TypeRuleSet { inner: Arc::new(RwLock::new(inner)) }
    }

    /// fix the rule set; further queries answer without recording
    pub fn accept_more_rules(&self, accept: bool) {
        self.inner.write().accept = accept
    }

    /// wrap `template` in a fresh rule generator whose evolution
    /// expression is the bare recursion argument
    pub fn generator(&self, template: Type) -> Type {
        let scev = self.inner.write().scev.add(GenericOp::Argument, smallvec![]);
        Type::RuleGen(Arc::new(RuleGenerator {
            template: template.fix(Fixing::NoRules),
            scev,
            rules: Arc::clone(&self.inner),
        }))
    }

    pub fn rule_count(&self) -> usize {
        let inner = self.inner.read();
        inner.ranges.len() + inner.axioms.len()
    }

    /// Derive a closed form argument evolution: an expression `f` over
    /// the induction counter such that `f(0) = outer` and
    /// `f(1) = inner`, generalized over the supported shapes
    /// (invariant addition, homogeneous tuple sections, matching user
    /// type wrappers). Returns the formula in the rule set's arena.
    pub fn argument_bundle(&self, outer: &Type, inner: &Type) -> Option<GenericId> {
        let outer = outer.fix(Fixing::NoRules);
        let inner = inner.fix(Fixing::NoRules);
        let mut inner_lock = self.inner.write();
        let id = bundle_rec(&mut inner_lock.scev, &outer, &inner)?;
        trace!("argument bundle derived over {} nodes", inner_lock.scev.len());
        Some(id)
    }

    /// evaluate a formula from this rule set's arena at step `n`
    pub fn infer(&self, formula: GenericId, n: i64) -> Option<Type> {
        let inner = self.inner.read();
        infer(&inner.scev, formula, &Type::invariant_i64(n))
    }

    /// copy a formula into the destination (job) arena
    pub fn export_formula(
        &self,
        dst: &mut GenericGraph,
        formula: GenericId,
    ) -> GenericId {
        let inner = self.inner.read();
        dst.import(&inner.scev, formula)
    }

    /// Compose the verification bundle for a generator rule set. The
    /// generator observed `(argument, result)` pairs; at sequence
    /// position `k` those are `(arg(n - k), result(k))`, so the
    /// argument formula is imported with its counter inverted.
    pub fn sequence_check_bundle(
        &self,
        arg_rules: &TypeRuleSet,
        arg_formula: GenericId,
        n: i64,
        res_formula: GenericId,
    ) -> GenericId {
        debug_assert!(!Arc::ptr_eq(&self.inner, &arg_rules.inner));
        let src = arg_rules.inner.read();
        let mut dst = self.inner.write();
        let inv = import_inverted(&src.scev, arg_formula, &mut dst.scev, n);
        dst.scev.add(GenericOp::Pair, smallvec![inv, res_formula])
    }

    /// The recursion depth solver: the largest `N >= 1` such that
    /// every recorded rule holds for all arguments `f(0..N-1)`, probed
    /// by doubling and bisection up to [DEPTH_LIMIT].
    pub fn solve_recursion_depth(&self, bundle: GenericId) -> i64 {
        let inner = self.inner.read();
        let ok_at = |step: i64| -> bool {
            let arg = match infer(&inner.scev, bundle, &Type::invariant_i64(step)) {
                Some(t) => t,
                None => return false,
            };
            for (key, range) in inner.ranges.iter() {
                match infer(&inner.scev, *key, &arg).and_then(|t| t.invariant_value())
                {
                    Some(v) if range.contains(v) => (),
                    _ => return false,
                }
            }
            for ax in inner.axioms.iter() {
                let got = match infer(&inner.scev, ax.key, &arg) {
                    Some(t) => t,
                    None => return false,
                };
                let holds = match &ax.pred {
                    Predicate::IsPair => got.is_tuple(),
                    Predicate::IsUser(tag) => got.is_user_type_of(tag),
                    Predicate::Equals(t) => &got == t,
                    Predicate::SizeEquals(s) => got.size() == *s,
                };
                if holds == ax.invert {
                    return false;
                }
            }
            true
        };
        if !ok_at(0) {
            return 0;
        }
        if !ok_at(1) {
            return 1;
        }
        // doubling probe for the first failing step
        let mut hi: i64 = 2;
        while hi < DEPTH_LIMIT && ok_at(hi) {
            hi = hi.saturating_mul(2);
        }
        if hi >= DEPTH_LIMIT {
            return DEPTH_LIMIT;
        }
        // bisect in (hi/2, hi]: rules hold at hi/2 and fail at hi
        let mut lo = hi / 2;
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            if ok_at(mid) {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        // rules hold for steps 0..=lo, so lo + 1 arguments are valid
        lo + 1
    }
}

fn scev_const(g: &mut GenericGraph, t: Type) -> GenericId {
    g.add(GenericOp::Constant(t), smallvec![])
}

/// import a formula substituting its counter argument by `n - k`
fn import_inverted(
    src: &GenericGraph,
    root: GenericId,
    dst: &mut GenericGraph,
    n: i64,
) -> GenericId {
    let order = src.postorder(root);
    let mut map: FxHashMap<GenericId, GenericId> = FxHashMap::default();
    for id in order {
        let node = src.node(id);
        let new = match &node.op {
            GenericOp::Argument => {
                let total = scev_const(dst, Type::invariant_i64(n));
                let k = dst.add(GenericOp::Argument, smallvec![]);
                dst.add(GenericOp::Math(MathOp::Sub), smallvec![total, k])
            }
            op => {
                let ups: smallvec::SmallVec<[GenericId; 2]> =
                    node.ups.iter().map(|u| map[u]).collect();
                dst.add(op.clone(), ups)
            }
        };
        map.insert(id, new);
    }
    map[&root]
}

/// see [TypeRuleSet::argument_bundle]
fn bundle_rec(g: &mut GenericGraph, outer: &Type, inner: &Type) -> Option<GenericId> {
    if outer == inner {
        return Some(scev_const(g, outer.clone()));
    }
    match (outer, inner) {
        (Type::Invariant(a), Type::Invariant(b)) => {
            // f(n) = a + n * (b - a)
            let delta = b.checked_sub(*a)?;
            let base = scev_const(g, Type::Invariant(*a));
            let step = scev_const(g, Type::Invariant(delta));
            let n = g.add(GenericOp::Argument, smallvec![]);
            let scaled = g.add(GenericOp::Math(MathOp::Mul), smallvec![step, n]);
            Some(g.add(GenericOp::Math(MathOp::Add), smallvec![base, scaled]))
        }
        (Type::User(t0, c0), Type::User(t1, c1)) if t0 == t1 => {
            let content = bundle_rec(g, c0, c1)?;
            Some(g.add(GenericOp::MakeUser(t0.clone()), smallvec![content]))
        }
        (Type::Tuple(_), Type::Tuple(_)) => {
            let e = outer.first()?;
            let oc = outer.count_leading_elements(&e);
            let ic = inner.count_leading_elements(&e);
            if inner.first()? == e
                && ic < oc
                && inner.rest_n(ic)? == outer.rest_n(oc)?
            {
                // a homogeneous section consumed head first:
                // f(n) = skip(outer, n * (oc - ic))
                let d = (oc - ic) as i64;
                let base = scev_const(g, outer.clone());
                let step = scev_const(g, Type::invariant_i64(d));
                let n = g.add(GenericOp::Argument, smallvec![]);
                let count = g.add(GenericOp::Math(MathOp::Mul), smallvec![step, n]);
                return Some(g.add(GenericOp::Skip, smallvec![base, count]));
            }
            if inner.first()? == e && ic > oc && outer.rest_n(oc)? == inner.rest_n(ic)?
            {
                // section grown head first:
                // f(n) = repeat(e, oc + n * (ic - oc), rest)
                let d = (ic - oc) as i64;
                let elem = scev_const(g, e);
                let tail = scev_const(g, outer.rest_n(oc)?);
                let base = scev_const(g, Type::invariant_i64(oc as i64));
                let step = scev_const(g, Type::invariant_i64(d));
                let n = g.add(GenericOp::Argument, smallvec![]);
                let grow = g.add(GenericOp::Math(MathOp::Mul), smallvec![step, n]);
                let count = g.add(GenericOp::Math(MathOp::Add), smallvec![base, grow]);
                return Some(g.add(GenericOp::Repeat, smallvec![elem, count, tail]));
            }
            let fst = bundle_rec(g, &outer.first()?, &inner.first()?)?;
            let rst = bundle_rec(g, &outer.rest()?, &inner.rest()?)?;
            Some(g.add(GenericOp::Pair, smallvec![fst, rst]))
        }
        _ => None,
    }
}

/// Evaluate a formula graph over concrete types with the induction
/// argument bound to `arg`. Formulas are built from the invariant
/// structural subset only; anything else fails the inference.
pub fn infer(g: &GenericGraph, formula: GenericId, arg: &Type) -> Option<Type> {
    let order = g.postorder(formula);
    let mut vals: FxHashMap<GenericId, Type> = FxHashMap::default();
    for id in order {
        let ups = g.ups(id);
        let v = match g.op(id) {
            GenericOp::Argument => arg.clone(),
            GenericOp::Constant(t) => t.clone(),
            GenericOp::Pair => {
                typ::pair(vals.get(&ups[0])?.clone(), vals.get(&ups[1])?.clone())
            }
            GenericOp::First => vals.get(&ups[0])?.first()?,
            GenericOp::Rest => vals.get(&ups[0])?.rest()?,
            GenericOp::Skip => {
                let n = vals.get(&ups[1])?.invariant_i64_value()?;
                vals.get(&ups[0])?.rest_n(usize::try_from(n).ok()?)?
            }
            GenericOp::Repeat => {
                let n = vals.get(&ups[1])?.invariant_i64_value()?;
                let elem = vals.get(&ups[0])?.clone();
                let tail = vals.get(&ups[2])?.clone();
                typ::chain(elem, usize::try_from(n).ok()?, tail)
            }
            GenericOp::MakeUser(tag) => {
                Type::user(tag, vals.get(&ups[0])?.clone())
            }
            GenericOp::UnwrapUser(tag) => {
                let v = vals.get(&ups[0])?;
                if !v.is_user_type_of(tag) {
                    return None;
                }
                v.unwrap_user()?
            }
            GenericOp::Math(op) => {
                let l = vals.get(&ups[0])?;
                let r = vals.get(&ups[1])?;
                match op {
                    MathOp::Add => typ::invariant_add(l, r)?,
                    MathOp::Sub => typ::invariant_sub(l, r)?,
                    MathOp::Mul => typ::invariant_mul(l, r)?,
                    MathOp::Div => typ::invariant_div(l, r)?,
                    MathOp::Mod => typ::invariant_mod(l, r)?,
                    MathOp::Equal => Type::boolean(l == r),
                    MathOp::Greater => Type::boolean(l > r),
                    MathOp::Less => Type::boolean(l < r),
                }
            }
            _ => return None,
        };
        vals.insert(id, v);
    }
    vals.remove(&formula)
}

/// A type proxy carrying a template and the symbolic expression of how
/// the value evolves with the induction counter. Structural queries
/// answer from the template and record their outcome as a rule.
pub struct RuleGenerator {
    template: Type,
    scev: GenericId,
    rules: Arc<RwLock<RuleSetInner>>,
}

impl std::fmt::Debug for RuleGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RuleGenerator({})", self.template)
    }
}

impl RuleGenerator {
    pub fn template(&self) -> &Type {
        &self.template
    }

    pub fn scev(&self) -> GenericId {
        self.scev
    }

    pub fn template_descriptor(&self) -> Option<&Tag> {
        self.template.descriptor()
    }

    fn derive(&self, template: Type, scev: GenericId) -> Type {
        Type::RuleGen(Arc::new(RuleGenerator {
            template,
            scev,
            rules: Arc::clone(&self.rules),
        }))
    }

    fn same_set(&self, other: &RuleGenerator) -> bool {
        Arc::ptr_eq(&self.rules, &other.rules)
    }

    pub fn is_pair(&self) -> bool {
        let b = self.template.is_tuple();
        self.rules.write().record_axiom(AxiomRule {
            key: self.scev,
            pred: Predicate::IsPair,
            invert: !b,
        });
        b
    }

    pub fn first(&self, lift: bool) -> Option<Type> {
        let fst = self.template.first()?;
        let mut inner = self.rules.write();
        inner.record_axiom(AxiomRule {
            key: self.scev,
            pred: Predicate::IsPair,
            invert: false,
        });
        if !lift {
            return Some(fst);
        }
        let scev = inner.scev.add(GenericOp::First, smallvec![self.scev]);
        drop(inner);
        Some(self.derive(fst, scev))
    }

    pub fn rest(&self, lift: bool) -> Option<Type> {
        let rst = self.template.rest()?;
        let mut inner = self.rules.write();
        inner.record_axiom(AxiomRule {
            key: self.scev,
            pred: Predicate::IsPair,
            invert: false,
        });
        if !lift {
            return Some(rst);
        }
        let scev = inner.scev.add(GenericOp::Rest, smallvec![self.scev]);
        drop(inner);
        Some(self.derive(rst, scev))
    }

    /// cons a first element onto the evolving value
    pub fn pair_to(&self, fst: &Type) -> Option<Type> {
        let fst_scev = match fst {
            Type::RuleGen(g) if self.same_set(g) => Some(g.scev),
            Type::RuleGen(_) => return None,
            _ => None,
        };
        let template = Type::tuple_raw(
            fst.fix(Fixing::NoRules),
            self.template.clone(),
        );
        let mut inner = self.rules.write();
        let fs = match fst_scev {
            Some(s) => s,
            None => inner.scev.add(
                GenericOp::Constant(fst.fix(Fixing::NoRules)),
                smallvec![],
            ),
        };
        let scev = inner.scev.add(GenericOp::Pair, smallvec![fs, self.scev]);
        drop(inner);
        Some(self.derive(template, scev))
    }

    pub fn unwrap_user(&self, lift: bool) -> Option<Type> {
        let tag = self.template.descriptor()?.clone();
        let content = self.template.unwrap_user()?;
        let mut inner = self.rules.write();
        inner.record_axiom(AxiomRule {
            key: self.scev,
            pred: Predicate::IsUser(tag.clone()),
            invert: false,
        });
        if !lift {
            return Some(content);
        }
        let scev = inner.scev.add(GenericOp::UnwrapUser(tag), smallvec![self.scev]);
        drop(inner);
        Some(self.derive(content, scev))
    }

    /// invariant addition lifted onto the evolution expression; no
    /// rule is recorded since arithmetic does not constrain the value
    pub fn add(&self, rhs: &Type) -> Option<Type> {
        let sum = typ::invariant_add(&self.template, &rhs.fix(Fixing::NoRules))?;
        let mut inner = self.rules.write();
        let r = inner
            .scev
            .add(GenericOp::Constant(rhs.fix(Fixing::NoRules)), smallvec![]);
        let scev =
            inner.scev.add(GenericOp::Math(MathOp::Add), smallvec![self.scev, r]);
        drop(inner);
        Some(self.derive(sum, scev))
    }

    pub fn sub(&self, rhs: &Type) -> Option<Type> {
        let diff = typ::invariant_sub(&self.template, &rhs.fix(Fixing::NoRules))?;
        let mut inner = self.rules.write();
        let r = inner
            .scev
            .add(GenericOp::Constant(rhs.fix(Fixing::NoRules)), smallvec![]);
        let scev =
            inner.scev.add(GenericOp::Math(MathOp::Sub), smallvec![self.scev, r]);
        drop(inner);
        Some(self.derive(diff, scev))
    }

    /// Ordering probe that pins its outcome. Numeric outcomes tighten
    /// a range rule; structural outcomes record an equality axiom.
    /// `reversed` flips the roles when the generator was the right
    /// operand.
    pub fn ordinal_probe(&self, rhs: &Type, reversed: bool) -> Ordering {
        let rhs_fixed = rhs.fix(Fixing::NoRules);
        let o = self.template.ordinal(&rhs_fixed);
        match (self.template.invariant_value(), rhs_fixed.invariant_value()) {
            (Some(_), Some(r)) => {
                let rule = match o {
                    Ordering::Less => RangeRule::maximum(r, true),
                    Ordering::Equal => RangeRule::exactly(r),
                    Ordering::Greater => RangeRule::minimum(r, true),
                };
                self.rules.write().record_range(self.scev, rule);
            }
            _ => {
                self.rules.write().record_axiom(AxiomRule {
                    key: self.scev,
                    pred: Predicate::Equals(rhs_fixed),
                    invert: o != Ordering::Equal,
                });
            }
        }
        if reversed { o.reverse() } else { o }
    }

    /// collapse to the template, optionally pinning what the caller
    /// will rely on
    pub fn fix(&self, fixing: Fixing) -> Type {
        let t = self.template.fix(Fixing::NoRules);
        match fixing {
            Fixing::NoRules => (),
            Fixing::SizedOnly => {
                self.rules.write().record_axiom(AxiomRule {
                    key: self.scev,
                    pred: Predicate::SizeEquals(t.size()),
                    invert: false,
                });
            }
            Fixing::WithRules => {
                self.rules.write().record_axiom(AxiomRule {
                    key: self.scev,
                    pred: Predicate::Equals(t.clone()),
                    invert: false,
                });
            }
        }
        t
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::typ::list;

    #[test]
    fn countdown_solves_to_depth() {
        // recursion consumes a counter: arg starts at 4, steps by -1,
        // body requires arg > 0
        let rules = TypeRuleSet::new();
        let g = rules.generator(Type::invariant_i64(4));
        // the body observed: arg > 0
        let zero = Type::invariant_i64(0);
        assert_eq!(g.ordinal_probe(&zero), Ordering::Greater);
        // inner recursion argument is arg - 1
        let inner = crate::typ::invariant_sub(&g, &Type::invariant_i64(1))
            .expect("rulegen sub");
        assert!(inner.is_rule_generator());
        rules.accept_more_rules(false);
        let bundle = rules
            .argument_bundle(&Type::invariant_i64(4), &inner.fix(Fixing::NoRules))
            .expect("closed form");
        assert_eq!(rules.infer(bundle, 0), Some(Type::invariant_i64(4)));
        assert_eq!(rules.infer(bundle, 1), Some(Type::invariant_i64(3)));
        // steps 0..=3 satisfy arg > 0; step 4 is arg == 0
        assert_eq!(rules.solve_recursion_depth(bundle), 4);
    }

    #[test]
    fn list_fold_solves_to_length() {
        // fold over (List<F32,4>, F32): each step drops one element
        let rules = TypeRuleSet::new();
        let outer = crate::typ::pair(list(Type::Float32, 4), Type::Float32);
        let g = rules.generator(outer.clone());
        // body projects: xs = first(arg), requires xs to be a pair
        let xs = g.first().expect("pair");
        assert!(xs.is_pair());
        let _head = xs.first().expect("head");
        let tail = xs.rest().expect("tail");
        let acc = g.rest().expect("acc");
        let inner = crate::typ::pair(tail, acc);
        rules.accept_more_rules(false);
        let bundle = rules
            .argument_bundle(&outer, &inner.fix(Fixing::NoRules))
            .expect("closed form");
        // after 4 steps xs is nil and is_pair fails
        assert_eq!(rules.solve_recursion_depth(bundle), 4);
    }

    #[test]
    fn range_rules_merge_by_tightening() {
        let mut r = RangeRule::minimum(Decimal::from(0), true);
        r.merge(&RangeRule::maximum(Decimal::from(10), false));
        assert!(r.contains(Decimal::from(5)));
        assert!(!r.contains(Decimal::from(0)));
        assert!(r.contains(Decimal::from(10)));
        r.merge(&RangeRule::maximum(Decimal::from(8), true));
        assert!(!r.contains(Decimal::from(8)));
    }
}
