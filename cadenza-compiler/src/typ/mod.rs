use crate::graph::GenericId;
use crate::rules::RuleGenerator;
use arcstr::ArcStr;
use fxhash::FxHasher64;
use rust_decimal::Decimal;
use std::{
    any::Any,
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    sync::LazyLock,
};
use triomphe::Arc;

mod algebra;

pub use algebra::{
    chain, invariant_add, invariant_div, invariant_mod, invariant_mul, invariant_sub,
    list, pair, tuple, union_merge,
};

/// Named descriptor behind user types and first class type values.
/// Tags compare by identity, the same way type descriptors are
/// singletons in the runtime symbol table.
#[derive(Clone)]
pub struct Tag(Arc<TagData>);

pub struct TagData {
    pub name: ArcStr,
    pub breakable: bool,
}

impl Tag {
    pub fn new(name: ArcStr) -> Self {
        Tag(Arc::new(TagData { name, breakable: true }))
    }

    pub fn opaque(name: ArcStr) -> Self {
        Tag(Arc::new(TagData { name, breakable: false }))
    }

    pub fn name(&self) -> &ArcStr {
        &self.0.name
    }

    /// may the content be destructured by user code
    pub fn breakable(&self) -> bool {
        self.0.breakable
    }

    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Tag {}

impl Hash for Tag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0.name)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

macro_rules! deftag {
    ($name:ident, $lit:literal) => {
        pub static $name: LazyLock<Tag> =
            LazyLock::new(|| Tag::opaque(arcstr::literal!($lit)));
    };
}

deftag!(FUNCTION, "Function");
deftag!(REACTIVE_RATE, "Reactive Rate");
deftag!(AUDIO_FILE, "Audio File");

/// Native scalar element kinds. These are the only types that exist at
/// run time outside of aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scalar {
    Float32,
    Float64,
    Int32,
    Int64,
}

impl Scalar {
    pub const fn size(&self) -> usize {
        match self {
            Scalar::Float32 | Scalar::Int32 => 4,
            Scalar::Float64 | Scalar::Int64 => 8,
        }
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, Scalar::Float32 | Scalar::Float64)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Scalar::Float32 => "Float32",
            Scalar::Float64 => "Float64",
            Scalar::Int32 => "Int32",
            Scalar::Int64 => "Int64",
        }
    }
}

/// A scalar or a SIMD vector of scalars. Width 1 is a plain scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NativeTy {
    pub elem: Scalar,
    pub width: u16,
}

impl NativeTy {
    pub const fn scalar(elem: Scalar) -> Self {
        NativeTy { elem, width: 1 }
    }

    pub const fn size(&self) -> usize {
        self.elem.size() * self.width as usize
    }
}

pub struct TupleData {
    pub fst: Type,
    pub rst: Type,
    hash: u64,
    size: usize,
    fixed: bool,
}

impl TupleData {
    fn new(fst: Type, rst: Type) -> Self {
        let mut h = FxHasher64::default();
        1337u64.hash(&mut h);
        fst.type_hash().hash(&mut h);
        rst.type_hash().hash(&mut h);
        let hash = h.finish();
        let size = fst.size() + rst.size();
        let fixed = fst.is_fixed() && rst.is_fixed();
        TupleData { fst, rst, hash, size, fixed }
    }
}

pub struct UnionData {
    pub variants: Box<[Type]>,
    hash: u64,
    size: usize,
}

impl UnionData {
    fn new(variants: Box<[Type]>) -> Self {
        let mut h = FxHasher64::default();
        1338u64.hash(&mut h);
        let mut size = 0;
        for t in variants.iter() {
            t.type_hash().hash(&mut h);
            size = size.max(t.size());
        }
        UnionData { variants, hash: h.finish(), size }
    }
}

/// Opaque refcounted payload carried through the type system on behalf
/// of external collaborators. Compares by identity.
#[derive(Clone)]
pub struct InternalRef(pub Arc<dyn Any + Send + Sync>);

impl InternalRef {
    fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl fmt::Debug for InternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InternalRef({:#x})", self.addr())
    }
}

/// Compile time type values. The kind set is closed; every transform in
/// the pipeline operates on this lattice.
///
/// A type is *fixed* when it contains no live rule generator. Only
/// fixed types may enter the specialization cache or cross between
/// transforms.
#[derive(Clone)]
pub enum Type {
    Nil,
    True,
    Float32,
    Float64,
    Int32,
    Int64,
    Vector(Scalar, u16),
    Invariant(Decimal),
    InvariantString(ArcStr),
    InvariantGraph(GenericId),
    TypeTag(Tag),
    Tuple(Arc<TupleData>),
    User(Tag, Arc<Type>),
    Union(Arc<UnionData>),
    ArrayView(Arc<Type>),
    RuleGen(Arc<RuleGenerator>),
    InternalRef(InternalRef),
}

impl Default for Type {
    fn default() -> Self {
        Type::Nil
    }
}

impl Type {
    pub fn invariant_i64(v: i64) -> Self {
        Type::Invariant(Decimal::from(v))
    }

    pub fn invariant_u64(v: u64) -> Self {
        Type::Invariant(Decimal::from(v))
    }

    pub fn boolean(b: bool) -> Self {
        if b { Type::True } else { Type::Nil }
    }

    pub fn native(nt: NativeTy) -> Self {
        if nt.width > 1 {
            Type::Vector(nt.elem, nt.width)
        } else {
            match nt.elem {
                Scalar::Float32 => Type::Float32,
                Scalar::Float64 => Type::Float64,
                Scalar::Int32 => Type::Int32,
                Scalar::Int64 => Type::Int64,
            }
        }
    }

    pub fn user(tag: &Tag, content: Type) -> Self {
        Type::User(tag.clone(), Arc::new(content))
    }

    pub fn array_view(elem: Type) -> Self {
        Type::ArrayView(Arc::new(elem))
    }

    /// kind rank for the ordinal total order; mirrors the fixed kind
    /// enumeration of the lattice
    fn rank(&self) -> i8 {
        match self {
            Type::ArrayView(_) => -9,
            Type::InternalRef(_) => -8,
            Type::InvariantString(_) => -7,
            Type::Union(_) => -6,
            Type::Tuple(_) => -5,
            Type::User(_, _) => -4,
            Type::InvariantGraph(_) => -3,
            Type::Invariant(_) => -2,
            Type::RuleGen(_) => -1,
            Type::Nil => 0,
            Type::True => 1,
            Type::TypeTag(_) => 2,
            Type::Float32 => 3,
            Type::Float64 => 4,
            Type::Int32 => 5,
            Type::Int64 => 6,
            Type::Vector(_, _) => 7,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Type::Nil)
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Type::True)
    }

    pub fn is_invariant(&self) -> bool {
        match self {
            Type::Invariant(_) => true,
            Type::RuleGen(g) => g.template().is_invariant(),
            _ => false,
        }
    }

    pub fn is_invariant_string(&self) -> bool {
        matches!(self, Type::InvariantString(_))
    }

    pub fn is_graph(&self) -> bool {
        matches!(self, Type::InvariantGraph(_))
    }

    pub fn is_type_tag(&self) -> bool {
        matches!(self, Type::TypeTag(_))
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Type::Tuple(_))
    }

    pub fn is_union(&self) -> bool {
        matches!(self, Type::Union(_))
    }

    pub fn is_array_view(&self) -> bool {
        matches!(self, Type::ArrayView(_))
    }

    pub fn is_rule_generator(&self) -> bool {
        matches!(self, Type::RuleGen(_))
    }

    pub fn is_user_type(&self) -> bool {
        match self {
            Type::User(_, _) => true,
            Type::RuleGen(g) => g.template().is_user_type(),
            _ => false,
        }
    }

    pub fn is_user_type_of(&self, tag: &Tag) -> bool {
        match self {
            Type::User(t, _) => t == tag,
            Type::RuleGen(g) => g.template().is_user_type_of(tag),
            _ => false,
        }
    }

    pub fn is_native(&self) -> bool {
        self.native_ty().is_some()
    }

    pub fn native_ty(&self) -> Option<NativeTy> {
        match self {
            Type::Float32 => Some(NativeTy::scalar(Scalar::Float32)),
            Type::Float64 => Some(NativeTy::scalar(Scalar::Float64)),
            Type::Int32 => Some(NativeTy::scalar(Scalar::Int32)),
            Type::Int64 => Some(NativeTy::scalar(Scalar::Int64)),
            Type::Vector(e, w) => Some(NativeTy { elem: *e, width: *w }),
            _ => None,
        }
    }

    /// Structural pair test. On a rule generator this is a speculative
    /// query: it records an axiom rule in the generator's rule set.
    pub fn is_pair(&self) -> bool {
        match self {
            Type::Tuple(_) => true,
            Type::RuleGen(g) => g.is_pair(),
            _ => false,
        }
    }

    pub fn descriptor(&self) -> Option<&Tag> {
        match self {
            Type::User(t, _) | Type::TypeTag(t) => Some(t),
            Type::RuleGen(g) => g.template_descriptor(),
            _ => None,
        }
    }

    pub fn invariant_value(&self) -> Option<Decimal> {
        match self {
            Type::Invariant(v) => Some(*v),
            Type::RuleGen(g) => g.template().invariant_value(),
            _ => None,
        }
    }

    pub fn invariant_i64_value(&self) -> Option<i64> {
        self.invariant_value().and_then(|d| i64::try_from(d).ok())
    }

    pub fn string_value(&self) -> Option<&ArcStr> {
        match self {
            Type::InvariantString(s) => Some(s),
            _ => None,
        }
    }

    pub fn graph_value(&self) -> Option<GenericId> {
        match self {
            Type::InvariantGraph(g) => Some(*g),
            _ => None,
        }
    }

    /// first element of a pair. On a rule generator the projection is
    /// lifted into the evolution expression and a pair axiom is
    /// recorded.
    pub fn first(&self) -> Option<Type> {
        match self {
            Type::Tuple(t) => Some(t.fst.clone()),
            Type::RuleGen(g) => g.first(true),
            _ => None,
        }
    }

    /// the trailing part of a pair, see [Type::first]
    pub fn rest(&self) -> Option<Type> {
        match self {
            Type::Tuple(t) => Some(t.rst.clone()),
            Type::RuleGen(g) => g.rest(true),
            _ => None,
        }
    }

    pub fn rest_n(&self, order: usize) -> Option<Type> {
        let mut t = self.clone();
        for _ in 0..order {
            t = t.rest()?;
        }
        Some(t)
    }

    /// n-th element; the last `rest` is returned whole when the chain
    /// ends before `index`
    pub fn element(&self, index: usize) -> Type {
        let mut t = self.clone();
        for _ in 0..index {
            match t.rest() {
                Some(r) => t = r,
                None => return t,
            }
        }
        t.first().unwrap_or(t)
    }

    pub fn unwrap_user(&self) -> Option<Type> {
        match self {
            Type::User(_, content) => Some((**content).clone()),
            Type::RuleGen(g) => g.unwrap_user(true),
            _ => None,
        }
    }

    pub fn union_variants(&self) -> Option<&[Type]> {
        match self {
            Type::Union(u) => Some(&u.variants),
            _ => None,
        }
    }

    pub fn array_view_element(&self) -> Option<Type> {
        match self {
            Type::ArrayView(e) => Some((**e).clone()),
            _ => None,
        }
    }

    pub fn rule_generator(&self) -> Option<&Arc<RuleGenerator>> {
        match self {
            Type::RuleGen(g) => Some(g),
            _ => None,
        }
    }

    /// total element count: 1 for all non tuples, 1 + arity(rst) for a
    /// tuple
    pub fn arity(&self) -> usize {
        let mut n = 1;
        let mut t = self;
        while let Type::Tuple(d) = t {
            n += 1;
            t = &d.rst;
        }
        n
    }

    /// number of leading cons cells whose first element equals `e`
    pub fn count_leading_elements(&self, e: &Type) -> usize {
        let mut n = 0;
        let mut t = self;
        while let Type::Tuple(d) = t {
            if &d.fst != e {
                break;
            }
            n += 1;
            t = &d.rst;
        }
        n
    }

    pub fn is_nil_terminated(&self) -> bool {
        let mut t = self;
        while let Type::Tuple(d) = t {
            t = &d.rst;
        }
        t.is_nil()
    }

    /// run time storage footprint in bytes; compile time values are
    /// zero sized
    pub fn size(&self) -> usize {
        match self {
            Type::Nil
            | Type::True
            | Type::Invariant(_)
            | Type::InvariantString(_)
            | Type::InvariantGraph(_)
            | Type::TypeTag(_)
            | Type::InternalRef(_) => 0,
            Type::Float32 | Type::Int32 => 4,
            Type::Float64 | Type::Int64 => 8,
            Type::Vector(e, w) => e.size() * *w as usize,
            Type::Tuple(d) => d.size,
            Type::User(_, c) => c.size(),
            Type::Union(u) => u.size + UNION_TAG_SIZE,
            Type::ArrayView(_) => ARRAY_VIEW_SIZE,
            Type::RuleGen(g) => g.template().size(),
        }
    }

    /// storage alignment in bytes
    pub fn align(&self) -> usize {
        match self {
            Type::Float32 | Type::Int32 => 4,
            Type::Float64 | Type::Int64 => 8,
            Type::Vector(e, w) => (e.size() * *w as usize).min(16),
            Type::Tuple(d) => d.fst.align().max(d.rst.align()),
            Type::User(_, c) => c.align(),
            Type::Union(u) => {
                u.variants.iter().map(|t| t.align()).max().unwrap_or(1).max(4)
            }
            Type::ArrayView(_) => 8,
            Type::RuleGen(g) => g.template().align(),
            _ => 1,
        }
    }

    pub fn is_fixed(&self) -> bool {
        match self {
            Type::RuleGen(_) => false,
            Type::Tuple(d) => d.fixed,
            Type::User(_, c) => c.is_fixed(),
            Type::Union(u) => u.variants.iter().all(|t| t.is_fixed()),
            Type::ArrayView(e) => e.is_fixed(),
            _ => true,
        }
    }

    /// Collapse rule generators to their template types.
    ///
    /// `Fixing::WithRules` records the constraints that pin the
    /// template down; `Fixing::NoRules` reads the template silently and
    /// is only safe where the result does not steer specialization.
    pub fn fix(&self, fixing: Fixing) -> Type {
        match self {
            Type::RuleGen(g) => g.fix(fixing),
            Type::Tuple(d) if !d.fixed => {
                pair(d.fst.fix(fixing), d.rst.fix(fixing))
            }
            Type::User(t, c) if !c.is_fixed() => {
                Type::User(t.clone(), Arc::new(c.fix(fixing)))
            }
            Type::Union(u) if !self.is_fixed() => {
                let vs: Vec<Type> = u.variants.iter().map(|t| t.fix(fixing)).collect();
                Type::union_of(vs)
            }
            Type::ArrayView(e) if !e.is_fixed() => {
                Type::ArrayView(Arc::new(e.fix(fixing)))
            }
            t => t.clone(),
        }
    }

    pub(crate) fn tuple_raw(fst: Type, rst: Type) -> Type {
        Type::Tuple(Arc::new(TupleData::new(fst, rst)))
    }

    pub(crate) fn union_of(variants: Vec<Type>) -> Type {
        Type::Union(Arc::new(UnionData::new(variants.into_boxed_slice())))
    }

    /// stable structural hash; equal types hash equal
    pub fn type_hash(&self) -> u64 {
        let mut h = FxHasher64::default();
        self.rank().hash(&mut h);
        match self {
            Type::Nil
            | Type::True
            | Type::Float32
            | Type::Float64
            | Type::Int32
            | Type::Int64 => (),
            Type::Vector(e, w) => {
                e.hash(&mut h);
                w.hash(&mut h)
            }
            Type::Invariant(d) => d.hash(&mut h),
            Type::InvariantString(s) => s.hash(&mut h),
            Type::InvariantGraph(g) => g.hash(&mut h),
            Type::TypeTag(t) => t.hash(&mut h),
            Type::Tuple(d) => return d.hash,
            Type::User(t, c) => {
                t.hash(&mut h);
                c.type_hash().hash(&mut h)
            }
            Type::Union(u) => return u.hash,
            Type::ArrayView(e) => e.type_hash().hash(&mut h),
            Type::RuleGen(g) => g.template().type_hash().hash(&mut h),
            Type::InternalRef(r) => r.addr().hash(&mut h),
        }
        h.finish()
    }

    /// Total order over the lattice: kind rank first, then payload.
    /// This is the *silent* comparison used for map keys and driver
    /// ordering; speculative comparisons that should record rules go
    /// through [Type::ordinal_probe].
    pub fn ordinal(&self, rhs: &Type) -> Ordering {
        match self.rank().cmp(&rhs.rank()) {
            Ordering::Equal => (),
            o => return o,
        }
        match (self, rhs) {
            (Type::Vector(e0, w0), Type::Vector(e1, w1)) => {
                e0.cmp(e1).then(w0.cmp(w1))
            }
            (Type::Invariant(a), Type::Invariant(b)) => a.cmp(b),
            (Type::InvariantString(a), Type::InvariantString(b)) => a.cmp(b),
            (Type::InvariantGraph(a), Type::InvariantGraph(b)) => a.cmp(b),
            (Type::TypeTag(a), Type::TypeTag(b)) => a.addr().cmp(&b.addr()),
            (Type::Tuple(a), Type::Tuple(b)) => {
                a.fst.ordinal(&b.fst).then_with(|| a.rst.ordinal(&b.rst))
            }
            (Type::User(t0, c0), Type::User(t1, c1)) => {
                t0.addr().cmp(&t1.addr()).then_with(|| c0.ordinal(c1))
            }
            (Type::Union(a), Type::Union(b)) => {
                a.variants.len().cmp(&b.variants.len()).then_with(|| {
                    for (x, y) in a.variants.iter().zip(b.variants.iter()) {
                        match x.ordinal(y) {
                            Ordering::Equal => (),
                            o => return o,
                        }
                    }
                    Ordering::Equal
                })
            }
            (Type::ArrayView(a), Type::ArrayView(b)) => a.ordinal(b),
            (Type::RuleGen(a), Type::RuleGen(b)) => {
                a.template().ordinal(b.template())
            }
            (Type::InternalRef(a), Type::InternalRef(b)) => a.addr().cmp(&b.addr()),
            _ => Ordering::Equal,
        }
    }

    /// Comparison that witnesses the outcome: when either side is a
    /// rule generator the result is pinned by a recorded rule so the
    /// speculative branch stays valid for the solved repeat range.
    pub fn ordinal_probe(&self, rhs: &Type) -> Ordering {
        match (self, rhs) {
            (Type::RuleGen(g), _) => g.ordinal_probe(rhs, false),
            (_, Type::RuleGen(g)) => g.ordinal_probe(self, true),
            (Type::Tuple(a), Type::Tuple(b)) => a
                .fst
                .ordinal_probe(&b.fst)
                .then_with(|| a.rst.ordinal_probe(&b.rst)),
            (Type::User(t0, c0), Type::User(t1, c1)) if t0 == t1 => {
                c0.ordinal_probe(c1)
            }
            _ => self.ordinal(rhs),
        }
    }

    /// equality that records rules on rule generators, see
    /// [Type::ordinal_probe]
    pub fn eq_probe(&self, rhs: &Type) -> bool {
        self.ordinal_probe(rhs) == Ordering::Equal
    }
}

/// runtime union dispatch tag word
pub const UNION_TAG_SIZE: usize = 4;
/// {pointer, length} fat reference
pub const ARRAY_VIEW_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fixing {
    NoRules,
    SizedOnly,
    WithRules,
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        self.ordinal(other) == Ordering::Equal
    }
}

impl Eq for Type {}

impl PartialOrd for Type {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.ordinal(other))
    }
}

impl Ord for Type {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordinal(other)
    }
}

impl Hash for Type {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.type_hash())
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Nil => write!(f, "nil"),
            Type::True => write!(f, "#t"),
            Type::Float32 => write!(f, "Float32"),
            Type::Float64 => write!(f, "Float64"),
            Type::Int32 => write!(f, "Int32"),
            Type::Int64 => write!(f, "Int64"),
            Type::Vector(e, w) => write!(f, "{}x{w}", e.name()),
            Type::Invariant(d) => write!(f, "#{d}"),
            Type::InvariantString(s) => write!(f, "{s:?}"),
            Type::InvariantGraph(g) => write!(f, "<graph {g:?}>"),
            Type::TypeTag(t) => write!(f, "#{t}"),
            Type::Tuple(d) => {
                write!(f, "({}", d.fst)?;
                let mut t = &d.rst;
                loop {
                    match t {
                        Type::Tuple(d) => {
                            write!(f, " {}", d.fst)?;
                            t = &d.rst;
                        }
                        Type::Nil => break write!(f, ")"),
                        other => break write!(f, " . {other})"),
                    }
                }
            }
            Type::User(t, c) => write!(f, "{t}{{{c}}}"),
            Type::Union(u) => {
                write!(f, "<")?;
                for (i, v) in u.variants.iter().enumerate() {
                    if i > 0 {
                        write!(f, "|")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ">")
            }
            Type::ArrayView(e) => write!(f, "[{e}]"),
            Type::RuleGen(g) => write!(f, "~{}", g.template()),
            Type::InternalRef(r) => write!(f, "{r:?}"),
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn arb_fixed_type() -> impl Strategy<Value = Type> {
        let leaf = prop_oneof![
            Just(Type::Nil),
            Just(Type::True),
            Just(Type::Float32),
            Just(Type::Float64),
            Just(Type::Int32),
            Just(Type::Int64),
            (0i64..1000).prop_map(Type::invariant_i64),
            any::<u16>().prop_filter("nonzero", |w| *w > 0).prop_map(|w| {
                Type::Vector(Scalar::Float32, w.clamp(1, 16))
            }),
            "[a-z]{1,8}".prop_map(|s| Type::InvariantString(s.as_str().into())),
        ];
        leaf.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                (inner.clone(), inner.clone())
                    .prop_map(|(a, b)| Type::tuple_raw(a, b)),
                inner
                    .clone()
                    .prop_map(|t| Type::user(&FUNCTION, t)),
                inner.prop_map(|t| Type::array_view(t)),
            ]
        })
    }

    proptest! {
        #[test]
        fn hash_stable_under_clone(t in arb_fixed_type()) {
            let c = t.clone();
            prop_assert_eq!(t.type_hash(), c.type_hash());
            prop_assert_eq!(&t, &c);
        }

        #[test]
        fn equal_types_hash_equal(a in arb_fixed_type(), b in arb_fixed_type()) {
            if a == b {
                prop_assert_eq!(a.type_hash(), b.type_hash());
            }
        }

        #[test]
        fn ordinal_is_total(a in arb_fixed_type(), b in arb_fixed_type()) {
            let ab = a.ordinal(&b);
            let ba = b.ordinal(&a);
            prop_assert_eq!(ab, ba.reverse());
        }
    }

    #[test]
    fn arity_and_leading() {
        let l = list(Type::Float32, 4);
        assert_eq!(l.arity(), 5); // 4 elements + nil terminator
        assert_eq!(l.count_leading_elements(&Type::Float32), 4);
        assert!(l.is_nil_terminated());
        assert_eq!(l.size(), 16);
    }

    #[test]
    fn tuple_is_not_special_listed() {
        let t = pair(Type::Float32, Type::Int32);
        assert_eq!(t.arity(), 2);
        assert!(!t.is_nil_terminated());
        assert_eq!(t.element(0), Type::Float32);
        assert_eq!(t.element(1), Type::Int32);
    }

    #[test]
    fn union_size_uniform() {
        let u = union_merge(Type::Int32, Type::Float32, false);
        assert_eq!(u.union_variants().map(|v| v.len()), Some(2));
        assert_eq!(u.size(), 4 + UNION_TAG_SIZE);
    }

    #[test]
    fn invariants_are_zero_size() {
        assert_eq!(Type::invariant_i64(42).size(), 0);
        assert_eq!(pair(Type::invariant_i64(1), Type::Nil).size(), 0);
    }
}
