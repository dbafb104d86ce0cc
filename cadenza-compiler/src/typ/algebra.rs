//! Algebraic operations over the type lattice: pair construction with
//! rule generator lifting, list chains, union merging and compile time
//! invariant arithmetic.

use super::Type;
use rust_decimal::Decimal;

/// Cons two types. When the rest is a rule generator the pair is
/// lifted into the generator's evolution expression so that structural
/// projections on the result stay solvable.
pub fn pair(fst: Type, rst: Type) -> Type {
    if let Type::RuleGen(g) = &rst {
        if let Some(t) = g.pair_to(&fst) {
            return t;
        }
    }
    Type::tuple_raw(fst, rst)
}

/// a tuple of `count` repetitions of `element`, not nil terminated;
/// the final cell holds two elements
pub fn tuple(element: Type, count: usize) -> Type {
    match count {
        0 => Type::Nil,
        1 => element,
        _ => chain(element.clone(), count - 1, element),
    }
}

/// a nil terminated list of `count` elements
pub fn list(element: Type, count: usize) -> Type {
    chain(element, count, Type::Nil)
}

/// `repeat` cons cells of `element` in front of `trailing`
pub fn chain(element: Type, repeat: usize, trailing: Type) -> Type {
    let mut t = trailing;
    for _ in 0..repeat {
        t = Type::tuple_raw(element.clone(), t);
    }
    t
}

/// Merge a subtype into a union. When `merge` is set and `head` is
/// already a union the variant is added to it, otherwise a fresh two
/// variant union is built. Duplicate variants collapse; variant order
/// is the ordinal type order so equal unions are structurally equal.
pub fn union_merge(head: Type, additional: Type, merge: bool) -> Type {
    let mut variants: Vec<Type> = Vec::new();
    let mut push = |t: Type| {
        if !variants.contains(&t) {
            variants.push(t)
        }
    };
    match (&head, merge) {
        (Type::Union(u), true) => {
            for v in u.variants.iter() {
                push(v.clone());
            }
        }
        _ => push(head.clone()),
    }
    match additional {
        Type::Union(u) => {
            for v in u.variants.iter() {
                push(v.clone());
            }
        }
        t => push(t),
    }
    if variants.len() == 1 {
        return variants.pop().unwrap_or(Type::Nil);
    }
    variants.sort();
    Type::union_of(variants)
}

fn lift<F>(lhs: &Type, rhs: &Type, f: F) -> Option<Type>
where
    F: Fn(Decimal, Decimal) -> Option<Decimal>,
{
    match (lhs, rhs) {
        (Type::Invariant(a), Type::Invariant(b)) => f(*a, *b).map(Type::Invariant),
        _ => None,
    }
}

/// Invariant addition; rule generators lift the operation into their
/// evolution expression.
pub fn invariant_add(lhs: &Type, rhs: &Type) -> Option<Type> {
    match (lhs, rhs) {
        (Type::RuleGen(g), r) => g.add(r),
        (l, Type::RuleGen(g)) => g.add(l),
        _ => lift(lhs, rhs, |a, b| a.checked_add(b)),
    }
}

pub fn invariant_sub(lhs: &Type, rhs: &Type) -> Option<Type> {
    match (lhs, rhs) {
        (Type::RuleGen(g), r) => g.sub(r),
        _ => lift(lhs, rhs, |a, b| a.checked_sub(b)),
    }
}

pub fn invariant_mul(lhs: &Type, rhs: &Type) -> Option<Type> {
    lift(lhs, rhs, |a, b| a.checked_mul(b))
}

pub fn invariant_div(lhs: &Type, rhs: &Type) -> Option<Type> {
    lift(lhs, rhs, |a, b| a.checked_div(b))
}

pub fn invariant_mod(lhs: &Type, rhs: &Type) -> Option<Type> {
    lift(lhs, rhs, |a, b| a.checked_rem(b))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn invariant_partial_evaluation() {
        let a = Type::invariant_i64(3);
        let b = Type::invariant_i64(2);
        assert_eq!(invariant_add(&a, &b), Some(Type::invariant_i64(5)));
        assert_eq!(invariant_sub(&a, &b), Some(Type::invariant_i64(1)));
        assert_eq!(invariant_mul(&a, &b), Some(Type::invariant_i64(6)));
        assert_eq!(invariant_add(&a, &Type::Float32), None);
    }

    #[test]
    fn union_merge_is_order_insensitive() {
        let a = union_merge(Type::Int32, Type::Float32, false);
        let b = union_merge(Type::Float32, Type::Int32, false);
        assert_eq!(a, b);
        assert_eq!(a.type_hash(), b.type_hash());
    }

    #[test]
    fn union_merge_deduplicates() {
        let u = union_merge(Type::Int32, Type::Int32, false);
        assert_eq!(u, Type::Int32);
        let u = union_merge(Type::Int32, Type::Float32, false);
        let u = union_merge(u, Type::Float32, true);
        assert_eq!(u.union_variants().map(|v| v.len()), Some(2));
    }
}
