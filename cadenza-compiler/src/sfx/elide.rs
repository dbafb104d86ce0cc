//! Copy elision over the imperative IR: a forward rewrite to a
//! fixpoint of three rules. A value about to be stored into a buffer
//! that dominates its single use is computed directly into that
//! buffer, aliasing and zero sized stores vanish, and pair chains
//! that reconstruct their upstream fold away. Running the pass on its
//! own output is the identity.

use super::ptr_ty;
use crate::graph::{
    typed::{CopyMode, TypedOp},
    TypedGraph, TypedId,
};
use fxhash::{FxHashMap, FxHashSet};
use log::debug;
use smallvec::smallvec;

/// nodes reachable from `root` including interior subgraph roots
fn full_order(g: &TypedGraph, root: TypedId) -> Vec<TypedId> {
    let mut order = Vec::new();
    let mut pending = vec![root];
    let mut seen: FxHashSet<TypedId> = FxHashSet::default();
    while let Some(r) = pending.pop() {
        for id in g.postorder(r) {
            if seen.insert(id) {
                order.push(id);
                for sub in g.op(id).subgraphs() {
                    pending.push(sub);
                }
            }
        }
    }
    order
}

fn resolve(map: &FxHashMap<TypedId, TypedId>, mut id: TypedId) -> TypedId {
    while let Some(&n) = map.get(&id) {
        if n == id {
            break;
        }
        id = n;
    }
    id
}

/// the structural rewrites that replace a node without creating any
fn rewrite(g: &TypedGraph, id: TypedId) -> Option<TypedId> {
    match g.op(id) {
        // pair(first(x), rest(x)) -> x
        TypedOp::Pair => {
            let f = g.up(id, 0);
            let r = g.up(id, 1);
            if let (TypedOp::First, TypedOp::Rest) = (g.op(f), g.op(r)) {
                let x = g.up(f, 0);
                if x == g.up(r, 0) && g.ty(x) == g.ty(id) {
                    return Some(x);
                }
            }
            None
        }
        TypedOp::Copy { size, .. } => {
            let dst = g.up(id, 0);
            let src = g.up(id, 1);
            // a store that reads back its own destination aliases away
            if let TypedOp::Dereference = g.op(src) {
                if g.up(src, 0) == dst {
                    return Some(dst);
                }
            }
            // zero sized stores do nothing
            if *size == 0 {
                return Some(dst);
            }
            if let TypedOp::Constant { data } = g.op(src) {
                if data.is_empty() {
                    return Some(dst);
                }
            }
            None
        }
        _ => None,
    }
}

/// Compute-into-destination: a store whose source is a producer with
/// exactly this one use computes straight into the destination
/// instead of materializing a temporary. A pair splits into direct
/// stores of its halves; a loaded aggregate becomes one block copy.
fn compute_into(
    g: &mut TypedGraph,
    id: TypedId,
    uses: &FxHashMap<TypedId, u32>,
) -> Option<TypedId> {
    let size = match g.op(id) {
        TypedOp::Copy { size, mode: CopyMode::Store, repeat: 1 } => *size,
        _ => return None,
    };
    let dst = g.up(id, 0);
    let src = g.up(id, 1);
    if uses.get(&src).copied().unwrap_or(0) != 1 {
        return None;
    }
    let rx = g.reactivity(id);
    let mut created: smallvec::SmallVec<[TypedId; 4]> = smallvec![];
    let new = match g.op(src).clone() {
        TypedOp::Pair => {
            let a = g.up(src, 0);
            let b = g.up(src, 1);
            let asz = g.ty(a).size();
            let bsz = g.ty(b).size();
            if asz + bsz != size {
                return None;
            }
            let head = if asz > 0 {
                let c = g.add(
                    TypedOp::Copy { size: asz, mode: CopyMode::Store, repeat: 1 },
                    smallvec![dst, a],
                    ptr_ty(),
                );
                created.push(c);
                c
            } else {
                dst
            };
            if bsz == 0 {
                head
            } else {
                let off = g.add(
                    TypedOp::Offset { bytes: asz as i64 },
                    smallvec![head],
                    ptr_ty(),
                );
                let tail = g.add(
                    TypedOp::Copy { size: bsz, mode: CopyMode::Store, repeat: 1 },
                    smallvec![off, b],
                    ptr_ty(),
                );
                let whole = g.add(TypedOp::Deps, smallvec![head, tail], ptr_ty());
                created.push(off);
                created.push(tail);
                created.push(whole);
                whole
            }
        }
        TypedOp::Dereference if g.ty(src).native_ty().is_none() => {
            let p = g.up(src, 0);
            let c = g.add(
                TypedOp::Copy { size, mode: CopyMode::MemCpy, repeat: 1 },
                smallvec![dst, p],
                ptr_ty(),
            );
            created.push(c);
            c
        }
        _ => return None,
    };
    for n in created {
        g.set_reactivity(n, rx);
    }
    Some(new)
}

/// Run copy elision to a fixpoint; returns the (possibly replaced)
/// root. Idempotent: a second run finds nothing to rewrite.
pub fn elide_copies(g: &mut TypedGraph, root: TypedId) -> TypedId {
    let mut root = root;
    loop {
        let order = full_order(g, root);
        let mut uses: FxHashMap<TypedId, u32> = FxHashMap::default();
        for &id in &order {
            for &u in g.ups(id) {
                if u != id {
                    *uses.entry(u).or_insert(0) += 1;
                }
            }
        }
        let mut map: FxHashMap<TypedId, TypedId> = FxHashMap::default();
        for &id in &order {
            if let Some(to) = rewrite(g, id) {
                map.insert(id, to);
            }
        }
        // the destination rewrite creates nodes, so it runs after the
        // structural matcher and never on an already replaced store; a
        // store whose source is folding this round waits for the next
        for &id in &order {
            if map.contains_key(&id) {
                continue;
            }
            if let TypedOp::Copy { .. } = g.op(id) {
                if map.contains_key(&g.up(id, 1)) {
                    continue;
                }
            }
            if let Some(to) = compute_into(g, id, &uses) {
                map.insert(id, to);
            }
        }
        if map.is_empty() {
            return root;
        }
        debug!("copy elision rewrote {} nodes", map.len());
        for &id in &order {
            if map.contains_key(&id) {
                continue;
            }
            let ups: Vec<TypedId> = g.ups(id).to_vec();
            for (slot, u) in ups.into_iter().enumerate() {
                let r = resolve(&map, u);
                if r != u {
                    g.patch_up(id, slot, r);
                }
            }
            let op = g.op(id).clone();
            let mapped = op.clone().map_subgraphs(|s| resolve(&map, s));
            if mapped != op {
                let ty = g.ty(id).clone();
                g.replace_op(id, mapped, ty);
            }
        }
        root = resolve(&map, root);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::typed::BufferAlloc;
    use crate::typ::{self, Type};
    use smallvec::smallvec;

    #[test]
    fn pair_of_projections_folds() {
        let mut g = TypedGraph::new();
        let ty = typ::pair(Type::Float32, Type::Int32);
        let x = g.add(TypedOp::Argument, smallvec![], ty.clone());
        let f = g.add(TypedOp::First, smallvec![x], Type::Float32);
        let r = g.add(TypedOp::Rest, smallvec![x], Type::Int32);
        let p = g.add(TypedOp::Pair, smallvec![f, r], ty);
        let root = elide_copies(&mut g, p);
        assert_eq!(root, x);
    }

    #[test]
    fn aliasing_store_is_removed() {
        let mut g = TypedGraph::new();
        let buf = g.add(
            TypedOp::Buffer { alloc: BufferAlloc::Stack, size: 4, align: 4 },
            smallvec![],
            Type::Int64,
        );
        let v = g.add(TypedOp::Dereference, smallvec![buf], Type::Float32);
        let cp = g.add(
            TypedOp::Copy { size: 4, mode: CopyMode::Store, repeat: 1 },
            smallvec![buf, v],
            Type::Int64,
        );
        let root = elide_copies(&mut g, cp);
        assert_eq!(root, buf);
    }

    #[test]
    fn pair_store_computes_into_the_destination() {
        // the pair dominates its single use: both halves land in the
        // buffer directly, the temporary never exists
        let mut g = TypedGraph::new();
        let buf = g.add(
            TypedOp::Buffer { alloc: BufferAlloc::Stack, size: 8, align: 4 },
            smallvec![],
            Type::Int64,
        );
        let x = g.add(TypedOp::Argument, smallvec![], Type::Float32);
        let y = g.add(TypedOp::Argument, smallvec![], Type::Int32);
        let p = g.add(
            TypedOp::Pair,
            smallvec![x, y],
            typ::pair(Type::Float32, Type::Int32),
        );
        let cp = g.add(
            TypedOp::Copy { size: 8, mode: CopyMode::Store, repeat: 1 },
            smallvec![buf, p],
            Type::Int64,
        );
        let root = elide_copies(&mut g, cp);
        let order = g.postorder(root);
        assert!(!order.contains(&p), "pair temporary still materialized");
        let copies = order
            .iter()
            .filter(|id| matches!(g.op(**id), TypedOp::Copy { .. }))
            .count();
        assert_eq!(copies, 2);
        assert!(order
            .iter()
            .any(|id| matches!(g.op(*id), TypedOp::Offset { bytes: 4 })));
        // the value of the store is still the destination pointer
        assert!(matches!(g.op(root), TypedOp::Deps));
        assert_eq!(g.up(g.up(root, 0), 0), buf);
    }

    #[test]
    fn loaded_aggregate_copies_into_the_destination() {
        let mut g = TypedGraph::new();
        let ty = typ::pair(Type::Float32, Type::Float32);
        let src_buf = g.add(
            TypedOp::Buffer { alloc: BufferAlloc::Stack, size: 8, align: 4 },
            smallvec![],
            Type::Int64,
        );
        let dst_buf = g.add(
            TypedOp::Buffer { alloc: BufferAlloc::Module, size: 8, align: 4 },
            smallvec![],
            Type::Int64,
        );
        let ld = g.add(TypedOp::Dereference, smallvec![src_buf], ty);
        let cp = g.add(
            TypedOp::Copy { size: 8, mode: CopyMode::Store, repeat: 1 },
            smallvec![dst_buf, ld],
            Type::Int64,
        );
        let root = elide_copies(&mut g, cp);
        match g.op(root) {
            TypedOp::Copy { mode: CopyMode::MemCpy, size: 8, repeat: 1 } => {
                assert_eq!(g.up(root, 0), dst_buf);
                assert_eq!(g.up(root, 1), src_buf);
            }
            op => panic!("expected a block copy, got {op:?}"),
        }
    }

    #[test]
    fn shared_producers_stay_materialized() {
        // the pair has a second consumer, so nothing may compute into
        // the store's destination
        let mut g = TypedGraph::new();
        let buf = g.add(
            TypedOp::Buffer { alloc: BufferAlloc::Stack, size: 8, align: 4 },
            smallvec![],
            Type::Int64,
        );
        let x = g.add(TypedOp::Argument, smallvec![], Type::Float32);
        let y = g.add(TypedOp::Argument, smallvec![], Type::Int32);
        let ty = typ::pair(Type::Float32, Type::Int32);
        let p = g.add(TypedOp::Pair, smallvec![x, y], ty.clone());
        let cp = g.add(
            TypedOp::Copy { size: 8, mode: CopyMode::Store, repeat: 1 },
            smallvec![buf, p],
            Type::Int64,
        );
        let keep = g.add(TypedOp::First, smallvec![p], Type::Float32);
        let root = g.add(TypedOp::Deps, smallvec![cp, keep], Type::Int64);
        let root = elide_copies(&mut g, root);
        assert!(g.postorder(root).contains(&p));
    }

    #[test]
    fn elision_is_idempotent() {
        let mut g = TypedGraph::new();
        let ty = typ::pair(Type::Float32, Type::Int32);
        let x = g.add(TypedOp::Argument, smallvec![], ty.clone());
        let f = g.add(TypedOp::First, smallvec![x], Type::Float32);
        let r = g.add(TypedOp::Rest, smallvec![x], Type::Int32);
        let p = g.add(TypedOp::Pair, smallvec![f, r], ty.clone());
        let buf = g.add(
            TypedOp::Buffer { alloc: BufferAlloc::Stack, size: 8, align: 4 },
            smallvec![],
            Type::Int64,
        );
        let cp = g.add(
            TypedOp::Copy { size: 8, mode: CopyMode::Store, repeat: 1 },
            smallvec![buf, p],
            Type::Int64,
        );
        let r1 = elide_copies(&mut g, cp);
        let h1 = g.graph_hash(r1);
        let r2 = elide_copies(&mut g, r1);
        assert_eq!(r1, r2);
        assert_eq!(h1, g.graph_hash(r2));
    }
}
