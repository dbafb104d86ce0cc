//! Arena allocated expression graphs. Nodes are immutable once pushed
//! and identified by typed indices; an arena owns every node created
//! through it and is dropped as a whole. The two sanctioned late
//! mutations are patching a reserved cycle edge before the arena is
//! sealed and the reactivity assignment performed by reactive
//! analysis.

use crate::typ::{Fixing, Type};
use fxhash::{FxHashMap, FxHasher64};
use smallvec::SmallVec;
use std::{
    fmt,
    hash::{Hash, Hasher},
};

pub mod generic;
pub mod typed;

pub use generic::{GenericOp, MathOp, TimeBase};
pub use typed::{BufferAlloc, CopyMode, TypedOp};

macro_rules! arena_id {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub fn index(&self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

arena_id!(GenericId);
arena_id!(TypedId);
arena_id!(RxId);

#[derive(Debug, Clone)]
pub struct GenericNode {
    pub op: GenericOp,
    pub ups: SmallVec<[GenericId; 2]>,
    /// byte offset into the source text, resolved to a position by the
    /// diagnostic sink
    pub pos: u32,
    hash: u64,
    refs: u32,
}

impl GenericNode {
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// approximate downstream count, used to decide whether transform
    /// results for this node are worth memoizing
    pub fn refs(&self) -> u32 {
        self.refs
    }
}

/// The untyped expression arena. Nodes are hash consed so structurally
/// equal subgraphs share an id and the graph hash is stable.
#[derive(Debug, Default)]
pub struct GenericGraph {
    nodes: Vec<GenericNode>,
    dedup: FxHashMap<u64, SmallVec<[GenericId; 1]>>,
}

impl GenericGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: GenericId) -> &GenericNode {
        &self.nodes[id.index()]
    }

    pub fn op(&self, id: GenericId) -> &GenericOp {
        &self.nodes[id.index()].op
    }

    pub fn ups(&self, id: GenericId) -> &[GenericId] {
        &self.nodes[id.index()].ups
    }

    pub fn up(&self, id: GenericId, i: usize) -> GenericId {
        self.nodes[id.index()].ups[i]
    }

    fn node_hash(&self, op: &GenericOp, ups: &[GenericId]) -> u64 {
        let mut h = FxHasher64::default();
        op.local_hash().hash(&mut h);
        for u in ups {
            self.nodes[u.index()].hash.hash(&mut h);
        }
        h.finish()
    }

    fn bump_refs(&mut self, ups: &[GenericId]) {
        for u in ups {
            self.nodes[u.index()].refs += 1;
        }
    }

    /// Intern a node. Structurally identical pure nodes collapse to
    /// one id; stateful constructs always get a fresh identity.
    pub fn add(&mut self, op: GenericOp, ups: impl Into<SmallVec<[GenericId; 2]>>) -> GenericId {
        self.add_at(op, ups, 0)
    }

    pub fn add_at(
        &mut self,
        op: GenericOp,
        ups: impl Into<SmallVec<[GenericId; 2]>>,
        pos: u32,
    ) -> GenericId {
        let ups = ups.into();
        let hash = self.node_hash(&op, &ups);
        if op.pure() {
            if let Some(ids) = self.dedup.get(&hash) {
                for &id in ids {
                    let n = &self.nodes[id.index()];
                    if n.op == op && n.ups == ups {
                        return id;
                    }
                }
            }
        }
        let id = GenericId(self.nodes.len() as u32);
        self.bump_refs(&ups);
        self.nodes.push(GenericNode { op, ups, pos, hash, refs: 0 });
        if self.nodes[id.index()].op.pure() {
            self.dedup.entry(hash).or_default().push(id);
        }
        id
    }

    /// Reserve a node whose upstreams are not all known yet; the cycle
    /// closing edge is patched in with [GenericGraph::patch_up] once
    /// the rest of the walk completes. Reserved nodes are never
    /// interned.
    pub fn reserve(&mut self, op: GenericOp, arity: usize) -> GenericId {
        let id = GenericId(self.nodes.len() as u32);
        let ups: SmallVec<[GenericId; 2]> = (0..arity).map(|_| id).collect();
        let mut h = FxHasher64::default();
        op.local_hash().hash(&mut h);
        id.0.hash(&mut h);
        let hash = h.finish();
        self.nodes.push(GenericNode { op, ups, pos: 0, hash, refs: 0 });
        id
    }

    pub fn patch_up(&mut self, id: GenericId, slot: usize, up: GenericId) {
        self.nodes[up.index()].refs += 1;
        self.nodes[id.index()].ups[slot] = up;
    }

    /// stable hash of the subgraph rooted at `id`
    pub fn graph_hash(&self, id: GenericId) -> u64 {
        self.nodes[id.index()].hash
    }

    /// postorder walk over the subgraph rooted at `root`
    pub fn postorder(&self, root: GenericId) -> Vec<GenericId> {
        postorder_walk(root, |id| SmallVec::from_slice(self.ups(id)))
    }

    /// identity copy of the subgraph rooted at `root` in `src` into
    /// this arena
    pub fn import(&mut self, src: &GenericGraph, root: GenericId) -> GenericId {
        let mut map: FxHashMap<GenericId, GenericId> = FxHashMap::default();
        for id in src.postorder(root) {
            let n = src.node(id);
            let ups: SmallVec<[GenericId; 2]> =
                n.ups.iter().map(|u| map[u]).collect();
            let new = self.add_at(n.op.clone(), ups, n.pos);
            map.insert(id, new);
        }
        map[&root]
    }
}

#[derive(Debug, Clone)]
pub struct TypedNode {
    pub op: TypedOp,
    pub ups: SmallVec<[TypedId; 2]>,
    /// the fixed result type of this node
    pub ty: Type,
    hash: u64,
}

impl TypedNode {
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// The typed expression arena produced by specialization and rewritten
/// by the later passes. Carries the late bound reactivity assignment
/// alongside the nodes.
#[derive(Debug, Default)]
pub struct TypedGraph {
    nodes: Vec<TypedNode>,
    rx: Vec<Option<RxId>>,
    dedup: FxHashMap<u64, SmallVec<[TypedId; 1]>>,
}

impl TypedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: TypedId) -> &TypedNode {
        &self.nodes[id.index()]
    }

    pub fn op(&self, id: TypedId) -> &TypedOp {
        &self.nodes[id.index()].op
    }

    pub fn ty(&self, id: TypedId) -> &Type {
        &self.nodes[id.index()].ty
    }

    pub fn ups(&self, id: TypedId) -> &[TypedId] {
        &self.nodes[id.index()].ups
    }

    pub fn up(&self, id: TypedId, i: usize) -> TypedId {
        self.nodes[id.index()].ups[i]
    }

    pub fn reactivity(&self, id: TypedId) -> Option<RxId> {
        self.rx[id.index()]
    }

    /// late reactivity assignment; only reactive analysis calls this
    pub fn set_reactivity(&mut self, id: TypedId, rx: Option<RxId>) {
        self.rx[id.index()] = rx;
    }

    fn node_hash(&self, op: &TypedOp, ups: &[TypedId], ty: &Type) -> u64 {
        let mut h = FxHasher64::default();
        op.local_hash().hash(&mut h);
        ty.type_hash().hash(&mut h);
        for u in ups {
            self.nodes[u.index()].hash.hash(&mut h);
        }
        h.finish()
    }

    pub fn add(
        &mut self,
        op: TypedOp,
        ups: impl Into<SmallVec<[TypedId; 2]>>,
        ty: Type,
    ) -> TypedId {
        let ups = ups.into();
        let hash = self.node_hash(&op, &ups, &ty);
        if op.pure() {
            if let Some(ids) = self.dedup.get(&hash) {
                for &id in ids {
                    let n = &self.nodes[id.index()];
                    if n.op == op && n.ups == ups && n.ty == ty {
                        return id;
                    }
                }
            }
        }
        let id = TypedId(self.nodes.len() as u32);
        self.nodes.push(TypedNode { op, ups, ty, hash });
        self.rx.push(None);
        if self.nodes[id.index()].op.pure() {
            self.dedup.entry(hash).or_default().push(id);
        }
        id
    }

    /// see [GenericGraph::reserve]
    pub fn reserve(&mut self, op: TypedOp, arity: usize, ty: Type) -> TypedId {
        let id = TypedId(self.nodes.len() as u32);
        let ups: SmallVec<[TypedId; 2]> = (0..arity).map(|_| id).collect();
        let mut h = FxHasher64::default();
        op.local_hash().hash(&mut h);
        id.0.hash(&mut h);
        let hash = h.finish();
        self.nodes.push(TypedNode { op, ups, ty, hash });
        self.rx.push(None);
        id
    }

    pub fn patch_up(&mut self, id: TypedId, slot: usize, up: TypedId) {
        self.nodes[id.index()].ups[slot] = up;
    }

    pub fn graph_hash(&self, id: TypedId) -> u64 {
        self.nodes[id.index()].hash
    }

    /// nil constant; the unit value every zero sized result collapses to
    pub fn nil(&mut self) -> TypedId {
        self.add(TypedOp::constant(Type::Nil), SmallVec::new(), Type::Nil)
    }

    /// Identity copy of the subgraph rooted at `root` in `src` into
    /// this arena. Crossing from a shorter lived region into a longer
    /// lived one always goes through this walk; interior subgraph
    /// references (function bodies, sequence parts) are remapped along
    /// with the upstream edges.
    pub fn import(&mut self, src: &TypedGraph, root: TypedId) -> TypedId {
        // gather every node including interior subgraph roots
        let mut order: Vec<TypedId> = Vec::new();
        let mut pending = vec![root];
        let mut seen: fxhash::FxHashSet<TypedId> = fxhash::FxHashSet::default();
        while let Some(r) = pending.pop() {
            for id in src.postorder(r) {
                if seen.insert(id) {
                    order.push(id);
                    for sub in src.op(id).subgraphs() {
                        pending.push(sub);
                    }
                }
            }
        }
        // reserve copies first so cycles resolve, then patch edges
        let mut map: FxHashMap<TypedId, TypedId> = FxHashMap::default();
        for &id in &order {
            let n = src.node(id);
            let c = self.reserve(n.op.clone(), n.ups.len(), n.ty.clone());
            map.insert(id, c);
        }
        for &id in &order {
            let c = map[&id];
            let ups: SmallVec<[TypedId; 2]> =
                src.ups(id).iter().map(|u| map[u]).collect();
            for (i, u) in ups.iter().enumerate() {
                self.patch_up(c, i, *u);
            }
            let op = src.op(id).clone().map_subgraphs(|g| map[&g]);
            self.nodes[c.index()].op = op;
        }
        map[&root]
    }

    /// Copy the subgraph rooted at `root` within this arena,
    /// substituting node ids present in `subst`. Interior subgraph
    /// references are left alone: they belong to other call frames.
    pub fn clone_subgraph(
        &mut self,
        root: TypedId,
        subst: &FxHashMap<TypedId, TypedId>,
    ) -> TypedId {
        let order = self.postorder(root);
        let mut map = subst.clone();
        if let Some(&r) = map.get(&root) {
            return r;
        }
        for &id in &order {
            if !map.contains_key(&id) {
                let n = self.node(id).clone();
                let c = self.reserve(n.op, n.ups.len(), n.ty);
                map.insert(id, c);
            }
        }
        for &id in &order {
            if subst.contains_key(&id) {
                continue;
            }
            let c = map[&id];
            let ups: SmallVec<[TypedId; 2]> = self
                .ups(id)
                .iter()
                .map(|u| map.get(u).copied().unwrap_or(*u))
                .collect();
            for (i, u) in ups.iter().enumerate() {
                self.patch_up(c, i, *u);
            }
        }
        map[&root]
    }

    /// transform internal rewrite of a node before the arena is
    /// sealed; the evaluator uses this to resolve reserved call nodes
    pub fn replace_op(&mut self, id: TypedId, op: TypedOp, ty: Type) {
        let n = &mut self.nodes[id.index()];
        n.op = op;
        n.ty = ty;
    }

    /// Collapse any rule generator remnants in result types after a
    /// speculative pass concluded. Walks interior subgraphs as well.
    pub fn fix_types(&mut self, root: TypedId) {
        let mut pending = vec![root];
        let mut seen: fxhash::FxHashSet<TypedId> = fxhash::FxHashSet::default();
        while let Some(r) = pending.pop() {
            for id in self.postorder(r) {
                if !seen.insert(id) {
                    continue;
                }
                for sub in self.op(id).subgraphs() {
                    pending.push(sub);
                }
                let n = &mut self.nodes[id.index()];
                if !n.ty.is_fixed() {
                    n.ty = n.ty.fix(Fixing::NoRules);
                }
                n.op = match n.op.clone() {
                    TypedOp::FunctionCall { label, body, arg, result }
                        if !arg.is_fixed() || !result.is_fixed() =>
                    {
                        TypedOp::FunctionCall {
                            label,
                            body,
                            arg: arg.fix(Fixing::NoRules),
                            result: result.fix(Fixing::NoRules),
                        }
                    }
                    TypedOp::Switch { label, branches, result }
                        if !result.is_fixed() =>
                    {
                        TypedOp::Switch {
                            label,
                            branches,
                            result: result.fix(Fixing::NoRules),
                        }
                    }
                    TypedOp::RingBuffer { len, elem } if !elem.is_fixed() => {
                        TypedOp::RingBuffer { len, elem: elem.fix(Fixing::NoRules) }
                    }
                    op => op,
                };
            }
        }
    }

    /// postorder walk over the subgraph rooted at `root`, following
    /// upstream edges only (interior subgraphs are separate scheduling
    /// units)
    pub fn postorder(&self, root: TypedId) -> Vec<TypedId> {
        postorder_walk(root, |id| SmallVec::from_slice(self.ups(id)))
    }
}

fn postorder_walk<I, F>(root: I, ups: F) -> Vec<I>
where
    I: Copy + PartialEq + Eq + Hash,
    F: Fn(I) -> SmallVec<[I; 2]>,
{
    let mut out = Vec::new();
    let mut seen: fxhash::FxHashSet<I> = fxhash::FxHashSet::default();
    let mut stack: Vec<(I, bool)> = vec![(root, false)];
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            out.push(id);
            continue;
        }
        if !seen.insert(id) {
            continue;
        }
        stack.push((id, true));
        let ups = ups(id);
        for &u in ups.iter().rev() {
            if u != id && !seen.contains(&u) {
                stack.push((u, false));
            }
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn generic_hash_consing() {
        let mut g = GenericGraph::new();
        let a = g.add(GenericOp::Argument, smallvec![]);
        let b = g.add(GenericOp::Argument, smallvec![]);
        assert_eq!(a, b);
        let f1 = g.add(GenericOp::First, smallvec![a]);
        let f2 = g.add(GenericOp::First, smallvec![b]);
        assert_eq!(f1, f2);
        let r = g.add(GenericOp::Rest, smallvec![a]);
        assert_ne!(f1, r);
        assert_eq!(g.node(a).refs(), 2);
    }

    #[test]
    fn typed_import_remaps_subgraphs() {
        let mut src = TypedGraph::new();
        let arg = src.add(TypedOp::Argument, smallvec![], Type::Float32);
        let body = src.add(TypedOp::First, smallvec![arg], Type::Float32);
        let call = src.add(
            TypedOp::FunctionCall {
                label: arcstr::literal!("f"),
                body,
                arg: Type::Float32,
                result: Type::Float32,
            },
            smallvec![arg],
            Type::Float32,
        );
        let mut dst = TypedGraph::new();
        let moved = dst.import(&src, call);
        match dst.op(moved) {
            TypedOp::FunctionCall { body, .. } => {
                assert!(body.index() < dst.len());
                assert!(matches!(dst.op(*body), TypedOp::First));
            }
            op => panic!("unexpected op {op:?}"),
        }
    }

    #[test]
    fn postorder_is_dependency_ordered() {
        let mut g = TypedGraph::new();
        let a = g.add(TypedOp::Argument, smallvec![], Type::Float32);
        let f = g.add(TypedOp::First, smallvec![a], Type::Float32);
        let r = g.add(TypedOp::Rest, smallvec![a], Type::Float32);
        let p = g.add(TypedOp::Pair, smallvec![f, r], Type::Float32);
        let order = g.postorder(p);
        let pos =
            |id| order.iter().position(|x| *x == id).unwrap_or(usize::MAX);
        assert_eq!(order.len(), 4);
        assert!(pos(a) < pos(f));
        assert!(pos(a) < pos(r));
        assert!(pos(f) < pos(p));
        assert!(pos(r) < pos(p));
    }
}
