//! Call graph collation over the lowered IR: which driver states can
//! reach each subroutine, plus a post lowering simplification that
//! inlines trivial call frames.

use cadenza_compiler::{
    graph::{typed::TypedOp, RxId, TypedGraph, TypedId},
    rx::RxGraph,
};
use fxhash::{FxHashMap, FxHashSet};
use log::debug;
use smallvec::SmallVec;

/// weight at or below which a lowered call frame folds into its caller
const INLINE_THRESHOLD: i32 = 7;

#[derive(Debug, Default)]
pub struct CallGraphNode {
    pub subroutine: Option<TypedId>,
    /// driver leaves that can activate work inside this frame; empty
    /// with `statically_active` set means everything runs every tick
    pub active: FxHashSet<RxId>,
    pub statically_active: bool,
    pub children: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct CallGraph {
    nodes: Vec<CallGraphNode>,
    by_subroutine: FxHashMap<TypedId, usize>,
}

impl CallGraph {
    pub fn root(&self) -> &CallGraphNode {
        &self.nodes[0]
    }

    pub fn node(&self, i: usize) -> &CallGraphNode {
        &self.nodes[i]
    }

    pub fn for_subroutine(&self, id: TypedId) -> Option<&CallGraphNode> {
        self.by_subroutine.get(&id).map(|i| &self.nodes[*i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Collate the call graph from the evaluation root down. Each frame
/// records the driver states reaching it; a node without reactivity
/// marks the whole frame statically active.
pub fn analyze(g: &TypedGraph, rx: &RxGraph, root: TypedId) -> CallGraph {
    let mut cg = CallGraph::default();
    cg.nodes.push(CallGraphNode::default());
    walk(g, rx, root, 0, &mut cg);
    cg
}

fn walk(g: &TypedGraph, rx: &RxGraph, body: TypedId, current: usize, cg: &mut CallGraph) {
    for id in g.postorder(body) {
        match g.op(id) {
            TypedOp::Subroutine { body: sub_body, .. } => {
                let child = cg.nodes.len();
                cg.nodes.push(CallGraphNode {
                    subroutine: Some(id),
                    ..Default::default()
                });
                cg.by_subroutine.insert(id, child);
                cg.nodes[current].children.push(child);
                walk(g, rx, *sub_body, child, cg);
                if !cg.nodes[current].statically_active {
                    let inherited: Vec<RxId> =
                        cg.nodes[child].active.iter().copied().collect();
                    cg.nodes[current].active.extend(inherited);
                }
            }
            TypedOp::Switch { branches, .. } => {
                for b in branches.iter() {
                    walk(g, rx, *b, current, cg);
                }
            }
            TypedOp::FunctionSequence { iterator, generator, tail, .. } => {
                for b in [*iterator, *generator, *tail] {
                    walk(g, rx, b, current, cg);
                }
            }
            _ => {
                if cg.nodes[current].statically_active {
                    continue;
                }
                match g.reactivity(id) {
                    Some(r) => {
                        for d in rx.driver_ids(r) {
                            cg.nodes[current].active.insert(d);
                        }
                    }
                    None => {
                        // constants and frame plumbing are active
                        // everywhere without forcing the frame static
                        if !matches!(
                            g.op(id),
                            TypedOp::Constant { .. }
                                | TypedOp::Deps
                                | TypedOp::Argument
                                | TypedOp::SequenceCounter
                                | TypedOp::Buffer { .. }
                                | TypedOp::SubroutineStateAllocation { .. }
                        ) {
                            cg.nodes[current].statically_active = true;
                            cg.nodes[current].active.clear();
                        }
                    }
                }
            }
        }
    }
}

fn body_weight(g: &TypedGraph, body: TypedId) -> i32 {
    let mut wt = 0;
    for id in g.postorder(body) {
        wt += g.op(id).weight();
        if wt > INLINE_THRESHOLD {
            return wt;
        }
    }
    wt
}

/// Re-run the inline decision after lowering: call frames that ended
/// up trivial fold into their caller. Switch branches are never
/// inlined, their scoping is special.
pub fn simplify(g: &mut TypedGraph, root: TypedId) -> TypedId {
    let order = g.postorder(root);
    let mut map: FxHashMap<TypedId, TypedId> = FxHashMap::default();
    for id in order {
        match g.op(id).clone() {
            TypedOp::Subroutine { body, .. }
                if body_weight(g, body) <= INLINE_THRESHOLD =>
            {
                let arg = g.up(id, 0);
                let arg = map.get(&arg).copied().unwrap_or(arg);
                let mut subst = FxHashMap::default();
                for b in g.postorder(body) {
                    if matches!(g.op(b), TypedOp::Argument) {
                        subst.insert(b, arg);
                    }
                }
                debug!("inlining trivial frame at {id:?}");
                let inlined = g.clone_subgraph(body, &subst);
                map.insert(id, inlined);
            }
            TypedOp::FunctionSequence { .. } | TypedOp::Switch { .. } => (),
            _ => (),
        }
    }
    if map.is_empty() {
        return root;
    }
    let order = g.postorder(root);
    for id in order {
        if map.contains_key(&id) {
            continue;
        }
        let ups: SmallVec<[TypedId; 2]> = g.ups(id).to_vec().into();
        for (slot, u) in ups.into_iter().enumerate() {
            if let Some(&n) = map.get(&u) {
                g.patch_up(id, slot, n);
            }
        }
    }
    map.get(&root).copied().unwrap_or(root)
}

#[cfg(test)]
mod test {
    use super::*;
    use cadenza_compiler::typ::Type;
    use smallvec::smallvec;

    #[test]
    fn trivial_frames_fold_into_the_caller() {
        let mut g = TypedGraph::new();
        let arg_out = g.add(TypedOp::Argument, smallvec![], Type::Float32);
        let body_arg = g.add(TypedOp::Argument, smallvec![], Type::Float32);
        let body = g.add(TypedOp::First, smallvec![body_arg], Type::Float32);
        let state = g.add(
            TypedOp::SubroutineStateAllocation { of: 1 },
            smallvec![],
            Type::Int64,
        );
        let call = g.add(
            TypedOp::Subroutine { label: arcstr::literal!("f"), body, uid: 1 },
            smallvec![arg_out, state],
            Type::Float32,
        );
        let root = simplify(&mut g, call);
        assert!(matches!(g.op(root), TypedOp::First));
        assert_eq!(g.up(root, 0), arg_out);
    }

    #[test]
    fn call_graph_records_frames() {
        let mut g = TypedGraph::new();
        let rxg = RxGraph::new();
        let body_arg = g.add(TypedOp::Argument, smallvec![], Type::Float32);
        let state = g.add(
            TypedOp::SubroutineStateAllocation { of: 7 },
            smallvec![],
            Type::Int64,
        );
        let arg = g.add(TypedOp::Argument, smallvec![], Type::Float32);
        let call = g.add(
            TypedOp::Subroutine { label: arcstr::literal!("g"), body: body_arg, uid: 7 },
            smallvec![arg, state],
            Type::Float32,
        );
        let cg = analyze(&g, &rxg, call);
        assert_eq!(cg.len(), 2);
        assert!(cg.for_subroutine(call).is_some());
    }
}
