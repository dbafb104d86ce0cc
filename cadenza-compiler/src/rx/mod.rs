//! Reactive analysis: every typed node is assigned an activation
//! clock, a driver or a fused set of drivers, and clock domain
//! crossings get boundary buffers. The reactivity graph is a DAG
//! parallel to the typed graph, filled in late through
//! [TypedGraph::set_reactivity].

use crate::{
    graph::{typed::TypedOp, RxId, TypedGraph, TypedId},
    typ::Type,
};
use anyhow::{bail, Result};
use arcstr::ArcStr;
use fxhash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// Priority classes of activation drivers, lowest first; the class is
/// the primary sort key of the signature order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DriverClass {
    InitOrNull,
    Recursive,
    EvalArgument,
    User,
}

/// A clock identity: metadata names the external source, `mul/div` is
/// its rate relative to the reference clock, and the bit mask indices
/// are filled in by counter allocation in the backend.
#[derive(Debug, Clone)]
pub struct DriverSignature {
    pub metadata: Type,
    pub priority: Type,
    pub mul: f64,
    pub div: f64,
    pub masks: SmallVec<[i32; 2]>,
    pub class: DriverClass,
}

impl DriverSignature {
    pub fn new(metadata: Type, class: DriverClass, mul: f64, div: f64) -> Self {
        DriverSignature { metadata, priority: Type::Nil, mul, div, masks: smallvec![], class }
    }

    pub fn user(key: &ArcStr, mul: f64, div: f64) -> Self {
        Self::new(Type::InvariantString(key.clone()), DriverClass::User, mul, div)
    }

    pub fn init() -> Self {
        Self::new(Type::Nil, DriverClass::InitOrNull, 1.0, 1.0)
    }

    pub fn recursive() -> Self {
        Self::new(Type::Nil, DriverClass::Recursive, 1.0, 1.0)
    }

    pub fn argument() -> Self {
        Self::new(Type::Nil, DriverClass::EvalArgument, 1.0, 1.0)
    }

    pub fn ratio(&self) -> f64 {
        self.mul / self.div
    }

    /// clock identity: class and metadata, ignoring rate scaling and
    /// decorations
    pub fn same_clock(&self, other: &DriverSignature) -> bool {
        self.class == other.class && self.metadata == other.metadata
    }

    pub fn set_multiplier(&mut self, mul: f64, div: f64) {
        self.mul = mul;
        self.div = div;
    }

    /// signature with priority and mask decorations removed; counter
    /// and driver set keys use this form
    pub fn stripped(&self) -> DriverSignature {
        DriverSignature {
            metadata: self.metadata.clone(),
            priority: Type::Nil,
            mul: self.mul,
            div: self.div,
            masks: smallvec![],
            class: self.class,
        }
    }

    pub fn ordinal(&self, other: &DriverSignature) -> Ordering {
        self.class
            .cmp(&other.class)
            .then_with(|| self.metadata.ordinal(&other.metadata))
            .then_with(|| self.priority.ordinal(&other.priority))
            .then_with(|| self.mul.total_cmp(&other.mul))
            .then_with(|| self.div.total_cmp(&other.div))
            .then_with(|| self.masks.cmp(&other.masks))
    }
}

impl PartialEq for DriverSignature {
    fn eq(&self, other: &Self) -> bool {
        self.ordinal(other) == Ordering::Equal
    }
}

impl Eq for DriverSignature {}

impl PartialOrd for DriverSignature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.ordinal(other))
    }
}

impl Ord for DriverSignature {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordinal(other)
    }
}

impl Hash for DriverSignature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.class.hash(state);
        self.metadata.type_hash().hash(state);
        self.mul.to_bits().hash(state);
        self.div.to_bits().hash(state);
    }
}

/// reactivity node: an external clock leaf or a fused set of clocks
/// that must fire together
#[derive(Debug, Clone, PartialEq)]
pub enum RxNode {
    Driver(DriverSignature),
    Fused(SmallVec<[RxId; 2]>),
}

#[derive(Debug, Default)]
pub struct RxGraph {
    nodes: Vec<RxNode>,
    drivers: FxHashMap<DriverSignature, RxId>,
    fused: FxHashMap<SmallVec<[RxId; 2]>, RxId>,
}

impl RxGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: RxId) -> &RxNode {
        &self.nodes[id.index()]
    }

    pub fn driver(&mut self, sig: DriverSignature) -> RxId {
        if let Some(id) = self.drivers.get(&sig) {
            return *id;
        }
        let id = RxId(self.nodes.len() as u32);
        self.nodes.push(RxNode::Driver(sig.clone()));
        self.drivers.insert(sig, id);
        id
    }

    /// flatten, sort and intern a fused set; a single driver stays
    /// itself
    pub fn fuse(&mut self, ids: impl IntoIterator<Item = RxId>) -> Option<RxId> {
        let mut set: SmallVec<[RxId; 2]> = SmallVec::new();
        for id in ids {
            for d in self.driver_ids(id) {
                if !set.contains(&d) {
                    set.push(d);
                }
            }
        }
        set.sort();
        match set.len() {
            0 => None,
            1 => Some(set[0]),
            _ => {
                if let Some(id) = self.fused.get(&set) {
                    return Some(*id);
                }
                let id = RxId(self.nodes.len() as u32);
                self.nodes.push(RxNode::Fused(set.clone()));
                self.fused.insert(set, id);
                Some(id)
            }
        }
    }

    /// the driver leaves under `id`
    pub fn driver_ids(&self, id: RxId) -> SmallVec<[RxId; 2]> {
        match &self.nodes[id.index()] {
            RxNode::Driver(_) => smallvec![id],
            RxNode::Fused(ds) => ds.clone(),
        }
    }

    pub fn signature(&self, id: RxId) -> Option<&DriverSignature> {
        match &self.nodes[id.index()] {
            RxNode::Driver(sig) => Some(sig),
            RxNode::Fused(_) => None,
        }
    }

    /// is every driver of `a` contained in `b`
    pub fn subset(&self, a: RxId, b: RxId) -> bool {
        let bs = self.driver_ids(b);
        self.driver_ids(a).iter().all(|d| bs.contains(d))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// analysis result: the reactivity arena plus the sorted driver set of
/// the compilation unit
#[derive(Debug)]
pub struct RxOutput {
    pub rx: RxGraph,
    pub drivers: Vec<DriverSignature>,
}

/// every reachable node including interior subgraph roots, dependency
/// ordered per subgraph
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

/// Infer activation clocks for every node reachable from `root`,
/// insert boundary buffers on clock domain crossings and return the
/// driver table. Ring buffer feedback edges converge through the
/// fixpoint re-entry instead of deadlocking the bottom-up walk.
pub fn analyze(g: &mut TypedGraph, root: TypedId) -> Result<RxOutput> {
    let mut rx = RxGraph::new();
    let order = full_order(g, root);

    // bottom-up clock assignment, iterated to a fixpoint so that
    // cycle closing edges observed too early converge
    let mut iterations = 0;
    loop {
        let mut changed = false;
        for &id in &order {
            let new = compute_rx(g, &mut rx, id);
            if g.reactivity(id) != new {
                g.set_reactivity(id, new);
                changed = true;
            }
        }
        if !changed {
            break;
        }
        iterations += 1;
        if iterations > order.len() + 2 {
            bail!("reactive analysis did not converge");
        }
    }

    insert_boundaries(g, &mut rx, &order)?;

    let mut drivers: Vec<DriverSignature> = rx
        .drivers
        .keys()
        .filter(|d| d.class == DriverClass::User)
        .cloned()
        .collect();
    drivers.sort();
    Ok(RxOutput { rx, drivers })
}

fn compute_rx(g: &TypedGraph, rx: &mut RxGraph, id: TypedId) -> Option<RxId> {
    match g.op(id) {
        TypedOp::Constant { .. } | TypedOp::Argument | TypedOp::SequenceCounter => None,
        TypedOp::Input { driver, .. } => Some(rx.driver(driver.stripped())),
        // a ring buffer fires on its input signal's clock; until the
        // cycle edge resolves it stays statically active
        TypedOp::RingBuffer { .. } => g.reactivity(g.up(id, 1)),
        TypedOp::FunctionCall { body, .. } => {
            let mut ids: SmallVec<[RxId; 4]> = SmallVec::new();
            collect_rx(g, id, &mut ids);
            ids.extend(g.reactivity(*body));
            rx.fuse(ids)
        }
        TypedOp::FunctionSequence { iterator, generator, tail, .. } => {
            let mut ids: SmallVec<[RxId; 4]> = SmallVec::new();
            collect_rx(g, id, &mut ids);
            for b in [iterator, generator, tail] {
                ids.extend(g.reactivity(*b));
            }
            rx.fuse(ids)
        }
        TypedOp::Switch { branches, .. } => {
            let mut ids: SmallVec<[RxId; 4]> = SmallVec::new();
            collect_rx(g, id, &mut ids);
            for b in branches.iter() {
                ids.extend(g.reactivity(*b));
            }
            rx.fuse(ids)
        }
        _ => {
            let mut ids: SmallVec<[RxId; 4]> = SmallVec::new();
            collect_rx(g, id, &mut ids);
            rx.fuse(ids)
        }
    }
}

fn collect_rx(g: &TypedGraph, id: TypedId, out: &mut SmallVec<[RxId; 4]>) {
    for &u in g.ups(id) {
        if u != id {
            out.extend(g.reactivity(u));
        }
    }
}

/// A sink that can fire without its source firing reads a stale
/// value: latch it through a boundary buffer sized by the rate ratio
/// ceiling.
fn needs_boundary(rx: &RxGraph, src: Option<RxId>, snk: Option<RxId>) -> bool {
    match (src, snk) {
        (None, _) => false,
        (Some(s), Some(k)) => s != k && !rx.subset(k, s),
        (Some(_), None) => true,
    }
}

fn boundary_capacity(rx: &RxGraph, src: RxId, snk: Option<RxId>) -> usize {
    let src_max = rx
        .driver_ids(src)
        .iter()
        .filter_map(|d| rx.signature(*d).map(|s| s.ratio()))
        .fold(f64::NAN, f64::max);
    let snk_min = snk
        .map(|k| {
            rx.driver_ids(k)
                .iter()
                .filter_map(|d| rx.signature(*d).map(|s| s.ratio()))
                .fold(f64::NAN, f64::min)
        })
        .unwrap_or(f64::NAN);
    if src_max.is_finite() && snk_min.is_finite() && snk_min > 0.0 {
        (src_max / snk_min).ceil().max(1.0) as usize
    } else {
        1
    }
}

fn insert_boundaries(
    g: &mut TypedGraph,
    rx: &mut RxGraph,
    order: &[TypedId],
) -> Result<()> {
    let mut made: FxHashMap<(TypedId, Option<RxId>), TypedId> = FxHashMap::default();
    for &id in order {
        if matches!(g.op(id), TypedOp::BoundaryBuffer { .. }) {
            continue;
        }
        let snk = g.reactivity(id);
        let ups: Vec<TypedId> = g.ups(id).to_vec();
        for (slot, u) in ups.into_iter().enumerate() {
            if u == id {
                continue;
            }
            let src = g.reactivity(u);
            if !needs_boundary(rx, src, snk) {
                continue;
            }
            let elem = g.ty(u).clone();
            if elem.size() == 0 {
                continue;
            }
            let src_id = match src {
                Some(s) => s,
                None => continue,
            };
            let b = match made.get(&(u, snk)) {
                Some(b) => *b,
                None => {
                    let capacity = boundary_capacity(rx, src_id, snk);
                    let b = g.add(
                        TypedOp::BoundaryBuffer { capacity, elem: elem.clone() },
                        smallvec![u],
                        elem,
                    );
                    g.set_reactivity(b, src);
                    made.insert((u, snk), b);
                    b
                }
            };
            g.patch_up(id, slot, b);
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::typed::TypedOp;
    use crate::typ::{NativeTy, Scalar};

    fn audio() -> DriverSignature {
        DriverSignature::user(&arcstr::literal!("audio"), 48000.0, 1.0)
    }

    fn control() -> DriverSignature {
        DriverSignature::user(&arcstr::literal!("control"), 100.0, 1.0)
    }

    #[test]
    fn signature_order_puts_init_first() {
        let mut v = vec![audio(), DriverSignature::init(), DriverSignature::recursive()];
        v.sort();
        assert_eq!(v[0].class, DriverClass::InitOrNull);
        assert_eq!(v[1].class, DriverClass::Recursive);
        assert_eq!(v[2].class, DriverClass::User);
    }

    #[test]
    fn pure_nodes_adopt_fused_upstreams() {
        let mut g = TypedGraph::new();
        let a = g.add(
            TypedOp::Input {
                key: arcstr::literal!("audio"),
                variety: crate::graph::generic::Variety::Stream,
                driver: audio(),
            },
            smallvec![],
            Type::Float32,
        );
        let c = g.add(
            TypedOp::Input {
                key: arcstr::literal!("control"),
                variety: crate::graph::generic::Variety::Stream,
                driver: control(),
            },
            smallvec![],
            Type::Float32,
        );
        let sum = g.add(
            TypedOp::Native {
                op: crate::graph::MathOp::Add,
                ty: NativeTy::scalar(Scalar::Float32),
            },
            smallvec![a, c],
            Type::Float32,
        );
        let out = analyze(&mut g, sum).unwrap();
        assert_eq!(out.drivers.len(), 2);
        let sum_rx = g.reactivity(sum).unwrap();
        // both inputs latch into the fused domain; the audio side
        // holds the rate ratio, the control side a single value
        let mut caps: Vec<usize> = g
            .postorder(sum)
            .into_iter()
            .filter_map(|id| match g.op(id) {
                TypedOp::BoundaryBuffer { capacity, .. } => Some(*capacity),
                _ => None,
            })
            .collect();
        caps.sort();
        assert_eq!(caps, vec![1, 480]);
        match out.rx.node(sum_rx) {
            RxNode::Fused(ds) => assert_eq!(ds.len(), 2),
            RxNode::Driver(_) => panic!("expected fused set"),
        }
    }

    #[test]
    fn slow_sink_gets_ratio_capacity_boundary() {
        let mut g = TypedGraph::new();
        let fast = g.add(
            TypedOp::Input {
                key: arcstr::literal!("audio"),
                variety: crate::graph::generic::Variety::Stream,
                driver: audio(),
            },
            smallvec![],
            Type::Float32,
        );
        let slow = g.add(
            TypedOp::Input {
                key: arcstr::literal!("control"),
                variety: crate::graph::generic::Variety::Stream,
                driver: control(),
            },
            smallvec![],
            Type::Float32,
        );
        // a ring buffer clocked by the slow input, fed by the fast one
        let rb = g.reserve(
            TypedOp::RingBuffer { len: 1, elem: Type::Float32 },
            2,
            Type::Float32,
        );
        g.patch_up(rb, 0, fast);
        g.patch_up(rb, 1, slow);
        let _ = analyze(&mut g, rb).unwrap();
        // the 48 kHz signal entering the 100 Hz domain is latched with
        // the rate ratio ceiling
        let b = g
            .postorder(rb)
            .into_iter()
            .find(|id| matches!(g.op(*id), TypedOp::BoundaryBuffer { .. }))
            .expect("boundary inserted");
        match g.op(b) {
            TypedOp::BoundaryBuffer { capacity, .. } => assert_eq!(*capacity, 480),
            _ => unreachable!(),
        }
    }

    #[test]
    fn ring_buffer_cycle_converges() {
        let mut g = TypedGraph::new();
        let sig = g.add(
            TypedOp::Input {
                key: arcstr::literal!("audio"),
                variety: crate::graph::generic::Variety::Stream,
                driver: audio(),
            },
            smallvec![],
            Type::Float32,
        );
        let init = g.add(TypedOp::constant(Type::Float32), smallvec![], Type::Float32);
        let rb = g.reserve(
            TypedOp::RingBuffer { len: 4, elem: Type::Float32 },
            2,
            crate::typ::chain(Type::Float32, 4, Type::Nil),
        );
        g.patch_up(rb, 0, init);
        // feedback: the ring buffer consumes a mix of the input and
        // its own output
        let head = g.add(TypedOp::First, smallvec![rb], Type::Float32);
        let mix = g.add(
            TypedOp::Native {
                op: crate::graph::MathOp::Add,
                ty: NativeTy::scalar(Scalar::Float32),
            },
            smallvec![sig, head],
            Type::Float32,
        );
        g.patch_up(rb, 1, mix);
        let out = analyze(&mut g, rb).unwrap();
        let rb_rx = g.reactivity(rb).expect("ring buffer clocked");
        let ds = out.rx.driver_ids(rb_rx);
        assert_eq!(ds.len(), 1);
        assert_eq!(
            out.rx.signature(ds[0]).map(|s| s.ratio()),
            Some(48000.0)
        );
    }
}
