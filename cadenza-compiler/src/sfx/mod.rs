//! The side effect transform: lowers the pure functional IR into an
//! imperative one with explicit buffers, pointer arithmetic, copies
//! and state slots. Function calls become subroutines with explicit
//! state windows; stateful and clock crossing nodes become module
//! buffers driven by slot counters.

use crate::{
    graph::{
        typed::{BufferAlloc, CopyMode, TypedOp},
        MathOp, TypedGraph, TypedId,
    },
    module::{BuildModule, SymbolEntry},
    rx::{DriverSignature, RxGraph},
    typ::{NativeTy, Scalar, Type},
};
use anyhow::Result;
use fxhash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};

pub mod elide;

pub use elide::elide_copies;

/// pointers are machine words in the typed IR
pub(crate) fn ptr_ty() -> Type {
    Type::Int64
}

pub struct SfxOutput {
    pub root: TypedId,
}

struct Lowerer<'a> {
    g: &'a mut TypedGraph,
    rx: &'a mut RxGraph,
    module: &'a mut BuildModule,
    map: FxHashMap<TypedId, TypedId>,
    done: FxHashSet<TypedId>,
}

/// Lower everything reachable from `root`. Reactivity annotations are
/// carried over to the rewritten nodes; writes keep their source
/// clock, state reads become statically active.
pub fn lower(
    g: &mut TypedGraph,
    rx: &mut RxGraph,
    module: &mut BuildModule,
    root: TypedId,
) -> Result<SfxOutput> {
    let mut l = Lowerer {
        g,
        rx,
        module,
        map: FxHashMap::default(),
        done: FxHashSet::default(),
    };
    let root = l.frame(root);
    Ok(SfxOutput { root })
}

impl<'a> Lowerer<'a> {
    fn frame(&mut self, root: TypedId) -> TypedId {
        let order = self.g.postorder(root);
        // ring buffer outputs are reserved up front so feedback users
        // resolve to the lowered node
        for &id in &order {
            if let TypedOp::RingBuffer { .. } = self.g.op(id) {
                if !self.map.contains_key(&id) {
                    let ty = self.g.ty(id).clone();
                    let out = self.g.reserve(TypedOp::Deps, 3, ty);
                    let rxa = self.g.reactivity(id);
                    self.g.set_reactivity(out, rxa);
                    self.map.insert(id, out);
                }
            }
        }
        for &id in &order {
            if self.done.contains(&id) {
                continue;
            }
            let new = self.node(id);
            self.map.insert(id, new);
            self.done.insert(id);
        }
        self.map.get(&root).copied().unwrap_or(root)
    }

    fn up(&self, id: TypedId, i: usize) -> TypedId {
        let u = self.g.up(id, i);
        self.map.get(&u).copied().unwrap_or(u)
    }

    fn mapped_ups(&self, id: TypedId) -> SmallVec<[TypedId; 2]> {
        self.g
            .ups(id)
            .iter()
            .map(|u| self.map.get(u).copied().unwrap_or(*u))
            .collect()
    }

    fn keep_rx(&mut self, old: TypedId, new: TypedId) -> TypedId {
        let r = self.g.reactivity(old);
        self.g.set_reactivity(new, r);
        new
    }

    fn const_i32(&mut self, v: i32) -> TypedId {
        let data = crate::graph::typed::encode_scalar(
            NativeTy::scalar(Scalar::Int32),
            v as f64,
        );
        self.g.add(TypedOp::Constant { data }, smallvec![], Type::Int32)
    }

    fn node(&mut self, id: TypedId) -> TypedId {
        match self.g.op(id).clone() {
            TypedOp::RingBuffer { len, elem } => self.ring_buffer(id, len, elem),
            TypedOp::BoundaryBuffer { capacity, elem } => {
                self.boundary(id, capacity, elem)
            }
            TypedOp::FunctionCall { label, body, arg, result } => {
                let lowered = self.frame(body);
                let uid = self.module.next_uid();
                let state = self.g.add(
                    TypedOp::SubroutineStateAllocation { of: uid },
                    smallvec![],
                    ptr_ty(),
                );
                let upstream = self.up(id, 0);
                let new = self.g.add(
                    TypedOp::Subroutine { label, body: lowered, uid },
                    smallvec![upstream, state],
                    result.clone(),
                );
                let _ = arg;
                self.keep_rx(id, new)
            }
            TypedOp::FunctionSequence {
                label,
                arg_formula,
                res_formula,
                iterator,
                generator,
                tail,
                count,
            } => {
                let iterator = self.frame(iterator);
                let generator = self.frame(generator);
                let tail = self.frame(tail);
                let ups = self.mapped_ups(id);
                let ty = self.g.ty(id).clone();
                let new = self.g.add(
                    TypedOp::FunctionSequence {
                        label,
                        arg_formula,
                        res_formula,
                        iterator,
                        generator,
                        tail,
                        count,
                    },
                    ups,
                    ty,
                );
                self.keep_rx(id, new)
            }
            TypedOp::Switch { label, branches, result } => {
                let branches: triomphe::Arc<[TypedId]> =
                    branches.iter().map(|b| self.frame(*b)).collect();
                let ups = self.mapped_ups(id);
                let new = self.g.add(
                    TypedOp::Switch { label, branches, result: result.clone() },
                    ups,
                    result,
                );
                self.keep_rx(id, new)
            }
            TypedOp::Input { key, variety, driver } => {
                let uid = self.module.next_uid();
                let ty = self.g.ty(id).clone();
                self.module.register_symbol(
                    key.clone(),
                    SymbolEntry {
                        uid,
                        ty: ty.clone(),
                        variety,
                        rate: (driver.mul, driver.div),
                        clock: driver.metadata.clone(),
                    },
                );
                let new = self.g.add(
                    TypedOp::Input { key, variety, driver },
                    smallvec![],
                    ty,
                );
                self.keep_rx(id, new)
            }
            op => {
                let ups = self.mapped_ups(id);
                if ups.as_slice() == self.g.ups(id) {
                    return id;
                }
                let ty = self.g.ty(id).clone();
                let new = self.g.add(op, ups, ty);
                self.keep_rx(id, new)
            }
        }
    }

    /// A delay line: one module buffer, one position slot. The read
    /// observes the previous tick, so it is ordered before the write;
    /// initialization tiles the init value over the whole buffer.
    fn ring_buffer(&mut self, id: TypedId, len: usize, elem: Type) -> TypedId {
        let out = self.map[&id];
        let uid = self.module.next_uid();
        let slot = self.module.get_index(uid);
        let init = self.up(id, 0);
        let sig = self.up(id, 1);
        let esz = elem.size().max(1);

        let buf = self.g.add(
            TypedOp::Buffer {
                alloc: BufferAlloc::Module,
                size: esz * len,
                align: elem.align(),
            },
            smallvec![],
            ptr_ty(),
        );
        // initialization: tiled fill of the init value
        let fill = self.g.add(
            TypedOp::Copy { size: esz, mode: CopyMode::Store, repeat: len },
            smallvec![buf, init],
            ptr_ty(),
        );
        let init_rx = self.rx.driver(DriverSignature::init());
        self.g.set_reactivity(fill, Some(init_rx));

        let ty = self.g.ty(id).clone();
        let read = self.g.add(TypedOp::Dereference, smallvec![buf], ty);
        self.g.set_reactivity(read, self.g.reactivity(id));

        let idx = self.g.add(TypedOp::GetSlot { index: slot }, smallvec![], Type::Int32);
        let at = self.g.add(
            TypedOp::AtIndex { elem_size: esz },
            smallvec![buf, idx],
            ptr_ty(),
        );
        // the write waits for the read: the output of a delay line is
        // the state before this tick
        let at_ordered = self.g.add(TypedOp::Deps, smallvec![at, read], ptr_ty());
        let write = self.g.add(
            TypedOp::Copy { size: esz, mode: CopyMode::Store, repeat: 1 },
            smallvec![at_ordered, sig],
            ptr_ty(),
        );
        let one = self.const_i32(1);
        let next = self.g.add(
            TypedOp::Native { op: MathOp::Add, ty: NativeTy::scalar(Scalar::Int32) },
            smallvec![idx, one],
            Type::Int32,
        );
        let cap = self.const_i32(len as i32);
        let wrapped = self.g.add(
            TypedOp::Native { op: MathOp::Mod, ty: NativeTy::scalar(Scalar::Int32) },
            smallvec![next, cap],
            Type::Int32,
        );
        let advance =
            self.g.add(TypedOp::SetSlot { index: slot }, smallvec![wrapped], Type::Nil);
        for n in [idx, at, at_ordered, write, next, wrapped, advance] {
            let r = self.g.reactivity(id);
            self.g.set_reactivity(n, r);
        }
        self.g.patch_up(out, 0, read);
        self.g.patch_up(out, 1, write);
        self.g.patch_up(out, 2, advance);
        out
    }

    /// A clock domain latch: written on the source clock, read
    /// unconditionally, holding the last value.
    fn boundary(&mut self, id: TypedId, capacity: usize, elem: Type) -> TypedId {
        let uid = self.module.next_uid();
        let slot = self.module.get_index(uid);
        let src = self.up(id, 0);
        let esz = elem.size().max(1);
        let buf = self.g.add(
            TypedOp::Buffer {
                alloc: BufferAlloc::Module,
                size: esz * capacity,
                align: elem.align(),
            },
            smallvec![],
            ptr_ty(),
        );
        let pos = self.g.add(TypedOp::GetSlot { index: slot }, smallvec![], Type::Int32);
        let at = self.g.add(
            TypedOp::AtIndex { elem_size: esz },
            smallvec![buf, pos],
            ptr_ty(),
        );
        let write = self.g.add(
            TypedOp::Copy { size: esz, mode: CopyMode::Store, repeat: 1 },
            smallvec![at, src],
            ptr_ty(),
        );
        let one = self.const_i32(1);
        let next = self.g.add(
            TypedOp::Native { op: MathOp::Add, ty: NativeTy::scalar(Scalar::Int32) },
            smallvec![pos, one],
            Type::Int32,
        );
        let cap = self.const_i32(capacity as i32);
        let wrapped = self.g.add(
            TypedOp::Native { op: MathOp::Mod, ty: NativeTy::scalar(Scalar::Int32) },
            smallvec![next, cap],
            Type::Int32,
        );
        let advance =
            self.g.add(TypedOp::SetSlot { index: slot }, smallvec![wrapped], Type::Nil);
        // the write side inherits the source clock
        let src_rx = self.g.reactivity(id);
        for n in [pos, at, write, next, wrapped, advance] {
            self.g.set_reactivity(n, src_rx);
        }
        // the read side latches: always active, observes the last
        // completed write
        let ordered = self.g.add(
            TypedOp::Deps,
            smallvec![at, write, advance],
            ptr_ty(),
        );
        let read = self.g.add(TypedOp::Dereference, smallvec![ordered], elem);
        self.g.set_reactivity(read, None);
        read
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{rx, spec, typ};
    use crate::graph::GenericOp;

    #[test]
    fn ring_buffer_lowers_to_one_buffer_one_slot() {
        let mut ctx = spec::JobCtx::without_symbols();
        let mut g = TypedGraph::new();
        let driver = DriverSignature::user(&arcstr::literal!("audio"), 48000.0, 1.0);
        let init = ctx.graphs.add(GenericOp::Constant(Type::Float32), smallvec![]);
        let order = ctx
            .graphs
            .add(GenericOp::Constant(Type::invariant_i64(4)), smallvec![]);
        let sig = ctx.graphs.add(
            GenericOp::Input {
                key: arcstr::literal!("sig"),
                ty: Type::Float32,
                variety: crate::graph::generic::Variety::Stream,
                driver,
            },
            smallvec![],
        );
        let rb = ctx.graphs.reserve(
            GenericOp::RingBuffer {
                time_base: crate::graph::generic::TimeBase::Samples,
            },
            3,
        );
        ctx.graphs.patch_up(rb, 0, init);
        ctx.graphs.patch_up(rb, 1, order);
        ctx.graphs.patch_up(rb, 2, sig);
        let s = spec::specialize(&mut ctx, &mut g, rb, Type::Nil).unwrap();
        assert_eq!(s.ty, typ::chain(Type::Float32, 4, Type::Nil));

        let mut out = rx::analyze(&mut g, s.node).unwrap();
        let mut module = BuildModule::new(Type::Nil, s.ty.clone());
        let sfx = lower(&mut g, &mut out.rx, &mut module, s.node).unwrap();

        // exactly one state slot (the position) and one module buffer
        // of 4 floats
        assert_eq!(module.slot_count(), 1);
        let order = g.postorder(sfx.root);
        let bufs: Vec<_> = order
            .iter()
            .filter_map(|id| match g.op(*id) {
                TypedOp::Buffer { alloc: BufferAlloc::Module, size, .. } => {
                    Some(*size)
                }
                _ => None,
            })
            .collect();
        assert_eq!(bufs, vec![16]);
        // the delayed read happens before the write
        assert!(order
            .iter()
            .any(|id| matches!(g.op(*id), TypedOp::Copy { repeat: 4, .. })));
        // reactivity of the lowered chain follows the signal clock
        let rb_rx = g.reactivity(sfx.root).expect("clocked");
        assert_eq!(out.rx.driver_ids(rb_rx).len(), 1);
    }
}
