//! Typed node kinds. The functional subset comes out of specialization;
//! the imperative subset is introduced by the side effect transform.

use super::{GenericId, TypedId};
use crate::{
    graph::generic::{MathOp, Variety},
    rx::DriverSignature,
    typ::{NativeTy, Type},
};
use arcstr::ArcStr;
use fxhash::FxHasher64;
use std::hash::{Hash, Hasher};
use triomphe::Arc;

/// storage class of an explicit buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferAlloc {
    Stack,
    StackZeroed,
    Module,
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyMode {
    Store,
    MemCpy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedOp {
    /// the argument value of the enclosing call frame
    Argument,
    /// constant with its encoded bit pattern; zero sized for compile
    /// time values
    Constant { data: Arc<[u8]> },
    Pair,
    First,
    Rest,
    /// native binary arithmetic or comparison; upstreams are `[l, r]`
    Native { op: MathOp, ty: NativeTy },
    /// scalar conversion
    Convert { to: NativeTy },
    /// out of line call; `body` is the callee subgraph, the upstream is
    /// the packed argument
    FunctionCall { label: ArcStr, body: TypedId, arg: Type, result: Type },
    /// solved recurrence: run `iterator` `count - 1` times from the
    /// tail call result, threading results through `generator`; the
    /// closed form argument/result formulas stay available for later
    /// partial unrolling
    FunctionSequence {
        label: ArcStr,
        arg_formula: GenericId,
        res_formula: GenericId,
        iterator: TypedId,
        generator: TypedId,
        tail: TypedId,
        count: i64,
    },
    /// iteration index inside a function sequence body
    SequenceCounter,
    /// runtime dispatch over a union tag; upstreams are
    /// `[selector, argument]`
    Switch { label: ArcStr, branches: Arc<[TypedId]>, result: Type },
    /// extract the dispatch tag word of a union value
    UnionTag,
    /// wrap a value as a union variant `index`
    UnionWrap { index: u32 },
    /// delay line over `len` elements of `elem`; upstreams are
    /// `[initializer, signal]`, the signal edge may close a cycle
    RingBuffer { len: usize, elem: Type },
    /// external input with its driver clock
    Input { key: ArcStr, variety: Variety, driver: DriverSignature },

    // imperative forms, introduced by the side effect transform
    Buffer { alloc: BufferAlloc, size: usize, align: usize },
    /// pointer displacement in bytes; upstream is `[ptr]`
    Offset { bytes: i64 },
    /// pointer displacement by element index; upstreams are
    /// `[ptr, index]`
    AtIndex { elem_size: usize },
    /// typed load; upstream is `[ptr]`
    Dereference,
    /// typed store or block copy; upstreams are `[dst, src]`
    Copy { size: usize, mode: CopyMode, repeat: usize },
    /// extracted call frame with explicit state; upstreams are
    /// `[argument, state]`
    Subroutine { label: ArcStr, body: TypedId, uid: u64 },
    /// state window for a subroutine body, sized by the named global
    /// the sizing pass emits
    SubroutineStateAllocation { of: u64 },
    /// clock domain crossing; latches the upstream value, capacity is
    /// the rate ratio ceiling
    BoundaryBuffer { capacity: usize, elem: Type },
    GetSlot { index: u32 },
    /// upstream is `[value]`
    SetSlot { index: u32 },
    /// ordering only edge
    Deps,
}

impl TypedOp {
    pub fn constant(ty: Type) -> TypedOp {
        TypedOp::Constant { data: encode_constant(&ty) }
    }

    /// pure nodes may be hash consed
    pub fn pure(&self) -> bool {
        match self {
            TypedOp::Argument
            | TypedOp::Constant { .. }
            | TypedOp::Pair
            | TypedOp::First
            | TypedOp::Rest
            | TypedOp::Native { .. }
            | TypedOp::Convert { .. }
            | TypedOp::SequenceCounter
            | TypedOp::UnionTag
            | TypedOp::UnionWrap { .. }
            | TypedOp::Offset { .. }
            | TypedOp::AtIndex { .. }
            | TypedOp::Deps => true,
            _ => false,
        }
    }

    /// scheduling weight for the inline decision
    pub fn weight(&self) -> i32 {
        match self {
            TypedOp::Constant { .. } | TypedOp::Deps => 0,
            TypedOp::Argument
            | TypedOp::Pair
            | TypedOp::First
            | TypedOp::Rest
            | TypedOp::SequenceCounter
            | TypedOp::UnionTag
            | TypedOp::Offset { .. }
            | TypedOp::GetSlot { .. } => 1,
            TypedOp::Native { .. }
            | TypedOp::Convert { .. }
            | TypedOp::UnionWrap { .. }
            | TypedOp::AtIndex { .. }
            | TypedOp::Dereference
            | TypedOp::SetSlot { .. }
            | TypedOp::Input { .. } => 2,
            TypedOp::Copy { .. } | TypedOp::Buffer { .. } => 3,
            TypedOp::FunctionCall { .. }
            | TypedOp::RingBuffer { .. }
            | TypedOp::BoundaryBuffer { .. }
            | TypedOp::Subroutine { .. }
            | TypedOp::SubroutineStateAllocation { .. } => 4,
            TypedOp::FunctionSequence { .. } | TypedOp::Switch { .. } => 6,
        }
    }

    /// default scheduling priority; see the topological sort keys
    pub fn priority(&self) -> i32 {
        match self {
            TypedOp::Constant { .. } => -1,
            TypedOp::Native { .. } => 1,
            _ => 0,
        }
    }

    pub fn local_hash(&self) -> u64 {
        let mut h = FxHasher64::default();
        std::mem::discriminant(self).hash(&mut h);
        match self {
            TypedOp::Argument
            | TypedOp::Pair
            | TypedOp::First
            | TypedOp::Rest
            | TypedOp::SequenceCounter
            | TypedOp::UnionTag
            | TypedOp::Dereference
            | TypedOp::Deps => (),
            TypedOp::Constant { data } => data.hash(&mut h),
            TypedOp::Native { op, ty } => {
                op.hash(&mut h);
                ty.hash(&mut h)
            }
            TypedOp::Convert { to } => to.hash(&mut h),
            TypedOp::FunctionCall { label, body, arg, result } => {
                label.hash(&mut h);
                body.hash(&mut h);
                arg.type_hash().hash(&mut h);
                result.type_hash().hash(&mut h)
            }
            TypedOp::FunctionSequence { label, iterator, generator, tail, count, .. } => {
                label.hash(&mut h);
                iterator.hash(&mut h);
                generator.hash(&mut h);
                tail.hash(&mut h);
                count.hash(&mut h)
            }
            TypedOp::Switch { label, branches, result } => {
                label.hash(&mut h);
                branches.hash(&mut h);
                result.type_hash().hash(&mut h)
            }
            TypedOp::UnionWrap { index } => index.hash(&mut h),
            TypedOp::RingBuffer { len, elem } => {
                len.hash(&mut h);
                elem.type_hash().hash(&mut h)
            }
            TypedOp::Input { key, variety, driver: _ } => {
                key.hash(&mut h);
                variety.hash(&mut h)
            }
            TypedOp::Buffer { alloc, size, align } => {
                alloc.hash(&mut h);
                size.hash(&mut h);
                align.hash(&mut h)
            }
            TypedOp::Offset { bytes } => bytes.hash(&mut h),
            TypedOp::AtIndex { elem_size } => elem_size.hash(&mut h),
            TypedOp::Copy { size, mode, repeat } => {
                size.hash(&mut h);
                mode.hash(&mut h);
                repeat.hash(&mut h)
            }
            TypedOp::Subroutine { label, body, uid } => {
                label.hash(&mut h);
                body.hash(&mut h);
                uid.hash(&mut h)
            }
            TypedOp::SubroutineStateAllocation { of } => of.hash(&mut h),
            TypedOp::BoundaryBuffer { capacity, elem } => {
                capacity.hash(&mut h);
                elem.type_hash().hash(&mut h)
            }
            TypedOp::GetSlot { index } | TypedOp::SetSlot { index } => {
                index.hash(&mut h)
            }
        }
        h.finish()
    }

    /// remap interior subgraph references when copying between arenas
    pub fn map_subgraphs<F: FnMut(TypedId) -> TypedId>(self, mut f: F) -> TypedOp {
        match self {
            TypedOp::FunctionCall { label, body, arg, result } => {
                TypedOp::FunctionCall { label, body: f(body), arg, result }
            }
            TypedOp::FunctionSequence {
                label,
                arg_formula,
                res_formula,
                iterator,
                generator,
                tail,
                count,
            } => TypedOp::FunctionSequence {
                label,
                arg_formula,
                res_formula,
                iterator: f(iterator),
                generator: f(generator),
                tail: f(tail),
                count,
            },
            TypedOp::Switch { label, branches, result } => {
                let branches: Arc<[TypedId]> =
                    branches.iter().map(|b| f(*b)).collect();
                TypedOp::Switch { label, branches, result }
            }
            TypedOp::Subroutine { label, body, uid } => {
                TypedOp::Subroutine { label, body: f(body), uid }
            }
            op => op,
        }
    }

    /// interior subgraph roots scheduled as their own units
    pub fn subgraphs(&self) -> SmallSubgraphs {
        let mut out = SmallSubgraphs::default();
        match self {
            TypedOp::FunctionCall { body, .. } => out.push(*body),
            TypedOp::FunctionSequence { iterator, generator, tail, .. } => {
                out.push(*iterator);
                out.push(*generator);
                out.push(*tail);
            }
            TypedOp::Switch { branches, .. } => {
                for b in branches.iter() {
                    out.push(*b)
                }
            }
            TypedOp::Subroutine { body, .. } => out.push(*body),
            _ => (),
        }
        out
    }
}

pub type SmallSubgraphs = smallvec::SmallVec<[TypedId; 3]>;

/// Encode a constant of type `ty` as its runtime bit pattern. Compile
/// time values encode to nothing; native defaults are zero. Invariants
/// that still carry a value encode through their natural native
/// container only when the caller asks for a sized image.
pub fn encode_constant(ty: &Type) -> Arc<[u8]> {
    let mut out = Vec::with_capacity(ty.size());
    encode_into(ty, &mut out);
    Arc::from(out.as_slice())
}

fn encode_into(ty: &Type, out: &mut Vec<u8>) {
    match ty {
        Type::Float32 => out.extend_from_slice(&0f32.to_le_bytes()),
        Type::Float64 => out.extend_from_slice(&0f64.to_le_bytes()),
        Type::Int32 => out.extend_from_slice(&0i32.to_le_bytes()),
        Type::Int64 => out.extend_from_slice(&0i64.to_le_bytes()),
        Type::Vector(e, w) => {
            for _ in 0..*w {
                encode_into(&Type::native(NativeTy::scalar(*e)), out)
            }
        }
        Type::Tuple(d) => {
            encode_into(&d.fst, out);
            encode_into(&d.rst, out);
        }
        Type::User(_, c) => encode_into(c, out),
        _ => (),
    }
}

/// encode a native scalar value to its bit pattern
pub fn encode_scalar(ty: NativeTy, value: f64) -> Arc<[u8]> {
    let mut out = Vec::with_capacity(ty.size());
    for _ in 0..ty.width {
        match ty.elem {
            crate::typ::Scalar::Float32 => {
                out.extend_from_slice(&(value as f32).to_le_bytes())
            }
            crate::typ::Scalar::Float64 => out.extend_from_slice(&value.to_le_bytes()),
            crate::typ::Scalar::Int32 => {
                out.extend_from_slice(&(value as i32).to_le_bytes())
            }
            crate::typ::Scalar::Int64 => {
                out.extend_from_slice(&(value as i64).to_le_bytes())
            }
        }
    }
    Arc::from(out.as_slice())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::typ::Scalar;

    #[test]
    fn constant_bit_patterns_round_trip() {
        for (nt, v) in [
            (NativeTy::scalar(Scalar::Float32), 1.5f64),
            (NativeTy::scalar(Scalar::Float64), -2.25),
            (NativeTy::scalar(Scalar::Int32), 42.0),
            (NativeTy::scalar(Scalar::Int64), -7.0),
            (NativeTy { elem: Scalar::Float32, width: 4 }, 0.5),
        ] {
            let data = encode_scalar(nt, v);
            assert_eq!(data.len(), nt.size());
            match nt.elem {
                Scalar::Float32 => {
                    let mut b = [0u8; 4];
                    b.copy_from_slice(&data[..4]);
                    assert_eq!(f32::from_le_bytes(b), v as f32);
                }
                Scalar::Float64 => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(&data[..8]);
                    assert_eq!(f64::from_le_bytes(b), v);
                }
                Scalar::Int32 => {
                    let mut b = [0u8; 4];
                    b.copy_from_slice(&data[..4]);
                    assert_eq!(i32::from_le_bytes(b), v as i32);
                }
                Scalar::Int64 => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(&data[..8]);
                    assert_eq!(i64::from_le_bytes(b), v as i64);
                }
            }
        }
    }

    #[test]
    fn zero_sized_constants_encode_empty() {
        assert!(encode_constant(&Type::Nil).is_empty());
        assert!(encode_constant(&Type::invariant_i64(9)).is_empty());
    }
}
