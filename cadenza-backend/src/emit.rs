//! The generic emitter: schedules typed nodes into conditionally
//! active regions gated by activity mask bits and drives a backend
//! through function bodies. Parametric in [Backend]; nothing upstream
//! of this file knows backend tokens.

use crate::{
    module::{CodeGenPass, DriverActivity},
    Backend, BinOp,
};
use anyhow::{anyhow, bail, Result};
use cadenza_compiler::{
    graph::{
        typed::{BufferAlloc, CopyMode, TypedOp},
        GenericGraph, MathOp, RxId, TypedGraph, TypedId,
    },
    rx::RxGraph,
    typ::{NativeTy, Scalar, Type, UNION_TAG_SIZE},
};
use compact_str::format_compact;
use fxhash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Disjunction of conjunctions of mask bit indices. `None` is
/// statically active; an empty disjunction is never active.
pub type ActivityMaskVector = Option<Vec<SmallVec<[i64; 2]>>>;

/// instance memory layout shared by the emitter and the runtime ABI
#[derive(Debug, Clone, Default)]
pub struct Layout {
    pub slot_offset: usize,
    pub slot_count: u32,
    pub buffer_offsets: FxHashMap<TypedId, usize>,
    /// per subroutine state footprint, reported through the sizing
    /// globals
    pub subroutine_sizes: FxHashMap<u64, usize>,
    pub state_size: usize,
    pub mask_offset: usize,
    pub mask_words: usize,
    pub symbol_offset: usize,
    pub symbol_count: usize,
    pub total_size: usize,
    pub symbol_index: FxHashMap<arcstr::ArcStr, usize>,
}

fn align_to(v: usize, a: usize) -> usize {
    v.div_ceil(a) * a
}

/// walk everything reachable including interior subgraphs
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

/// The sizing pass: assign module buffer offsets, compute subroutine
/// state footprints and the total instance size.
pub fn layout(
    g: &TypedGraph,
    root: TypedId,
    slot_count: u32,
    mask_bits: usize,
    symbols: impl Iterator<Item = arcstr::ArcStr>,
) -> Layout {
    let mut l = Layout::default();
    l.slot_offset = 0;
    l.slot_count = slot_count;
    let mut off = slot_count as usize * 4;
    for id in full_order(g, root) {
        if let TypedOp::Buffer { alloc: BufferAlloc::Module, size, align } = g.op(id) {
            off = align_to(off, (*align).max(1));
            l.buffer_offsets.insert(id, off);
            off += size;
        }
    }
    l.state_size = off;
    // per subroutine footprints for the sizing globals
    for id in full_order(g, root) {
        if let TypedOp::Subroutine { body, uid, .. } = g.op(id) {
            let mut size = 0usize;
            for b in full_order(g, *body) {
                if let TypedOp::Buffer { alloc: BufferAlloc::Module, size: s, .. } =
                    g.op(b)
                {
                    size += s;
                }
            }
            l.subroutine_sizes.insert(*uid, size);
        }
    }
    l.mask_offset = align_to(l.state_size, 4);
    l.mask_words = mask_bits.div_ceil(32);
    l.symbol_offset = align_to(l.mask_offset + l.mask_words * 4, 8);
    for (i, k) in symbols.enumerate() {
        l.symbol_index.insert(k, i);
    }
    l.symbol_count = l.symbol_index.len();
    l.total_size = align_to(l.symbol_offset + l.symbol_count * 8, 32);
    l
}

/// map a node's reactivity onto mask conjunctions under the current
/// pass
pub fn activity_mask(
    rx: &RxGraph,
    pass: &CodeGenPass,
    node_rx: Option<RxId>,
) -> ActivityMaskVector {
    let r = node_rx?;
    let mut conjs: Vec<SmallVec<[i64; 2]>> = Vec::new();
    for d in rx.driver_ids(r) {
        let sig = match rx.signature(d) {
            Some(s) => s,
            None => return None,
        };
        match pass.is_driver_active(sig) {
            DriverActivity::Always => return None,
            DriverActivity::Never => (),
            DriverActivity::Bit(b) => conjs.push(SmallVec::from_slice(&[b])),
        }
    }
    conjs.sort();
    conjs.dedup();
    Some(conjs)
}

/// Topological sort with the scheduling keys: data dependency first,
/// then mask block membership (larger mask sets first, equal masks
/// contiguous), then per node priority.
pub fn schedule(
    g: &TypedGraph,
    rx: &RxGraph,
    pass: &CodeGenPass,
    body: TypedId,
) -> Vec<(TypedId, ActivityMaskVector)> {
    let nodes = g.postorder(body);
    let index: FxHashMap<TypedId, usize> =
        nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
    let masks: FxHashMap<TypedId, ActivityMaskVector> = nodes
        .iter()
        .map(|n| (*n, activity_mask(rx, pass, g.reactivity(*n))))
        .collect();
    let mut indeg: FxHashMap<TypedId, usize> = FxHashMap::default();
    let mut users: FxHashMap<TypedId, SmallVec<[TypedId; 2]>> = FxHashMap::default();
    for &n in &nodes {
        indeg.entry(n).or_insert(0);
        for &u in g.ups(n) {
            if u != n && index.contains_key(&u) {
                *indeg.entry(n).or_insert(0) += 1;
                users.entry(u).or_default().push(n);
            }
        }
    }
    let mut ready: Vec<TypedId> =
        nodes.iter().copied().filter(|n| indeg[n] == 0).collect();
    let mut out = Vec::with_capacity(nodes.len());
    let mut last_mask: Option<ActivityMaskVector> = None;
    while !ready.is_empty() {
        let pick = {
            let score = |n: &TypedId| {
                let m = &masks[n];
                let same = Some(m) == last_mask.as_ref();
                let msize = m.as_ref().map(|v| v.len()).unwrap_or(0);
                // same block first, then larger mask sets, then node
                // priority, then stable order
                (
                    !same,
                    std::cmp::Reverse(msize),
                    std::cmp::Reverse(g.op(*n).priority()),
                    index[n],
                )
            };
            let (i, _) = ready
                .iter()
                .enumerate()
                .min_by_key(|(_, n)| score(n))
                .expect("ready set not empty");
            ready.remove(i)
        };
        last_mask = Some(masks[&pick].clone());
        out.push((pick, masks[&pick].clone()));
        if let Some(us) = users.get(&pick) {
            for &u in us.clone().iter() {
                let d = indeg.get_mut(&u).expect("indexed");
                *d -= 1;
                if *d == 0 {
                    ready.push(u);
                }
            }
        }
    }
    out
}

pub struct Emitter<'a, B: Backend> {
    pub b: &'a mut B,
    pub g: &'a TypedGraph,
    pub formulas: &'a GenericGraph,
    pub rx: &'a RxGraph,
    pub pass: &'a CodeGenPass,
    pub layout: &'a Layout,
    fns: FxHashMap<TypedId, B::Func>,
    values: FxHashMap<TypedId, B::Val>,
    instance: Option<B::Val>,
    arg: Option<B::Val>,
    counter: Option<B::Val>,
}

impl<'a, B: Backend> Emitter<'a, B> {
    pub fn new(
        b: &'a mut B,
        g: &'a TypedGraph,
        formulas: &'a GenericGraph,
        rx: &'a RxGraph,
        pass: &'a CodeGenPass,
        layout: &'a Layout,
    ) -> Self {
        Emitter {
            b,
            g,
            formulas,
            rx,
            pass,
            layout,
            fns: FxHashMap::default(),
            values: FxHashMap::default(),
            instance: None,
            arg: None,
            counter: None,
        }
    }

    fn native_ty(&mut self, nt: NativeTy) -> B::Ty {
        let elem = match nt.elem {
            Scalar::Float32 => self.b.float_ty(32),
            Scalar::Float64 => self.b.float_ty(64),
            Scalar::Int32 => self.b.int_ty(32),
            Scalar::Int64 => self.b.int_ty(64),
        };
        if nt.width > 1 {
            self.b.vector_ty(elem, nt.width)
        } else {
            elem
        }
    }

    /// native scalars stay in registers, aggregates travel as
    /// pointers
    fn value_ty(&mut self, ty: &Type) -> B::Ty {
        match ty.native_ty() {
            Some(nt) => self.native_ty(nt),
            None => self.b.ptr_ty(),
        }
    }

    fn instance(&mut self) -> B::Val {
        match &self.instance {
            Some(v) => v.clone(),
            None => {
                let v = self.b.fn_arg(0);
                self.instance = Some(v.clone());
                v
            }
        }
    }

    fn i32_const(&mut self, v: i64) -> B::Val {
        let ty = self.b.int_ty(32);
        self.b.const_int(&ty, v)
    }

    fn offset_ptr(&mut self, base: B::Val, bytes: usize) -> B::Val {
        if bytes == 0 {
            return base;
        }
        let ty = self.b.int_ty(64);
        let off = self.b.const_int(&ty, bytes as i64);
        self.b.gep(base, off)
    }

    fn slot_ptr(&mut self, index: u32) -> B::Val {
        let inst = self.instance();
        self.offset_ptr(inst, self.layout.slot_offset + index as usize * 4)
    }

    fn mask_word_ptr(&mut self, word: usize) -> B::Val {
        let inst = self.instance();
        self.offset_ptr(inst, self.layout.mask_offset + word * 4)
    }

    /// read one activity mask bit
    fn mask_bit(&mut self, bit: i64) -> B::Val {
        let word = (bit / 32) as usize;
        let sub = (bit % 32) as u32;
        let p = self.mask_word_ptr(word);
        let i32t = self.b.int_ty(32);
        let w = self.b.load(&i32t, p);
        let m = self.b.const_int(&i32t, 1i64 << sub);
        let and = self.b.binop(BinOp::And, &i32t, w, m);
        let zero = self.b.const_int(&i32t, 0);
        self.b.binop(BinOp::Ne, &i32t, and, zero)
    }

    /// OR of ANDs over the mask bits of a region
    fn node_active_flag(&mut self, conjs: &[SmallVec<[i64; 2]>]) -> B::Val {
        let i32t = self.b.int_ty(32);
        let mut whole: Option<B::Val> = None;
        for conj in conjs {
            let mut c: Option<B::Val> = None;
            for &bit in conj {
                let t = self.mask_bit(bit);
                c = Some(match c {
                    None => t,
                    Some(p) => self.b.binop(BinOp::And, &i32t, p, t),
                });
            }
            if let Some(c) = c {
                whole = Some(match whole {
                    None => c,
                    Some(p) => self.b.binop(BinOp::Or, &i32t, p, c),
                });
            }
        }
        match whole {
            Some(v) => v,
            None => self.b.const_int(&i32t, 0),
        }
    }

    /// Emit a function for a body subgraph: `(instance, argument,
    /// counter) -> result`. Memoized per body root.
    pub fn function_for(&mut self, label: &str, body: TypedId) -> Result<B::Func> {
        if let Some(f) = self.fns.get(&body) {
            return Ok(f.clone());
        }
        let ptr = self.b.ptr_ty();
        // the argument type comes from the Argument nodes inside
        let arg_ty = self.body_arg_ty(body);
        let i32t = self.b.int_ty(32);
        let ret = {
            let t = self.g.ty(body).clone();
            self.value_ty(&t)
        };
        let f = self.b.declare_function(
            &format_compact!("{label}_{}", body.index()),
            &[ptr, arg_ty, i32t],
            ret,
        );
        self.fns.insert(body, f.clone());

        let saved_vals = std::mem::take(&mut self.values);
        let saved_inst = self.instance.take();
        let saved_arg = self.arg.take();
        let saved_ctr = self.counter.take();

        self.b.begin_function(&f);
        self.instance = Some(self.b.fn_arg(0));
        self.arg = Some(self.b.fn_arg(1));
        self.counter = Some(self.b.fn_arg(2));
        let out = self.build_body(body)?;
        self.b.end_function(Some(out));

        self.values = saved_vals;
        self.instance = saved_inst;
        self.arg = saved_arg;
        self.counter = saved_ctr;
        Ok(f)
    }

    fn body_arg_ty(&mut self, body: TypedId) -> B::Ty {
        for id in self.g.postorder(body) {
            if matches!(self.g.op(id), TypedOp::Argument) {
                let t = self.g.ty(id).clone();
                return self.value_ty(&t);
            }
        }
        self.b.ptr_ty()
    }

    /// Schedule and emit one body: maximal runs of nodes sharing a
    /// non empty mask become `if (active) { eager } else { passive }`
    /// regions; region outputs merge through selects so downstream
    /// references stay defined.
    pub fn build_body(&mut self, body: TypedId) -> Result<B::Val> {
        let scheduled = schedule(self.g, self.rx, self.pass, body);
        let mut i = 0usize;
        while i < scheduled.len() {
            let mask = scheduled[i].1.clone();
            let mut j = i;
            while j < scheduled.len() && scheduled[j].1 == mask {
                j += 1;
            }
            let run: Vec<TypedId> = scheduled[i..j].iter().map(|(n, _)| *n).collect();
            match &mask {
                None => {
                    for n in &run {
                        let v = self.emit_node(*n)?;
                        self.values.insert(*n, v);
                    }
                }
                Some(conjs) if conjs.is_empty() => {
                    // never active in this pass
                    for n in &run {
                        let ty = self.g.ty(*n).clone();
                        let t = self.value_ty(&ty);
                        let v = self.b.undef(&t);
                        self.values.insert(*n, v);
                    }
                }
                Some(conjs) => {
                    let flag = self.node_active_flag(conjs);
                    let mut eager: FxHashMap<TypedId, B::Val> = FxHashMap::default();
                    self.b.begin_if(flag.clone());
                    for n in &run {
                        let v = self.emit_node(*n)?;
                        eager.insert(*n, v.clone());
                        self.values.insert(*n, v);
                    }
                    self.b.begin_else();
                    let mut passive: FxHashMap<TypedId, B::Val> = FxHashMap::default();
                    for n in &run {
                        let ty = self.g.ty(*n).clone();
                        let t = self.value_ty(&ty);
                        let v = self.b.undef(&t);
                        passive.insert(*n, v);
                    }
                    self.b.end_if();
                    for n in &run {
                        let v = self.b.select(
                            flag.clone(),
                            eager[n].clone(),
                            passive[n].clone(),
                        );
                        self.values.insert(*n, v);
                    }
                }
            }
            i = j;
        }
        self.value(body)
    }

    fn value(&mut self, id: TypedId) -> Result<B::Val> {
        self.values
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("unscheduled node {id:?}"))
    }

    fn store_value(&mut self, ty: &Type, v: B::Val, ptr: B::Val) {
        match ty.native_ty() {
            Some(_) => self.b.store(v, ptr),
            None => self.b.memcpy(ptr, v, ty.size()),
        }
    }

    fn emit_node(&mut self, id: TypedId) -> Result<B::Val> {
        let ty = self.g.ty(id).clone();
        match self.g.op(id).clone() {
            TypedOp::Argument => {
                self.arg.clone().ok_or_else(|| anyhow!("argument outside a frame"))
            }
            TypedOp::SequenceCounter => {
                self.counter.clone().ok_or_else(|| anyhow!("counter outside a frame"))
            }
            TypedOp::Deps => self.value(self.g.up(id, 0)),
            TypedOp::Constant { data } => {
                if let Some(nt) = ty.native_ty() {
                    if nt.width == 1 && data.len() == nt.size() {
                        let t = self.native_ty(nt);
                        return Ok(match nt.elem {
                            Scalar::Float32 => {
                                let mut b = [0u8; 4];
                                b.copy_from_slice(&data);
                                self.b.const_float(&t, f32::from_le_bytes(b) as f64)
                            }
                            Scalar::Float64 => {
                                let mut b = [0u8; 8];
                                b.copy_from_slice(&data);
                                self.b.const_float(&t, f64::from_le_bytes(b))
                            }
                            Scalar::Int32 => {
                                let mut b = [0u8; 4];
                                b.copy_from_slice(&data);
                                self.b.const_int(&t, i32::from_le_bytes(b) as i64)
                            }
                            Scalar::Int64 => {
                                let mut b = [0u8; 8];
                                b.copy_from_slice(&data);
                                self.b.const_int(&t, i64::from_le_bytes(b))
                            }
                        });
                    }
                }
                if data.is_empty() {
                    return Ok(self.i32_const(0));
                }
                Ok(self.b.intern_blob(self.g.graph_hash(id), &data))
            }
            TypedOp::Pair => {
                let l = self.g.up(id, 0);
                let r = self.g.up(id, 1);
                let lv = self.value(l)?;
                let rv = self.value(r)?;
                let lty = self.g.ty(l).clone();
                let rty = self.g.ty(r).clone();
                let slot = self.b.alloca(ty.size(), ty.align(), false);
                if lty.size() > 0 {
                    self.store_value(&lty, lv, slot.clone());
                }
                if rty.size() > 0 {
                    let p = self.offset_ptr(slot.clone(), lty.size());
                    self.store_value(&rty, rv, p);
                }
                Ok(slot)
            }
            TypedOp::First => {
                let v = self.value(self.g.up(id, 0))?;
                match ty.native_ty() {
                    Some(nt) => {
                        let t = self.native_ty(nt);
                        Ok(self.b.load(&t, v))
                    }
                    None => Ok(v),
                }
            }
            TypedOp::Rest => {
                let up = self.g.up(id, 0);
                let fst_size = self
                    .g
                    .ty(up)
                    .first()
                    .map(|t| t.size())
                    .unwrap_or(0);
                let v = self.value(up)?;
                let p = self.offset_ptr(v, fst_size);
                match ty.native_ty() {
                    Some(nt) => {
                        let t = self.native_ty(nt);
                        Ok(self.b.load(&t, p))
                    }
                    None => Ok(p),
                }
            }
            TypedOp::Native { op, ty: nt } => {
                let l = self.value(self.g.up(id, 0))?;
                let r = self.value(self.g.up(id, 1))?;
                let t = self.native_ty(nt);
                if op.is_comparison() {
                    let bop = match op {
                        MathOp::Equal => BinOp::Eq,
                        MathOp::Greater => BinOp::Gt,
                        MathOp::Less => BinOp::Lt,
                        _ => unreachable!(),
                    };
                    let c = self.b.binop(bop, &t, l, r);
                    let one = if nt.elem.is_float() {
                        self.b.const_float(&t, 1.0)
                    } else {
                        self.b.const_int(&t, 1)
                    };
                    let zero = if nt.elem.is_float() {
                        self.b.const_float(&t, 0.0)
                    } else {
                        self.b.const_int(&t, 0)
                    };
                    return Ok(self.b.select(c, one, zero));
                }
                let bop = match op {
                    MathOp::Add => BinOp::Add,
                    MathOp::Sub => BinOp::Sub,
                    MathOp::Mul => BinOp::Mul,
                    MathOp::Div => BinOp::Div,
                    MathOp::Mod => BinOp::Rem,
                    _ => unreachable!(),
                };
                Ok(self.b.binop(bop, &t, l, r))
            }
            TypedOp::Convert { to } => {
                let v = self.value(self.g.up(id, 0))?;
                let t = self.native_ty(to);
                Ok(self.b.convert(&t, v))
            }
            TypedOp::UnionTag => {
                let up = self.g.up(id, 0);
                let payload = self.g.ty(up).size().saturating_sub(UNION_TAG_SIZE);
                let v = self.value(up)?;
                let p = self.offset_ptr(v, payload);
                let t = self.b.int_ty(32);
                Ok(self.b.load(&t, p))
            }
            TypedOp::UnionWrap { index } => {
                let up = self.g.up(id, 0);
                let uty = ty.clone();
                let slot = self.b.alloca(uty.size(), uty.align(), true);
                let v = self.value(up)?;
                let upty = self.g.ty(up).clone();
                if upty.size() > 0 {
                    self.store_value(&upty, v, slot.clone());
                }
                let tagp =
                    self.offset_ptr(slot.clone(), uty.size() - UNION_TAG_SIZE);
                let tag = self.i32_const(index as i64);
                self.b.store(tag, tagp);
                Ok(slot)
            }
            TypedOp::Switch { label, branches, result } => {
                let sel = self.value(self.g.up(id, 0))?;
                let argv = self.value(self.g.up(id, 1))?;
                let slot = self.b.alloca(result.size().max(1), result.align(), false);
                self.b.begin_switch(sel);
                for (i, br) in branches.iter().enumerate() {
                    let f = self.function_for(&label, *br)?;
                    self.b.begin_case(i);
                    let inst = self.instance();
                    let k = self.counter_or_zero();
                    let rt = {
                        let t = self.g.ty(*br).clone();
                        self.value_ty(&t)
                    };
                    if let Some(v) =
                        self.b.call(&f, &[inst, argv.clone(), k], Some(&rt))
                    {
                        let bty = self.g.ty(*br).clone();
                        if bty.size() > 0 {
                            self.store_value(&bty, v, slot.clone());
                        }
                    }
                    self.b.end_case();
                }
                self.b.end_switch();
                match result.native_ty() {
                    Some(nt) => {
                        let t = self.native_ty(nt);
                        Ok(self.b.load(&t, slot))
                    }
                    None => Ok(slot),
                }
            }
            TypedOp::Subroutine { label, body, uid: _ } => {
                let f = self.function_for(&label, body)?;
                let argv = self.value(self.g.up(id, 0))?;
                let inst = self.instance();
                let k = self.counter_or_zero();
                if !self.body_refers_local_buffers(body) {
                    self.b.tail_call_hint();
                }
                let rt = self.value_ty(&ty);
                self.b
                    .call(&f, &[inst, argv, k], Some(&rt))
                    .ok_or_else(|| anyhow!("call without value"))
            }
            TypedOp::SubroutineStateAllocation { of } => {
                // state windows are fixed offsets from the instance;
                // the named size global keeps the contract observable
                let size =
                    self.layout.subroutine_sizes.get(&of).copied().unwrap_or(0);
                self.b.set_global_const(&format_compact!("sizeof_{of}"), size as i64);
                Ok(self.instance())
            }
            TypedOp::FunctionSequence {
                label,
                iterator,
                generator,
                tail,
                count,
                ..
            } => self.emit_sequence(id, &label, iterator, generator, tail, count),
            TypedOp::Buffer { alloc, size, align } => match alloc {
                BufferAlloc::Module => {
                    let off = self
                        .layout
                        .buffer_offsets
                        .get(&id)
                        .copied()
                        .ok_or_else(|| anyhow!("module buffer without layout"))?;
                    let inst = self.instance();
                    Ok(self.offset_ptr(inst, off))
                }
                BufferAlloc::Stack => Ok(self.b.alloca(size, align, false)),
                BufferAlloc::StackZeroed => Ok(self.b.alloca(size, align, true)),
                BufferAlloc::Empty => Ok(self.b.alloca(0, 1, false)),
            },
            TypedOp::Offset { bytes } => {
                let v = self.value(self.g.up(id, 0))?;
                Ok(self.offset_ptr(v, bytes as usize))
            }
            TypedOp::AtIndex { elem_size } => {
                let p = self.value(self.g.up(id, 0))?;
                let idx = self.value(self.g.up(id, 1))?;
                let i64t = self.b.int_ty(64);
                let ext = self.b.convert(&i64t, idx);
                let sz = self.b.const_int(&i64t, elem_size as i64);
                let off = self.b.binop(BinOp::Mul, &i64t, ext, sz);
                Ok(self.b.gep(p, off))
            }
            TypedOp::Dereference => {
                let v = self.value(self.g.up(id, 0))?;
                match ty.native_ty() {
                    Some(nt) => {
                        let t = self.native_ty(nt);
                        Ok(self.b.load(&t, v))
                    }
                    None => Ok(v),
                }
            }
            TypedOp::Copy { size, mode, repeat } => {
                let dst = self.value(self.g.up(id, 0))?;
                let src = self.value(self.g.up(id, 1))?;
                let src_ty = self.g.ty(self.g.up(id, 1)).clone();
                if repeat > 1 {
                    // tiled fill
                    let i32t = self.b.int_ty(32);
                    let n = self.b.const_int(&i32t, repeat as i64);
                    let ind = self.b.begin_loop(n);
                    let i64t = self.b.int_ty(64);
                    let ext = self.b.convert(&i64t, ind);
                    let sz = self.b.const_int(&i64t, size as i64);
                    let off = self.b.binop(BinOp::Mul, &i64t, ext, sz);
                    let at = self.b.gep(dst.clone(), off);
                    match (mode, src_ty.native_ty()) {
                        (CopyMode::Store, Some(_)) => self.b.store(src.clone(), at),
                        _ => self.b.memcpy(at, src.clone(), size),
                    }
                    self.b.end_loop();
                    return Ok(dst);
                }
                match (mode, src_ty.native_ty()) {
                    (CopyMode::Store, Some(_)) => self.b.store(src, dst.clone()),
                    _ => self.b.memcpy(dst.clone(), src, size),
                }
                Ok(dst)
            }
            TypedOp::GetSlot { index } => {
                let p = self.slot_ptr(index);
                let t = self.b.int_ty(32);
                Ok(self.b.load(&t, p))
            }
            TypedOp::SetSlot { index } => {
                let v = self.value(self.g.up(id, 0))?;
                let p = self.slot_ptr(index);
                self.b.store(v, p);
                Ok(self.i32_const(0))
            }
            TypedOp::Input { key, .. } => {
                let idx = self
                    .layout
                    .symbol_index
                    .get(&key)
                    .copied()
                    .ok_or_else(|| anyhow!("input {key} missing from symbol table"))?;
                let inst = self.instance();
                let pp = self.offset_ptr(inst, self.layout.symbol_offset + idx * 8);
                let pt = self.b.ptr_ty();
                let p = self.b.load(&pt, pp);
                match ty.native_ty() {
                    Some(nt) => {
                        let t = self.native_ty(nt);
                        Ok(self.b.load(&t, p))
                    }
                    None => Ok(p),
                }
            }
            TypedOp::RingBuffer { .. } | TypedOp::BoundaryBuffer { .. } => {
                bail!("stateful node survived side effect lowering")
            }
            TypedOp::FunctionCall { .. } => {
                bail!("function call survived side effect lowering")
            }
        }
    }

    fn counter_or_zero(&mut self) -> B::Val {
        match &self.counter {
            Some(c) => c.clone(),
            None => self.i32_const(0),
        }
    }

    fn body_refers_local_buffers(&self, body: TypedId) -> bool {
        self.g.postorder(body).into_iter().any(|id| {
            matches!(
                self.g.op(id),
                TypedOp::Buffer {
                    alloc: BufferAlloc::Stack | BufferAlloc::StackZeroed,
                    ..
                }
            )
        })
    }

    /// A solved recurrence becomes a predicated self call that
    /// degenerates to the tail form on the terminating iteration:
    /// `seq(k, x) = k == N-1 ? tail(x) : gen(x, seq(k+1, iter(x)))`.
    fn emit_sequence(
        &mut self,
        id: TypedId,
        label: &str,
        iterator: TypedId,
        generator: TypedId,
        tail: TypedId,
        count: i64,
    ) -> Result<B::Val> {
        let iter_f = self.function_for(&format_compact!("{label}_iter"), iterator)?;
        let gen_f = self.function_for(&format_compact!("{label}_gen"), generator)?;
        let tail_f = self.function_for(&format_compact!("{label}_tail"), tail)?;

        let seq_f = if let Some(f) = self.fns.get(&id) {
            f.clone()
        } else {
            let ptr = self.b.ptr_ty();
            let i32t = self.b.int_ty(32);
            let arg_t = self.body_arg_ty(iterator);
            let res_t = {
                let t = self.g.ty(id).clone();
                self.value_ty(&t)
            };
            let f = self.b.declare_function(
                &format_compact!("{label}_{}", id.index()),
                &[ptr.clone(), arg_t.clone(), i32t.clone()],
                res_t.clone(),
            );
            self.fns.insert(id, f.clone());

            let saved_vals = std::mem::take(&mut self.values);
            let saved_inst = self.instance.take();
            let saved_arg = self.arg.take();
            let saved_ctr = self.counter.take();

            self.b.begin_function(&f);
            let inst = self.b.fn_arg(0);
            let x = self.b.fn_arg(1);
            let k = self.b.fn_arg(2);
            let result_ty = self.g.ty(id).clone();
            let slot = self.b.alloca(result_ty.size().max(1), result_ty.align(), false);
            let last = self.b.const_int(&i32t, count - 1);
            let is_last = self.b.binop(BinOp::Eq, &i32t, k.clone(), last);
            self.b.begin_if(is_last.clone());
            {
                // terminating iteration: plain tail form
                let tail_res_t = {
                    let t = self.g.ty(tail).clone();
                    self.value_ty(&t)
                };
                self.b.tail_call_hint();
                if let Some(v) = self.b.call(
                    &tail_f,
                    &[inst.clone(), x.clone(), k.clone()],
                    Some(&tail_res_t),
                ) {
                    let t = self.g.ty(tail).clone();
                    if t.size() > 0 {
                        self.store_value(&t, v, slot.clone());
                    }
                }
            }
            self.b.begin_else();
            {
                let iter_res_t = {
                    let t = self.g.ty(iterator).clone();
                    self.value_ty(&t)
                };
                let next_arg = self
                    .b
                    .call(&iter_f, &[inst.clone(), x.clone(), k.clone()], Some(&iter_res_t))
                    .ok_or_else(|| anyhow!("iterator produced no value"))?;
                let one = self.b.const_int(&i32t, 1);
                let k1 = self.b.binop(BinOp::Add, &i32t, k.clone(), one);
                let rec = self
                    .b
                    .call(&f, &[inst.clone(), next_arg, k1], Some(&res_t))
                    .ok_or_else(|| anyhow!("recursive call produced no value"))?;
                // generator sees (argument, recursive result)
                let iter_arg_ty = self.g.ty(iterator).clone();
                let gen_res = self.g.ty(generator).clone();
                let pair_size = iter_arg_ty.size() + result_ty.size();
                let pairp = self.b.alloca(pair_size.max(1), result_ty.align(), false);
                let xt = self
                    .g
                    .postorder(iterator)
                    .into_iter()
                    .find(|n| matches!(self.g.op(*n), TypedOp::Argument))
                    .map(|n| self.g.ty(n).clone())
                    .unwrap_or(Type::Nil);
                if xt.size() > 0 {
                    self.store_value(&xt, x.clone(), pairp.clone());
                }
                let rp = self.offset_ptr(pairp.clone(), xt.size());
                if result_ty.size() > 0 {
                    self.store_value(&result_ty, rec, rp);
                }
                let gen_res_t = self.value_ty(&gen_res);
                if let Some(v) = self.b.call(
                    &gen_f,
                    &[inst.clone(), pairp, k.clone()],
                    Some(&gen_res_t),
                ) {
                    if gen_res.size() > 0 {
                        self.store_value(&gen_res, v, slot.clone());
                    }
                }
            }
            self.b.end_if();
            let out = match result_ty.native_ty() {
                Some(nt) => {
                    let t = self.native_ty(nt);
                    self.b.load(&t, slot)
                }
                None => slot,
            };
            self.b.end_function(Some(out));

            self.values = saved_vals;
            self.instance = saved_inst;
            self.arg = saved_arg;
            self.counter = saved_ctr;
            f
        };

        let argv = self.value(self.g.up(id, 0))?;
        let inst = self.instance();
        let zero = self.i32_const(0);
        let rt = {
            let t = self.g.ty(id).clone();
            self.value_ty(&t)
        };
        self.b
            .call(&seq_f, &[inst, argv, zero], Some(&rt))
            .ok_or_else(|| anyhow!("sequence call produced no value"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use cadenza_compiler::rx::DriverSignature;
    use proptest::prelude::*;
    use smallvec::smallvec;

    fn simple_graph(n: usize) -> (TypedGraph, TypedId) {
        let mut g = TypedGraph::new();
        let mut last = g.add(TypedOp::Argument, smallvec![], Type::Float32);
        for _ in 0..n {
            last = g.add(TypedOp::First, smallvec![last], Type::Float32);
        }
        (g, last)
    }

    #[test]
    fn schedule_is_a_permutation_respecting_deps() {
        let (g, root) = simple_graph(5);
        let rxg = RxGraph::new();
        let pass = CodeGenPass::new("t", crate::module::CounterIndices::new());
        let sched = schedule(&g, &rxg, &pass, root);
        let base = g.postorder(root);
        assert_eq!(sched.len(), base.len());
        let pos: FxHashMap<TypedId, usize> =
            sched.iter().enumerate().map(|(i, (n, _))| (*n, i)).collect();
        for (n, _) in &sched {
            for u in g.ups(*n) {
                if u != n {
                    assert!(pos[u] < pos[n]);
                }
            }
        }
    }

    proptest! {
        #[test]
        fn schedule_always_permutes(n in 1usize..40) {
            let (g, root) = simple_graph(n);
            let rxg = RxGraph::new();
            let pass = CodeGenPass::new("t", crate::module::CounterIndices::new());
            let sched = schedule(&g, &rxg, &pass, root);
            let mut a: Vec<_> = sched.iter().map(|(n, _)| *n).collect();
            let mut b = g.postorder(root);
            a.sort();
            b.sort();
            prop_assert_eq!(a, b);
        }
    }

    #[test]
    fn mask_blocks_are_contiguous() {
        // two drivers, nodes alternating between them; the schedule
        // must not interleave the mask blocks more than dependencies
        // force
        let mut g = TypedGraph::new();
        let mut rxg = RxGraph::new();
        let a = rxg.driver(DriverSignature::user(&arcstr::literal!("a"), 1.0, 2.0));
        let b = rxg.driver(DriverSignature::user(&arcstr::literal!("b"), 1.0, 4.0));
        let mut nodes = vec![];
        for i in 0..6u32 {
            // slot reads are not interned, so each node keeps its own
            // identity and reactivity
            let n = g.add(TypedOp::GetSlot { index: i }, smallvec![], Type::Float32);
            g.set_reactivity(n, Some(if i % 2 == 0 { a } else { b }));
            nodes.push(n);
        }
        let root = {
            let mut last = nodes[0];
            for n in &nodes[1..] {
                last = g.add(
                    TypedOp::Native {
                        op: MathOp::Add,
                        ty: NativeTy::scalar(Scalar::Float32),
                    },
                    smallvec![last, *n],
                    Type::Float32,
                );
            }
            last
        };
        let mut build = cadenza_compiler::module::BuildModule::new(
            Type::Nil,
            Type::Nil,
        );
        let drivers = vec![
            DriverSignature::user(&arcstr::literal!("a"), 1.0, 2.0),
            DriverSignature::user(&arcstr::literal!("b"), 1.0, 4.0),
        ];
        let (m, _) = crate::module::activation_matrix(&drivers, 1);
        let mut set = crate::module::counter_set(&mut build, &m);
        crate::module::assign_mask_bits(&mut set);
        let mut pass = CodeGenPass::new("eval", set);
        for d in &drivers {
            pass.insert(d);
        }
        let sched = schedule(&g, &rxg, &pass, root);
        // count mask transitions among gated nodes; with two masks and
        // free ordering there should be few runs, not an alternation
        let gated: Vec<_> = sched
            .iter()
            .filter_map(|(_, m)| m.as_ref().map(|v| v.clone()))
            .collect();
        let mut runs = 1;
        for w in gated.windows(2) {
            if w[0] != w[1] {
                runs += 1;
            }
        }
        assert!(runs <= 3, "mask blocks fragmented into {runs} runs");
    }
}
