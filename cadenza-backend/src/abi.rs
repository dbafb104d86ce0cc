//! The runtime ABI of a compiled instance: entry points, instance
//! layout and the versioned class metadata blob. The layout is
//! `[state | mask words | symbol pointer slots]`, aligned to 32.

use crate::{
    callgraph,
    emit::{self, Emitter, Layout},
    module::{
        activation_matrix, assign_mask_bits, combine_rows,
        compute_auspicious_vector_length, counter_set, normalize_rates, CodeGenPass,
        CounterIndices, MAX_VECTOR_LENGTH,
    },
    Backend, BinOp, BuildFlag,
};
use anyhow::Result;
use cadenza_compiler::{
    graph::generic::Variety,
    rx::{DriverClass, DriverSignature},
    typ::Type,
    CompileOutput,
};
use compact_str::format_compact;
use enumflags2::BitFlags;
use log::info;

/// bumped whenever the packed metadata layout changes
pub const CLASS_METADATA_VERSION: u32 = 2;

/// type description JSON the runtime loader consumes
pub fn type_json(ty: &Type) -> serde_json::Value {
    use serde_json::json;
    match ty {
        Type::Nil => json!({ "kind": "nil" }),
        Type::True => json!({ "kind": "true" }),
        Type::Float32 => json!({ "kind": "Float32" }),
        Type::Float64 => json!({ "kind": "Float64" }),
        Type::Int32 => json!({ "kind": "Int32" }),
        Type::Int64 => json!({ "kind": "Int64" }),
        Type::Vector(e, w) => json!({ "kind": "Vector", "elem": e.name(), "width": w }),
        Type::Invariant(d) => json!({ "kind": "Invariant", "value": d.to_string() }),
        Type::InvariantString(s) => {
            json!({ "kind": "String", "value": s.as_str() })
        }
        Type::Tuple(d) => json!({
            "kind": "Tuple",
            "first": type_json(&d.fst),
            "rest": type_json(&d.rst),
        }),
        Type::User(tag, c) => json!({
            "kind": "User",
            "tag": tag.name().as_str(),
            "content": type_json(c),
        }),
        Type::Union(u) => json!({
            "kind": "Union",
            "variants": u.variants.iter().map(type_json).collect::<Vec<_>>(),
        }),
        Type::ArrayView(e) => json!({ "kind": "ArrayView", "elem": type_json(e) }),
        t => json!({ "kind": "opaque", "text": t.to_string() }),
    }
}

#[derive(Debug, Serialize)]
struct SymbolDescription {
    key: String,
    uid: u64,
    variety: String,
    rate: (f64, f64),
    clock: String,
    ty: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ClassDescription {
    version: u32,
    name: String,
    size: usize,
    state_slots: u32,
    mask_words: usize,
    result: serde_json::Value,
    symbols: Vec<SymbolDescription>,
    drivers: Vec<String>,
}

fn variety_name(v: Variety) -> &'static str {
    match v {
        Variety::Argument => "argument",
        Variety::Stream => "stream",
        Variety::Configuration => "configuration",
        Variety::External => "external",
        Variety::UnsafeExternal => "unsafe-external",
        Variety::Internal => "internal",
    }
}

/// everything a runtime loader needs to drive the emitted code
#[derive(Debug)]
pub struct ProgramInfo {
    pub layout: Layout,
    pub vector_length: i64,
    pub counters: CounterIndices,
    pub drivers: Vec<DriverSignature>,
    pub metadata_json: String,
}

fn driver_entry_name(d: &DriverSignature) -> String {
    match &d.metadata {
        Type::InvariantString(s) => s.to_string(),
        other => format_compact!("{other}").replace(['#', ' '], "_"),
    }
}

/// Emit the full program: the initialization and evaluation passes
/// over the lowered graph plus every runtime entry point.
pub fn build_program<B: Backend>(
    b: &mut B,
    out: &mut CompileOutput,
    name: &str,
    flags: BitFlags<BuildFlag>,
) -> Result<ProgramInfo> {
    let drivers = normalize_rates(&out.rx.drivers);
    let (scalar, _) = activation_matrix(&drivers, 1);
    let vector_length = compute_auspicious_vector_length(&scalar, MAX_VECTOR_LENGTH);
    let (matrix, jitter) = activation_matrix(&drivers, vector_length);
    let combined = combine_rows(&matrix, jitter);
    let mut counters = counter_set(&mut out.module, &combined);
    let mask_bits = assign_mask_bits(&mut counters);
    info!(
        "activation: {} drivers, vector {}, superclock {}, {} counters",
        drivers.len(),
        vector_length,
        combined.rows.len(),
        counters.len()
    );

    let layout = emit::layout(
        &out.typed,
        out.root,
        out.module.slot_count(),
        mask_bits,
        out.module.symbols().map(|(k, _)| k.clone()),
    );

    let cg = callgraph::analyze(&out.typed, &out.rx.rx, out.root);
    info!("call graph: {} frames", cg.len());

    // the initialization pass runs every reactive node once
    let mut init_pass = CodeGenPass::new("init", counters.clone()).with_all_active();
    init_pass.insert(&DriverSignature::init());
    for d in &drivers {
        init_pass.insert(d);
    }
    // the evaluation pass honours activity masks; init work is gone
    let mut eval_pass = CodeGenPass::new("eval", counters.clone());
    for d in &drivers {
        eval_pass.insert(d);
    }

    let init_fn = {
        let mut em = Emitter::new(
            b,
            &out.typed,
            &out.formulas,
            &out.rx.rx,
            &init_pass,
            &layout,
        );
        em.function_for(&format_compact!("{name}_init_body"), out.root)?
    };
    let eval_fn = {
        let mut em = Emitter::new(
            b,
            &out.typed,
            &out.formulas,
            &out.rx.rx,
            &eval_pass,
            &layout,
        );
        em.function_for(&format_compact!("{name}_eval_body"), out.root)?
    };

    let ptr = b.ptr_ty();
    let i64t = b.int_ty(64);
    let i32t = b.int_ty(32);

    // GetSize: total bytes for an instance
    let f = b.declare_function(&format_compact!("{name}_GetSize"), &[], i64t.clone());
    b.begin_function(&f);
    let sz = b.const_int(&i64t, layout.total_size as i64);
    b.end_function(Some(sz));

    // GetSymbolOffset: offset of the i-th pointer slot
    let f = b.declare_function(
        &format_compact!("{name}_GetSymbolOffset"),
        &[i64t.clone()],
        i64t.clone(),
    );
    b.begin_function(&f);
    let i = b.fn_arg(0);
    let eight = b.const_int(&i64t, 8);
    let off = b.binop(BinOp::Mul, &i64t, i, eight);
    let base = b.const_int(&i64t, layout.symbol_offset as i64);
    let r = b.binop(BinOp::Add, &i64t, base, off);
    b.end_function(Some(r));

    // Initialize: zero the instance, then run the init pass with the
    // argument data
    let void_ty = b.void_ty();
    let f = b.declare_function(
        &format_compact!("{name}_Initialize"),
        &[ptr.clone(), ptr.clone()],
        void_ty,
    );
    b.begin_function(&f);
    let inst = b.fn_arg(0);
    let argp = b.fn_arg(1);
    b.memset(inst.clone(), 0, layout.symbol_offset);
    let zero = b.const_int(&i32t, 0);
    b.call(&init_fn, &[inst, argp, zero], None);
    b.end_function(None);

    // Evaluate: one ungated tick
    if !flags.contains(BuildFlag::OmitEvaluate) {
        let void_ty = b.void_ty();
        let f = b.declare_function(
            &format_compact!("{name}_Evaluate"),
            &[ptr.clone(), ptr.clone(), ptr.clone()],
            void_ty,
        );
        b.begin_function(&f);
        let inst = b.fn_arg(0);
        let inp = b.fn_arg(1);
        let outp = b.fn_arg(2);
        let zero = b.const_int(&i32t, 0);
        let r = b.call(&eval_fn, &[inst, inp, zero], Some(&ptr));
        if let Some(r) = r {
            let size = out.result_type.size();
            if out.result_type.native_ty().is_some() {
                b.store(r, outp);
            } else if size > 0 {
                b.memcpy(outp, r, size);
            }
        }
        b.end_function(None);
    }

    // Tick<Driver>: advance the driver's counters, refresh the mask
    // bits and evaluate for a number of super frames
    if !flags.contains(BuildFlag::OmitReactiveDrivers) {
        for d in drivers.iter().filter(|d| d.class == DriverClass::User) {
            let void_ty = b.void_ty();
            let f = b.declare_function(
                &format_compact!("{name}_Tick_{}", driver_entry_name(d)),
                &[ptr.clone(), ptr.clone(), i64t.clone()],
                void_ty,
            );
            b.begin_function(&f);
            let inst = b.fn_arg(0);
            let outp = b.fn_arg(1);
            let frames = b.fn_arg(2);
            let _ = b.begin_loop(frames);
            for (key, ctr) in (&counters).into_iter() {
                if key.metadata != d.metadata {
                    continue;
                }
                let slotp = {
                    let off = b.const_int(
                        &i64t,
                        (layout.slot_offset + ctr.index as usize * 4) as i64,
                    );
                    b.gep(inst.clone(), off)
                };
                let c = b.load(&i32t, slotp.clone());
                let one = b.const_int(&i32t, 1);
                let c1 = b.binop(BinOp::Add, &i32t, c, one);
                let divider = b.const_int(&i32t, ctr.divider);
                let wrapped = b.binop(BinOp::Rem, &i32t, c1, divider);
                b.store(wrapped.clone(), slotp);
                let zero = b.const_int(&i32t, 0);
                let gate = b.binop(BinOp::Eq, &i32t, wrapped, zero);
                store_mask_bit(b, &layout, inst.clone(), ctr.bitmask_index, gate);
            }
            let zero32 = b.const_int(&i32t, 0);
            let r = b.call(
                &eval_fn,
                &[inst.clone(), outp.clone(), zero32],
                Some(&ptr),
            );
            if let Some(r) = r {
                let size = out.result_type.size();
                if out.result_type.native_ty().is_some() {
                    b.store(r, outp.clone());
                } else if size > 0 {
                    b.memcpy(outp.clone(), r, size);
                }
            }
            b.end_loop();
            b.end_function(None);
        }
    }

    // GetValue: address of the i-th external pointer slot
    let f = b.declare_function(
        &format_compact!("{name}_GetValue"),
        &[ptr.clone(), i64t.clone()],
        ptr.clone(),
    );
    b.begin_function(&f);
    let inst = b.fn_arg(0);
    let i = b.fn_arg(1);
    let eight = b.const_int(&i64t, 8);
    let off = b.binop(BinOp::Mul, &i64t, i, eight);
    let base = b.const_int(&i64t, layout.symbol_offset as i64);
    let total = b.binop(BinOp::Add, &i64t, base, off);
    let p = b.gep(inst, total);
    b.end_function(Some(p));

    // SetConfigurationSlot: stash a configuration pointer before
    // initialization
    let cfg = b.global(&format_compact!("{name}_config_slots"), layout.symbol_count * 8);
    let void_ty = b.void_ty();
    let f = b.declare_function(
        &format_compact!("{name}_SetConfigurationSlot"),
        &[i64t.clone(), ptr.clone()],
        void_ty,
    );
    b.begin_function(&f);
    let i = b.fn_arg(0);
    let v = b.fn_arg(1);
    let eight = b.const_int(&i64t, 8);
    let off = b.binop(BinOp::Mul, &i64t, i, eight);
    let slot = b.gep(cfg, off);
    b.store(v, slot);
    b.end_function(None);

    // GetClassData: the packed, versioned metadata blob
    let meta = ClassDescription {
        version: CLASS_METADATA_VERSION,
        name: name.to_string(),
        size: layout.total_size,
        state_slots: layout.slot_count,
        mask_words: layout.mask_words,
        result: type_json(&out.result_type),
        symbols: out
            .module
            .symbols()
            .map(|(k, e)| SymbolDescription {
                key: k.to_string(),
                uid: e.uid,
                variety: variety_name(e.variety).to_string(),
                rate: e.rate,
                clock: e.clock.to_string(),
                ty: type_json(&e.ty),
            })
            .collect(),
        drivers: drivers.iter().map(driver_entry_name).collect(),
    };
    let metadata_json = serde_json::to_string(&meta)?;
    let f = b.declare_function(&format_compact!("{name}_GetClassData"), &[], ptr);
    b.begin_function(&f);
    let blob = b.intern_blob(
        fxhash::hash64(metadata_json.as_bytes()),
        metadata_json.as_bytes(),
    );
    b.end_function(Some(blob));

    Ok(ProgramInfo {
        layout,
        vector_length,
        counters,
        drivers,
        metadata_json,
    })
}

/// flip one mask bit to the gate value without disturbing the rest of
/// the word
fn store_mask_bit<B: Backend>(
    b: &mut B,
    layout: &Layout,
    inst: B::Val,
    bit: i64,
    gate: B::Val,
) {
    if bit < 0 {
        return;
    }
    let i32t = b.int_ty(32);
    let i64t = b.int_ty(64);
    let word = (bit / 32) as usize;
    let sub = (bit % 32) as u32;
    let off = b.const_int(&i64t, (layout.mask_offset + word * 4) as i64);
    let p = b.gep(inst, off);
    let base = b.load(&i32t, p.clone());
    let minus1 = b.const_int(&i32t, -1);
    let zero = b.const_int(&i32t, 0);
    let wide = b.select(gate, minus1, zero);
    let switch_mask = b.const_int(&i32t, 1i64 << sub);
    let x = b.binop(BinOp::Xor, &i32t, wide, base.clone());
    let a = b.binop(BinOp::And, &i32t, x, switch_mask);
    let set = b.binop(BinOp::Xor, &i32t, base, a);
    b.store(set, p);
}
