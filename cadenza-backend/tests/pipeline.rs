//! End to end scenarios: generic graphs through specialization,
//! reactive analysis, lowering and emission onto the SSA reference
//! backend.

use cadenza_backend::{abi, ssa::SsaModule, BuildFlag};
use cadenza_compiler::{
    compile,
    graph::{
        generic::{TimeBase, Variety},
        typed::TypedOp,
        GenericId, GenericOp, MathOp,
    },
    repo::function_value,
    rx::DriverSignature,
    spec::JobCtx,
    typ::{self, Type},
};
use enumflags2::BitFlags;
use smallvec::smallvec;

fn audio_input(ctx: &mut JobCtx, key: &str) -> GenericId {
    ctx.graphs.add(
        GenericOp::Input {
            key: arcstr::ArcStr::from(key),
            ty: Type::Float32,
            variety: Variety::Stream,
            driver: DriverSignature::user(&arcstr::ArcStr::from(key), 48000.0, 1.0),
        },
        smallvec![],
    )
}

#[test]
fn scalar_identity_produces_no_call() {
    let mut ctx = JobCtx::without_symbols();
    let body = ctx.graphs.add(GenericOp::Argument, smallvec![]);
    let fv = function_value(&arcstr::literal!("id"), &[], &[body]);
    let f = ctx.graphs.add(GenericOp::Constant(fv), smallvec![]);
    let arg = ctx.graphs.add(GenericOp::Argument, smallvec![]);
    let call = ctx
        .graphs
        .add(GenericOp::Evaluate { label: arcstr::literal!("id") }, smallvec![f, arg]);
    let out = compile(ctx, call, Type::Float32).unwrap();
    assert_eq!(out.result_type, Type::Float32);
    assert!(matches!(out.typed.op(out.root), TypedOp::Argument));
    assert_eq!(out.module.slot_count(), 0);
}

#[test]
fn homogeneous_list_fold_solves_to_a_sequence() {
    // λ(xs, acc). fold(rest(xs), first(xs) + acc) with the base form
    // returning acc; over (List<Float32, 4>, Float32) the solver
    // finds depth 4
    let mut ctx = JobCtx::without_symbols();
    let g = &mut ctx.graphs;
    let arg = g.add(GenericOp::Argument, smallvec![]);
    let xs = g.add(GenericOp::First, smallvec![arg]);
    let acc = g.add(GenericOp::Rest, smallvec![arg]);
    let head = g.add(GenericOp::First, smallvec![xs]);
    let tail = g.add(GenericOp::Rest, smallvec![xs]);
    let new_acc = g.add(GenericOp::Math(MathOp::Add), smallvec![head, acc]);
    let recur_arg = g.add(GenericOp::Pair, smallvec![tail, new_acc]);
    // the recursive call closes a cycle through the function value
    let recur = g.reserve(GenericOp::Evaluate { label: arcstr::literal!("fold") }, 2);
    g.patch_up(recur, 1, recur_arg);
    let base = acc;
    let fv = function_value(&arcstr::literal!("fold"), &[recur], &[recur, base]);
    let fconst = g.add(GenericOp::Constant(fv), smallvec![]);
    g.patch_up(recur, 0, fconst);

    let outer_arg = g.add(GenericOp::Argument, smallvec![]);
    let fv2 = function_value(&arcstr::literal!("fold"), &[recur], &[recur, base]);
    let f2 = g.add(GenericOp::Constant(fv2), smallvec![]);
    let call = g.add(
        GenericOp::Evaluate { label: arcstr::literal!("fold") },
        smallvec![f2, outer_arg],
    );

    let argument = typ::pair(typ::list(Type::Float32, 4), Type::Float32);
    let out = compile(ctx, call, argument).unwrap();
    assert_eq!(out.result_type, Type::Float32);
    let seq = out
        .typed
        .postorder(out.root)
        .into_iter()
        .find_map(|id| match out.typed.op(id) {
            TypedOp::FunctionSequence { count, .. } => Some(*count),
            _ => None,
        });
    assert_eq!(seq, Some(4), "expected a solved sequence of four steps");
}

#[test]
fn union_dispatch_emits_a_switch() {
    // dispatch over Union{Int32, Float32}: one switch, one branch per
    // variant, merged result union
    let mut ctx = JobCtx::without_symbols();
    let g = &mut ctx.graphs;
    let body = g.add(GenericOp::Argument, smallvec![]);
    let one = g.add(GenericOp::Constant(Type::invariant_i64(1)), smallvec![]);
    let body = g.add(GenericOp::Math(MathOp::Add), smallvec![body, one]);
    let fv = function_value(&arcstr::literal!("bump"), &[], &[body]);
    let f = g.add(GenericOp::Constant(fv), smallvec![]);
    let arg = g.add(GenericOp::Argument, smallvec![]);
    let call = g.add(
        GenericOp::Dispatch { label: arcstr::literal!("bump") },
        smallvec![f, arg],
    );
    let argument = typ::union_merge(Type::Int32, Type::Float32, false);
    let out = compile(ctx, call, argument.clone()).unwrap();
    let sw = out
        .typed
        .postorder(out.root)
        .into_iter()
        .find_map(|id| match out.typed.op(id) {
            TypedOp::Switch { branches, result, .. } => {
                Some((branches.len(), result.clone()))
            }
            _ => None,
        })
        .expect("no switch emitted");
    assert_eq!(sw.0, 2);
    assert_eq!(sw.1, argument);
}

#[test]
fn clock_boundary_gets_a_ratio_sized_latch() {
    // 48 kHz source, 100 Hz sink, no explicit resampler
    let mut ctx = JobCtx::without_symbols();
    let fast = audio_input(&mut ctx, "audio");
    let slow = ctx.graphs.add(
        GenericOp::Input {
            key: arcstr::literal!("control"),
            ty: Type::Float32,
            variety: Variety::Stream,
            driver: DriverSignature::user(&arcstr::literal!("control"), 100.0, 1.0),
        },
        smallvec![],
    );
    let init = ctx.graphs.add(GenericOp::Constant(Type::Float32), smallvec![]);
    let order = ctx
        .graphs
        .add(GenericOp::Constant(Type::invariant_i64(1)), smallvec![]);
    // a control-clocked buffer latching the audio signal
    let rb = ctx
        .graphs
        .reserve(GenericOp::RingBuffer { time_base: TimeBase::Samples }, 3);
    ctx.graphs.patch_up(rb, 0, init);
    ctx.graphs.patch_up(rb, 1, order);
    let mix = ctx.graphs.add(GenericOp::Math(MathOp::Add), smallvec![fast, slow]);
    ctx.graphs.patch_up(rb, 2, mix);
    let out = compile(ctx, rb, Type::Nil).unwrap();
    // both inputs latch into the fused domain; the audio side capacity
    // is the 480 ratio ceiling
    let caps: Vec<usize> = {
        let mut v = vec![];
        let mut pending = vec![out.root];
        let mut seen = std::collections::HashSet::new();
        while let Some(r) = pending.pop() {
            for id in out.typed.postorder(r) {
                if !seen.insert(id) {
                    continue;
                }
                for s in out.typed.op(id).subgraphs() {
                    pending.push(s);
                }
                if let TypedOp::Buffer { size, .. } = out.typed.op(id) {
                    v.push(*size);
                }
            }
        }
        v.sort();
        v
    };
    assert!(
        caps.contains(&(480 * 4)),
        "expected a 480 element latch, buffers: {caps:?}"
    );
}

#[test]
fn stateful_ring_buffer_full_program() {
    let mut ctx = JobCtx::without_symbols();
    let sig = audio_input(&mut ctx, "audio");
    let init = ctx.graphs.add(GenericOp::Constant(Type::Float32), smallvec![]);
    let order = ctx
        .graphs
        .add(GenericOp::Constant(Type::invariant_i64(4)), smallvec![]);
    let rb = ctx
        .graphs
        .reserve(GenericOp::RingBuffer { time_base: TimeBase::Samples }, 3);
    ctx.graphs.patch_up(rb, 0, init);
    ctx.graphs.patch_up(rb, 1, order);
    ctx.graphs.patch_up(rb, 2, sig);

    let mut out = compile(ctx, rb, Type::Nil).unwrap();
    assert_eq!(out.result_type, typ::chain(Type::Float32, 4, Type::Nil));
    // one state slot: the write position
    assert_eq!(out.module.slot_count(), 1);
    assert!(out.module.symbol("audio").is_some());

    let mut b = SsaModule::new();
    let info =
        abi::build_program(&mut b, &mut out, "rbuf", BitFlags::default()).unwrap();
    // 4 floats of state behind the position slot, aligned instance
    assert!(info.layout.state_size >= 4 + 16);
    assert_eq!(info.layout.total_size % 32, 0);
    assert_eq!(info.layout.symbol_count, 1);
    let text = b.text();
    assert!(text.contains("rbuf_GetSize"));
    assert!(text.contains("rbuf_Initialize"));
    assert!(text.contains("rbuf_Evaluate"));
    assert!(text.contains("rbuf_Tick_audio"));
    assert!(text.contains("rbuf_GetClassData"));
    assert!(info.metadata_json.contains("\"audio\""));
    assert!(info.metadata_json.contains("stream"));
}

#[test]
fn two_rate_program_allocates_a_counter_bit() {
    let mut ctx = JobCtx::without_symbols();
    let fast = audio_input(&mut ctx, "audio");
    let slow = ctx.graphs.add(
        GenericOp::Input {
            key: arcstr::literal!("control"),
            ty: Type::Float32,
            variety: Variety::Stream,
            driver: DriverSignature::user(&arcstr::literal!("control"), 100.0, 1.0),
        },
        smallvec![],
    );
    let sum = ctx.graphs.add(GenericOp::Math(MathOp::Add), smallvec![fast, slow]);
    let mut out = compile(ctx, sum, Type::Nil).unwrap();
    let mut b = SsaModule::new();
    let info =
        abi::build_program(&mut b, &mut out, "mix", BitFlags::default()).unwrap();
    // the slow clock is counter driven and owns a mask bit
    assert_eq!(info.counters.len(), 1);
    assert_eq!(info.layout.mask_words, 1);
    let text = b.text();
    assert!(text.contains("mix_Tick_audio"));
    assert!(text.contains("mix_Tick_control"));
}

#[test]
fn omit_flags_suppress_entry_points() {
    let mut ctx = JobCtx::without_symbols();
    let sig = audio_input(&mut ctx, "audio");
    let mut out = compile(ctx, sig, Type::Nil).unwrap();
    let mut b = SsaModule::new();
    let _ = abi::build_program(
        &mut b,
        &mut out,
        "quiet",
        BuildFlag::OmitEvaluate | BuildFlag::OmitReactiveDrivers,
    )
    .unwrap();
    let text = b.text();
    assert!(!text.contains("quiet_Evaluate"));
    assert!(!text.contains("quiet_Tick_audio"));
    assert!(text.contains("quiet_Initialize"));
}
