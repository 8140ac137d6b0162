//! End-to-end divergence scenarios over hand-built CFG shapes.

mod common;

use common::{run_core, BOTH_STRATEGIES};
use uniformity::build::FuncBuilder;
use uniformity::divergence::DivergenceAnalysis;
use uniformity::frontend::{
    loop_divergence_report, GpuDivergenceAnalysis, LoopDivergenceAnalysis, OpcodeSources,
};
use uniformity::sync::SyncDependenceAnalysis;
use uniformity::{print, Context, FuncAnalyses, Value};

fn term_value(func: &uniformity::FuncDef, block: uniformity::Block) -> Value {
    Value::Inst(func.terminator_of(block))
}

/// Simple diamond: a divergent condition taints the branch, the merge block,
/// and the φ collecting from both arms.
#[test]
fn simple_diamond() {
    let cx = Context::new();
    let mut b = FuncBuilder::new(&cx, "diamond");
    let entry = b.block("entry");
    let then_ = b.block("then");
    let else_ = b.block("else");
    let merge = b.block("merge");
    let c = b.op(entry, "c", "src", &[]);
    b.cond_br(entry, c, then_, else_);
    b.br(then_, merge);
    b.br(else_, merge);
    let x = b.phi(merge, "x", &[(then_, b.const_int(1)), (else_, b.const_int(2))]);
    b.ret(merge);
    let func = b.finish().unwrap();
    let info = FuncAnalyses::compute(&func);

    for strategy in BOTH_STRATEGIES {
        let da = run_core(&cx, &func, &info, strategy, &[c], &[], false);
        assert!(da.is_divergent(c));
        assert!(da.is_divergent(term_value(&func, entry)));
        assert!(da.is_join_divergent(merge));
        assert!(!da.is_temporal_divergent(merge));
        assert!(da.is_divergent(x));
        assert!(!da.is_divergent(term_value(&func, then_)));
    }

    // The same analysis through the GPU frontend, with its deterministic dump.
    let sources = OpcodeSources::new(&cx, &["src"], &[]);
    let gpu = GpuDivergenceAnalysis::new(&cx, &func, &info, &sources);
    assert!(gpu.is_divergent(x));
    insta::assert_snapshot!(gpu.dump(), @r"
    Divergence of kernel diamond {
    DIVERGENT: %c = src
    DIVERGENT: cond_br %c, then, else
    DIVERGENT: %x = phi [ 1, then ], [ 2, else ]
    }
    ");
}

/// Hidden divergence: a uniform branch nested under a divergent one. The φ at
/// the shared merge is divergent because two disjoint paths of the outer
/// branch reach it, even though the inner branch itself stays uniform.
#[test]
fn hidden_diverge() {
    let cx = Context::new();
    let mut b = FuncBuilder::new(&cx, "hidden");
    let entry = b.block("entry");
    let b1 = b.block("b1");
    let t = b.block("t");
    let b2 = b.block("b2");
    let merge = b.block("merge");
    let d = b.op(entry, "d", "src", &[]);
    b.cond_br(entry, d, b1, b2);
    let u = b.op(b1, "u", "uni", &[]);
    b.cond_br(b1, u, t, merge);
    b.br(t, merge);
    b.br(b2, merge);
    let x = b.phi(
        merge,
        "x",
        &[(t, b.const_int(1)), (b1, b.const_int(2)), (b2, b.const_int(3))],
    );
    b.ret(merge);
    let func = b.finish().unwrap();
    let info = FuncAnalyses::compute(&func);

    for strategy in BOTH_STRATEGIES {
        let da = run_core(&cx, &func, &info, strategy, &[d], &[], false);
        assert!(da.is_divergent(term_value(&func, entry)));
        // The inner branch never becomes divergent.
        assert!(!da.is_divergent(u));
        assert!(!da.is_divergent(term_value(&func, b1)));
        assert!(da.is_join_divergent(merge));
        assert!(da.is_divergent(x));
    }
}

/// A loop with a uniform induction and a uniform exit has nothing divergent.
#[test]
fn uniform_loop_induction() {
    let cx = Context::new();
    let mut b = FuncBuilder::new(&cx, "uniform_loop");
    let n = b.param("n");
    let entry = b.block("entry");
    let header = b.block("header");
    let exit = b.block("exit");
    b.br(entry, header);
    let i = b.phi_deferred(header, "i");
    let i1 = b.op(header, "i1", "add", &[i, b.const_int(1)]);
    let c = b.op(header, "c", "cmp", &[i1, n]);
    b.set_phi_incoming(i, &[(entry, b.const_int(0)), (header, i1)]);
    b.cond_br(header, c, header, exit);
    b.ret(exit);
    let func = b.finish().unwrap();
    let info = FuncAnalyses::compute(&func);

    for strategy in BOTH_STRATEGIES {
        let da = run_core(&cx, &func, &info, strategy, &[], &[], false);
        assert_eq!(da.divergent_values().count(), 0);
        assert!(!da.is_divergent(i));
        assert!(!da.is_divergent(c));
    }
    assert_eq!(print::divergence_dump(&run_core(
        &cx,
        &func,
        &info,
        BOTH_STRATEGIES[0],
        &[],
        &[],
        false,
    )), "");
}

/// Loop shape shared by the temporal-divergence scenarios: a divergent branch
/// in the header can skip out of the loop early.
///
/// ```text
/// entry -> header <-> latch -> done
///            \-> exit
/// ```
struct EarlyExitLoop {
    func: uniformity::FuncDef,
    header: uniformity::Block,
    exit: uniformity::Block,
    d: Value,
    i: Value,
    live_out: Value,
    done_out: Value,
}

fn early_exit_loop(cx: &Context, lcssa: bool) -> EarlyExitLoop {
    let mut b = FuncBuilder::new(cx, "early_exit");
    let entry = b.block("entry");
    let header = b.block("header");
    let latch = b.block("latch");
    let exit = b.block("exit");
    let done = b.block("done");
    b.br(entry, header);
    let i = b.phi_deferred(header, "i");
    let d = b.op(header, "d", "src", &[]);
    b.cond_br(header, d, exit, latch);
    let i1 = b.op(latch, "i1", "add", &[i, b.const_int(1)]);
    let c = b.op(latch, "c", "cmp", &[i1, b.const_int(100)]);
    b.set_phi_incoming(i, &[(entry, b.const_int(0)), (latch, i1)]);
    b.cond_br(latch, c, header, done);
    // Loop live-outs: through LCSSA φs, or as direct uses of loop values.
    let (live_out, done_out) = if lcssa {
        let out = b.phi(exit, "out", &[(header, i)]);
        let out2 = b.phi(done, "out2", &[(latch, i1)]);
        (out, out2)
    } else {
        let y = b.op(exit, "y", "add", &[i, b.const_int(5)]);
        let z = b.op(done, "z", "mul", &[i1, b.const_int(2)]);
        (y, z)
    };
    b.ret(exit);
    b.ret(done);
    EarlyExitLoop {
        func: b.finish().unwrap(),
        header,
        exit,
        d,
        i,
        live_out,
        done_out,
    }
}

/// Divergent early exit under the loop frontend (LCSSA): the exit block is
/// temporally divergent and its LCSSA φ is tainted; the induction variable
/// itself stays uniform inside the loop.
#[test]
fn divergent_exit_temporal_lcssa() {
    let cx = Context::new();
    let shape = early_exit_loop(&cx, true);
    let func = &shape.func;
    let info = FuncAnalyses::compute(func);
    let l = info.loops.innermost(shape.header).unwrap();

    for strategy in BOTH_STRATEGIES {
        let mut sync = SyncDependenceAnalysis::with_strategy(
            func,
            &info.cfg,
            &info.pdt,
            &info.loops,
            strategy,
        );
        let mut da = DivergenceAnalysis::new(&cx, func, Some(l), &info.dt, &info.loops);
        da.mark_divergent(shape.d);
        da.compute(&mut sync, true);

        assert!(da.is_divergent(term_value(func, shape.header)));
        assert!(da.is_temporal_divergent(shape.exit));
        assert!(da.is_divergent(shape.live_out));
        // Uniform trip counting is untouched by the early exit.
        assert!(!da.is_divergent(shape.i));
        assert!(!da.is_divergent(shape.done_out));
    }
}

/// The same loop under the GPU frontend (no LCSSA): loop-live-out tainting
/// marks every outside use of a loop-carried value.
#[test]
fn divergent_loop_live_out_gpu() {
    let cx = Context::new();
    let shape = early_exit_loop(&cx, false);
    let func = &shape.func;
    let info = FuncAnalyses::compute(func);

    let sources = OpcodeSources::new(&cx, &["src"], &[]);
    let gpu = GpuDivergenceAnalysis::new(&cx, func, &info, &sources);

    assert!(gpu.is_divergent(shape.d));
    assert!(gpu.is_divergent(term_value(func, shape.header)));
    // Both the early exit's and the regular exit's uses of loop-carried
    // values observe a divergent iteration count.
    assert!(gpu.is_divergent(shape.live_out));
    assert!(gpu.is_divergent(shape.done_out));
    // Inside the loop the induction stays uniform.
    assert!(gpu.is_uniform(shape.i));

    insta::assert_snapshot!(gpu.dump(), @r"
    Divergence of kernel early_exit {
    DIVERGENT: %d = src
    DIVERGENT: cond_br %d, exit, latch
    DIVERGENT: %y = add %i, 5
    DIVERGENT: %z = mul %i1, 2
    }
    ");
}

/// Divergent switch: three arms reconverging on a single φ.
#[test]
fn switch_three_arms() {
    let cx = Context::new();
    let mut b = FuncBuilder::new(&cx, "switch3");
    let entry = b.block("entry");
    let a = b.block("a");
    let c = b.block("c");
    let d = b.block("d");
    let merge = b.block("merge");
    let sel = b.op(entry, "sel", "src", &[]);
    b.switch(entry, sel, &[a, c, d]);
    b.br(a, merge);
    b.br(c, merge);
    b.br(d, merge);
    let x = b.phi(
        merge,
        "x",
        &[(a, b.const_int(10)), (c, b.const_int(20)), (d, b.const_int(30))],
    );
    b.ret(merge);
    let func = b.finish().unwrap();
    let info = FuncAnalyses::compute(&func);

    for strategy in BOTH_STRATEGIES {
        let da = run_core(&cx, &func, &info, strategy, &[sel], &[], false);
        assert!(da.is_divergent(term_value(&func, entry)));
        assert!(da.is_join_divergent(merge));
        assert!(da.is_divergent(x));
    }
}

/// A φ in a join block whose incoming values fold to one value (undef
/// included) stays uniform by default; the conservative knob taints it.
#[test]
fn identity_phi_knob() {
    let cx = Context::new();
    let build = || {
        let mut b = FuncBuilder::new(&cx, "identity");
        let entry = b.block("entry");
        let then_ = b.block("then");
        let else_ = b.block("else");
        let merge = b.block("merge");
        let c = b.op(entry, "c", "src", &[]);
        b.cond_br(entry, c, then_, else_);
        b.br(then_, merge);
        b.br(else_, merge);
        let same = b.phi(merge, "same", &[(then_, b.const_int(7)), (else_, b.const_int(7))]);
        let fold = b.phi(merge, "fold", &[(then_, b.undef()), (else_, b.const_int(9))]);
        let diff = b.phi(merge, "diff", &[(then_, b.const_int(1)), (else_, b.const_int(2))]);
        b.ret(merge);
        (b.finish().unwrap(), c, same, fold, diff)
    };

    let (func, c, same, fold, diff) = build();
    let info = FuncAnalyses::compute(&func);

    let da = run_core(&cx, &func, &info, BOTH_STRATEGIES[0], &[c], &[], false);
    assert!(!da.is_divergent(same));
    assert!(!da.is_divergent(fold));
    assert!(da.is_divergent(diff));

    // Conservative mode: every φ in the join block is tainted.
    let mut sync = SyncDependenceAnalysis::new(&func, &info.cfg, &info.pdt, &info.loops);
    let mut da = DivergenceAnalysis::new(&cx, &func, None, &info.dt, &info.loops);
    da.set_fold_identity_phis(false);
    da.mark_divergent(c);
    da.compute(&mut sync, false);
    assert!(da.is_divergent(same));
    assert!(da.is_divergent(fold));
    assert!(da.is_divergent(diff));
}

/// Uniform overrides survive operand divergence, and seeds never taint them.
#[test]
fn uniform_override_respected() {
    let cx = Context::new();
    let mut b = FuncBuilder::new(&cx, "override");
    let entry = b.block("entry");
    let t = b.op(entry, "t", "src", &[]);
    let forced = b.op(entry, "forced", "broadcast", &[t]);
    let user = b.op(entry, "user", "add", &[forced, b.const_int(1)]);
    b.ret(entry);
    let func = b.finish().unwrap();
    let info = FuncAnalyses::compute(&func);

    let da = run_core(&cx, &func, &info, BOTH_STRATEGIES[0], &[t], &[forced], false);
    assert!(da.is_divergent(t));
    assert!(da.is_always_uniform(forced));
    assert!(!da.is_divergent(forced));
    // Divergence does not tunnel through the override.
    assert!(!da.is_divergent(user));
}

/// An abnormal terminator carries data divergence but never control
/// divergence.
#[test]
fn abnormal_terminator_is_not_a_branch() {
    let cx = Context::new();
    let mut b = FuncBuilder::new(&cx, "abnormal");
    let entry = b.block("entry");
    let normal = b.block("normal");
    let pad = b.block("pad");
    let merge = b.block("merge");
    let t = b.op(entry, "t", "src", &[]);
    b.unwind(entry, "r", &[t], &[normal, pad]);
    b.br(normal, merge);
    b.br(pad, merge);
    let x = b.phi(merge, "x", &[(normal, b.const_int(1)), (pad, b.const_int(2))]);
    b.ret(merge);
    let func = b.finish().unwrap();
    let info = FuncAnalyses::compute(&func);

    for strategy in BOTH_STRATEGIES {
        let da = run_core(&cx, &func, &info, strategy, &[t], &[], false);
        // The dispatch result is data-divergent...
        assert!(da.is_divergent(term_value(&func, entry)));
        // ...but its targets never count as a divergent join.
        assert!(!da.is_join_divergent(merge));
        assert!(!da.is_divergent(x));
    }
}

/// The per-loop vectorizer frontend: header φs are divergent by construction,
/// the (unique) exit condition is pinned uniform.
#[test]
fn loop_frontend_seeds_header_phis() {
    let cx = Context::new();
    let mut b = FuncBuilder::new(&cx, "vec_loop");
    let n = b.param("n");
    let entry = b.block("entry");
    let header = b.block("header");
    let exit = b.block("exit");
    b.br(entry, header);
    let i = b.phi_deferred(header, "i");
    let acc = b.phi_deferred(header, "acc");
    let i1 = b.op(header, "i1", "add", &[i, b.const_int(1)]);
    let acc1 = b.op(header, "acc1", "add", &[acc, i]);
    let c = b.op(header, "c", "cmp", &[i1, n]);
    b.set_phi_incoming(i, &[(entry, b.const_int(0)), (header, i1)]);
    b.set_phi_incoming(acc, &[(entry, b.const_int(0)), (header, acc1)]);
    b.cond_br(header, c, header, exit);
    let out = b.phi(exit, "out", &[(header, acc1)]);
    b.ret(exit);
    let func = b.finish().unwrap();
    let info = FuncAnalyses::compute(&func);
    let l = info.loops.innermost(header).unwrap();

    let mut sync = SyncDependenceAnalysis::new(&func, &info.cfg, &info.pdt, &info.loops);
    let analysis = LoopDivergenceAnalysis::new(&cx, &func, &info, &mut sync, l);
    assert!(analysis.is_divergent(i));
    assert!(analysis.is_divergent(acc));
    assert!(analysis.is_divergent(i1));
    assert!(analysis.is_divergent(acc1));
    // The exit condition is uniform after remainder splitting, so the branch
    // stays uniform even though its condition depends on a divergent φ.
    assert!(analysis.is_uniform(c));
    assert!(analysis.is_uniform(term_value(&func, header)));

    let report = loop_divergence_report(&cx, &func, &info);
    insta::assert_snapshot!(report, @r"
    Divergence of loop header {
    DIVERGENT: %i = phi [ 0, entry ], [ %i1, header ]
    DIVERGENT: %acc = phi [ 0, entry ], [ %acc1, header ]
    DIVERGENT: %i1 = add %i, 1
    DIVERGENT: %acc1 = add %acc, %i
    }
    ");
}
