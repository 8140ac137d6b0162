//! Thin adapters that seed and run the divergence propagation.
//!
//! The generic analysis does not know where divergence originates; these
//! frontends do. [`GpuDivergenceAnalysis`] consumes a target-supplied
//! [`DivergenceSource`] policy (thread-id intrinsics, divergent loads, and
//! the like) and analyzes a whole kernel. [`LoopDivergenceAnalysis`] treats
//! one loop as the vectorization region: its header φs vary per lane by
//! construction, while the loop exit condition is uniform once a scalar
//! remainder loop has been split off.

use crate::{
    divergence::DivergenceAnalysis,
    loops::LoopId,
    print,
    sync::SyncDependenceAnalysis,
    Context, FuncAnalyses, FuncDef, Value,
};

/// Target policy identifying where divergence enters a kernel, and which
/// values the target pins as uniform regardless of their operands.
pub trait DivergenceSource {
    fn is_source_of_divergence(&self, cx: &Context, func: &FuncDef, v: Value) -> bool;

    fn is_always_uniform(&self, _cx: &Context, _func: &FuncDef, _v: Value) -> bool {
        false
    }
}

/// A [`DivergenceSource`] driven by opcode names: any operation whose opcode
/// is in `divergent_ops` seeds divergence (e.g. `"tid"`), any in
/// `uniform_ops` is pinned uniform; function parameters are divergent iff
/// `divergent_params`.
#[derive(Default)]
pub struct OpcodeSources {
    pub divergent_ops: rustc_hash::FxHashSet<crate::InternedStr>,
    pub uniform_ops: rustc_hash::FxHashSet<crate::InternedStr>,
    pub divergent_params: bool,
}

impl OpcodeSources {
    pub fn new(cx: &Context, divergent_ops: &[&str], uniform_ops: &[&str]) -> Self {
        Self {
            divergent_ops: divergent_ops.iter().map(|op| cx.intern_str(op)).collect(),
            uniform_ops: uniform_ops.iter().map(|op| cx.intern_str(op)).collect(),
            divergent_params: false,
        }
    }

    fn opcode_of(func: &FuncDef, v: Value) -> Option<crate::InternedStr> {
        match v {
            Value::Inst(inst) => match func.insts[inst].kind {
                crate::InstKind::Op(opcode) => Some(opcode),
                _ => None,
            },
            _ => None,
        }
    }
}

impl DivergenceSource for OpcodeSources {
    fn is_source_of_divergence(&self, _cx: &Context, func: &FuncDef, v: Value) -> bool {
        if matches!(v, Value::Param(_)) {
            return self.divergent_params;
        }
        Self::opcode_of(func, v).is_some_and(|op| self.divergent_ops.contains(&op))
    }

    fn is_always_uniform(&self, _cx: &Context, func: &FuncDef, v: Value) -> bool {
        Self::opcode_of(func, v).is_some_and(|op| self.uniform_ops.contains(&op))
    }
}

/// Whole-kernel divergence for the SIMT execution of `func`. Not in LCSSA
/// form, so divergent loop exits taint loop live-outs directly.
pub struct GpuDivergenceAnalysis<'a> {
    da: DivergenceAnalysis<'a>,
}

impl<'a> GpuDivergenceAnalysis<'a> {
    pub fn new(
        cx: &'a Context,
        func: &'a FuncDef,
        info: &'a FuncAnalyses,
        sources: &dyn DivergenceSource,
    ) -> Self {
        let mut sync =
            SyncDependenceAnalysis::new(func, &info.cfg, &info.pdt, &info.loops);
        let mut da = DivergenceAnalysis::new(cx, func, None, &info.dt, &info.loops);

        for &block in &func.block_order {
            for &inst in &func.blocks[block].insts {
                let v = Value::Inst(inst);
                if sources.is_source_of_divergence(cx, func, v) {
                    da.mark_divergent(v);
                } else if sources.is_always_uniform(cx, func, v) {
                    da.add_uniform_override(v);
                }
            }
        }
        for i in 0..func.params.len() {
            let v = Value::Param(i as u32);
            if sources.is_source_of_divergence(cx, func, v) {
                da.mark_divergent(v);
            }
        }

        da.compute(&mut sync, false);
        Self { da }
    }

    pub fn is_divergent(&self, v: Value) -> bool {
        self.da.is_divergent(v)
    }

    pub fn is_uniform(&self, v: Value) -> bool {
        !self.is_divergent(v)
    }

    pub fn analysis(&self) -> &DivergenceAnalysis<'a> {
        &self.da
    }

    /// Deterministic listing of the kernel's divergent values.
    pub fn dump(&self) -> String {
        let mut out = format!("Divergence of kernel {} {{\n", &self.da.cx()[self.da.func().name]);
        out.push_str(&print::divergence_dump(&self.da));
        out.push_str("}\n");
        out
    }
}

/// Divergence of one loop, as seen by a vectorizer considering it (LCSSA
/// form assumed): header φs vary per lane, the exit condition is uniform
/// after remainder splitting.
pub struct LoopDivergenceAnalysis<'a> {
    header: crate::Block,
    da: DivergenceAnalysis<'a>,
}

impl<'a> LoopDivergenceAnalysis<'a> {
    pub fn new(
        cx: &'a Context,
        func: &'a FuncDef,
        info: &'a FuncAnalyses,
        sync: &mut SyncDependenceAnalysis<'_>,
        l: LoopId,
    ) -> Self {
        let mut da = DivergenceAnalysis::new(cx, func, Some(l), &info.dt, &info.loops);

        // The override goes in first: a header φ that happens to be the exit
        // condition must stay uniform rather than be seeded.
        if let Some(exiting) = info.loops.unique_exiting_block(func, l) {
            if let Some(cond) = func.condition_of(func.terminator_of(exiting)) {
                da.add_uniform_override(cond);
            }
        }
        for phi in func.phi_nodes(info.loops.header(l)) {
            let v = Value::Inst(phi);
            if !da.is_always_uniform(v) {
                da.mark_divergent(v);
            }
        }

        da.compute(sync, true);
        Self {
            header: info.loops.header(l),
            da,
        }
    }

    pub fn is_divergent(&self, v: Value) -> bool {
        self.da.is_divergent(v)
    }

    pub fn is_uniform(&self, v: Value) -> bool {
        !self.is_divergent(v)
    }

    pub fn analysis(&self) -> &DivergenceAnalysis<'a> {
        &self.da
    }

    /// Deterministic listing of the loop's divergent values.
    pub fn dump(&self) -> String {
        let cx = self.da.cx();
        let func = self.da.func();
        let mut out =
            format!("Divergence of loop {} {{\n", &cx[func.blocks[self.header].name]);
        out.push_str(&print::divergence_dump(&self.da));
        out.push_str("}\n");
        out
    }
}

/// Runs [`LoopDivergenceAnalysis`] on every loop of `func`, in loop-discovery
/// order, and concatenates their dumps.
pub fn loop_divergence_report(cx: &Context, func: &FuncDef, info: &FuncAnalyses) -> String {
    let mut sync = SyncDependenceAnalysis::new(func, &info.cfg, &info.pdt, &info.loops);
    let mut out = String::new();
    for l in info.loops.loop_ids() {
        let analysis = LoopDivergenceAnalysis::new(cx, func, info, &mut sync, l);
        out.push_str(&analysis.dump());
    }
    out
}
