#![allow(dead_code)]

use uniformity::divergence::DivergenceAnalysis;
use uniformity::sync::{JoinStrategy, SyncDependenceAnalysis};
use uniformity::{Context, FuncAnalyses, FuncDef, Value};

/// Runs the core propagation over the whole function with explicit seeds and
/// overrides.
pub fn run_core<'a>(
    cx: &'a Context,
    func: &'a FuncDef,
    info: &'a FuncAnalyses,
    strategy: JoinStrategy,
    seeds: &[Value],
    overrides: &[Value],
    is_lcssa: bool,
) -> DivergenceAnalysis<'a> {
    let mut sync = SyncDependenceAnalysis::with_strategy(
        func,
        &info.cfg,
        &info.pdt,
        &info.loops,
        strategy,
    );
    let mut da = DivergenceAnalysis::new(cx, func, None, &info.dt, &info.loops);
    for &v in overrides {
        da.add_uniform_override(v);
    }
    for &v in seeds {
        da.mark_divergent(v);
    }
    da.compute(&mut sync, is_lcssa);
    da
}

pub const BOTH_STRATEGIES: [JoinStrategy; 2] =
    [JoinStrategy::ReachingDefs, JoinStrategy::DisjointPaths];
