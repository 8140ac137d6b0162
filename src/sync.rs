//! Sync-dependence analysis: which φ-nodes a divergent branch can taint.
//!
//! For every terminator, [`SyncDependenceAnalysis::join_blocks`] answers the
//! question "if this branch were divergent, which blocks would receive
//! threads through different incoming edges?". Two block categories qualify:
//!
//! * *same-level joins*: blocks reachable from the branch by two
//!   vertex-disjoint paths (the classic reconvergence point);
//! * *divergent loop exits*: exits of the branch's loop that some threads
//!   reach while disjoint others continue towards the latch, so threads leave
//!   the loop on different iterations (temporal divergence).
//!
//! The answer depends only on the CFG, dominance and loop structure - never
//! on which values are currently divergent - so results are cached per
//! terminator and never invalidated. Two interchangeable formulations are
//! provided (see [`JoinStrategy`]); they compute the same sets.

use crate::{
    cfg::CfgInfo,
    dom::PostDominatorTree,
    loops::LoopForest,
    paths::DivPathDecider,
    Block, FuncDef, FxIndexSet, Inst, InstKind,
};
use rustc_hash::FxHashMap;

/// Set of blocks whose φ-nodes become divergent if a given branch does.
pub type BlockSet = FxIndexSet<Block>;

/// How join blocks are computed.
///
/// Both formulations yield the same sets on reducible CFGs; `ReachingDefs` is
/// the default because a single bounded forward walk answers one terminator,
/// while `DisjointPaths` runs a flow search per candidate block. The latter is
/// kept as an independently testable reference.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum JoinStrategy {
    /// Forward walk from the branch targets, tracking through which successor
    /// control reaches each block; a block reached under two different
    /// successors is a join.
    #[default]
    ReachingDefs,
    /// Ford-Fulkerson vertex-disjoint path queries per candidate block
    /// ([`DivPathDecider`]).
    DisjointPaths,
}

/// Maps terminators to the blocks whose φ-nodes they can taint, lazily.
///
/// The cache makes `join_blocks` take `&mut self`; from the caller's point of
/// view the query is idempotent. One instance per function analysis, used
/// single-threaded.
pub struct SyncDependenceAnalysis<'a> {
    func: &'a FuncDef,
    cfg: &'a CfgInfo,
    pdt: &'a PostDominatorTree,
    loops: &'a LoopForest,
    strategy: JoinStrategy,
    cache: FxHashMap<Inst, BlockSet>,
}

impl<'a> SyncDependenceAnalysis<'a> {
    pub fn new(
        func: &'a FuncDef,
        cfg: &'a CfgInfo,
        pdt: &'a PostDominatorTree,
        loops: &'a LoopForest,
    ) -> Self {
        Self::with_strategy(func, cfg, pdt, loops, JoinStrategy::default())
    }

    pub fn with_strategy(
        func: &'a FuncDef,
        cfg: &'a CfgInfo,
        pdt: &'a PostDominatorTree,
        loops: &'a LoopForest,
        strategy: JoinStrategy,
    ) -> Self {
        Self {
            func,
            cfg,
            pdt,
            loops,
            strategy,
            cache: FxHashMap::default(),
        }
    }

    /// The blocks with at least one φ-node that becomes divergent if `term`
    /// is divergent. Iteration order is the deterministic insertion order of
    /// the underlying walk.
    pub fn join_blocks(&mut self, term: Inst) -> &BlockSet {
        debug_assert!(matches!(self.func.insts[term].kind, InstKind::Term(_)));
        if !self.cache.contains_key(&term) {
            let joins = if self.func.insts[term].blocks.len() < 2 {
                BlockSet::default()
            } else {
                match self.strategy {
                    JoinStrategy::ReachingDefs => self.reaching_def_joins(term),
                    JoinStrategy::DisjointPaths => self.disjoint_path_joins(term),
                }
            };
            log::trace!(
                "join_blocks: terminator of {:?} -> {} block(s)",
                self.func.block_of(term),
                joins.len()
            );
            self.cache.insert(term, joins);
        }
        &self.cache[&term]
    }

    /// Reaching-def formulation: walk forward from the branch targets,
    /// remembering through which target each block is currently reached. A
    /// block reached through two different targets joins divergent control.
    /// The walk never crosses the branch's immediate post-dominator (which
    /// closes its region of influence), the enclosing loop's header (which
    /// would overwrite the loop-carried reaching def), or a loop exit edge;
    /// exits are classified separately at the end.
    fn reaching_def_joins(&self, term: Inst) -> BlockSet {
        let func = self.func;
        let term_block = func.block_of(term);
        let term_loop = self.loops.innermost(term_block);
        let leaves_loop =
            |block: Block| term_loop.is_some_and(|l| !self.loops.contains(l, block));
        let header = term_loop.map(|l| self.loops.header(l));
        let pd_bound = self.pdt.immediate_post_dominator(term_block);

        let mut joins = BlockSet::default();
        // Last block of the branch through which each block is reached.
        let mut reaching: FxHashMap<Block, Block> = FxHashMap::default();
        let mut exits = BlockSet::default();
        let mut worklist: Vec<Block> = Vec::new();

        for &succ in func.successors(term_block) {
            reaching.entry(succ).or_insert(succ);
            if leaves_loop(succ) {
                exits.insert(succ);
            } else {
                worklist.push(succ);
            }
        }

        while let Some(block) = worklist.pop() {
            if Some(block) == pd_bound || Some(block) == header {
                continue;
            }
            let def = reaching[&block];

            for &succ in func.successors(block) {
                if leaves_loop(succ) {
                    reaching.entry(succ).or_insert(def);
                    exits.insert(succ);
                    continue;
                }
                match reaching.get(&succ) {
                    None => {
                        reaching.insert(succ, def);
                        worklist.push(succ);
                    }
                    Some(&prev) => {
                        // A conflicting def joins control; so does re-entering
                        // a branch target through a cycle carrying its own def
                        // (the target's φ then mixes first-visit and re-entry
                        // threads).
                        let reentered_target =
                            def == succ && func.successors(term_block).contains(&succ);
                        if prev != def || reentered_target {
                            reaching.insert(succ, succ);
                            if joins.insert(succ) {
                                worklist.push(succ);
                            }
                        }
                    }
                }
            }
        }

        // Classify reached loop exits: an exit not reached through the same
        // def as the loop header sees threads arrive on differing iterations.
        if !exits.is_empty() {
            let header = header.expect("loop exits reached outside any loop");
            if !reaching.contains_key(&header) {
                // The region closed inside the loop; only its post-dominator's
                // reaching def can flow on to the header.
                if let Some(pd) = pd_bound {
                    if let Some(&pd_def) = reaching.get(&pd) {
                        reaching.insert(header, pd_def);
                    }
                }
            }
            let header_def = reaching.get(&header).copied();
            debug_assert!(
                header_def.is_some(),
                "no reaching def in the header of the carrying loop"
            );
            for &exit in &exits {
                let exit_def = reaching.get(&exit).copied();
                debug_assert!(exit_def.is_some(), "no reaching def at a loop exit");
                if exit_def != header_def {
                    joins.insert(exit);
                }
            }
        }

        joins
    }

    /// Disjoint-paths formulation: a block in the branch's loop (or anywhere,
    /// for a loop-free branch) with two or more predecessors is a join iff
    /// two vertex-disjoint paths lead to it from the branch block; loop exits
    /// are classified by [`DivPathDecider::induces_divergent_exit`].
    fn disjoint_path_joins(&self, term: Inst) -> BlockSet {
        let func = self.func;
        let term_block = func.block_of(term);
        let term_loop = self.loops.innermost(term_block);
        let decider = DivPathDecider::new(func, self.cfg, self.loops);

        let mut joins = BlockSet::default();
        for &block in &func.block_order {
            if self.cfg.preds(block).len() < 2 {
                continue;
            }
            if let Some(l) = term_loop {
                if !self.loops.contains(l, block) {
                    continue;
                }
            }
            if decider.disjoint_paths(term_block, block, 2) {
                joins.insert(block);
            }
        }
        if let Some(l) = term_loop {
            for &exit in self.loops.exit_blocks(l) {
                if decider.induces_divergent_exit(term_block, exit, l) {
                    joins.insert(exit);
                }
            }
        }
        joins
    }
}
