//! Work-list propagation of divergence over values.
//!
//! Seeds are declared via [`DivergenceAnalysis::mark_divergent`]; a run of
//! [`DivergenceAnalysis::compute`] then grows the divergent set to a fixed
//! point by fusing three update rules:
//!
//! * an ordinary instruction is divergent iff some operand is;
//! * a branch is divergent iff its condition is, and when one becomes
//!   divergent the φ-nodes of its join blocks (from
//!   [`SyncDependenceAnalysis`]) are re-evaluated;
//! * a φ-node is divergent if its block joins divergent control, if its block
//!   is a temporally divergent loop exit, or if an incoming value is.
//!
//! Divergent loop exits need care: under LCSSA every value leaving the loop
//! passes through a single-operand φ at the exit, so tainting exit φs
//! suffices; without LCSSA (GPU kernels), [`taint_loop_live_outs`] walks the
//! dominance region below the loop and taints every outside user of a
//! loop-defined value directly.
//!
//! All sets grow monotonically and every work-list consumption either marks
//! something new or nothing, so the fixed point is reached after at most one
//! pass per marked value. The work-list is LIFO; the resulting sets are
//! order-independent, and iteration of the final divergent set follows
//! insertion order for deterministic diagnostics.
//!
//! [`taint_loop_live_outs`]: DivergenceAnalysis::taint_loop_live_outs

use crate::{
    cfg::UseLists,
    dom::DominatorTree,
    loops::{LoopForest, LoopId},
    sync::SyncDependenceAnalysis,
    Block, Context, FuncDef, FxIndexSet, Inst, InstKind, TerminatorKind, Value,
};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

/// Why a block's φ-nodes are control-tainted, if they are.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum JoinDivergence {
    /// Disjoint paths from a divergent branch at the same loop level meet here.
    SameLevel,
    /// Threads leave a loop with a divergent branch here, on different
    /// iterations.
    Temporal,
    Both,
}

pub struct DivergenceAnalysis<'a> {
    cx: &'a Context,
    func: &'a FuncDef,
    /// Restricts propagation to one loop (the vectorizer frontend); `None`
    /// analyzes the whole function.
    region_loop: Option<LoopId>,
    dt: &'a DominatorTree,
    loops: &'a LoopForest,
    uses: UseLists,

    /// Monotonic; insertion order is the deterministic diagnostic order.
    divergent: FxIndexSet<Value>,
    /// Values that must never become divergent (frontend knowledge).
    overrides: FxHashSet<Value>,
    join_state: FxHashMap<Block, JoinDivergence>,
    worklist: Vec<Inst>,

    fold_identity_phis: bool,
}

impl<'a> DivergenceAnalysis<'a> {
    pub fn new(
        cx: &'a Context,
        func: &'a FuncDef,
        region_loop: Option<LoopId>,
        dt: &'a DominatorTree,
        loops: &'a LoopForest,
    ) -> Self {
        Self {
            cx,
            func,
            region_loop,
            dt,
            loops,
            uses: UseLists::compute(func),
            divergent: FxIndexSet::default(),
            overrides: FxHashSet::default(),
            join_state: FxHashMap::default(),
            worklist: Vec::new(),
            fold_identity_phis: true,
        }
    }

    /// Whether a φ-node whose incoming values all fold to one value may stay
    /// uniform in a join block (on by default). Turning this off treats every
    /// φ in a join block as divergent.
    pub fn set_fold_identity_phis(&mut self, fold: bool) {
        self.fold_identity_phis = fold;
    }

    /// Seeds `v` as divergent. `v` must not be a uniform override.
    pub fn mark_divergent(&mut self, v: Value) {
        assert!(
            !matches!(v, Value::Const(_)),
            "constants cannot be divergent"
        );
        assert!(
            !self.is_always_uniform(v),
            "attempt to mark a uniform override as divergent"
        );
        self.divergent.insert(v);
    }

    /// Declares that `v` can never become divergent. Must precede
    /// [`compute`](Self::compute).
    pub fn add_uniform_override(&mut self, v: Value) {
        assert!(
            !self.is_divergent(v),
            "attempt to override a value already marked divergent"
        );
        self.overrides.insert(v);
    }

    pub fn is_divergent(&self, v: Value) -> bool {
        self.divergent.contains(&v)
    }

    pub fn is_always_uniform(&self, v: Value) -> bool {
        self.overrides.contains(&v)
    }

    /// Whether `block` reconverges divergent control at its own loop level.
    pub fn is_join_divergent(&self, block: Block) -> bool {
        matches!(
            self.join_state.get(&block),
            Some(JoinDivergence::SameLevel | JoinDivergence::Both)
        )
    }

    /// Whether threads reach `block` on different loop iterations.
    pub fn is_temporal_divergent(&self, block: Block) -> bool {
        matches!(
            self.join_state.get(&block),
            Some(JoinDivergence::Temporal | JoinDivergence::Both)
        )
    }

    /// All divergent values, in the deterministic order they were discovered.
    pub fn divergent_values(&self) -> impl Iterator<Item = Value> + '_ {
        self.divergent.iter().copied()
    }

    pub fn cx(&self) -> &'a Context {
        self.cx
    }

    pub fn func(&self) -> &'a FuncDef {
        self.func
    }

    /// Runs the propagation to its fixed point. `is_lcssa` declares that
    /// every loop live-out is materialized as a φ at a loop exit, which lets
    /// divergent loop exits be handled by tainting those φs alone.
    ///
    /// Calling `compute` again (e.g. after further seeds) resumes from the
    /// current state; with no new seeds it is a no-op.
    pub fn compute(&mut self, sync: &mut SyncDependenceAnalysis<'_>, is_lcssa: bool) {
        let func = self.func;
        log::debug!(
            "divergence: computing fixed point of `{}` ({} seeds, lcssa: {})",
            &self.cx[func.name],
            self.divergent.len(),
            is_lcssa,
        );

        let seeds: Vec<Value> = self.divergent.iter().copied().collect();
        for v in seeds {
            for &user in self.uses.users(v) {
                self.worklist.push(user);
            }
        }

        while let Some(inst) = self.worklist.pop() {
            let val = Value::Inst(inst);
            if self.is_always_uniform(val) || self.is_divergent(val) {
                continue;
            }

            // Control divergence caused by a branch.
            if let InstKind::Term(kind) = func.insts[inst].kind {
                if self.update_terminator(inst, kind) {
                    self.mark_divergent(val);
                    self.propagate_branch_divergence(sync, inst, is_lcssa);
                    continue;
                }
                // A non-divergent terminator can still carry data divergence
                // (e.g. the result of an abnormal dispatch), handled below.
            }

            let becomes_divergent = match func.insts[inst].kind {
                InstKind::Phi => self.update_phi(inst),
                _ => self.update_op(inst),
            };
            if becomes_divergent {
                self.mark_divergent(val);
                self.push_users(val);
            }
        }
    }

    fn update_terminator(&self, term: Inst, kind: TerminatorKind) -> bool {
        match kind {
            TerminatorKind::CondBr | TerminatorKind::Switch => {
                self.is_divergent(self.func.insts[term].inputs[0])
            }
            // Abnormal dispatch is never control-divergent; neither are
            // single-target jumps and returns.
            TerminatorKind::Unwind | TerminatorKind::Br | TerminatorKind::Ret => false,
        }
    }

    fn update_phi(&self, phi: Inst) -> bool {
        let block = self.func.block_of(phi);
        if self.is_temporal_divergent(block) {
            return true;
        }
        if self.is_join_divergent(block)
            && !(self.fold_identity_phis && self.func.phi_incoming_all_same(self.cx, phi))
        {
            return true;
        }
        self.func.insts[phi].inputs.iter().any(|&v| self.is_divergent(v))
    }

    fn update_op(&self, inst: Inst) -> bool {
        self.func.insts[inst].inputs.iter().any(|&v| self.is_divergent(v))
    }

    fn in_region(&self, inst: Inst) -> bool {
        self.region_loop
            .map_or(true, |l| self.loops.contains(l, self.func.block_of(inst)))
    }

    fn push_users(&mut self, v: Value) {
        for &user in self.uses.users(v) {
            if self.in_region(user) {
                self.worklist.push(user);
            }
        }
    }

    fn push_phi_nodes(&mut self, block: Block) {
        let func = self.func;
        self.worklist.extend(func.phi_nodes(block));
    }

    fn mark_block_join_divergent(&mut self, block: Block) {
        let state = self.join_state.entry(block).or_insert(JoinDivergence::SameLevel);
        if *state == JoinDivergence::Temporal {
            *state = JoinDivergence::Both;
        }
    }

    fn mark_block_temporal_divergent(&mut self, block: Block) {
        let state = self.join_state.entry(block).or_insert(JoinDivergence::Temporal);
        if *state == JoinDivergence::SameLevel {
            *state = JoinDivergence::Both;
        }
    }

    /// A branch just became divergent: classify each of its join blocks.
    fn propagate_branch_divergence(
        &mut self,
        sync: &mut SyncDependenceAnalysis<'_>,
        term: Inst,
        is_lcssa: bool,
    ) {
        let branch_loop = self.loops.innermost(self.func.block_of(term));
        let joins: SmallVec<[Block; 8]> = sync.join_blocks(term).iter().copied().collect();
        for join in joins {
            let join_loop = self.loops.innermost(join);
            if join_loop == branch_loop {
                self.mark_block_join_divergent(join);
                self.push_phi_nodes(join);
            } else if is_lcssa {
                // The loop-carried live-outs all sit in exit φs; tainting
                // them is enough.
                self.mark_block_temporal_divergent(join);
                self.push_phi_nodes(join);
            } else {
                let branch_loop = branch_loop
                    .expect("cross-loop join outside any loop: irreducible control flow");
                self.taint_loop_live_outs(branch_loop);
            }
        }
    }

    /// Marks every user of a value carried by `l` that sits outside of `l`:
    /// such users observe the value as of the (divergent) iteration their
    /// thread left the loop. Users are found by walking the region dominated
    /// by the loop header from the exits; φ-nodes at the fringe of that
    /// region are tainted wholesale as temporally divergent.
    fn taint_loop_live_outs(&mut self, l: LoopId) {
        let func = self.func;
        let header = self.loops.header(l);
        log::trace!(
            "divergence: tainting live-outs of the loop at {:?}",
            &self.cx[func.blocks[header].name]
        );

        let mut taint_stack: Vec<Block> = self.loops.exit_blocks(l).to_vec();
        let mut visited: FxHashSet<Block> = taint_stack.iter().copied().collect();
        visited.insert(header);

        while let Some(user_block) = taint_stack.pop() {
            assert!(
                !self.loops.contains(l, user_block),
                "irreducible control flow detected"
            );

            // φ-nodes at the fringe of the dominance region.
            if !self.dt.dominates(header, user_block) {
                self.mark_block_temporal_divergent(user_block);
                self.push_phi_nodes(user_block);
                continue;
            }

            for &inst in &func.blocks[user_block].insts {
                let val = Value::Inst(inst);
                if self.is_always_uniform(val) || self.is_divergent(val) {
                    continue;
                }
                let uses_carried_value = func.insts[inst].inputs.iter().any(|&op| match op {
                    Value::Inst(def) => self.loops.contains(l, func.block_of(def)),
                    Value::Const(_) | Value::Param(_) => false,
                });
                if uses_carried_value {
                    self.mark_divergent(val);
                    self.push_users(val);
                }
            }

            for &succ in func.successors(user_block) {
                if visited.insert(succ) {
                    taint_stack.push(succ);
                }
            }
        }
    }
}
