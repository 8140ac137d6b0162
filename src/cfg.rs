//! Control-flow graph (CFG) abstractions and utilities.

use crate::{Block, FuncDef, Inst, Value};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Derived CFG facts: predecessor lists and a post-order numbering.
///
/// Computed once per function and queried read-only afterwards; all tables are
/// keyed by block identity, never owning the blocks themselves.
pub struct CfgInfo {
    preds: FxHashMap<Block, SmallVec<[Block; 2]>>,
    postorder: Vec<Block>,
    rpo_index: FxHashMap<Block, u32>,
}

impl CfgInfo {
    pub fn compute(func: &FuncDef) -> Self {
        let mut preds: FxHashMap<Block, SmallVec<[Block; 2]>> = FxHashMap::default();
        for &block in &func.block_order {
            for &succ in func.successors(block) {
                let entry = preds.entry(succ).or_default();
                // A switch may name the same target twice; predecessor lists
                // are edge-deduplicated.
                if !entry.contains(&block) {
                    entry.push(block);
                }
            }
        }

        // Iterative DFS from the entry, visiting successors in target order.
        let mut postorder = Vec::with_capacity(func.block_order.len());
        let mut visited = rustc_hash::FxHashSet::default();
        let mut stack: Vec<(Block, usize)> = vec![(func.entry, 0)];
        visited.insert(func.entry);
        while let Some(&mut (block, ref mut next_succ)) = stack.last_mut() {
            match func.successors(block).get(*next_succ) {
                Some(&succ) => {
                    *next_succ += 1;
                    if visited.insert(succ) {
                        stack.push((succ, 0));
                    }
                }
                None => {
                    postorder.push(block);
                    stack.pop();
                }
            }
        }

        let rpo_index = postorder
            .iter()
            .rev()
            .enumerate()
            .map(|(i, &b)| (b, i as u32))
            .collect();

        Self { preds, postorder, rpo_index }
    }

    /// Predecessors of `block`, deduplicated, in first-occurrence program order.
    pub fn preds(&self, block: Block) -> &[Block] {
        match self.preds.get(&block) {
            Some(p) => p.as_slice(),
            None => &[],
        }
    }

    pub fn postorder(&self) -> &[Block] {
        &self.postorder
    }

    pub fn reverse_postorder(&self) -> impl DoubleEndedIterator<Item = Block> + '_ {
        self.postorder.iter().rev().copied()
    }

    /// Position of `block` in a reverse post-order traversal.
    pub fn rpo_index(&self, block: Block) -> u32 {
        self.rpo_index[&block]
    }
}

/// Def-use index: every user instruction of every value, in program order.
pub struct UseLists {
    users: FxHashMap<Value, SmallVec<[Inst; 4]>>,
}

impl UseLists {
    pub fn compute(func: &FuncDef) -> Self {
        let mut users: FxHashMap<Value, SmallVec<[Inst; 4]>> = FxHashMap::default();
        for &block in &func.block_order {
            for &inst in &func.blocks[block].insts {
                for &input in &func.insts[inst].inputs {
                    users.entry(input).or_default().push(inst);
                }
            }
        }
        Self { users }
    }

    pub fn users(&self, v: Value) -> &[Inst] {
        match self.users.get(&v) {
            Some(u) => u.as_slice(),
            None => &[],
        }
    }
}
