//! Dominator and post-dominator trees.
//!
//! Both are computed with the iterative algorithm of Cooper, Harvey and
//! Kennedy ("A Simple, Fast Dominance Algorithm") over the post-order
//! numbering from [`CfgInfo`]. `dominates` answers in O(1) via pre-order
//! intervals of the dominator tree.

use crate::{cfg::CfgInfo, Block, FuncDef};
use rustc_hash::FxHashMap;

pub struct DominatorTree {
    /// Immediate dominator per block; the entry has none.
    idom: FxHashMap<Block, Block>,
    /// `(pre_number, pre_max)` intervals from a pre-order walk of the tree.
    intervals: FxHashMap<Block, (u32, u32)>,
}

impl DominatorTree {
    pub fn compute(func: &FuncDef, cfg: &CfgInfo) -> Self {
        let rpo: Vec<Block> = cfg.reverse_postorder().collect();

        // The entry temporarily dominates itself so it participates in
        // intersections; the self-edge is removed afterwards.
        let mut idom: FxHashMap<Block, Block> = FxHashMap::default();
        idom.insert(func.entry, func.entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &block in &rpo[1..] {
                let mut processed = cfg
                    .preds(block)
                    .iter()
                    .copied()
                    .filter(|p| idom.contains_key(p));
                // At least one predecessor precedes `block` in RPO.
                let first = processed.next().unwrap();
                let new_idom =
                    processed.fold(first, |a, b| Self::intersect(cfg, &idom, a, b));
                if idom.get(&block) != Some(&new_idom) {
                    idom.insert(block, new_idom);
                    changed = true;
                }
            }
        }
        idom.remove(&func.entry);

        // Children in RPO, so pre-order numbering is deterministic.
        let mut children: FxHashMap<Block, Vec<Block>> = FxHashMap::default();
        for &block in &rpo[1..] {
            children.entry(idom[&block]).or_default().push(block);
        }

        let mut intervals: FxHashMap<Block, (u32, u32)> = FxHashMap::default();
        let mut pre_order = Vec::with_capacity(rpo.len());
        let mut stack = vec![func.entry];
        let mut n = 0u32;
        while let Some(block) = stack.pop() {
            intervals.insert(block, (n, n));
            pre_order.push(block);
            n += 1;
            if let Some(kids) = children.get(&block) {
                stack.extend(kids.iter().rev());
            }
        }
        // Children appear after their parent in pre-order, so a reverse sweep
        // propagates `pre_max` bottom-up.
        for &block in pre_order.iter().rev() {
            if let Some(&parent) = idom.get(&block) {
                let child_max = intervals[&block].1;
                let parent_interval = intervals.get_mut(&parent).unwrap();
                parent_interval.1 = parent_interval.1.max(child_max);
            }
        }

        Self { idom, intervals }
    }

    fn intersect(cfg: &CfgInfo, idom: &FxHashMap<Block, Block>, mut a: Block, mut b: Block) -> Block {
        while a != b {
            // The deeper node (later in RPO) walks up.
            if cfg.rpo_index(a) > cfg.rpo_index(b) {
                a = idom[&a];
            } else {
                b = idom[&b];
            }
        }
        a
    }

    /// `None` for the entry block.
    pub fn immediate_dominator(&self, block: Block) -> Option<Block> {
        self.idom.get(&block).copied()
    }

    /// Whether `a` dominates `b` (reflexively).
    pub fn dominates(&self, a: Block, b: Block) -> bool {
        let (a_pre, a_max) = self.intervals[&a];
        let (b_pre, b_max) = self.intervals[&b];
        a_pre <= b_pre && a_max >= b_max
    }
}

/// Immediate post-dominator per block, relative to a virtual exit root that
/// post-dominates every function exit.
pub struct PostDominatorTree {
    ipdom: FxHashMap<Block, PdParent>,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum PdParent {
    /// The virtual exit root.
    Virtual,
    Block(Block),
}

impl PostDominatorTree {
    pub fn compute(func: &FuncDef, cfg: &CfgInfo) -> Self {
        // Exits, in program order, are the children of the virtual root.
        let roots: Vec<Block> = func
            .block_order
            .iter()
            .copied()
            .filter(|&b| func.successors(b).is_empty())
            .collect();

        // Post-order of the reversed CFG (edges flipped, predecessors walked).
        let mut po = Vec::with_capacity(func.block_order.len());
        let mut visited = rustc_hash::FxHashSet::default();
        for &root in &roots {
            if !visited.insert(root) {
                continue;
            }
            let mut stack: Vec<(Block, usize)> = vec![(root, 0)];
            while let Some(&mut (block, ref mut next)) = stack.last_mut() {
                match cfg.preds(block).get(*next) {
                    Some(&pred) => {
                        *next += 1;
                        if visited.insert(pred) {
                            stack.push((pred, 0));
                        }
                    }
                    None => {
                        po.push(block);
                        stack.pop();
                    }
                }
            }
        }
        let po_index: FxHashMap<Block, u32> =
            po.iter().enumerate().map(|(i, &b)| (b, i as u32)).collect();

        let mut ipdom: FxHashMap<Block, PdParent> = FxHashMap::default();
        for &root in &roots {
            ipdom.insert(root, PdParent::Virtual);
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &block in po.iter().rev() {
                if func.successors(block).is_empty() {
                    continue;
                }
                let mut processed = func
                    .successors(block)
                    .iter()
                    .copied()
                    .filter(|s| ipdom.contains_key(s));
                let Some(first) = processed.next() else {
                    continue;
                };
                let new_ipdom = processed.fold(PdParent::Block(first), |a, b| {
                    Self::intersect(&po_index, &ipdom, a, PdParent::Block(b))
                });
                if ipdom.get(&block) != Some(&new_ipdom) {
                    ipdom.insert(block, new_ipdom);
                    changed = true;
                }
            }
        }

        Self { ipdom }
    }

    fn intersect(
        po_index: &FxHashMap<Block, u32>,
        ipdom: &FxHashMap<Block, PdParent>,
        mut a: PdParent,
        mut b: PdParent,
    ) -> PdParent {
        loop {
            match (a, b) {
                (PdParent::Virtual, _) | (_, PdParent::Virtual) => return PdParent::Virtual,
                (PdParent::Block(x), PdParent::Block(y)) => {
                    if x == y {
                        return a;
                    }
                    // The deeper node (earlier reversed post-order) walks up.
                    if po_index[&x] < po_index[&y] {
                        a = ipdom[&x];
                    } else {
                        b = ipdom[&y];
                    }
                }
            }
        }
    }

    /// The immediate post-dominator of `block`, or `None` if it is the
    /// virtual exit root (the block is an exit, or only reaches divergent
    /// non-terminating control flow).
    pub fn immediate_post_dominator(&self, block: Block) -> Option<Block> {
        match self.ipdom.get(&block) {
            Some(PdParent::Block(b)) => Some(*b),
            Some(PdParent::Virtual) | None => None,
        }
    }
}
