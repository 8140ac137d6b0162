//! Natural-loop forest.
//!
//! Loops are discovered from back edges (edges whose target dominates their
//! source); each loop is the natural loop of its header, i.e. the header plus
//! every block that reaches a latch without passing through the header.
//! Reducibility is assumed throughout and asserted in every build profile: a
//! retreating edge whose target does not dominate its source has no natural
//! loop, and silently skipping it would yield a wrong forest.

use crate::{cfg::CfgInfo, dom::DominatorTree, Block, FuncDef, FxIndexMap, FxIndexSet};
use itertools::Itertools;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Handle for a loop in a [`LoopForest`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct LoopId(u32);

struct LoopDef {
    header: Block,
    /// Sources of back edges into `header`. Canonical loops have exactly one.
    latches: SmallVec<[Block; 1]>,
    /// All member blocks (header first), including those of nested loops.
    blocks: FxIndexSet<Block>,
    parent: Option<LoopId>,
    depth: u32,
    /// Blocks outside the loop with a predecessor inside, in program order.
    exit_blocks: Vec<Block>,
}

#[derive(Default)]
pub struct LoopForest {
    loops: Vec<LoopDef>,
    /// Innermost containing loop per block.
    innermost: FxHashMap<Block, LoopId>,
}

impl LoopForest {
    pub fn compute(func: &FuncDef, cfg: &CfgInfo, dt: &DominatorTree) -> Self {
        // Back edges, grouped by header in RPO discovery order.
        let mut headers: FxIndexMap<Block, SmallVec<[Block; 1]>> = FxIndexMap::default();
        for block in cfg.reverse_postorder() {
            for &succ in func.successors(block) {
                if cfg.rpo_index(succ) <= cfg.rpo_index(block) {
                    // A retreating edge whose target does not dominate its
                    // source has no natural loop.
                    assert!(
                        dt.dominates(succ, block),
                        "irreducible control flow detected"
                    );
                    headers.entry(succ).or_default().push(block);
                }
            }
        }

        let mut loops: Vec<LoopDef> = headers
            .into_iter()
            .map(|(header, latches)| {
                // Natural loop: backward walk from the latches, fenced by the
                // header.
                let mut blocks = FxIndexSet::default();
                blocks.insert(header);
                let mut stack: Vec<Block> = Vec::new();
                for &latch in &latches {
                    if blocks.insert(latch) {
                        stack.push(latch);
                    }
                }
                while let Some(block) = stack.pop() {
                    for &pred in cfg.preds(block) {
                        if blocks.insert(pred) {
                            stack.push(pred);
                        }
                    }
                }
                LoopDef {
                    header,
                    latches,
                    blocks,
                    parent: None,
                    depth: 1,
                    exit_blocks: Vec::new(),
                }
            })
            .collect();

        // Nesting: the parent is the smallest other loop containing the header.
        for i in 0..loops.len() {
            let mut parent: Option<usize> = None;
            for j in 0..loops.len() {
                if i == j || !loops[j].blocks.contains(&loops[i].header) {
                    continue;
                }
                if parent.map_or(true, |p| loops[j].blocks.len() < loops[p].blocks.len()) {
                    parent = Some(j);
                }
            }
            loops[i].parent = parent.map(|p| LoopId(p as u32));
        }
        for i in 0..loops.len() {
            let mut depth = 1;
            let mut cursor = loops[i].parent;
            while let Some(LoopId(p)) = cursor {
                depth += 1;
                cursor = loops[p as usize].parent;
            }
            loops[i].depth = depth;
        }

        // Innermost loop per block: larger loops assign first, nested loops
        // overwrite.
        let mut by_size: Vec<usize> = (0..loops.len()).collect();
        by_size.sort_by_key(|&i| std::cmp::Reverse(loops[i].blocks.len()));
        let mut innermost = FxHashMap::default();
        for i in by_size {
            for &block in &loops[i].blocks {
                innermost.insert(block, LoopId(i as u32));
            }
        }

        for i in 0..loops.len() {
            let mut exits = Vec::new();
            for &block in &func.block_order {
                if !loops[i].blocks.contains(&block) {
                    continue;
                }
                for &succ in func.successors(block) {
                    if !loops[i].blocks.contains(&succ) && !exits.contains(&succ) {
                        exits.push(succ);
                    }
                }
            }
            loops[i].exit_blocks = exits;
        }

        Self { loops, innermost }
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// All loops, in header discovery (RPO) order.
    pub fn loop_ids(&self) -> impl Iterator<Item = LoopId> {
        (0..self.loops.len() as u32).map(LoopId)
    }

    /// The innermost loop containing `block`, if any.
    pub fn innermost(&self, block: Block) -> Option<LoopId> {
        self.innermost.get(&block).copied()
    }

    pub fn header(&self, l: LoopId) -> Block {
        self.loops[l.0 as usize].header
    }

    /// The unique back-edge source, or `None` for multi-latch loops.
    pub fn latch(&self, l: LoopId) -> Option<Block> {
        match &self.loops[l.0 as usize].latches[..] {
            &[latch] => Some(latch),
            _ => None,
        }
    }

    pub fn contains(&self, l: LoopId, block: Block) -> bool {
        self.loops[l.0 as usize].blocks.contains(&block)
    }

    /// Blocks outside the loop with an in-loop predecessor, in program order.
    pub fn exit_blocks(&self, l: LoopId) -> &[Block] {
        &self.loops[l.0 as usize].exit_blocks
    }

    pub fn parent(&self, l: LoopId) -> Option<LoopId> {
        self.loops[l.0 as usize].parent
    }

    pub fn depth(&self, l: LoopId) -> u32 {
        self.loops[l.0 as usize].depth
    }

    /// The single in-loop block all exit edges leave from, if there is one.
    pub fn unique_exiting_block(&self, func: &FuncDef, l: LoopId) -> Option<Block> {
        func.block_order
            .iter()
            .copied()
            .filter(|&b| {
                self.contains(l, b)
                    && func.successors(b).iter().any(|&s| !self.contains(l, s))
            })
            .exactly_one()
            .ok()
    }
}
