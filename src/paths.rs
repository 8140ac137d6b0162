//! Vertex-disjoint path queries over the CFG.
//!
//! Whether `n` vertex-disjoint paths connect two blocks is decided by a
//! specialization of Ford-Fulkerson that stops once a flow of `n` is found,
//! run on a node-split graph: every block becomes an `In` and an `Out` node
//! joined by an internal edge of capacity 1, and every CFG edge an `Out -> In`
//! edge of capacity 1. Augmenting paths alternate forward edges and reverse
//! (residual) edges of the current flow, so after `n` successful augmentations
//! the extracted paths share no interior vertex. Running time is `O(edges) * n`.

use crate::{
    cfg::CfgInfo,
    loops::{LoopForest, LoopId},
    Block, FuncDef,
};
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
enum Half {
    In,
    Out,
}

/// One half of a split block in the flow network.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
struct Node {
    block: Block,
    half: Half,
}

impl Node {
    fn input(block: Block) -> Self {
        Self { block, half: Half::In }
    }

    fn output(block: Block) -> Self {
        Self { block, half: Half::Out }
    }
}

/// An edge of the flow network currently carrying one unit of flow.
type Edge = (Node, Node);

pub struct DivPathDecider<'a> {
    func: &'a FuncDef,
    cfg: &'a CfgInfo,
    loops: &'a LoopForest,
}

impl<'a> DivPathDecider<'a> {
    pub fn new(func: &'a FuncDef, cfg: &'a CfgInfo, loops: &'a LoopForest) -> Self {
        Self { func, cfg, loops }
    }

    /// Whether `n` vertex-disjoint paths lead from `from` to `to`.
    pub fn disjoint_paths(&self, from: Block, to: Block, n: u32) -> bool {
        self.n_disjoint_paths(Node::output(from), &[Node::input(to)], n, None)
    }

    /// Whether a divergent branch in `from` can make threads leave `l`
    /// through `exit` on different iterations: one path must reach the exit
    /// while a disjoint one reaches the latch, both staying inside the loop
    /// until the exit edge is taken.
    pub fn induces_divergent_exit(&self, from: Block, exit: Block, l: LoopId) -> bool {
        let latch = self.loops.latch(l).expect("loop with a unique latch");
        if from == latch {
            return matches!(self.cfg.preds(exit), &[pred] if pred == from);
        }
        let sinks = [Node::output(exit), Node::output(latch)];
        self.n_disjoint_paths(Node::output(from), &sinks, 2, Some(l))
    }

    fn n_disjoint_paths(
        &self,
        source: Node,
        sinks: &[Node],
        n: u32,
        within: Option<LoopId>,
    ) -> bool {
        let mut flow: FxHashSet<Edge> = FxHashSet::default();
        for _ in 0..n {
            let mut parent: FxHashMap<Node, Node> = FxHashMap::default();
            let Some(sink) = self.find_augmenting(source, sinks, &flow, &mut parent, within)
            else {
                return false;
            };
            Self::inject_flow(source, sink, &parent, &mut flow);
        }
        true
    }

    /// DFS for a path from `source` to one of `sinks` along edges with
    /// residual capacity, recording each node's search predecessor.
    fn find_augmenting(
        &self,
        source: Node,
        sinks: &[Node],
        flow: &FxHashSet<Edge>,
        parent: &mut FxHashMap<Node, Node>,
        within: Option<LoopId>,
    ) -> Option<Node> {
        let in_bounds =
            |block: Block| within.map_or(true, |l| self.loops.contains(l, block));

        let mut visited: FxHashSet<Node> = FxHashSet::default();
        let mut stack = vec![source];
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            if sinks.contains(&node) {
                return Some(node);
            }

            let block = node.block;
            match node.half {
                Half::Out => {
                    // Forward CFG edges, fenced by the loop (an exit node can
                    // be reached, but not traversed through).
                    if in_bounds(block) {
                        for &succ in self.func.successors(block) {
                            let next = Node::input(succ);
                            if !visited.contains(&next) && !flow.contains(&(node, next)) {
                                parent.insert(next, node);
                                stack.push(next);
                            }
                        }
                    }
                    // Residual reversal of the internal split edge.
                    let split_in = Node::input(block);
                    if !visited.contains(&split_in) && flow.contains(&(split_in, node)) {
                        parent.insert(split_in, node);
                        stack.push(split_in);
                    }
                }
                Half::In => {
                    // The internal split edge, unless saturated.
                    let split_out = Node::output(block);
                    if !visited.contains(&split_out) && !flow.contains(&(node, split_out)) {
                        parent.insert(split_out, node);
                        stack.push(split_out);
                    }
                    // Residual reversal of CFG edges carrying flow.
                    if in_bounds(block) {
                        for &pred in self.cfg.preds(block) {
                            let next = Node::output(pred);
                            if !visited.contains(&next) && flow.contains(&(next, node)) {
                                parent.insert(next, node);
                                stack.push(next);
                            }
                        }
                    }
                }
            }
        }
        None
    }

    /// Pushes one unit of flow along the found path, cancelling any residual
    /// edges it used.
    fn inject_flow(
        source: Node,
        mut end: Node,
        parent: &FxHashMap<Node, Node>,
        flow: &mut FxHashSet<Edge>,
    ) {
        while end != source {
            let prev = parent[&end];
            if !flow.remove(&(end, prev)) {
                flow.insert((prev, end));
            }
            end = prev;
        }
    }
}
