//! Divergence (uniformity) analysis for SIMT/SPMD control-flow graphs.
//!
//! GPU programs (and vectorized loops) execute groups of threads in lock-step.
//! A value is *uniform* if every thread of the group observes the same value,
//! and *divergent* otherwise. If a branch condition is divergent, threads
//! disagree on which successor to take and control itself diverges: the group
//! must execute both paths with different subsets of threads enabled until
//! they reconverge. Knowing which values and branches are divergent lets a
//! compiler decide where transformations like jump threading, loop
//! unswitching, or lane masking are profitable (or harmful).
//!
//! The analysis computes a conservative but non-trivial over-approximation of
//! the divergent values of a function, given a set of seed values (thread-id
//! sources and the like, identified by a caller-supplied policy). Two kinds of
//! dependence are propagated:
//!
//! * *data dependence*: an instruction with a divergent operand is divergent;
//! * *sync dependence*: a φ-node reading from a reconvergence point of a
//!   divergent branch is divergent even when all its incoming values are
//!   uniform, because different threads arrive through different edges.
//!
//! Sync dependence is resolved by [`sync::SyncDependenceAnalysis`], which maps
//! every branch to the set of blocks whose φ-nodes it can taint (including
//! loop exits that threads may leave on different iterations, so-called
//! *temporal* divergence). The work-list propagation lives in
//! [`divergence::DivergenceAnalysis`], and thin frontends for GPU kernels and
//! to-be-vectorized loops in [`frontend`].
//!
//! The approach follows the vectorization analysis of Karrenberg and Hack
//! ("Improving Performance of OpenCL on CPUs", CC '12): reconvergence points
//! are the blocks reachable from a branch by two disjoint paths, computed here
//! either by a bounded reaching-definitions walk or by an explicit
//! vertex-disjoint path search ([`paths::DivPathDecider`]).
//!
//! The crate carries its own minimal SSA CFG (blocks of ordered instructions,
//! φ-nodes as a leading prefix, a terminator last) so that the analysis, its
//! support analyses (dominators, post-dominators, natural loops), and its
//! tests are self-contained; see [`build::FuncBuilder`] for constructing one.

use smallvec::SmallVec;
use std::hash::BuildHasherDefault;

mod context;
pub use context::{Block, Const, Context, EntityDefs, EntityId, Inst, InternedStr};

pub mod build;
pub mod cfg;
pub mod divergence;
pub mod dom;
pub mod frontend;
pub mod loops;
pub mod paths;
pub mod print;
pub mod sync;

/// Map with deterministic (insertion) iteration order and a fast hasher.
pub type FxIndexMap<K, V> =
    indexmap::IndexMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;

/// Set with deterministic (insertion) iteration order and a fast hasher.
pub type FxIndexSet<T> = indexmap::IndexSet<T, BuildHasherDefault<rustc_hash::FxHasher>>;

/// The definition of an interned [`Const`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ConstDef {
    Bool(bool),
    Int(i64),
    /// An unspecified value; φ-nodes treat `Undef` inputs as compatible with
    /// any other single incoming value.
    Undef,
}

/// Any SSA value an instruction can refer to.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Value {
    Const(Const),
    /// The `i`-th parameter of the enclosing function.
    Param(u32),
    /// The result of an instruction.
    Inst(Inst),
}

/// Ways a block can transfer control, discriminated at query time.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TerminatorKind {
    /// Two-way branch on `inputs[0]`.
    CondBr,
    /// Multi-way branch on `inputs[0]`, one target per case.
    Switch,
    /// Unconditional jump to the single target.
    Br,
    /// Function return, no targets.
    Ret,
    /// Abnormal dispatch (e.g. an exception edge). Its targets count for
    /// reachability, but it is never treated as a divergent branch; only the
    /// data divergence of its result propagates.
    Unwind,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum InstKind {
    /// Value join: `inputs[i]` flows in when control arrives from `blocks[i]`.
    Phi,
    /// An ordinary operation, identified by an opcode mnemonic. The analysis
    /// never interprets the opcode; only the operands matter.
    Op(InternedStr),
    Term(TerminatorKind),
}

#[derive(Clone)]
pub struct InstDef {
    /// Result name, used only for diagnostics.
    pub name: InternedStr,

    pub kind: InstKind,

    /// Ordered operands. For `CondBr`/`Switch` the condition is `inputs[0]`.
    pub inputs: SmallVec<[Value; 2]>,

    /// For φ-nodes, the incoming block per input; for terminators, the
    /// successor targets (in successor order). Empty otherwise.
    pub blocks: SmallVec<[Block; 2]>,
}

#[derive(Clone)]
pub struct BlockDef {
    /// Label, used only for diagnostics.
    pub name: InternedStr,

    /// Ordered instructions: a (possibly empty) φ prefix, then ordinary
    /// operations, with the terminator last.
    pub insts: Vec<Inst>,
}

/// A function in SSA form, with its CFG implied by block terminators.
///
/// Blocks and instructions are [`Context`]-allocated entities; `block_order`
/// fixes the deterministic program order that every analysis iterates in
/// (entity definitions themselves are deliberately not iterable).
pub struct FuncDef {
    pub name: InternedStr,
    /// Parameter names; parameters are referenced as [`Value::Param`].
    pub params: Vec<InternedStr>,

    pub blocks: EntityDefs<Block, BlockDef>,
    pub insts: EntityDefs<Inst, InstDef>,

    pub entry: Block,
    /// All blocks in program order, entry first.
    pub block_order: Vec<Block>,

    pub(crate) inst_parent: rustc_hash::FxHashMap<Inst, Block>,
}

impl FuncDef {
    /// The block an instruction is defined in.
    pub fn block_of(&self, inst: Inst) -> Block {
        self.inst_parent[&inst]
    }

    /// The last instruction of `block`. Well-formed functions always have one.
    pub fn terminator_of(&self, block: Block) -> Inst {
        *self.blocks[block].insts.last().expect("block with no terminator")
    }

    /// Successor blocks of `block`, in target order.
    pub fn successors(&self, block: Block) -> &[Block] {
        &self.insts[self.terminator_of(block)].blocks
    }

    /// The φ-nodes of `block` (its leading instruction prefix).
    pub fn phi_nodes(&self, block: Block) -> impl Iterator<Item = Inst> + '_ {
        self.blocks[block]
            .insts
            .iter()
            .copied()
            .take_while(|&inst| matches!(self.insts[inst].kind, InstKind::Phi))
    }

    /// The branch condition of a `CondBr`/`Switch` terminator.
    pub fn condition_of(&self, term: Inst) -> Option<Value> {
        match self.insts[term].kind {
            InstKind::Term(TerminatorKind::CondBr | TerminatorKind::Switch) => {
                Some(self.insts[term].inputs[0])
            }
            _ => None,
        }
    }

    /// Whether all incoming values of a φ-node fold to one value, treating
    /// `Undef` constants as compatible with anything. Such a φ cannot observe
    /// which edge control arrived through.
    pub fn phi_incoming_all_same(&self, cx: &Context, phi: Inst) -> bool {
        debug_assert!(matches!(self.insts[phi].kind, InstKind::Phi));
        let mut folded = None;
        for &input in &self.insts[phi].inputs {
            if let Value::Const(c) = input {
                if cx[c] == ConstDef::Undef {
                    continue;
                }
            }
            if *folded.get_or_insert(input) != input {
                return false;
            }
        }
        true
    }
}

/// The CFG-derived analyses the divergence propagator consumes, bundled so
/// frontends and tests can derive them from a function in one step.
pub struct FuncAnalyses {
    pub cfg: cfg::CfgInfo,
    pub dt: dom::DominatorTree,
    pub pdt: dom::PostDominatorTree,
    pub loops: loops::LoopForest,
}

impl FuncAnalyses {
    pub fn compute(func: &FuncDef) -> Self {
        let cfg = cfg::CfgInfo::compute(func);
        let dt = dom::DominatorTree::compute(func, &cfg);
        let pdt = dom::PostDominatorTree::compute(func, &cfg);
        let loops = loops::LoopForest::compute(func, &cfg, &dt);
        Self { cfg, dt, pdt, loops }
    }
}
