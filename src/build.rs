//! Construction and structural validation of [`FuncDef`]s.

use crate::{
    Block, BlockDef, Context, EntityDefs, FuncDef, Inst, InstDef, InstKind, TerminatorKind, Value,
};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use thiserror::Error;

/// Structural errors reported by [`FuncBuilder::finish`].
///
/// These are caller mistakes in assembling a function, reported as values
/// (unlike analysis-time precondition violations, which assert).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IrError {
    #[error("function has no blocks")]
    NoBlocks,
    #[error("block `{0}` is empty")]
    EmptyBlock(String),
    #[error("block `{0}` does not end in a terminator")]
    MissingTerminator(String),
    #[error("terminator in the middle of block `{0}`")]
    MidBlockTerminator(String),
    #[error("φ-node after a non-φ instruction in block `{0}`")]
    PhiNotLeading(String),
    #[error("`{kind}` terminator of block `{block}` has a malformed target/input list")]
    MalformedTerminator { block: String, kind: &'static str },
    #[error("φ-node `{phi}` does not cover the predecessors of block `{block}` exactly")]
    PhiIncomingMismatch { phi: String, block: String },
    #[error("block `{0}` is unreachable from the entry block")]
    UnreachableBlock(String),
}

/// Incrementally builds a [`FuncDef`]; [`FuncBuilder::finish`] verifies the
/// result.
///
/// φ-nodes may be added at any point and are always placed at the end of the
/// block's φ prefix, so interleaving them with ordinary operations is not a
/// builder error.
pub struct FuncBuilder<'a> {
    cx: &'a Context,
    name: crate::InternedStr,
    params: Vec<crate::InternedStr>,
    blocks: EntityDefs<Block, BlockDef>,
    insts: EntityDefs<Inst, InstDef>,
    block_order: Vec<Block>,
    inst_parent: FxHashMap<Inst, Block>,
}

impl<'a> FuncBuilder<'a> {
    pub fn new(cx: &'a Context, name: &str) -> Self {
        Self {
            cx,
            name: cx.intern_str(name),
            params: Vec::new(),
            blocks: EntityDefs::new(),
            insts: EntityDefs::new(),
            block_order: Vec::new(),
            inst_parent: FxHashMap::default(),
        }
    }

    /// Appends a function parameter and returns the value referring to it.
    pub fn param(&mut self, name: &str) -> Value {
        self.params.push(self.cx.intern_str(name));
        Value::Param(self.params.len() as u32 - 1)
    }

    pub fn const_int(&self, v: i64) -> Value {
        Value::Const(self.cx.intern_const(crate::ConstDef::Int(v)))
    }

    pub fn const_bool(&self, v: bool) -> Value {
        Value::Const(self.cx.intern_const(crate::ConstDef::Bool(v)))
    }

    pub fn undef(&self) -> Value {
        Value::Const(self.cx.intern_const(crate::ConstDef::Undef))
    }

    /// Appends a new block; the first block created becomes the entry.
    pub fn block(&mut self, name: &str) -> Block {
        let block = self.blocks.define(
            self.cx,
            BlockDef {
                name: self.cx.intern_str(name),
                insts: Vec::new(),
            },
        );
        self.block_order.push(block);
        block
    }

    fn append(&mut self, block: Block, def: InstDef) -> Inst {
        let inst = self.insts.define(self.cx, def);
        self.inst_parent.insert(inst, block);
        self.blocks[block].insts.push(inst);
        inst
    }

    /// Appends an ordinary operation and returns its result value.
    pub fn op(&mut self, block: Block, name: &str, opcode: &str, inputs: &[Value]) -> Value {
        let inst = self.append(
            block,
            InstDef {
                name: self.cx.intern_str(name),
                kind: InstKind::Op(self.cx.intern_str(opcode)),
                inputs: SmallVec::from_slice(inputs),
                blocks: SmallVec::new(),
            },
        );
        Value::Inst(inst)
    }

    /// Adds a φ-node at the end of `block`'s φ prefix and returns its result.
    pub fn phi(&mut self, block: Block, name: &str, incoming: &[(Block, Value)]) -> Value {
        let inst = self.insts.define(
            self.cx,
            InstDef {
                name: self.cx.intern_str(name),
                kind: InstKind::Phi,
                inputs: incoming.iter().map(|&(_, v)| v).collect(),
                blocks: incoming.iter().map(|&(b, _)| b).collect(),
            },
        );
        self.inst_parent.insert(inst, block);
        let block_insts = &mut self.blocks[block].insts;
        let phi_prefix_len = block_insts
            .iter()
            .take_while(|&&i| matches!(self.insts[i].kind, InstKind::Phi))
            .count();
        block_insts.insert(phi_prefix_len, inst);
        Value::Inst(inst)
    }

    /// Adds a φ-node with no incoming values yet, for loop-carried values
    /// that must reference instructions built later; complete it with
    /// [`set_phi_incoming`](Self::set_phi_incoming) before `finish`.
    pub fn phi_deferred(&mut self, block: Block, name: &str) -> Value {
        self.phi(block, name, &[])
    }

    pub fn set_phi_incoming(&mut self, phi: Value, incoming: &[(Block, Value)]) {
        let Value::Inst(inst) = phi else {
            panic!("set_phi_incoming on a non-instruction value")
        };
        let def = &mut self.insts[inst];
        assert!(matches!(def.kind, InstKind::Phi), "set_phi_incoming on a non-φ");
        def.inputs = incoming.iter().map(|&(_, v)| v).collect();
        def.blocks = incoming.iter().map(|&(b, _)| b).collect();
    }

    pub fn cond_br(&mut self, block: Block, cond: Value, on_true: Block, on_false: Block) {
        self.terminator(block, TerminatorKind::CondBr, &[cond], &[on_true, on_false]);
    }

    pub fn switch(&mut self, block: Block, cond: Value, targets: &[Block]) {
        self.terminator(block, TerminatorKind::Switch, &[cond], targets);
    }

    pub fn br(&mut self, block: Block, target: Block) {
        self.terminator(block, TerminatorKind::Br, &[], &[target]);
    }

    pub fn ret(&mut self, block: Block) {
        self.terminator(block, TerminatorKind::Ret, &[], &[]);
    }

    /// Abnormal dispatch (e.g. a call with an exceptional edge): `inputs` are
    /// the data operands of the dispatching instruction.
    pub fn unwind(&mut self, block: Block, name: &str, inputs: &[Value], targets: &[Block]) {
        let def = InstDef {
            name: self.cx.intern_str(name),
            kind: InstKind::Term(TerminatorKind::Unwind),
            inputs: SmallVec::from_slice(inputs),
            blocks: SmallVec::from_slice(targets),
        };
        self.append(block, def);
    }

    fn terminator(
        &mut self,
        block: Block,
        kind: TerminatorKind,
        inputs: &[Value],
        targets: &[Block],
    ) {
        let def = InstDef {
            name: self.cx.intern_str(""),
            kind: InstKind::Term(kind),
            inputs: SmallVec::from_slice(inputs),
            blocks: SmallVec::from_slice(targets),
        };
        self.append(block, def);
    }

    /// Assembles the function, verifying its structure.
    pub fn finish(self) -> Result<FuncDef, IrError> {
        let entry = *self.block_order.first().ok_or(IrError::NoBlocks)?;
        let func = FuncDef {
            name: self.name,
            params: self.params,
            blocks: self.blocks,
            insts: self.insts,
            entry,
            block_order: self.block_order,
            inst_parent: self.inst_parent,
        };
        verify(self.cx, &func)?;
        Ok(func)
    }
}

/// Checks the structural invariants every analysis in this crate relies on.
fn verify(cx: &Context, func: &FuncDef) -> Result<(), IrError> {
    let block_name = |b: Block| cx[func.blocks[b].name].to_string();

    // Per-block shape: non-empty, φ prefix, terminator last (and only last).
    for &block in &func.block_order {
        let insts = &func.blocks[block].insts;
        let &last = insts.last().ok_or_else(|| IrError::EmptyBlock(block_name(block)))?;

        let mut seen_non_phi = false;
        for &inst in insts {
            let def = &func.insts[inst];
            match def.kind {
                InstKind::Phi => {
                    if seen_non_phi {
                        return Err(IrError::PhiNotLeading(block_name(block)));
                    }
                }
                InstKind::Op(_) => seen_non_phi = true,
                InstKind::Term(kind) => {
                    seen_non_phi = true;
                    if inst != last {
                        return Err(IrError::MidBlockTerminator(block_name(block)));
                    }
                    let malformed = |kind| IrError::MalformedTerminator {
                        block: block_name(block),
                        kind,
                    };
                    match kind {
                        TerminatorKind::CondBr => {
                            if def.blocks.len() != 2 || def.inputs.len() != 1 {
                                return Err(malformed("cond_br"));
                            }
                        }
                        TerminatorKind::Switch => {
                            if def.blocks.len() < 2 || def.inputs.len() != 1 {
                                return Err(malformed("switch"));
                            }
                        }
                        TerminatorKind::Br => {
                            if def.blocks.len() != 1 || !def.inputs.is_empty() {
                                return Err(malformed("br"));
                            }
                        }
                        TerminatorKind::Ret => {
                            if !def.blocks.is_empty() {
                                return Err(malformed("ret"));
                            }
                        }
                        TerminatorKind::Unwind => {}
                    }
                }
            }
        }
        if !matches!(func.insts[last].kind, InstKind::Term(_)) {
            return Err(IrError::MissingTerminator(block_name(block)));
        }
    }

    // Predecessors, for φ checking below.
    let mut preds: FxHashMap<Block, SmallVec<[Block; 2]>> = FxHashMap::default();
    for &block in &func.block_order {
        for &succ in func.successors(block) {
            let entry = preds.entry(succ).or_default();
            if !entry.contains(&block) {
                entry.push(block);
            }
        }
    }

    // Every φ must mention each predecessor exactly once, and nothing else.
    for &block in &func.block_order {
        let block_preds = preds.get(&block).map_or(&[][..], |p| &p[..]);
        for phi in func.phi_nodes(block) {
            let incoming = &func.insts[phi].blocks;
            let distinct: FxHashSet<Block> = incoming.iter().copied().collect();
            if distinct.len() != incoming.len()
                || incoming.len() != block_preds.len()
                || !block_preds.iter().all(|p| distinct.contains(p))
            {
                return Err(IrError::PhiIncomingMismatch {
                    phi: cx[func.insts[phi].name].to_string(),
                    block: block_name(block),
                });
            }
        }
    }

    // Reachability: the analyses assume every block hangs off the entry.
    let mut reachable = FxHashSet::default();
    let mut stack = vec![func.entry];
    reachable.insert(func.entry);
    while let Some(block) = stack.pop() {
        for &succ in func.successors(block) {
            if reachable.insert(succ) {
                stack.push(succ);
            }
        }
    }
    for &block in &func.block_order {
        if !reachable.contains(&block) {
            return Err(IrError::UnreachableBlock(block_name(block)));
        }
    }

    Ok(())
}
