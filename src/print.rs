//! Plain-text listings of functions and analysis results.
//!
//! All output iterates blocks in [`FuncDef::block_order`] and instructions in
//! block order, so a given function and analysis state always print the same
//! bytes.

use crate::{
    divergence::DivergenceAnalysis, ConstDef, Context, FuncDef, Inst, InstKind, TerminatorKind,
    Value,
};
use itertools::Itertools;

pub fn value_to_string(cx: &Context, func: &FuncDef, v: Value) -> String {
    match v {
        Value::Const(c) => match cx[c] {
            ConstDef::Bool(b) => b.to_string(),
            ConstDef::Int(i) => i.to_string(),
            ConstDef::Undef => "undef".to_string(),
        },
        Value::Param(i) => format!("%{}", &cx[func.params[i as usize]]),
        Value::Inst(inst) => format!("%{}", &cx[func.insts[inst].name]),
    }
}

pub fn inst_to_string(cx: &Context, func: &FuncDef, inst: Inst) -> String {
    let def = &func.insts[inst];
    let value = |v| value_to_string(cx, func, v);
    let label = |b| cx[func.blocks[b].name].to_string();
    match def.kind {
        InstKind::Phi => {
            let incoming = def
                .inputs
                .iter()
                .zip(&def.blocks)
                .map(|(&v, &b)| format!("[ {}, {} ]", value(v), label(b)))
                .join(", ");
            format!("%{} = phi {incoming}", &cx[def.name])
        }
        InstKind::Op(opcode) => {
            let operands = def.inputs.iter().map(|&v| value(v)).join(", ");
            if operands.is_empty() {
                format!("%{} = {}", &cx[def.name], &cx[opcode])
            } else {
                format!("%{} = {} {operands}", &cx[def.name], &cx[opcode])
            }
        }
        InstKind::Term(kind) => {
            let targets = def.blocks.iter().map(|&b| label(b)).join(", ");
            match kind {
                TerminatorKind::CondBr => {
                    format!("cond_br {}, {targets}", value(def.inputs[0]))
                }
                TerminatorKind::Switch => {
                    format!("switch {}, [{targets}]", value(def.inputs[0]))
                }
                TerminatorKind::Br => format!("br {targets}"),
                TerminatorKind::Ret => "ret".to_string(),
                TerminatorKind::Unwind => {
                    let operands = def.inputs.iter().map(|&v| value(v)).join(", ");
                    format!("%{} = unwind {operands} to [{targets}]", &cx[def.name])
                }
            }
        }
    }
}

pub fn func_to_string(cx: &Context, func: &FuncDef) -> String {
    let params = func.params.iter().map(|&p| format!("%{}", &cx[p])).join(", ");
    let mut out = format!("func @{}({params}) {{\n", &cx[func.name]);
    for &block in &func.block_order {
        out.push_str(&format!("{}:\n", &cx[func.blocks[block].name]));
        for &inst in &func.blocks[block].insts {
            out.push_str(&format!("  {}\n", inst_to_string(cx, func, inst)));
        }
    }
    out.push_str("}\n");
    out
}

/// One `DIVERGENT:` line per divergent instruction, in program order.
pub fn divergence_dump(da: &DivergenceAnalysis<'_>) -> String {
    let cx = da.cx();
    let func = da.func();
    let mut out = String::new();
    for &block in &func.block_order {
        for &inst in &func.blocks[block].insts {
            if da.is_divergent(Value::Inst(inst)) {
                out.push_str(&format!("DIVERGENT: {}\n", inst_to_string(cx, func, inst)));
            }
        }
    }
    out
}
