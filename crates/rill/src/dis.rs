//! Human-readable bytecode listings.
//!
//! [`disassemble`] renders a [`Proto`] and its nested prototypes the way
//! you'd want them in a compiler test or a bug report: one instruction per
//! line with its pc, source line and resolved jump targets.

use std::fmt::{self, Write};

use crate::bytecode::{Op, Proto};

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, args) = match self {
            Op::PushNil(n) => ("PUSHNIL", format!("{n}")),
            Op::Pop(n) => ("POP", format!("{n}")),
            Op::PushInt(i) => ("PUSHINT", format!("{i}")),
            Op::PushNum(k) => ("PUSHNUM", format!("{k}")),
            Op::PushString(k) => ("PUSHSTRING", format!("{k}")),
            Op::GetLocal(i) => ("GETLOCAL", format!("{i}")),
            Op::GetGlobal(k) => ("GETGLOBAL", format!("{k}")),
            Op::GetUpvalue(i) => ("PUSHUPVALUE", format!("{i}")),
            Op::GetTable => ("GETTABLE", String::new()),
            Op::GetDotted(k) => ("GETDOTTED", format!("{k}")),
            Op::PushSelf(k) => ("PUSHSELF", format!("{k}")),
            Op::SetLocal(i) => ("SETLOCAL", format!("{i}")),
            Op::SetGlobal(k) => ("SETGLOBAL", format!("{k}")),
            Op::SetTablePop => ("SETTABLEPOP", String::new()),
            Op::SetTable(n) => ("SETTABLE", format!("{n}")),
            Op::CreateTable(n) => ("CREATETABLE", format!("{n}")),
            Op::SetList { batch, table } => ("SETLIST", format!("{batch} {table}")),
            Op::SetMap { table } => ("SETMAP", format!("{table}")),
            Op::Add => ("ADD", String::new()),
            Op::Sub => ("SUB", String::new()),
            Op::Mul => ("MUL", String::new()),
            Op::Div => ("DIV", String::new()),
            Op::Pow => ("POW", String::new()),
            Op::Concat => ("CONCAT", String::new()),
            Op::Negate => ("MINUS", String::new()),
            Op::Not => ("NOT", String::new()),
            Op::Equal => ("EQ", String::new()),
            Op::NotEqual => ("NE", String::new()),
            Op::Less => ("LT", String::new()),
            Op::LessEq => ("LE", String::new()),
            Op::Greater => ("GT", String::new()),
            Op::GreaterEq => ("GE", String::new()),
            Op::Jump(o) => ("JMP", format!("{o}")),
            Op::JumpIfFalse(o) => ("JMPF", format!("{o}")),
            Op::JumpIfTrue(o) => ("JMPT", format!("{o}")),
            Op::JumpOnTrue(o) => ("JMPONT", format!("{o}")),
            Op::JumpOnFalse(o) => ("JMPONF", format!("{o}")),
            Op::ForPrep(o) => ("FORPREP", format!("{o}")),
            Op::ForLoop(o) => ("FORLOOP", format!("{o}")),
            Op::TForPrep(o) => ("TFORPREP", format!("{o}")),
            Op::TForLoop(o) => ("TFORLOOP", format!("{o}")),
            Op::Call { base, results } => ("CALL", format!("{base} {results}")),
            Op::Return(base) => ("RETURN", format!("{base}")),
            Op::Closure { proto, upvalues } => ("CLOSURE", format!("{proto} {upvalues}")),
        };
        if args.is_empty() {
            f.write_str(name)
        } else {
            write!(f, "{name:<12}{args}")
        }
    }
}

/// Render `proto` (and, recursively, its nested prototypes) as a listing.
pub fn disassemble(proto: &Proto) -> String {
    let mut out = String::new();
    write_proto(&mut out, proto, "main");
    out
}

fn write_proto(out: &mut String, proto: &Proto, name: &str) {
    let _ = writeln!(
        out,
        "{} <{}:{}> ({} instructions, {} locals, max stack {})",
        name,
        proto.source,
        proto.line_defined,
        proto.code.len(),
        proto.locvars.len(),
        proto.max_stack,
    );
    for (pc, op) in proto.code.iter().enumerate() {
        let line = proto.lines.get(pc).copied().unwrap_or(0);
        let _ = write!(out, "  {pc:>4}  [{line}]  {op}");
        if let Some(offset) = op.jump_offset() {
            let _ = write!(out, "  ; to {}", pc as i64 + 1 + i64::from(offset));
        }
        let _ = writeln!(out);
    }
    for (i, nested) in proto.protos.iter().enumerate() {
        let _ = writeln!(out);
        write_proto(out, nested, &format!("function[{i}]"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Op;

    #[test]
    fn listing_shows_instructions_and_jump_targets() {
        let mut proto = Proto::new("chunk".to_string(), 0);
        proto.code = vec![Op::PushInt(1), Op::JumpIfFalse(1), Op::Pop(1), Op::Return(0)];
        proto.lines = vec![1, 1, 2, 2, u32::MAX];
        let listing = disassemble(&proto);
        assert!(listing.contains("PUSHINT"));
        assert!(listing.contains("; to 3"), "jump target missing:\n{listing}");
        assert!(listing.contains("RETURN"));
        assert_eq!(listing.lines().count(), 1 + proto.code.len());
    }
}
