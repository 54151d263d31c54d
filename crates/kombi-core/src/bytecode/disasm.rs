//! Mnemonic listing of `.text`, one instruction per line.

use std::fmt::Write;

use crate::bytecode::model::Instruction;

/// Renders the whole `.text` section under a `.text` heading.
///
/// Addresses are `.text` indices, the same numbering `SA`/`DEL` offsets use.
pub fn disassemble(text: &[Instruction]) -> String {
    let mut out = String::from(".text\n");
    for (idx, ins) in text.iter().enumerate() {
        let _ = writeln!(out, "{}", line(idx as u32, ins));
    }
    out.push('\n');
    out
}

/// One listing line: `{addr:08x}:  {mnemonic}`.
pub fn line(addr: u32, ins: &Instruction) -> String {
    format!("{addr:08x}:  {ins}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::model::{tag, Token};
    use pretty_assertions::assert_eq;

    #[test]
    fn listing() {
        let text = [
            Instruction::apply(Token::out(b'a'), Token::builtin(tag::I)),
            Instruction::delay(3),
            Instruction::pop_apply(),
        ];
        assert_eq!(
            disassemble(&text),
            ".text\n\
             00000000:  APP        .a, i\n\
             00000001:  DEL        0x00000003\n\
             00000002:  LA\n\
             \n"
        );
    }

    #[test]
    fn empty_listing() {
        assert_eq!(disassemble(&[]), ".text\n\n");
    }
}
