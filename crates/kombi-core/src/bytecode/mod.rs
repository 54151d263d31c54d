//! Bytecode helpers: instruction model, file headers, assembler, disassembler
//! and the `.rodata` hex dump.

/// Opcodes, combinator tags and the 8-byte instruction record.
pub mod model;
/// File and program headers.
pub mod format;
/// Text assembler and image builder.
pub mod asm;
/// Mnemonic listing of `.text`.
pub mod disasm;
/// Hex dump of `.rodata`.
pub mod dump;

pub use model::{ExOpcode, Instruction, OpFlags, Opcode, Operand, TagFlags, Token};
