//! Instruction model shared by the loader, the interpreter and the tooling.
//!
//! An instruction record is 8 bytes on disk:
//!
//! ```text
//! [opcode u8][opcode_ex u8][reserved u16][operand 4 bytes]
//! ```
//!
//! The operand is a big-endian `u32` when the opcode carries
//! [`OpFlags::OFFSET`], otherwise two `(tag, char)` literal tokens.

use std::fmt;

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};

use crate::{CoreError, CoreResult, INSTRUCTION_SIZE};

bitflags! {
    /// Flag bits carried by the opcode byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpFlags: u8 {
        /// `opcode_ex` selects a sub-operation.
        const EXTENDED = 0x80;
        /// The operand is a 32-bit offset.
        const OFFSET = 0x40;
    }
}

bitflags! {
    /// Flag bits carried by a combinator tag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TagFlags: u8 {
        /// The token embeds a literal character.
        const CHAR = 0x20;
        /// Internal variant carrying a handle, address or constant offset.
        const PAYLOAD = 0x40;
    }
}

/* ─────────────────────────── Opcodes ─────────────────────────── */

/// Primary opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// `APP`: apply two literal/accumulator operands.
    Apply,
    /// `LA`: pop a function and apply it to the accumulator.
    PopApply,
    /// `SA`: push the accumulator (delays when it holds `d`).
    Save,
    /// `XCH`: swap the accumulator with the slot beneath the stack top.
    Exchange,
    /// `DEL`: skip an inline delayed body, leaving a thunk in the accumulator.
    Delay,
    /// `LC`: load a constant, sub-operation in `opcode_ex`.
    LoadConst,
}

impl Opcode {
    /// Every opcode, in encoding order.
    pub const ALL: [Opcode; 6] = [
        Opcode::Apply,
        Opcode::PopApply,
        Opcode::Save,
        Opcode::Exchange,
        Opcode::Delay,
        Opcode::LoadConst,
    ];

    /// Encoded byte, flags included.
    pub const fn byte(self) -> u8 {
        match self {
            Opcode::Apply => 0x01,
            Opcode::PopApply => 0x02,
            Opcode::Save => 0x03 | OpFlags::OFFSET.bits(),
            Opcode::Exchange => 0x04,
            Opcode::Delay => 0x05 | OpFlags::OFFSET.bits(),
            Opcode::LoadConst => 0x06 | OpFlags::EXTENDED.bits() | OpFlags::OFFSET.bits(),
        }
    }

    /// Decodes an opcode byte.
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Opcode::Apply),
            0x02 => Some(Opcode::PopApply),
            0x43 => Some(Opcode::Save),
            0x04 => Some(Opcode::Exchange),
            0x45 => Some(Opcode::Delay),
            0xC6 => Some(Opcode::LoadConst),
            _ => None,
        }
    }

    /// Assembly mnemonic.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Apply => "APP",
            Opcode::PopApply => "LA",
            Opcode::Save => "SA",
            Opcode::Exchange => "XCH",
            Opcode::Delay => "DEL",
            Opcode::LoadConst => "LC",
        }
    }

    /// Parses a mnemonic (case-insensitive).
    pub fn from_mnemonic(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.mnemonic().eq_ignore_ascii_case(s))
    }

    /// Flag bits of the encoded byte.
    pub const fn flags(self) -> OpFlags { OpFlags::from_bits_truncate(self.byte()) }
}

/// Extended opcodes (sub-operations of `LC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExOpcode {
    /// Load a `~p` constant-string printer.
    Print,
}

impl ExOpcode {
    /// Encoded byte.
    pub const fn byte(self) -> u8 {
        match self {
            ExOpcode::Print => 0x01,
        }
    }

    /// Decodes an extended opcode byte.
    pub const fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(ExOpcode::Print),
            _ => None,
        }
    }

    /// Assembly mnemonic.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            ExOpcode::Print => "print",
        }
    }
}

/* ─────────────────────────── Combinator tags ─────────────────────────── */

/// Raw combinator tags, as stored in operands and shown by the disassembler.
pub mod tag {
    /// Operand placeholder: take the accumulator.
    pub const ACC: u8 = 0x00;
    /// `k`
    pub const K: u8 = 0x01;
    /// `s`
    pub const S: u8 = 0x02;
    /// `i`
    pub const I: u8 = 0x03;
    /// `v`
    pub const V: u8 = 0x04;
    /// `c`
    pub const C: u8 = 0x05;
    /// `d`
    pub const D: u8 = 0x06;
    /// `e`
    pub const E: u8 = 0x07;
    /// `@`
    pub const READ: u8 = 0x08;
    /// `|`
    pub const PIPE: u8 = 0x09;
    /// `.x`
    pub const OUT: u8 = 0x21;
    /// `?x`
    pub const CMP: u8 = 0x22;
    /// `` `k ``
    pub const K1: u8 = 0x41;
    /// `` `s ``
    pub const S1: u8 = 0x42;
    /// ``` ``s ```
    pub const S2: u8 = 0x43;
    /// `` `c `` (continuation)
    pub const C1: u8 = 0x44;
    /// `` `d `` applied to an evaluated value
    pub const D1_VALUE: u8 = 0x45;
    /// `` `d `` applied to a suspended application
    pub const D1_APP: u8 = 0x46;
    /// `` `d `` applied to an inline body
    pub const D1_CODE: u8 = 0x47;
    /// `~j`
    pub const JUMP: u8 = 0x48;
    /// `~f`
    pub const FINALIZE: u8 = 0x49;
    /// `~p`
    pub const PRINT: u8 = 0x4A;
}

/// Mnemonic of a combinator tag, `None` for unknown tags.
pub const fn tag_mnemonic(t: u8) -> Option<&'static str> {
    Some(match t {
        tag::ACC => "acc",
        tag::K => "k",
        tag::S => "s",
        tag::I => "i",
        tag::V => "v",
        tag::C => "c",
        tag::D => "d",
        tag::E => "e",
        tag::READ => "@",
        tag::PIPE => "|",
        tag::OUT => ".",
        tag::CMP => "?",
        tag::K1 => "`k",
        tag::S1 => "`s",
        tag::S2 => "``s",
        tag::C1 => "`c",
        tag::D1_VALUE | tag::D1_APP | tag::D1_CODE => "`d",
        tag::JUMP => "~j",
        tag::FINALIZE => "~f",
        tag::PRINT => "~p",
        _ => return None,
    })
}

/// Printable form of a literal character: `<SP>`, `<LF>`, the glyph, or `<0xNN>`.
pub fn char_mnemonic(ch: u8) -> String {
    match ch {
        b' ' => "<SP>".to_owned(),
        b'\n' => "<LF>".to_owned(),
        33..=126 => char::from(ch).to_string(),
        _ => format!("<0x{ch:02x}>"),
    }
}

/* ─────────────────────────── Tokens ─────────────────────────── */

/// One literal application operand: a combinator tag plus its character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token {
    /// Combinator tag (see [`tag`]).
    pub tag: u8,
    /// Literal character, meaningful for [`TagFlags::CHAR`] tags.
    pub ch: u8,
}

impl Token {
    /// The accumulator placeholder.
    pub const ACC: Self = Token { tag: tag::ACC, ch: 0 };

    /// Builds a token.
    pub const fn new(tag: u8, ch: u8) -> Self { Self { tag, ch } }
    /// Token for a character-less builtin.
    pub const fn builtin(tag: u8) -> Self { Self { tag, ch: 0 } }
    /// `.ch`
    pub const fn out(ch: u8) -> Self { Self { tag: tag::OUT, ch } }
    /// `?ch`
    pub const fn cmp(ch: u8) -> Self { Self { tag: tag::CMP, ch } }

    /// True for the accumulator placeholder.
    pub const fn is_acc(self) -> bool { self.tag == tag::ACC }
    /// True when the tag embeds a character.
    pub const fn is_char(self) -> bool { TagFlags::from_bits_truncate(self.tag).contains(TagFlags::CHAR) }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match tag_mnemonic(self.tag) {
            Some(name) if self.is_char() => write!(f, "{name}{}", char_mnemonic(self.ch)),
            Some(name) => f.write_str(name),
            None => write!(f, "<fn 0x{:02x}>", self.tag),
        }
    }
}

/* ─────────────────────────── Instructions ─────────────────────────── */

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Jump target or constant offset (host order once decoded).
    Offset(u32),
    /// Two application operands.
    Pair(Token, Token),
}

/// One decoded instruction record. Opcode bytes are kept raw so that the
/// interpreter, not the loader, decides what an unknown opcode means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    /// Opcode byte, flags included.
    pub op: u8,
    /// Extended opcode byte.
    pub op_ex: u8,
    /// Operand.
    pub operand: Operand,
}

impl Instruction {
    const fn plain(op: Opcode) -> Self {
        Self { op: op.byte(), op_ex: 0, operand: Operand::Pair(Token::ACC, Token::ACC) }
    }

    /// `APP first, second`
    pub const fn apply(first: Token, second: Token) -> Self {
        Self { op: Opcode::Apply.byte(), op_ex: 0, operand: Operand::Pair(first, second) }
    }
    /// `LA`
    pub const fn pop_apply() -> Self { Self::plain(Opcode::PopApply) }
    /// `SA offset`
    pub const fn save(offset: u32) -> Self {
        Self { op: Opcode::Save.byte(), op_ex: 0, operand: Operand::Offset(offset) }
    }
    /// `XCH`
    pub const fn exchange() -> Self { Self::plain(Opcode::Exchange) }
    /// `DEL offset`
    pub const fn delay(offset: u32) -> Self {
        Self { op: Opcode::Delay.byte(), op_ex: 0, operand: Operand::Offset(offset) }
    }
    /// `LC<print> offset`
    pub const fn print(offset: u32) -> Self {
        Self { op: Opcode::LoadConst.byte(), op_ex: ExOpcode::Print.byte(), operand: Operand::Offset(offset) }
    }

    /// Known opcode, if any.
    pub const fn opcode(&self) -> Option<Opcode> { Opcode::from_byte(self.op) }
    /// Flag bits of the opcode byte.
    pub const fn flags(&self) -> OpFlags { OpFlags::from_bits_truncate(self.op) }
    /// Known extended opcode, only meaningful with [`OpFlags::EXTENDED`].
    pub const fn ex_opcode(&self) -> Option<ExOpcode> {
        if self.flags().contains(OpFlags::EXTENDED) { ExOpcode::from_byte(self.op_ex) } else { None }
    }
    /// Offset operand, if any.
    pub const fn offset(&self) -> Option<u32> {
        match self.operand {
            Operand::Offset(off) => Some(off),
            Operand::Pair(..) => None,
        }
    }

    /// Encodes the 8-byte record.
    pub fn encode(&self) -> [u8; INSTRUCTION_SIZE] {
        let mut raw = [0u8; INSTRUCTION_SIZE];
        raw[0] = self.op;
        raw[1] = self.op_ex;
        match self.operand {
            Operand::Offset(off) => BigEndian::write_u32(&mut raw[4..], off),
            Operand::Pair(a, b) => raw[4..].copy_from_slice(&[a.tag, a.ch, b.tag, b.ch]),
        }
        raw
    }

    /// Decodes an 8-byte record. The operand shape follows [`OpFlags::OFFSET`].
    pub fn decode(raw: &[u8]) -> CoreResult<Self> {
        if raw.len() != INSTRUCTION_SIZE {
            return Err(CoreError::InvalidLength { section: "instruction".into(), len: raw.len() as u64 });
        }
        let operand = if OpFlags::from_bits_truncate(raw[0]).contains(OpFlags::OFFSET) {
            Operand::Offset(BigEndian::read_u32(&raw[4..]))
        } else {
            Operand::Pair(Token::new(raw[4], raw[5]), Token::new(raw[6], raw[7]))
        };
        Ok(Self { op: raw[0], op_ex: raw[1], operand })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(op) = self.opcode() else {
            return write!(f, "{:<10} 0x{:02x}", ".byte", self.op);
        };
        let head = if op.flags().contains(OpFlags::EXTENDED) {
            match ExOpcode::from_byte(self.op_ex) {
                Some(ex) => format!("{}<{}>", op.mnemonic(), ex.mnemonic()),
                None => format!("{}<0x{:02x}>", op.mnemonic(), self.op_ex),
            }
        } else {
            op.mnemonic().to_owned()
        };
        match (op, self.operand) {
            (_, Operand::Offset(off)) => write!(f, "{head:<10} 0x{off:08x}"),
            (Opcode::Apply, Operand::Pair(a, b)) => write!(f, "{head:<10} {a}, {b}"),
            _ => f.write_str(&head),
        }
    }
}

/* ─────────────────────────── Tests ─────────────────────────── */
