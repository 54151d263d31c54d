//! Function values as the interpreter sees them.
//!
//! Each variant carries exactly its payload: nothing, a literal character,
//! a pool handle, an instruction address or a `.rodata` offset.

use std::fmt;

use kombi_core::bytecode::model::{char_mnemonic, tag, tag_mnemonic, Token};

/// Instruction address, bootstrap prefix included.
pub type Addr = u32;

/// Index of a live pool element, stamped with the pool epoch it was
/// allocated in. A handle from before a [`crate::Pool::clear`] never
/// resolves again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle {
    pub(crate) index: u32,
    pub(crate) epoch: u32,
}

impl Handle {
    pub(crate) const fn new(index: u32, epoch: u32) -> Self { Self { index, epoch } }

    /// Slot index.
    pub const fn index(self) -> u32 { self.index }

    /// Pool epoch at allocation.
    pub const fn epoch(self) -> u32 { self.epoch }
}

/// A tagged function value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Value {
    /// No value; also the result of a failed run.
    #[default]
    Empty,
    /// `k`
    K,
    /// `s`
    S,
    /// `i`
    I,
    /// `v`
    V,
    /// `c`
    C,
    /// `d`
    D,
    /// `e`
    E,
    /// `@`
    Read,
    /// `|`
    Pipe,
    /// `.x`
    Out(u8),
    /// `?x`
    Cmp(u8),
    /// `` `k x ``
    K1(Handle),
    /// `` `s x ``
    S1(Handle),
    /// ``` ``s x y ```
    S2(Handle),
    /// Continuation.
    C1(Handle),
    /// `d` applied to an evaluated value.
    D1Value(Handle),
    /// `d` applied to a suspended application.
    D1App(Handle),
    /// `d` applied to an inline body starting at the address.
    D1Code(Addr),
    /// Return to the instruction after the address.
    Jump(Addr),
    /// Finish forcing a promise applied at the address.
    Finalize(Addr),
    /// Print the NUL-terminated constant at the `.rodata` offset.
    Print(u32),
}

impl Value {
    /// Builtin value of a literal operand. `None` for the accumulator
    /// placeholder, internal tags and unknown tags.
    pub const fn from_token(t: Token) -> Option<Self> {
        Some(match t.tag {
            tag::K => Value::K,
            tag::S => Value::S,
            tag::I => Value::I,
            tag::V => Value::V,
            tag::C => Value::C,
            tag::D => Value::D,
            tag::E => Value::E,
            tag::READ => Value::Read,
            tag::PIPE => Value::Pipe,
            tag::OUT => Value::Out(t.ch),
            tag::CMP => Value::Cmp(t.ch),
            _ => return None,
        })
    }

    /// Raw tag, as used in the bytecode and in error reports.
    pub const fn tag(self) -> u8 {
        match self {
            Value::Empty => tag::ACC,
            Value::K => tag::K,
            Value::S => tag::S,
            Value::I => tag::I,
            Value::V => tag::V,
            Value::C => tag::C,
            Value::D => tag::D,
            Value::E => tag::E,
            Value::Read => tag::READ,
            Value::Pipe => tag::PIPE,
            Value::Out(_) => tag::OUT,
            Value::Cmp(_) => tag::CMP,
            Value::K1(_) => tag::K1,
            Value::S1(_) => tag::S1,
            Value::S2(_) => tag::S2,
            Value::C1(_) => tag::C1,
            Value::D1Value(_) => tag::D1_VALUE,
            Value::D1App(_) => tag::D1_APP,
            Value::D1Code(_) => tag::D1_CODE,
            Value::Jump(_) => tag::JUMP,
            Value::Finalize(_) => tag::FINALIZE,
            Value::Print(_) => tag::PRINT,
        }
    }

    /// Pool handle owned by this value, if any.
    pub const fn handle(self) -> Option<Handle> {
        match self {
            Value::K1(h) | Value::S1(h) | Value::S2(h) | Value::C1(h) | Value::D1Value(h) | Value::D1App(h) => Some(h),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = tag_mnemonic(self.tag()).unwrap_or("?");
        match *self {
            Value::Empty => f.write_str("<empty>"),
            Value::Out(ch) | Value::Cmp(ch) => write!(f, "{name}{}", char_mnemonic(ch)),
            Value::D1Code(a) | Value::Jump(a) | Value::Finalize(a) => write!(f, "{name}@0x{a:08x}"),
            Value::Print(off) => write!(f, "{name}+0x{off:x}"),
            v => match v.handle() {
                Some(h) => write!(f, "{name}#{}", h.index()),
                None => f.write_str(name),
            },
        }
    }
}
