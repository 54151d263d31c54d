//! Small assembler used by tests, benches and `kombi asm`.
//!
//! Syntax mirrors the disassembler output, plus labels:
//!
//! ```text
//! ; `.a` applied to `i`, then halt
//!         APP   .a, i
//!         APP   e, acc
//! thunk:  DEL   after          ; jump over the inline body
//!         APP   .b, i
//! after:  LC<print> "done\n"
//! ```
//!
//! - Operands: `acc`, `k s i v c d e @ |`, `.x` / `?x` with `x` a glyph,
//!   `<SP>`, `<LF>` or `<0xNN>`.
//! - Offsets (`SA`, `DEL`, `LC`): a label, a decimal or a `0x` number.
//! - `LC<print>` also takes a string literal, stored NUL-terminated in `.rodata`.
//! - Lines beginning with `;` are comments.

use std::collections::HashMap;

use crate::{
    bytecode::{
        format::{FileHeader, ProgramHeader},
        model::{tag, ExOpcode, Instruction, Opcode, Operand, Token},
    },
    ByteWriter, CoreError, CoreResult, INSTRUCTION_SIZE, PROG_HEADER_SIZE,
};

/* ─────────────────────────── Builder ─────────────────────────── */

/// Incremental image builder. Offsets it hands out are `.text` indices,
/// not counting the bootstrap prefix the loader adds.
#[derive(Debug, Clone)]
pub struct ProgramBuilder {
    prefix: Vec<u8>,
    file: FileHeader,
    extension: Vec<u8>,
    text: Vec<Instruction>,
    rodata: Vec<u8>,
}

impl Default for ProgramBuilder {
    fn default() -> Self { Self::new() }
}

impl ProgramBuilder {
    /// Empty program with the current header.
    pub fn new() -> Self {
        Self {
            prefix: Vec::new(),
            file: FileHeader::CURRENT,
            extension: Vec::new(),
            text: Vec::new(),
            rodata: Vec::new(),
        }
    }

    /// Bytes written before the magic byte (e.g. `#!/usr/bin/env kombi\n`).
    pub fn prefix(mut self, bytes: &[u8]) -> Self {
        self.prefix = bytes.to_vec();
        self
    }

    /// Overrides the written version.
    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.file.major = major;
        self.file.minor = minor;
        self
    }

    /// Appends extension bytes to the program header.
    pub fn header_extension(mut self, bytes: &[u8]) -> CoreResult<Self> {
        let size = PROG_HEADER_SIZE + bytes.len();
        self.file.prog_header_size = u8::try_from(size)
            .map_err(|_| CoreError::InvalidLength { section: "program header".into(), len: size as u64 })?;
        self.extension = bytes.to_vec();
        Ok(self)
    }

    /// Index the next pushed instruction will get.
    pub fn here(&self) -> u32 { self.text.len() as u32 }

    /// Appends an instruction and returns its index.
    pub fn push(&mut self, ins: Instruction) -> u32 {
        let at = self.here();
        self.text.push(ins);
        at
    }

    /// Appends a NUL-terminated string to `.rodata` and returns its offset.
    pub fn string(&mut self, s: &[u8]) -> u32 {
        let at = self.rodata.len() as u32;
        self.rodata.extend_from_slice(s);
        self.rodata.push(0);
        at
    }

    /// Rewrites the offset operand of instruction `at`.
    pub fn patch(&mut self, at: u32, target: u32) -> CoreResult<()> {
        let ins = self
            .text
            .get_mut(at as usize)
            .ok_or_else(|| CoreError::corrupted(format!("no instruction at {at}")))?;
        match ins.operand {
            Operand::Offset(_) => {
                ins.operand = Operand::Offset(target);
                Ok(())
            }
            Operand::Pair(..) => Err(CoreError::corrupted(format!("instruction {at} has no offset operand"))),
        }
    }

    /// Instructions pushed so far.
    pub fn text(&self) -> &[Instruction] { &self.text }

    /// `.rodata` built so far.
    pub fn rodata(&self) -> &[u8] { &self.rodata }

    /// Serializes the image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_bytes(&self.prefix);
        self.file.write(&mut w);
        ProgramHeader {
            text_size: (self.text.len() * INSTRUCTION_SIZE) as u32,
            rodata_size: self.rodata.len() as u32,
        }
        .write(&mut w);
        w.write_bytes(&self.extension);
        for ins in &self.text {
            w.write_bytes(&ins.encode());
        }
        w.write_bytes(&self.rodata);
        w.into_vec()
    }
}

/* ─────────────────────────── Assembler ─────────────────────────── */

/// Assembles a source listing into a [`ProgramBuilder`].
pub fn assemble(source: &str) -> CoreResult<ProgramBuilder> {
    let mut b = ProgramBuilder::new();
    let mut labels: HashMap<&str, u32> = HashMap::new();
    let mut fixups: Vec<(u32, &str, u32)> = Vec::new();

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = (idx + 1) as u32;
        let mut line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if let Some((label, rest)) = split_label(line) {
            if labels.insert(label, b.here()).is_some() {
                return Err(CoreError::syntax(line_no, format!("label `{label}` defined twice")));
            }
            line = rest.trim_start();
            if line.is_empty() {
                continue;
            }
        }

        let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let (name, ex) = match head.split_once('<') {
            Some((name, ex)) => {
                let ex = ex.strip_suffix('>').ok_or_else(|| CoreError::syntax(line_no, "unterminated `<`"))?;
                (name, Some(ex))
            }
            None => (head, None),
        };
        let op = Opcode::from_mnemonic(name)
            .ok_or_else(|| CoreError::syntax(line_no, format!("unknown instruction `{head}`")))?;

        match op {
            Opcode::Apply => {
                let (first, after) = parse_token(rest).ok_or_else(|| CoreError::syntax(line_no, "bad first operand"))?;
                let after = after.trim_start().strip_prefix(',').ok_or_else(|| CoreError::syntax(line_no, "expected `,`"))?;
                let (second, tail) = parse_token(after.trim_start()).ok_or_else(|| CoreError::syntax(line_no, "bad second operand"))?;
                if !tail.trim().is_empty() {
                    return Err(CoreError::syntax(line_no, format!("trailing input `{}`", tail.trim())));
                }
                if first.is_acc() && second.is_acc() {
                    return Err(CoreError::syntax(line_no, "APP needs at least one literal operand"));
                }
                b.push(Instruction::apply(first, second));
            }
            Opcode::PopApply | Opcode::Exchange => {
                if !rest.is_empty() {
                    return Err(CoreError::syntax(line_no, format!("{} takes no operand", op.mnemonic())));
                }
                b.push(if op == Opcode::PopApply { Instruction::pop_apply() } else { Instruction::exchange() });
            }
            Opcode::Save | Opcode::Delay => {
                let at = b.push(if op == Opcode::Save { Instruction::save(0) } else { Instruction::delay(0) });
                match parse_number(rest) {
                    Some(n) => b.patch(at, n)?,
                    None if is_label(rest) => fixups.push((at, rest, line_no)),
                    None => return Err(CoreError::syntax(line_no, format!("bad offset `{rest}`"))),
                }
            }
            Opcode::LoadConst => {
                let ex = ex.ok_or_else(|| CoreError::syntax(line_no, "LC needs a sub-operation, e.g. `LC<print>`"))?;
                if ExOpcode::Print.mnemonic() != ex {
                    return Err(CoreError::syntax(line_no, format!("unknown sub-operation `{ex}`")));
                }
                let offset = if rest.starts_with('"') {
                    let bytes = parse_string_literal(rest).map_err(|msg| CoreError::syntax(line_no, msg))?;
                    b.string(&bytes)
                } else {
                    parse_number(rest).ok_or_else(|| CoreError::syntax(line_no, format!("bad constant `{rest}`")))?
                };
                b.push(Instruction::print(offset));
            }
        }
    }

    for (at, label, line_no) in fixups {
        let target = *labels
            .get(label)
            .ok_or_else(|| CoreError::syntax(line_no, format!("undefined label `{label}`")))?;
        b.patch(at, target)?;
    }
    Ok(b)
}

fn strip_comment(line: &str) -> &str {
    // `;` inside a string literal or as a `.;`/`?;` character is not a comment.
    let bytes = line.as_bytes();
    let mut in_str = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_str => i += 1,
            b'"' => in_str = !in_str,
            b'.' | b'?' if !in_str => i += 1,
            b';' if !in_str => return &line[..i],
            _ => {}
        }
        i += 1;
    }
    line
}

fn split_label(line: &str) -> Option<(&str, &str)> {
    let (label, rest) = line.split_once(':')?;
    is_label(label).then_some((label, rest))
}

fn is_label(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_number(s: &str) -> Option<u32> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_token(s: &str) -> Option<(Token, &str)> {
    let first = s.chars().next()?;
    if first == '.' || first == '?' {
        let (ch, rest) = parse_char(&s[1..])?;
        let t = if first == '.' { Token::out(ch) } else { Token::cmp(ch) };
        return Some((t, rest));
    }
    let end = s.find(|c: char| c == ',' || c.is_whitespace()).unwrap_or(s.len());
    let t = match &s[..end] {
        "acc" => tag::ACC,
        "k" => tag::K,
        "s" => tag::S,
        "i" => tag::I,
        "v" => tag::V,
        "c" => tag::C,
        "d" => tag::D,
        "e" => tag::E,
        "@" => tag::READ,
        "|" => tag::PIPE,
        _ => return None,
    };
    Some((Token::builtin(t), &s[end..]))
}

fn parse_char(s: &str) -> Option<(u8, &str)> {
    if let Some(inner) = s.strip_prefix('<') {
        if let Some(close) = inner.find('>') {
            let name = &inner[..close];
            let ch = match name {
                "SP" => Some(b' '),
                "LF" => Some(b'\n'),
                _ => name.strip_prefix("0x").and_then(|h| u8::from_str_radix(h, 16).ok()),
            };
            if let Some(ch) = ch {
                return Some((ch, &inner[close + 1..]));
            }
        }
    }
    let c = s.chars().next()?;
    if !c.is_ascii() {
        return None;
    }
    Some((c as u8, &s[1..]))
}

fn parse_string_literal(input: &str) -> Result<Vec<u8>, &'static str> {
    let bytes = input.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'"' || bytes[bytes.len() - 1] != b'"' {
        return Err("string literal expected");
    }

    let mut out = Vec::new();
    let mut escaping = false;
    for &b in &bytes[1..bytes.len() - 1] {
        if escaping {
            out.push(match b {
                b'n' => b'\n',
                b't' => b'\t',
                other => other,
            });
            escaping = false;
            continue;
        }
        match b {
            b'\\' => escaping = true,
            0 => return Err("NUL inside string literal"),
            _ => out.push(b),
        }
    }

    if escaping {
        return Err("incomplete escape sequence");
    }
    Ok(out)
}

/* ─────────────────────────── Tests ─────────────────────────── */
