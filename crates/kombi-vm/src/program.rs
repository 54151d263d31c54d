//! Loaded program images.
//!
//! Loading checks the headers, copies `.rodata`, decodes every `.text`
//! record and prepends the bootstrap sequence `LA, XCH, LA, LA, LA`, which
//! the interpreter jumps into (addresses 0 and 3) to finish applications.

use std::fs;
use std::path::Path;

use kombi_core::bytecode::disasm;
use kombi_core::bytecode::format::{FileHeader, ImageInfo, ProgramHeader};
use kombi_core::bytecode::model::Instruction;
use kombi_core::{ByteReader, CoreError, BOOTSTRAP_LEN, INSTRUCTION_SIZE};

use crate::error::{LoadError, LoadResult, VmError, VmResult};
use crate::value::Addr;

const BOOTSTRAP: [Instruction; BOOTSTRAP_LEN as usize] = [
    Instruction::pop_apply(),
    Instruction::exchange(),
    Instruction::pop_apply(),
    Instruction::pop_apply(),
    Instruction::pop_apply(),
];

/// An immutable, validated program.
#[derive(Debug, Clone)]
pub struct Program {
    file_name: String,
    header: FileHeader,
    sizes: ProgramHeader,
    code: Vec<Instruction>,
    rodata: Vec<u8>,
}

impl Program {
    /// Parses an image. `relaxed` tolerates a version mismatch as long as the
    /// program header has no extension.
    pub fn load(bytes: &[u8], file_name: &str, relaxed: bool) -> LoadResult<Self> {
        let malformed = |e: CoreError| LoadError::Malformed { file: file_name.to_owned(), reason: e.to_string() };
        let mut r = ByteReader::new(bytes);

        let header = FileHeader::locate(&mut r).map_err(malformed)?;
        if !header.is_current_version() {
            if !(relaxed && header.has_plain_program_header()) {
                return Err(LoadError::UnsupportedVersion {
                    file: file_name.to_owned(),
                    major: header.major,
                    minor: header.minor,
                });
            }
            #[cfg(feature = "tracing")]
            tracing::warn!(file = file_name, major = header.major, minor = header.minor, "forcing execution of foreign bytecode");
        }

        let sizes = ProgramHeader::read(&mut r, header.prog_header_size).map_err(malformed)?;
        let count = sizes.instruction_count().map_err(malformed)? as usize;
        let text = r.read_bytes(sizes.text_size as usize).map_err(malformed)?;
        let data = r.read_bytes(sizes.rodata_size as usize).map_err(malformed)?;

        let mut code = Vec::new();
        code.try_reserve_exact(count + BOOTSTRAP.len())
            .map_err(|_| LoadError::Alloc { bytes: (count + BOOTSTRAP.len()) * INSTRUCTION_SIZE })?;
        code.extend_from_slice(&BOOTSTRAP);
        for raw in text.chunks_exact(INSTRUCTION_SIZE) {
            code.push(Instruction::decode(raw).map_err(malformed)?);
        }

        let mut rodata = Vec::new();
        rodata.try_reserve_exact(data.len()).map_err(|_| LoadError::Alloc { bytes: data.len() })?;
        rodata.extend_from_slice(data);

        #[cfg(feature = "tracing")]
        tracing::debug!(file = file_name, instructions = count, rodata = rodata.len(), "program loaded");

        Ok(Self { file_name: file_name.to_owned(), header, sizes, code, rodata })
    }

    /// Reads and loads a file.
    pub fn from_path(path: impl AsRef<Path>, relaxed: bool) -> LoadResult<Self> {
        let path = path.as_ref();
        let file = path.display().to_string();
        let bytes = fs::read(path).map_err(|source| LoadError::Io { file: file.clone(), source })?;
        Self::load(&bytes, &file, relaxed)
    }

    /// Headers only, as shown by `kombi info`.
    pub fn inspect(bytes: &[u8], file_name: &str) -> LoadResult<ImageInfo> {
        ImageInfo::read(bytes).map_err(|e| LoadError::Malformed { file: file_name.to_owned(), reason: e.to_string() })
    }

    /// Name used in diagnostics.
    pub fn file_name(&self) -> &str { &self.file_name }

    /// File header as read.
    pub const fn header(&self) -> FileHeader { self.header }

    /// Section sizes as read.
    pub const fn sizes(&self) -> ProgramHeader { self.sizes }

    /// Executable code, bootstrap included. Indices are interpreter addresses.
    pub fn code(&self) -> &[Instruction] { &self.code }

    /// The loaded `.text`, without the bootstrap.
    pub fn text(&self) -> &[Instruction] { &self.code[BOOTSTRAP.len()..] }

    /// The loaded `.rodata`.
    pub fn rodata(&self) -> &[u8] { &self.rodata }

    /// Instruction at an interpreter address.
    pub fn fetch(&self, ip: Addr) -> VmResult<Instruction> {
        self.code
            .get(ip as usize)
            .copied()
            .ok_or(VmError::InvalidAddress { section: ".text", addr: ip })
    }

    /// Disassembly of the instruction at an interpreter address, numbered
    /// like the `.text` listing. Bootstrap addresses are shown as `boot+N`.
    pub fn listing_line(&self, ip: Addr) -> String {
        match (self.fetch(ip), ip.checked_sub(BOOTSTRAP_LEN)) {
            (Ok(ins), Some(index)) => disasm::line(index, &ins),
            (Ok(ins), None) => format!("boot+{ip}:  {ins}"),
            (Err(_), Some(index)) => format!("{index:08x}:  <past end of .text>"),
            (Err(_), None) => format!("boot+{ip}:  <missing>"),
        }
    }

    /// Constant string at a `.rodata` offset, up to its NUL (or the end of the section).
    pub fn constant(&self, offset: u32) -> VmResult<&[u8]> {
        let tail = self
            .rodata
            .get(offset as usize..)
            .filter(|t| !t.is_empty())
            .ok_or(VmError::InvalidAddress { section: ".rodata", addr: offset })?;
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(&tail[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kombi_core::asm::ProgramBuilder;
    use kombi_core::bytecode::model::{tag, Token};
    use kombi_core::MAGIC;
    use pretty_assertions::assert_eq;

    fn sample() -> ProgramBuilder {
        let mut b = ProgramBuilder::new();
        let off = b.string(b"hi");
        b.push(Instruction::print(off));
        b.push(Instruction::apply(Token::builtin(tag::E), Token::ACC));
        b
    }

    #[test]
    fn bootstrap_precedes_text() -> LoadResult<()> {
        let b = sample();
        let p = Program::load(&b.to_bytes(), "sample.kbc", false)?;
        assert_eq!(p.code().len(), 7);
        assert_eq!(&p.code()[..5], &BOOTSTRAP);
        assert_eq!(p.text(), b.text());
        assert_eq!(p.rodata(), b"hi\0");
        assert_eq!(p.sizes(), ProgramHeader { text_size: 16, rodata_size: 3 });
        assert_eq!(p.file_name(), "sample.kbc");
        Ok(())
    }

    #[test]
    fn fetch_and_constant_bounds() -> LoadResult<()> {
        let p = Program::load(&sample().to_bytes(), "sample.kbc", false)?;
        assert!(p.fetch(6).is_ok());
        assert!(matches!(p.fetch(7), Err(VmError::InvalidAddress { section: ".text", addr: 7 })));
        assert_eq!(p.constant(0).ok(), Some(&b"hi"[..]));
        assert_eq!(p.constant(1).ok(), Some(&b"i"[..]));
        assert!(matches!(p.constant(3), Err(VmError::InvalidAddress { section: ".rodata", addr: 3 })));
        Ok(())
    }

    #[test]
    fn constant_without_terminator_stops_at_end() -> LoadResult<()> {
        let mut bytes = ProgramBuilder::new().to_bytes();
        // rodata_size lives in the last four header bytes
        let at = bytes.len() - 4;
        bytes[at..].copy_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(b"ok");
        let p = Program::load(&bytes, "raw", false)?;
        assert_eq!(p.constant(0).ok(), Some(&b"ok"[..]));
        Ok(())
    }

    #[test]
    fn shebang_prefix_is_skipped() -> LoadResult<()> {
        let bytes = sample().prefix(b"#!/usr/bin/env kombi run\n").to_bytes();
        assert_eq!(Program::load(&bytes, "script", false)?.text().len(), 2);
        Ok(())
    }

    #[test]
    fn missing_magic_is_malformed() {
        let err = Program::load(b"not bytecode", "junk.txt", false).unwrap_err();
        assert!(matches!(&err, LoadError::Malformed { file, .. } if file == "junk.txt"));
        assert!(err.to_string().contains(&format!("0x{MAGIC:02X}")));
    }

    #[test]
    fn foreign_version_needs_relaxed_mode() {
        let bytes = sample().version(0, 7).to_bytes();
        assert!(matches!(
            Program::load(&bytes, "old.kbc", false),
            Err(LoadError::UnsupportedVersion { major: 0, minor: 7, .. })
        ));
        assert!(Program::load(&bytes, "old.kbc", true).is_ok());
    }

    #[test]
    fn listing_lines_use_text_indices() -> LoadResult<()> {
        let p = Program::load(&sample().to_bytes(), "s.kbc", false)?;
        assert_eq!(p.listing_line(BOOTSTRAP_LEN + 1), disasm::line(1, &p.text()[1]));
        assert_eq!(p.listing_line(3), "boot+3:  LA");
        assert_eq!(p.listing_line(1), "boot+1:  XCH");
        assert_eq!(p.listing_line(BOOTSTRAP_LEN + 2), "00000002:  <past end of .text>");
        Ok(())
    }

    #[test]
    fn relaxed_mode_rejects_header_extension() -> Result<(), CoreError> {
        let bytes = sample().version(1, 0).header_extension(&[0; 4])?.to_bytes();
        assert!(matches!(Program::load(&bytes, "new.kbc", true), Err(LoadError::UnsupportedVersion { .. })));
        Ok(())
    }

    #[test]
    fn current_version_skips_header_extension() -> Result<(), Box<dyn std::error::Error>> {
        let bytes = sample().header_extension(&[0xAA; 4])?.to_bytes();
        let p = Program::load(&bytes, "ext.kbc", false)?;
        assert_eq!(p.rodata(), b"hi\0");
        Ok(())
    }

    #[test]
    fn truncated_sections_are_malformed() {
        let bytes = sample().to_bytes();
        for cut in [3, 10, bytes.len() - 1] {
            assert!(
                matches!(Program::load(&bytes[..cut], "cut.kbc", false), Err(LoadError::Malformed { .. })),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn misaligned_text_is_malformed() {
        let mut bytes = sample().to_bytes();
        // text_size is the first field after the 4-byte file header
        bytes[4..8].copy_from_slice(&12u32.to_be_bytes());
        let err = Program::load(&bytes, "odd.kbc", false).unwrap_err();
        assert!(err.to_string().contains(".text"));
    }

    #[test]
    fn inspect_and_from_path() -> Result<(), Box<dyn std::error::Error>> {
        let bytes = sample().to_bytes();
        let info = Program::inspect(&bytes, "sample.kbc")?;
        assert_eq!(info.program, Some(ProgramHeader { text_size: 16, rodata_size: 3 }));

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sample.kbc");
        fs::write(&path, &bytes)?;
        assert_eq!(Program::from_path(&path, false)?.text().len(), 2);
        assert!(matches!(Program::from_path(dir.path().join("nope"), false), Err(LoadError::Io { .. })));
        Ok(())
    }
}
