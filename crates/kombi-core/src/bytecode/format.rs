//! File and program headers.
//!
//! ```text
//! [prefix ...] magic u8 | major u8 | minor u8 | prog_header_size u8
//!              text_size u32 BE | rodata_size u32 BE | [extension ...]
//! ```

use std::fmt;

use crate::{
    ByteReader, ByteWriter, CoreError, CoreResult, INSTRUCTION_SIZE, MAGIC, PROG_HEADER_SIZE,
    VERSION_MAJOR, VERSION_MINOR,
};

/// The fixed 4-byte file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Major format version.
    pub major: u8,
    /// Minor format version.
    pub minor: u8,
    /// Size in bytes of the program header that follows.
    pub prog_header_size: u8,
}

impl FileHeader {
    /// Header written by this version of the toolchain.
    pub const CURRENT: Self = Self {
        major: VERSION_MAJOR,
        minor: VERSION_MINOR,
        prog_header_size: PROG_HEADER_SIZE as u8,
    };

    /// Skips any prefix (e.g. a `#!` line) up to the magic byte, then reads the header.
    pub fn locate(r: &mut ByteReader<'_>) -> CoreResult<Self> {
        r.skip_until(MAGIC).ok_or(CoreError::MissingMagic)?;
        r.skip(1)?;
        Ok(Self { major: r.read_u8()?, minor: r.read_u8()?, prog_header_size: r.read_u8()? })
    }

    /// Writes the header, magic included.
    pub fn write(&self, w: &mut ByteWriter) {
        w.write_bytes(&[MAGIC, self.major, self.minor, self.prog_header_size]);
    }

    /// True when the version matches the one this toolchain understands.
    pub const fn is_current_version(&self) -> bool {
        self.major == VERSION_MAJOR && self.minor == VERSION_MINOR
    }

    /// True when the program header has no unrecognized extension.
    pub const fn has_plain_program_header(&self) -> bool {
        self.prog_header_size as usize == PROG_HEADER_SIZE
    }
}

/// Section sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgramHeader {
    /// Size of `.text` in bytes.
    pub text_size: u32,
    /// Size of `.rodata` in bytes.
    pub rodata_size: u32,
}

impl ProgramHeader {
    /// Reads a program header of `declared` bytes; extension bytes are skipped.
    pub fn read(r: &mut ByteReader<'_>, declared: u8) -> CoreResult<Self> {
        if (declared as usize) < PROG_HEADER_SIZE {
            return Err(CoreError::InvalidLength { section: "program header".into(), len: u64::from(declared) });
        }
        let header = Self { text_size: r.read_u32_be()?, rodata_size: r.read_u32_be()? };
        r.skip(declared as usize - PROG_HEADER_SIZE)?;
        Ok(header)
    }

    /// Writes the 8-byte header.
    pub fn write(&self, w: &mut ByteWriter) {
        w.write_u32_be(self.text_size);
        w.write_u32_be(self.rodata_size);
    }

    /// Number of instruction records in `.text`.
    pub fn instruction_count(&self) -> CoreResult<u32> {
        if self.text_size as usize % INSTRUCTION_SIZE != 0 {
            return Err(CoreError::InvalidLength { section: ".text".into(), len: u64::from(self.text_size) });
        }
        Ok(self.text_size / INSTRUCTION_SIZE as u32)
    }
}

/// Header summary of an image, as reported by `kombi info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    /// File header.
    pub file: FileHeader,
    /// Program header, when the version and header size are both recognized.
    pub program: Option<ProgramHeader>,
}

impl ImageInfo {
    /// Reads only the headers of an image.
    pub fn read(data: &[u8]) -> CoreResult<Self> {
        let mut r = ByteReader::new(data);
        let file = FileHeader::locate(&mut r)?;
        let program = if file.is_current_version() && file.has_plain_program_header() {
            Some(ProgramHeader::read(&mut r, file.prog_header_size)?)
        } else {
            None
        };
        Ok(Self { file, program })
    }
}

impl fmt::Display for ImageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Version: {}.{}.*", self.file.major, self.file.minor)?;
        if !self.file.is_current_version() {
            return Ok(());
        }
        match self.program {
            Some(p) => {
                writeln!(f, "Size of section .text   (bytes): {}", p.text_size)?;
                writeln!(f, "Size of section .rodata (bytes): {}", p.rodata_size)
            }
            None => writeln!(f, "Program header unrecognizable ({} bytes)", self.file.prog_header_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn image(prefix: &[u8], file: FileHeader, sizes: ProgramHeader) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_bytes(prefix);
        file.write(&mut w);
        sizes.write(&mut w);
        w.into_vec()
    }

    #[test]
    fn info_skips_shebang() -> CoreResult<()> {
        let data = image(b"#!/usr/bin/env kombi\n", FileHeader::CURRENT, ProgramHeader { text_size: 16, rodata_size: 3 });
        let info = ImageInfo::read(&data)?;
        assert_eq!(info.program, Some(ProgramHeader { text_size: 16, rodata_size: 3 }));
        assert_eq!(
            info.to_string(),
            "Version: 0.1.*\nSize of section .text   (bytes): 16\nSize of section .rodata (bytes): 3\n"
        );
        Ok(())
    }

    #[test]
    fn info_on_foreign_version_prints_only_version() -> CoreResult<()> {
        let file = FileHeader { major: 3, minor: 9, prog_header_size: 8 };
        let info = ImageInfo::read(&image(&[], file, ProgramHeader::default()))?;
        assert_eq!(info.program, None);
        assert_eq!(info.to_string(), "Version: 3.9.*\n");
        Ok(())
    }

    #[test]
    fn info_on_extended_header() -> CoreResult<()> {
        let file = FileHeader { prog_header_size: 12, ..FileHeader::CURRENT };
        let info = ImageInfo::read(&image(&[], file, ProgramHeader::default()))?;
        assert_eq!(info.to_string(), "Version: 0.1.*\nProgram header unrecognizable (12 bytes)\n");
        Ok(())
    }

    #[test]
    fn missing_magic() {
        assert_eq!(ImageInfo::read(b"plain text"), Err(CoreError::MissingMagic));
    }

    #[test]
    fn program_header_too_short() {
        let mut r = ByteReader::new(&[0; 8]);
        assert!(matches!(ProgramHeader::read(&mut r, 4), Err(CoreError::InvalidLength { len: 4, .. })));
    }

    #[test]
    fn text_must_be_whole_records() {
        assert!(ProgramHeader { text_size: 12, rodata_size: 0 }.instruction_count().is_err());
        assert_eq!(ProgramHeader { text_size: 24, rodata_size: 0 }.instruction_count(), Ok(3));
    }
}
