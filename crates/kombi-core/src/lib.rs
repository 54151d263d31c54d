//! kombi-core — primitives partagées du bytecode Kombi
//!
//! Fournit :
//! - Constantes du format (`MAGIC`, version, tailles d'en-têtes, bootstrap)
//! - IO mémoire (big-endian) : `ByteWriter`, `ByteReader`
//! - Modèle d'instruction : `Opcode`, `ExOpcode`, `Token`, `Instruction`
//! - En-têtes de fichier : `FileHeader`, `ProgramHeader`, `ImageInfo`
//! - Assembleur textuel + `ProgramBuilder` (production d'images)
//! - Désassembleur et hexdump de `.rodata`
//! - Erreurs `CoreError` + alias `CoreResult<T>`
//!
//! Le crate ne connaît ni le pool ni la pile : il décrit le format, la VM
//! (`kombi-vm`) l'exécute.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

/* ─────────────────────────── Imports ─────────────────────────── */

use std::borrow::Cow;
use std::fmt;

use byteorder::{BigEndian, ByteOrder};

/* ─────────────────────────── Modules publics ─────────────────────────── */

/// Primitives de bytecode (modèle, en-têtes, assembleur, désassembleur, dump).
pub mod bytecode;

pub use bytecode::asm;
pub use bytecode::disasm;
pub use bytecode::dump;

/* ─────────────────────────── Résultat commun ─────────────────────────── */

/// Alias résultat commun au core.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/* ─────────────────────────── Format — Constantes ─────────────────────────── */

/// Octet magique ouvrant l'en-tête de fichier.
pub const MAGIC: u8 = 0xDB;

/// Version majeure du format produit et accepté.
pub const VERSION_MAJOR: u8 = 0;

/// Version mineure du format produit et accepté.
pub const VERSION_MINOR: u8 = 1;

/// Taille de l'en-tête de fichier (magic, major, minor, taille d'en-tête programme).
pub const FILE_HEADER_SIZE: usize = 4;

/// Taille de l'en-tête programme reconnu (`text_size`, `rodata_size`).
pub const PROG_HEADER_SIZE: usize = 8;

/// Taille d'un enregistrement d'instruction dans `.text`.
pub const INSTRUCTION_SIZE: usize = 8;

/// Nombre d'instructions de bootstrap placées devant `.text` au chargement.
pub const BOOTSTRAP_LEN: u32 = 5;

/* ─────────────────────────── Byte Writer (BE) ─────────────────────────── */

/// Buffer d'écriture (croît automatiquement), entiers en big-endian.
#[derive(Debug, Default, Clone)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Crée un writer vide.
    pub fn new() -> Self { Self { buf: Vec::new() } }
    /// Accès en lecture au contenu.
    pub fn as_slice(&self) -> &[u8] { &self.buf }
    /// Récupère le buffer (consomme).
    pub fn into_vec(self) -> Vec<u8> { self.buf }
    /// Longueur écrite.
    pub fn len(&self) -> usize { self.buf.len() }
    /// Vrai si rien n'a été écrit.
    pub fn is_empty(&self) -> bool { self.buf.is_empty() }
    /// Ajoute des octets bruts.
    pub fn write_bytes(&mut self, bytes: &[u8]) { self.buf.extend_from_slice(bytes); }
    /// Ajoute un octet.
    pub fn write_u8(&mut self, v: u8) { self.buf.push(v); }
    /// Écrit un u16 big-endian.
    pub fn write_u16_be(&mut self, v: u16) {
        let mut b = [0u8; 2];
        BigEndian::write_u16(&mut b, v);
        self.buf.extend_from_slice(&b);
    }
    /// Écrit un u32 big-endian.
    pub fn write_u32_be(&mut self, v: u32) {
        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }
}

/* ─────────────────────────── Byte Reader (BE) ─────────────────────────── */

/// Lecteur séquentiel sur un slice d'octets (helpers BE).
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> ByteReader<'a> {
    /// Construit un lecteur.
    pub fn new(data: &'a [u8]) -> Self { Self { data, off: 0 } }
    /// Offset courant.
    pub fn offset(&self) -> usize { self.off }
    /// Taille restante.
    pub fn remaining(&self) -> usize { self.data.len().saturating_sub(self.off) }

    /// Lit `n` octets (ou erreur si EOF).
    pub fn read_bytes(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(CoreError::UnexpectedEof { needed: n as u64, at: self.off as u64 });
        }
        let start = self.off;
        self.off += n;
        Ok(&self.data[start..self.off])
    }

    /// Saute `n` octets.
    pub fn skip(&mut self, n: usize) -> CoreResult<()> { self.read_bytes(n).map(|_| ()) }

    /// Avance jusqu'au prochain octet égal à `byte`, sans le consommer.
    ///
    /// Renvoie le nombre d'octets sautés.
    pub fn skip_until(&mut self, byte: u8) -> Option<usize> {
        let found = self.data[self.off..].iter().position(|&b| b == byte)?;
        self.off += found;
        Some(found)
    }

    /// Lit un u8.
    pub fn read_u8(&mut self) -> CoreResult<u8> { Ok(self.read_bytes(1)?[0]) }

    /// Lit un u16 BE.
    pub fn read_u16_be(&mut self) -> CoreResult<u16> { Ok(BigEndian::read_u16(self.read_bytes(2)?)) }

    /// Lit un u32 BE.
    pub fn read_u32_be(&mut self) -> CoreResult<u32> { Ok(BigEndian::read_u32(self.read_bytes(4)?)) }
}

/* ─────────────────────────── Erreurs ─────────────────────────── */

/// Erreurs de bas niveau communes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Aucun octet magique trouvé dans l'entrée.
    MissingMagic,
    /// Fin de buffer inattendue.
    UnexpectedEof { /// Nombre d'octets manquants.
        needed: u64, /// Offset où l'erreur s'est produite.
        at: u64
    },
    /// Longueur de section invalide (trop courte, non alignée…).
    InvalidLength { /// Nom de section.
        section: Cow<'static, str>, /// Longueur fautive.
        len: u64
    },
    /// Source d'assemblage invalide (ligne 1-based).
    Syntax { /// Ligne fautive.
        line: u32, /// Description courte.
        msg: Cow<'static, str>
    },
    /// Données corrompues.
    Corrupted(Cow<'static, str>),
}

impl CoreError {
    /// Construit une erreur « corrompu ».
    pub fn corrupted(msg: impl Into<Cow<'static, str>>) -> Self { CoreError::Corrupted(msg.into()) }
    /// Construit une erreur de syntaxe d'assemblage.
    pub fn syntax(line: u32, msg: impl Into<Cow<'static, str>>) -> Self { CoreError::Syntax { line, msg: msg.into() } }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::MissingMagic => write!(f, "magic byte 0x{MAGIC:02X} not found"),
            CoreError::UnexpectedEof { needed, at } => write!(f, "unexpected EOF: need {needed} bytes at {at}"),
            CoreError::InvalidLength { section, len } => write!(f, "invalid length for {section}: {len}"),
            CoreError::Syntax { line, msg } => write!(f, "line {line}: {msg}"),
            CoreError::Corrupted(msg) => write!(f, "corrupted: {msg}"),
        }
    }
}

impl std::error::Error for CoreError {}

/* ─────────────────────────── Prélude (reexports utiles) ─────────────────────────── */

/// Prélude pratique pour importer les types/funcs clés du crate.
pub mod prelude {
    /// Réexports utiles pour une importation rapide.
    pub use super::{
        bytecode::{
            asm::{assemble, ProgramBuilder},
            format::{FileHeader, ImageInfo, ProgramHeader},
            model::{tag, ExOpcode, Instruction, OpFlags, Opcode, Operand, TagFlags, Token},
        },
        ByteReader, ByteWriter, CoreError, CoreResult, BOOTSTRAP_LEN, FILE_HEADER_SIZE,
        INSTRUCTION_SIZE, MAGIC, PROG_HEADER_SIZE, VERSION_MAJOR, VERSION_MINOR,
    };
}

/* ─────────────────────────── Tests ─────────────────────────── */
#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn writer_reader_be() -> CoreResult<()> {
        let mut w = ByteWriter::new();
        w.write_u8(7);
        w.write_u16_be(0xBEEF);
        w.write_u32_be(0xDEAD_BEEF);
        assert_eq!(w.as_slice(), &[7, 0xBE, 0xEF, 0xDE, 0xAD, 0xBE, 0xEF]);

        let mut r = ByteReader::new(w.as_slice());
        assert_eq!(r.read_u8()?, 7);
        assert_eq!(r.read_u16_be()?, 0xBEEF);
        assert_eq!(r.read_u32_be()?, 0xDEAD_BEEF);
        assert_eq!(r.remaining(), 0);
        Ok(())
    }

    #[test]
    fn reader_reports_eof_position() {
        let mut r = ByteReader::new(&[1, 2, 3]);
        assert!(r.skip(2).is_ok());
        assert_eq!(r.read_u32_be(), Err(CoreError::UnexpectedEof { needed: 4, at: 2 }));
    }

    #[test]
    fn skip_until_stops_on_byte() {
        let data = b"#!/usr/bin/env kombi\n\xDB\x00";
        let mut r = ByteReader::new(data);
        assert_eq!(r.skip_until(MAGIC), Some(21));
        assert_eq!(r.read_u8(), Ok(MAGIC));
        assert_eq!(r.skip_until(0x42), None);
    }
}
