//! kombi-benches — programmes de charge pour les benchmarks Criterion
//!
//! Chaque programme est un listing assemblé en mémoire, sans fichier externe.

#![forbid(unsafe_code)]

use std::io::{self, Write};

use kombi_core::asm::assemble;
use kombi_core::CoreResult;

/// Boucle infinie `(s i i)` qui écrit `x` à chaque tour.
pub const TAIL_LOOP: &str = "
        APP s, i
        APP acc, i
        SA  end
        APP s, i
        APP acc, i
        APP k, acc
        APP s, acc
        APP acc, .x
        LA
end:    APP e, acc
";

/// Capture une continuation avec `c` et la réinvoque une fois.
pub const CONTINUATION_TWICE: &str = "
        APP s, i
        SA  l1
        APP k, .A
        APP s, acc
        APP k, acc
        APP s, acc
        APP acc, k
        LA
l1:     SA  l2
        APP c, i
        LA
l2:     SA  l3
        APP k, .B
        LA
l3:     APP e, acc
";

/// Image binaire d'un listing.
pub fn image(src: &str) -> CoreResult<Vec<u8>> { Ok(assemble(src)?.to_bytes()) }

/// Sortie qui accepte `n` octets, puis échoue : borne les programmes sans fin.
#[derive(Debug)]
pub struct Budget(pub usize);

impl Write for Budget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.0 == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "budget spent"));
        }
        let n = buf.len().min(self.0);
        self.0 -= n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}
