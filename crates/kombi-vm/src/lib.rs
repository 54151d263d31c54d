//! kombi-vm — machine virtuelle du bytecode Kombi
//!
//! Exécute les images produites par le compilateur (format décrit dans
//! `kombi-core`) :
//!
//! - `Program` : chargement, vérification d'en-têtes, bootstrap `LA, XCH, LA, LA, LA`
//! - `Pool`    : arène à capacité fixe, comptage de références, libération itérative
//! - `Stack`   : pile segmentée copy-on-write, capture O(1) pour `c`
//! - `Vm`      : accumulateur + boucle fetch/execute, sans récursion hôte
//! - `LoadError` / `VmError` : erreurs de chargement / d'exécution (toujours fatales)
//!
//! Plusieurs `Vm` peuvent coexister : aucun état global.
//!
//! ```no_run
//! use kombi_vm::{Vm, VmOptions};
//!
//! let bytes = std::fs::read("hello.kbc")?;
//! let mut vm = Vm::load(&bytes, &VmOptions::default())?;
//! let result = vm.execute(&mut std::io::stdin(), &mut std::io::stdout())?;
//! vm.release(result)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]
#![cfg_attr(not(debug_assertions), warn(missing_docs))]

/* ─────────────────────────── Modules ─────────────────────────── */

pub mod error;
pub mod pool;
pub mod program;
pub mod stack;
pub mod value;
pub mod vm;

/* ─────────────────────────── Réexports ─────────────────────────── */

pub use error::{LoadError, LoadResult, VmError, VmResult};
pub use pool::Pool;
pub use program::Program;
pub use stack::{SegmentId, Stack};
pub use value::{Addr, Handle, Value};
pub use vm::{RunStats, Vm, VmOptions};

/// Prélude : `use kombi_vm::prelude::*;`
pub mod prelude {
    pub use crate::{LoadError, Program, RunStats, Value, Vm, VmError, VmOptions, VmResult};
}
