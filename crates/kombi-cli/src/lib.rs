//! kombi-cli — bibliothèque interne du binaire `kombi`
//!
//! Sépare la logique des commandes du parsing d'arguments (laissé à `main.rs`) :
//! - `run`    : charge une image et l'exécute (stdin/stdout ou fichiers)
//! - `info`   : version et tailles de sections
//! - `disasm` : listing de `.text`
//! - `dump`   : hexdump de `.rodata`
//! - `asm`    : assemble un listing texte en image binaire
//!
//! Traces (`feature = "trace"`) et couleurs (`feature = "color"`) optionnelles.

#![deny(unused_must_use)]
#![forbid(unsafe_code)]

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{anyhow, Context, Result};
use kombi_core::{asm, disasm, dump};
use kombi_vm::{Program, RunStats, Vm, VmOptions};

#[cfg(feature = "color")]
use owo_colors::OwoColorize;

/// Préfixe écrit par `asm --shebang`.
pub const SHEBANG: &[u8] = b"#!/usr/bin/env -S kombi run\n";

// ───────────────────────────── Types publics ─────────────────────────────

/// Commande haut-niveau (le parsing CLI reste dans main.rs).
#[derive(Clone, Debug)]
pub enum Command {
    /// Exécute une image.
    Run(RunTask),
    /// Affiche les en-têtes d'une image.
    Info(InfoTask),
    /// Désassemble `.text`.
    Disasm(ViewTask),
    /// Hexdump de `.rodata`.
    Dump(ViewTask),
    /// Assemble un listing.
    Asm(AsmTask),
}

#[derive(Clone, Debug, Default)]
pub struct RunTask {
    pub program: Input,          // image (fichier ou stdin)
    pub input: Option<PathBuf>,  // entrée du programme (stdin si omis)
    pub stack_segment: u32,      // valeurs par segment de pile
    pub pool_size: u32,          // capacité du pool
    pub force: bool,             // tolère une version différente
    pub stats: bool,             // affiche les compteurs
    pub time: bool,              // affiche le temps d'exécution
}

#[derive(Clone, Debug, Default)]
pub struct InfoTask {
    pub input: Input,
}

#[derive(Clone, Debug, Default)]
pub struct ViewTask {
    pub input: Input,
    pub output: Output,
    pub force: bool,
}

#[derive(Clone, Debug, Default)]
pub struct AsmTask {
    pub input: Input,
    pub output: Output,
    pub shebang: bool,   // préfixe `#!` pour un script exécutable
    pub overwrite: bool, // autorise l'écrasement
}

/// Entrée : fichier ou `-` (=stdin).
#[derive(Clone, Debug, Default)]
pub enum Input {
    Path(PathBuf),
    #[default]
    Stdin,
}

impl Input {
    fn name(&self) -> String {
        match self {
            Input::Path(p) => display(p),
            Input::Stdin => "<stdin>".to_owned(),
        }
    }
}

/// Sortie : fichier ou stdout.
#[derive(Clone, Debug, Default)]
pub enum Output {
    Path(PathBuf),
    #[default]
    Stdout,
}

/// Résultat d'une exécution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub stats: RunStats,
    pub pool_capacity: u32,
}

// ───────────────────────────── Initialisation ─────────────────────────────

/// Initialise le logger selon la feature `trace`. Les événements `tracing`
/// de `kombi-vm` arrivent par le pont `log`.
pub fn init_logger() {
    #[cfg(feature = "trace")]
    {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_secs()
            .try_init();
    }
}

// ───────────────────────────── Exécution ─────────────────────────────

/// Exécute une commande. Retourne un code de sortie.
pub fn execute(cmd: Command) -> Result<i32> {
    match cmd {
        Command::Run(t) => run_entry(t),
        Command::Info(t) => {
            let bytes = read_bytes(&t.input)?;
            write_out(&Output::Stdout, info_text(&bytes, &t.input.name())?.as_bytes())?;
            Ok(0)
        },
        Command::Disasm(t) => {
            let program = load_program(&t.input, t.force)?;
            write_out(&t.output, disasm::disassemble(program.text()).as_bytes())?;
            Ok(0)
        },
        Command::Dump(t) => {
            let program = load_program(&t.input, t.force)?;
            write_out(&t.output, dump::hexdump(program.rodata()).as_bytes())?;
            Ok(0)
        },
        Command::Asm(t) => {
            asm_entry(t)?;
            Ok(0)
        },
    }
}

fn run_entry(task: RunTask) -> Result<i32> {
    let bytes = read_bytes(&task.program)?;
    let opts = VmOptions {
        file_name: task.program.name(),
        stack_segment_size: task.stack_segment,
        pool_size: task.pool_size,
        force_exec: task.force,
    };
    #[cfg(feature = "trace")]
    log::debug!("run {} (segment {}, pool {})", opts.file_name, opts.stack_segment_size, opts.pool_size);

    let mut input: Box<dyn Read> = match &task.input {
        Some(p) => Box::new(BufReader::new(
            File::open(p).with_context(|| format!("ouverture: {}", display(p)))?,
        )),
        None => Box::new(io::stdin().lock()),
    };
    let mut output = BufWriter::new(io::stdout().lock());

    let start = Instant::now();
    let report = run_program(&bytes, &opts, &mut input, &mut output)?;
    let elapsed = start.elapsed();

    if task.stats {
        let s = report.stats;
        status_info(
            "STATS",
            &format!(
                "{} instructions, stack peak {}, pool peak {}/{}",
                s.steps, s.peak_depth, s.peak_pool, report.pool_capacity
            ),
        );
    }
    if task.time {
        status_info("TIME", &format!("run: {} ms", elapsed.as_millis()));
    }
    Ok(0)
}

/// Charge et exécute une image jusqu'à `e`, puis libère le résultat.
pub fn run_program(bytes: &[u8], opts: &VmOptions, input: &mut dyn Read, output: &mut dyn Write) -> Result<RunReport> {
    let mut vm = Vm::load(bytes, opts)?;
    let result = vm.execute(input, output).map_err(|e| {
        let at = vm.program().listing_line(vm.ip());
        anyhow!(e).context(format!("{}: runtime error at {at}", opts.file_name))
    })?;
    let stats = vm.stats();
    vm.release(result)?;
    vm.unwind()?;
    Ok(RunReport { stats, pool_capacity: vm.pool().capacity() })
}

/// Texte de `kombi info`.
pub fn info_text(bytes: &[u8], name: &str) -> Result<String> {
    Ok(Program::inspect(bytes, name)?.to_string())
}

fn load_program(input: &Input, force: bool) -> Result<Program> {
    let bytes = read_bytes(input)?;
    Ok(Program::load(&bytes, &input.name(), force)?)
}

fn asm_entry(task: AsmTask) -> Result<()> {
    let name = task.input.name();
    let src = String::from_utf8(read_bytes(&task.input)?).with_context(|| format!("{name}: UTF-8 invalide"))?;
    let image = assemble_image(&src, task.shebang).with_context(|| format!("{name}: assemblage"))?;

    match &task.output {
        Output::Stdout => write_out(&task.output, &image)?,
        Output::Path(p) => {
            if p.exists() && !task.overwrite {
                return Err(anyhow!("fichier de sortie existe déjà: {}", display(p)));
            }
            write_bytes_atomic(p, &image).with_context(|| format!("écriture de {}", display(p)))?;
            status_ok("ASM", &display(p));
        },
    }
    Ok(())
}

/// Assemble un listing en image binaire.
pub fn assemble_image(src: &str, shebang: bool) -> Result<Vec<u8>> {
    let mut builder = asm::assemble(src)?;
    if shebang {
        builder = builder.prefix(SHEBANG);
    }
    Ok(builder.to_bytes())
}

// ───────────────────────────── Utilitaires E/S ─────────────────────────────

fn read_bytes(input: &Input) -> Result<Vec<u8>> {
    match input {
        Input::Stdin => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf).context("lecture de stdin")?;
            Ok(buf)
        },
        Input::Path(p) => fs::read(p).with_context(|| format!("lecture: {}", display(p))),
    }
}

fn write_out(output: &Output, bytes: &[u8]) -> Result<()> {
    match output {
        Output::Stdout => {
            let mut w = BufWriter::new(io::stdout().lock());
            w.write_all(bytes)?;
            w.flush()?;
        },
        Output::Path(p) => write_bytes_atomic(p, bytes).with_context(|| format!("écriture de {}", display(p)))?,
    }
    Ok(())
}

fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let tmp = unique_tmp_path(parent, path.file_name().unwrap_or_default());
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        w.write_all(bytes)?;
        w.flush()?;
    }
    if path.exists() {
        // Windows : Rename sur cible existante peut échouer
        let _ = fs::remove_file(path);
    }
    fs::rename(&tmp, path).or_else(|_| fs::copy(&tmp, path).and_then(|_| fs::remove_file(&tmp)))?;
    Ok(())
}

fn unique_tmp_path(dir: &Path, base: &std::ffi::OsStr) -> PathBuf {
    let mut i = 0u32;
    loop {
        let candidate = dir.join(format!("{}.tmp{}", base.to_string_lossy(), i));
        if !candidate.exists() {
            return candidate;
        }
        i = i.wrapping_add(1);
    }
}

fn display(p: &Path) -> String {
    p.to_string_lossy().to_string()
}

// ───────────────────────────── Sorties jolies ─────────────────────────────

fn status_ok(tag: &str, msg: &str) {
    #[cfg(feature = "color")]
    {
        eprintln!("{} {}", tag.green().bold(), msg);
    }
    #[cfg(not(feature = "color"))]
    {
        eprintln!("{} {}", tag, msg);
    }
}

fn status_info(tag: &str, msg: &str) {
    #[cfg(feature = "color")]
    {
        eprintln!("{} {}", tag.blue().bold(), msg);
    }
    #[cfg(not(feature = "color"))]
    {
        eprintln!("{} {}", tag, msg);
    }
}

// ───────────────────────────── Tests ─────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const HELLO: &str = "
            LC<print> \"hi\\n\"
            APP acc, i
            APP e, acc
    ";

    #[test]
    fn assemble_then_run() -> Result<()> {
        let image = assemble_image(HELLO, true)?;
        assert!(image.starts_with(SHEBANG));
        let mut out = Vec::new();
        let report = run_program(&image, &VmOptions::default(), &mut &b""[..], &mut out)?;
        assert_eq!(out, b"hi\n");
        assert_eq!(report.stats.live, 0);
        assert_eq!(report.pool_capacity, 65_536);
        Ok(())
    }

    #[test]
    fn runtime_error_names_the_instruction() -> Result<()> {
        let image = assemble_image("APP i, i\nLA", false)?;
        let opts = VmOptions { file_name: "bad.kbc".into(), ..VmOptions::default() };
        let err = run_program(&image, &opts, &mut &b""[..], &mut Vec::new()).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.starts_with("bad.kbc: runtime error at 00000001:  LA"), "{msg}");
        assert!(msg.contains("stack underflow"), "{msg}");
        Ok(())
    }

    #[test]
    fn info_lists_sections() -> Result<()> {
        let image = assemble_image(HELLO, false)?;
        assert_eq!(
            info_text(&image, "hello.kbc")?,
            "Version: 0.1.*\nSize of section .text   (bytes): 24\nSize of section .rodata (bytes): 4\n"
        );
        assert!(info_text(b"nothing here", "x").is_err());
        Ok(())
    }

    #[test]
    fn asm_writes_file_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("hello.kasm");
        let out = dir.path().join("hello.kbc");
        fs::write(&src, HELLO)?;
        let task = AsmTask {
            input: Input::Path(src),
            output: Output::Path(out.clone()),
            shebang: false,
            overwrite: false,
        };
        asm_entry(task.clone())?;
        let program = load_program(&Input::Path(out.clone()), false)?;
        assert_eq!(program.text().len(), 3);
        assert!(asm_entry(task.clone()).is_err());
        asm_entry(AsmTask { overwrite: true, ..task })?;
        Ok(())
    }

    #[test]
    fn input_names() {
        assert_eq!(Input::Stdin.name(), "<stdin>");
        assert_eq!(Input::Path(PathBuf::from("a/b.kbc")).name(), "a/b.kbc");
    }
}
