//! `kombi` — CLI principal de Kombi
//!
//! Ici on fait uniquement : parsing d'arguments, initialisation (logger,
//! couleur), et délégation à `kombi_cli` (lib).

#![forbid(unsafe_code)]

use std::{path::PathBuf, process::ExitCode};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use kombi_cli as cli; // notre lib interne (src/lib.rs)

// ──────────────────────────── CLI (clap) ────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "kombi", version, about = "Kombi — exécuter, inspecter, assembler du bytecode", long_about = None)]
struct Opt {
    /// Augmente la verbosité (-v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Mode silencieux (casse la verbosité)
    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue)]
    quiet: bool,

    /// Force la couleur (si la feature `color` est compilée)
    #[arg(long = "color", value_enum, default_value_t = ColorChoice::Auto)]
    color: ColorChoice,

    /// Sous-commandes
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Exécuter une image bytecode
    Run {
        /// Image (ou - pour stdin)
        program: Option<PathBuf>,
        /// Entrée du programme (stdin si omis)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Valeurs par segment de pile
        #[arg(long = "stack-segment", default_value_t = 256, value_parser = clap::value_parser!(u32).range(1..))]
        stack_segment: u32,
        /// Capacité du pool, en éléments
        #[arg(long = "pool-size", default_value_t = 65_536, value_parser = clap::value_parser!(u32).range(1..))]
        pool_size: u32,
        /// Exécuter même si la version diffère
        #[arg(short, long)]
        force: bool,
        /// Afficher les compteurs (instructions, pics de pile et de pool)
        #[arg(long)]
        stats: bool,
        /// Afficher le temps d'exécution
        #[arg(long)]
        time: bool,
    },

    /// Afficher version et tailles de sections
    Info {
        /// Image
        input: Option<PathBuf>,
    },

    /// Désassembler `.text`
    Disasm {
        /// Image
        input: Option<PathBuf>,
        /// Sortie texte (stdout si omis)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Accepter une version différente
        #[arg(short, long)]
        force: bool,
    },

    /// Hexdump de `.rodata`
    Dump {
        /// Image
        input: Option<PathBuf>,
        /// Sortie texte (stdout si omis)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Accepter une version différente
        #[arg(short, long)]
        force: bool,
    },

    /// Assembler un listing texte
    Asm {
        /// Listing (ou - pour stdin)
        input: Option<PathBuf>,
        /// Image de sortie (stdout si omis)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Préfixer `#!/usr/bin/env -S kombi run`
        #[arg(long)]
        shebang: bool,
        /// Écraser le fichier de sortie
        #[arg(long)]
        overwrite: bool,
    },
}

// ──────────────────────────── Entrée / Sortie ────────────────────────────

fn input_from_opt(p: Option<PathBuf>) -> cli::Input {
    match p {
        Some(path) if path.as_os_str() == "-" => cli::Input::Stdin,
        Some(path) => cli::Input::Path(path),
        None => cli::Input::Stdin,
    }
}

fn output_from_opt(p: Option<PathBuf>) -> cli::Output {
    p.map_or(cli::Output::Stdout, cli::Output::Path)
}

// ──────────────────────────── Logger / Verbosité ────────────────────────────

fn init_telemetry(verbose: u8, quiet: bool) {
    #[cfg(feature = "trace")]
    {
        let level = if quiet {
            "error"
        } else {
            match verbose {
                0 => "warn",
                1 => "info",
                2 => "debug",
                _ => "trace",
            }
        };
        std::env::set_var("RUST_LOG", std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string()));
        cli::init_logger();
    }
    #[cfg(not(feature = "trace"))]
    let _ = (verbose, quiet);
}

fn init_color(choice: ColorChoice) {
    match choice {
        ColorChoice::Auto => {},
        ColorChoice::Always => {
            std::env::set_var("CLICOLOR_FORCE", "1");
            std::env::remove_var("NO_COLOR");
        },
        ColorChoice::Never => {
            std::env::set_var("NO_COLOR", "1");
            std::env::remove_var("CLICOLOR_FORCE");
        },
    }
}

// ──────────────────────────── main ────────────────────────────

fn main() -> ExitCode {
    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");
        return ExitCode::from(1);
    }
    ExitCode::from(0)
}

fn real_main() -> Result<()> {
    let opt = Opt::parse();

    init_color(opt.color);
    init_telemetry(opt.verbose, opt.quiet);

    use cli::{AsmTask, Command as C, InfoTask, RunTask, ViewTask};

    let command = match opt.cmd {
        Command::Run { program, input, stack_segment, pool_size, force, stats, time } => C::Run(RunTask {
            program: input_from_opt(program),
            input,
            stack_segment,
            pool_size,
            force,
            stats,
            time,
        }),
        Command::Info { input } => C::Info(InfoTask { input: input_from_opt(input) }),
        Command::Disasm { input, output, force } => {
            C::Disasm(ViewTask { input: input_from_opt(input), output: output_from_opt(output), force })
        },
        Command::Dump { input, output, force } => {
            C::Dump(ViewTask { input: input_from_opt(input), output: output_from_opt(output), force })
        },
        Command::Asm { input, output, shebang, overwrite } => C::Asm(AsmTask {
            input: input_from_opt(input),
            output: output_from_opt(output),
            shebang,
            overwrite,
        }),
    };

    let code = cli::execute(command).context("échec d'exécution de la commande")?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
