//! Command-line driver.
//!
//! `ember <path>` lexes, annotates, and evaluates a program. Program
//! output (`display`, `newline`) goes to stdout; diagnostics go to
//! stderr with source context. The process exits 0 on success, 1 on any
//! failure, or with the status a program passed to `exit`.

use clap::Parser;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::error::EmberError;
use crate::eval::{interpret, Interpretation};

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "A small Lisp interpreter", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Program to run
    pub path: PathBuf,

    /// Print the annotated token stream to stderr before evaluating
    #[arg(long)]
    pub dump_tokens: bool,

    /// Print the span table to stderr before evaluating
    #[arg(long)]
    pub dump_flux: bool,

    /// Print heap statistics to stderr after the run
    #[arg(long, short)]
    pub verbose: bool,
}

/// Entry point for the CLI. Returns the process exit code.
pub fn run_cli() -> i32 {
    let cli = Cli::parse();
    execute(&cli)
}

/// Run one program file per the CLI's flags.
pub fn execute(cli: &Cli) -> i32 {
    let source = match fs::read_to_string(&cli.path) {
        Ok(s) => s,
        Err(e) => {
            let err = EmberError::Io {
                message: format!("cannot read {}: {}", cli.path.display(), e),
            };
            eprintln!("{}", err.display_with_source(""));
            return 1;
        }
    };

    if cli.dump_tokens || cli.dump_flux {
        dump_front_end(&source, cli.dump_tokens, cli.dump_flux);
    }

    let result = interpret(&source);
    report(&source, &result, cli.verbose)
}

/// Print program output and diagnostics; compute the exit code.
fn report(source: &str, result: &Interpretation, verbose: bool) -> i32 {
    print!("{}", result.output);
    let _ = io::stdout().flush();

    if verbose {
        eprintln!(
            "{} minor / {} major collections, {} bytes promoted",
            result.stats.minor_collections,
            result.stats.major_collections,
            result.stats.bytes_promoted
        );
    }

    if let Some(err) = &result.error {
        eprintln!("{}", err.display_with_source(source));
        return 1;
    }
    result.exit.unwrap_or(0)
}

/// Best-effort debugging views of the front-end stages.
fn dump_front_end(source: &str, tokens: bool, flux_table: bool) {
    use crate::annotate::annotate;
    use crate::arena::{Arena, Scratch};
    use crate::flux::{self, FluxContext};
    use crate::lexer::Lexer;

    let mut toks = Lexer::new(source).tokenize();
    let scratch = Scratch::new();
    if annotate(&mut toks, &scratch).is_err() {
        // The evaluation pass will report the error with context.
        return;
    }
    if tokens {
        for (i, t) in toks.iter().enumerate() {
            eprintln!(
                "{:4} {:?} #{} {:?}",
                i,
                t.kind,
                t.sexpr_id,
                t.text(source)
            );
        }
    }
    if flux_table {
        let spans = Arena::new();
        let ids = Arena::new();
        let lists = Arena::new();
        let forms = Arena::new();
        let ctx = FluxContext {
            spans: &spans,
            ids: &ids,
            lists: &lists,
            forms: &forms,
        };
        if let Ok(flux) = flux::build(&toks, ctx) {
            eprint!("{}", flux.describe(source));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli_for(path: PathBuf) -> Cli {
        Cli {
            path,
            dump_tokens: false,
            dump_flux: false,
            verbose: false,
        }
    }

    #[test]
    fn missing_file_exits_nonzero() {
        let cli = cli_for(PathBuf::from("/nonexistent/program.lsp"));
        assert_eq!(execute(&cli), 1);
    }

    #[test]
    fn valid_program_exits_zero() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write as _;
        write!(file, "(display (+ 1 2))").unwrap();
        let cli = cli_for(file.path().to_path_buf());
        assert_eq!(execute(&cli), 0);
    }

    #[test]
    fn failing_program_exits_one() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write as _;
        write!(file, "(/ 1 0)").unwrap();
        let cli = cli_for(file.path().to_path_buf());
        assert_eq!(execute(&cli), 1);
    }

    #[test]
    fn exit_status_propagates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write as _;
        write!(file, "(exit 7)").unwrap();
        let cli = cli_for(file.path().to_path_buf());
        assert_eq!(execute(&cli), 7);
    }
}
