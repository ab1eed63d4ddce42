use clap::Parser;
use color_eyre::eyre::{Report, Result};
use synteruptor::{blocks, breaks, catalog, cli, goc, graphs, orthologs, paralogs, rank, reorder};
use synteruptor::Cli;

fn main() -> Result<(), Report> {
    // ------------------------------------------------------------------------
    // CLI Setup

    // Parse CLI parameters; usage errors exit 1 (clap defaults to 2)
    let args = Cli::parse_from_env_or_exit();

    // initialize color_eyre crate for colorized logs
    color_eyre::install()?;

    // Set logging/verbosity level via RUST_LOG
    std::env::set_var("RUST_LOG", args.verbosity.to_string());

    // initialize env_logger crate for logging/verbosity level
    env_logger::init();

    // check which stage we're running
    match args.command {
        cli::Command::Orthologs(args) => orthologs::build(&args)?,
        cli::Command::Paralogs(args) => paralogs::build(&args)?,
        cli::Command::Load(args) => catalog::load(&args)?,
        cli::Command::Blocks(args) => blocks::find(&args)?,
        cli::Command::Breaks(args) => breaks::find(&args)?,
        cli::Command::BreakGenes(args) => breaks::genes::extract(&args)?,
        cli::Command::Rank(args) => rank::rank(&args)?,
        cli::Command::Graphs(args) => graphs::analyze(&args)?,
        cli::Command::Reorder(args) => reorder::reorder(&args)?,
        cli::Command::Goc(args) => goc::compute(&args)?,
        cli::Command::Run(args) => cli::run_pipeline(&args)?,
    }

    Ok(())
}

trait ParseOrExit: Parser {
    /// Parse `std::env::args`, printing usage errors and exiting 1.
    fn parse_from_env_or_exit() -> Self {
        match Self::try_parse() {
            Ok(args) => args,
            Err(err) => {
                // --help and --version are "errors" to clap but not to us
                if err.use_stderr() {
                    let _ = err.print();
                    std::process::exit(1);
                }
                let _ = err.print();
                std::process::exit(0);
            }
        }
    }
}

impl ParseOrExit for Cli {}
