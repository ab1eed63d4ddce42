//! [Command-line interface](Cli) (CLI) of the main binary.

use crate::Verbosity;
use crate::{blocks, breaks, catalog, goc, graphs, orthologs, paralogs, rank, reorder};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Report, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ----------------------------------------------------------------------------
// CLI Entry Point
// ----------------------------------------------------------------------------

/// The command-line interface (CLI).
///
/// One executable, one subcommand per pipeline stage. Stages communicate
/// exclusively through the store given with `-d`, so any stage can be
/// re-run on its own.
#[derive(Debug, Parser)]
#[clap(name = "synteruptor", author, version)]
#[clap(about = "synteruptor detects synteny breaks between pairwise-compared annotated genomes.")]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,

    /// Set the output [Verbosity] level.
    #[clap(short = 'v', long)]
    #[clap(value_enum, default_value_t = Verbosity::default())]
    #[clap(global = true)]
    pub verbosity: Verbosity,
}

/// CLI [commands](#variants), one per pipeline stage.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build ortholog pairs from similarity hits (best reciprocal hits with
    /// synteny rescue).
    Orthologs(orthologs::Args),

    /// Build within-genome paralog lists from similarity hits.
    Paralogs(paralogs::Args),

    /// Load the gene catalog, genome metadata, paralogs and ortholog pairs
    /// into the store.
    Load(catalog::LoadArgs),

    /// Aggregate consecutive ortholog pairs into maximal synteny blocks.
    Blocks(blocks::Args),

    /// Derive breaks between near-consecutive blocks and match opposites.
    Breaks(breaks::Args),

    /// Materialize the gene contents on each side of each break.
    #[clap(name = "break-genes")]
    BreakGenes(breaks::genes::Args),

    /// Score break content; optionally prune low-quality breaks.
    Rank(rank::Args),

    /// Group similar breaks across species pairs into graphs, detect cycles.
    Graphs(graphs::Args),

    /// Reorder fragmented genome assemblies against a reference.
    Reorder(reorder::Args),

    /// Compute sliding-window gene order conservation per species pair.
    Goc(goc::Args),

    /// Run the store-side stages in order: load, blocks, breaks,
    /// break-genes, rank, graphs.
    Run(RunArgs),
}

// ----------------------------------------------------------------------------
// Run (all store-side stages)
// ----------------------------------------------------------------------------

/// Run the store-side pipeline in stage order.
#[derive(Clone, Debug, Deserialize, Parser, Serialize)]
pub struct RunArgs {
    /// Path of the store to create or reuse.
    #[clap(short = 'd', long, required = true)]
    pub store: PathBuf,

    /// Gene catalog file.
    #[clap(short = 'g', long, required = true)]
    pub genes: PathBuf,

    /// Genome metadata file.
    #[clap(short = 'G', long)]
    pub genomes: Option<PathBuf>,

    /// Ortholog pairs file from the orthologs stage.
    #[clap(short = 'r', long, required = true)]
    pub orthos: PathBuf,

    /// Paralog pairs file from the paralogs stage.
    #[clap(short = 'P', long)]
    pub paralogs: Option<PathBuf>,

    /// Block CDS gap tolerance.
    #[clap(short = 't', long, default_value_t = blocks::DEFAULT_TOLERANCE)]
    pub tolerance: i64,

    /// Maximum number of blocks included inside a break.
    #[clap(short = 'b', long, default_value_t = breaks::DEFAULT_MAX_INCLUDED_BLOCKS)]
    pub max_included_blocks: i64,

    /// Remove low-quality breaks after ranking.
    #[clap(short = 'C', long)]
    pub clean: bool,
}

/// Chain the store-side stages. Semantics are identical to invoking the
/// subcommands one at a time.
pub fn run_pipeline(args: &RunArgs) -> Result<(), Report> {
    catalog::load(&catalog::LoadArgs {
        store: args.store.clone(),
        genes: args.genes.clone(),
        genomes: args.genomes.clone(),
        orthos: args.orthos.clone(),
        paralogs: args.paralogs.clone(),
    })?;
    blocks::find(&blocks::Args { store: args.store.clone(), tolerance: args.tolerance })?;
    breaks::find(&breaks::Args {
        store: args.store.clone(),
        max_included_blocks: args.max_included_blocks,
    })?;
    breaks::genes::extract(&breaks::genes::Args { store: args.store.clone() })?;
    rank::rank(&rank::Args { store: args.store.clone(), clean: args.clean })?;
    graphs::analyze(&graphs::Args { store: args.store.clone() })?;
    Ok(())
}
