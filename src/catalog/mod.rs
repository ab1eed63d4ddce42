//! Gene catalog parsing and the catalog loader stage.
//!
//! The catalog loader owns the `genes`, `genomes`, `genome_parts` and
//! `orthos` tables. It merges the paralog annotations produced by the
//! paralog builder and computes, per ordered species pair, the two 1-based
//! orderings of ortholog pairs along each genome.

use crate::store::Store;
use crate::utils::table::Table;
use clap::Parser;
use color_eyre::eyre::{eyre, Report, Result, WrapErr};
use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ----------------------------------------------------------------------------
// Feature
// ----------------------------------------------------------------------------

/// The annotated feature kind of a gene record.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Feature {
    Cds,
    Pseudo,
    TRna,
    RRna,
    Other(String),
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let feat = match self {
            Feature::Cds => "CDS",
            Feature::Pseudo => "pseudo",
            Feature::TRna => "tRNA",
            Feature::RRna => "rRNA",
            Feature::Other(other) => other.as_str(),
        };
        write!(f, "{feat}")
    }
}

impl FromStr for Feature {
    type Err = Report;

    fn from_str(feat: &str) -> Result<Self, Report> {
        let feat = match feat {
            "CDS" => Feature::Cds,
            "pseudo" => Feature::Pseudo,
            "tRNA" => Feature::TRna,
            "rRNA" => Feature::RRna,
            other => Feature::Other(other.to_string()),
        };
        Ok(feat)
    }
}

// ----------------------------------------------------------------------------
// Gene
// ----------------------------------------------------------------------------

/// One feature of the gene catalog, keyed by `pid`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Gene {
    pub pid: String,
    pub sp: String,
    pub gpart: String,
    /// Dense 1-based rank within the genome part, all features included.
    pub pnum_all: i64,
    /// Dense 1-based rank among CDS only; -1 for non-CDS features.
    pub pnum_cds: i64,
    /// User-facing rank, reassigned by the assembly reorderer.
    pub pnum_display: i64,
    pub feat: Feature,
    pub loc_start: i64,
    pub loc_end: i64,
    pub strand: i64,
    /// Nucleotide length.
    pub length: i64,
    pub product: String,
    pub gc: f64,
    pub delta_gc: f64,
    pub paralogs_n: i64,
    pub paralogs: Option<String>,
}

impl Gene {
    pub fn is_cds(&self) -> bool {
        self.feat == Feature::Cds
    }
}

/// Read the gene catalog (§ gene catalog input contract: tab-separated
/// with a header line). Malformed rows are contract errors.
pub fn read_genes(path: &Path) -> Result<Vec<Gene>, Report> {
    let table = Table::read(path)?;

    let mut genes = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        let gene = parse_gene(&table, row)
            .wrap_err_with(|| format!("Malformed gene catalog row in {path:?}: {row:?}"))?;
        genes.push(gene);
    }

    Ok(genes)
}

fn parse_gene(table: &Table, row: &[String]) -> Result<Gene, Report> {
    let pid = table.get(row, "pid")?.to_string();
    let feat: Feature = table.get(row, "feat")?.parse()?;
    let pnum_all: i64 = table.get(row, "pnum_all")?.parse()?;
    let pnum_cds: i64 = table.get(row, "pnum_CDS")?.parse()?;
    let loc_start: i64 = table.get(row, "loc_start")?.parse()?;
    let loc_end: i64 = table.get(row, "loc_end")?.parse()?;
    let strand: i64 = table.get(row, "strand")?.parse()?;

    if loc_start > loc_end {
        return Err(eyre!("Gene {pid} has loc_start > loc_end ({loc_start} > {loc_end})."));
    }
    if strand != 1 && strand != -1 {
        return Err(eyre!("Gene {pid} has invalid strand {strand}."));
    }
    if (feat == Feature::Cds) != (pnum_cds > 0) {
        return Err(eyre!("Gene {pid} ({feat}) has inconsistent pnum_CDS {pnum_cds}."));
    }

    Ok(Gene {
        pnum_display: pnum_all,
        pid,
        sp: table.get(row, "sp")?.to_string(),
        gpart: table.get(row, "gpart")?.to_string(),
        pnum_all,
        pnum_cds,
        feat,
        loc_start,
        loc_end,
        strand,
        length: table.get(row, "length")?.parse()?,
        product: table.get(row, "product")?.to_string(),
        gc: table.get(row, "GC")?.parse()?,
        delta_gc: table.get(row, "delta_GC")?.parse()?,
        paralogs_n: 0,
        paralogs: None,
    })
}

// ----------------------------------------------------------------------------
// Genome metadata
// ----------------------------------------------------------------------------

/// One row of the optional genome metadata file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GenomeInfo {
    pub abbr: String,
    pub species: String,
    pub strain: String,
    pub taxonomy: String,
    pub gc: f64,
}

pub fn read_genomes(path: &Path) -> Result<Vec<GenomeInfo>, Report> {
    let table = Table::read(path)?;

    let mut genomes = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        genomes.push(GenomeInfo {
            abbr: table.get(row, "abbr")?.to_string(),
            species: table.get(row, "species")?.to_string(),
            strain: table.get(row, "strain")?.to_string(),
            taxonomy: table.get(row, "taxonomy")?.to_string(),
            gc: table.get(row, "GC")?.parse().wrap_err_with(|| {
                format!("Malformed GC value in genome metadata: {path:?}")
            })?,
        });
    }

    Ok(genomes)
}

// ----------------------------------------------------------------------------
// Intermediate artifacts
// ----------------------------------------------------------------------------

/// One ortholog pair as emitted by the ortholog builder.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OrthoPair {
    pub oid: i64,
    pub pid1: String,
    pub pid2: String,
    pub o_ident: f64,
    pub o_alen: i64,
}

pub fn read_orthos(path: &Path) -> Result<Vec<OrthoPair>, Report> {
    let table = Table::read(path)?;

    let mut pairs = Vec::with_capacity(table.rows.len());
    for row in &table.rows {
        pairs.push(OrthoPair {
            oid: table.get(row, "oid")?.parse()?,
            pid1: table.get(row, "pid1")?.to_string(),
            pid2: table.get(row, "pid2")?.to_string(),
            o_ident: table.get(row, "o_ident")?.parse()?,
            o_alen: table.get(row, "o_alen")?.parse()?,
        });
    }

    Ok(pairs)
}

/// Read the three-column paralog artifact: `pid<TAB>n<TAB>subjects`.
pub fn read_paralogs(path: &Path) -> Result<BTreeMap<String, (i64, String)>, Report> {
    let file = File::open(path).wrap_err_with(|| format!("Failed to read file: {path:?}"))?;

    let mut paralogs = BTreeMap::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (pid, n, subjects) = line
            .splitn(3, '\t')
            .collect_tuple()
            .ok_or_else(|| eyre!("Malformed paralog row in {path:?}: {line}"))?;
        paralogs.insert(pid.to_string(), (n.parse()?, subjects.to_string()));
    }

    Ok(paralogs)
}

// ----------------------------------------------------------------------------
// Load stage
// ----------------------------------------------------------------------------

/// Load the gene catalog, genome metadata, paralogs and ortholog pairs
/// into the store.
#[derive(Clone, Debug, Deserialize, Parser, Serialize)]
pub struct LoadArgs {
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
}

/// Catalog loader stage.
pub fn load(args: &LoadArgs) -> Result<(), Report> {
    let store = Store::open(&args.store)?;
    store.reset_tables(&["genes", "genomes", "genome_parts", "orthos"])?;

    let mut genes = read_genes(&args.genes)?;
    info!("Loaded {} genes from {:?}", genes.len(), args.genes);

    // merge paralog annotations
    if let Some(path) = &args.paralogs {
        let paralogs = read_paralogs(path)?;
        for gene in &mut genes {
            if let Some((n, subjects)) = paralogs.get(&gene.pid) {
                gene.paralogs_n = *n;
                gene.paralogs = Some(subjects.clone());
            }
        }
    }

    insert_genes(&store, &genes)?;
    insert_parts_and_genomes(&store, &genes, args.genomes.as_deref())?;

    let orthos = read_orthos(&args.orthos)?;
    info!("Loaded {} ortholog pairs from {:?}", orthos.len(), args.orthos);
    insert_orthos(&store, &genes, &orthos)?;

    store.refresh_views()?;
    store.record_stage("load", &serde_json::to_string(args)?)?;
    Ok(())
}

fn insert_genes(store: &Store, genes: &[Gene]) -> Result<(), Report> {
    let tx = store.conn().unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO genes (pid, sp, gpart, pnum_all, pnum_CDS, pnum_display,
                                feat, loc_start, loc_end, strand, length, product,
                                GC, delta_GC, paralogs_n, paralogs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )?;
        for g in genes {
            stmt.execute(rusqlite::params![
                g.pid,
                g.sp,
                g.gpart,
                g.pnum_all,
                g.pnum_cds,
                g.pnum_display,
                g.feat.to_string(),
                g.loc_start,
                g.loc_end,
                g.strand,
                g.length,
                g.product,
                g.gc,
                g.delta_gc,
                g.paralogs_n,
                g.paralogs,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn insert_parts_and_genomes(
    store: &Store,
    genes: &[Gene],
    genomes: Option<&Path>,
) -> Result<(), Report> {
    // display rank extent per genome part
    let mut parts: BTreeMap<(&str, &str), (i64, i64)> = BTreeMap::new();
    for g in genes {
        let entry = parts
            .entry((&g.sp, &g.gpart))
            .or_insert((g.pnum_display, g.pnum_display));
        entry.0 = entry.0.min(g.pnum_display);
        entry.1 = entry.1.max(g.pnum_display);
    }

    // genome rows, from metadata when given, derived from the genes otherwise
    let metadata: BTreeMap<String, GenomeInfo> = match genomes {
        Some(path) => read_genomes(path)?.into_iter().map(|g| (g.abbr.clone(), g)).collect(),
        None => BTreeMap::new(),
    };

    let species = genes.iter().map(|g| g.sp.as_str()).unique().sorted().collect_vec();

    let tx = store.conn().unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO genome_parts (sp, gpart, min, max) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for ((sp, gpart), (min, max)) in &parts {
            stmt.execute(rusqlite::params![sp, gpart, min, max])?;
        }

        let mut stmt = tx.prepare_cached(
            "INSERT INTO genomes (sp, name, strain, taxonomy, GC, max_pnum_display)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for sp in species {
            let max_pnum_display =
                genes.iter().filter(|g| g.sp == sp).map(|g| g.pnum_display).max().unwrap_or(0);
            match metadata.get(sp) {
                Some(meta) => stmt.execute(rusqlite::params![
                    sp,
                    meta.species,
                    meta.strain,
                    meta.taxonomy,
                    meta.gc,
                    max_pnum_display,
                ])?,
                None => {
                    // length-weighted mean of the gene GC stands in
                    let (sum, len): (f64, f64) = genes
                        .iter()
                        .filter(|g| g.sp == sp)
                        .fold((0.0, 0.0), |(s, l), g| {
                            (s + g.gc * g.length as f64, l + g.length as f64)
                        });
                    let gc = if len > 0.0 { sum / len } else { 0.0 };
                    stmt.execute(rusqlite::params![sp, sp, "", "", gc, max_pnum_display])?
                }
            };
        }
    }
    tx.commit()?;
    Ok(())
}

/// Insert ortholog pairs, computing `pnum_order1` and `pnum_order2`: the
/// 1-based ranks of each pair among the pairs of its ordered species pair,
/// along genome 1 and genome 2 respectively (`(gpart, pnum_CDS)` ascending).
fn insert_orthos(store: &Store, genes: &[Gene], orthos: &[OrthoPair]) -> Result<(), Report> {
    let by_pid: BTreeMap<&str, &Gene> = genes.iter().map(|g| (g.pid.as_str(), g)).collect();

    // group pair indices by ordered species pair
    let mut by_species: BTreeMap<(&str, &str), Vec<usize>> = BTreeMap::new();
    for (i, pair) in orthos.iter().enumerate() {
        let g1 = by_pid
            .get(pair.pid1.as_str())
            .ok_or_else(|| eyre!("Ortholog pair references unknown gene: {}", pair.pid1))?;
        let g2 = by_pid
            .get(pair.pid2.as_str())
            .ok_or_else(|| eyre!("Ortholog pair references unknown gene: {}", pair.pid2))?;
        if g1.sp == g2.sp {
            return Err(eyre!(
                "Ortholog pair ({}, {}) is within a single species: {}",
                pair.pid1,
                pair.pid2,
                g1.sp
            ));
        }
        by_species.entry((g1.sp.as_str(), g2.sp.as_str())).or_default().push(i);
    }

    // per species pair, rank along each genome
    let mut order1 = vec![0i64; orthos.len()];
    let mut order2 = vec![0i64; orthos.len()];
    for indices in by_species.values() {
        let ranked1 = indices
            .iter()
            .sorted_by_key(|&&i| {
                let g = by_pid[orthos[i].pid1.as_str()];
                (g.gpart.clone(), g.pnum_cds)
            })
            .collect_vec();
        for (rank, &&i) in ranked1.iter().enumerate() {
            order1[i] = rank as i64 + 1;
        }
        let ranked2 = indices
            .iter()
            .sorted_by_key(|&&i| {
                let g = by_pid[orthos[i].pid2.as_str()];
                (g.gpart.clone(), g.pnum_cds)
            })
            .collect_vec();
        for (rank, &&i) in ranked2.iter().enumerate() {
            order2[i] = rank as i64 + 1;
        }
    }

    let tx = store.conn().unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO orthos (oid, pid1, pid2, o_ident, o_alen, pnum_order1, pnum_order2)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for (i, pair) in orthos.iter().enumerate() {
            stmt.execute(rusqlite::params![
                pair.oid,
                pair.pid1,
                pair.pid2,
                pair.o_ident,
                pair.o_alen,
                order1[i],
                order2[i],
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}
