//! Paralog builder: within-genome paralog lists from similarity hits.

use crate::catalog;
use crate::hits::{self, Hit};
use clap::Parser;
use color_eyre::eyre::{eyre, Report, Result, WrapErr};
use itertools::Itertools;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

pub const DEFAULT_MIN_IDENTITY: f64 = 40.0;
pub const DEFAULT_MAX_EVALUE: f64 = 1e-20;
pub const DEFAULT_MIN_LENGTH_RATIO: f64 = 0.5;

/// Unknown pids are tolerated this many times before the stage gives up.
const MAX_UNKNOWN_PID_WARNINGS: usize = 10;

/// Build within-genome paralog lists from similarity hits.
#[derive(Clone, Debug, Deserialize, Parser, Serialize)]
pub struct Args {
    /// Similarity hits file (12-column tab-separated).
    #[clap(short = 'i', long, required = true)]
    pub hits: PathBuf,

    /// Gene catalog file.
    #[clap(short = 'g', long, required = true)]
    pub genes: PathBuf,

    /// Output paralog pairs file.
    #[clap(short = 'o', long, required = true)]
    pub output: PathBuf,

    /// Minimum percent identity between paralogs.
    #[clap(short = 's', long, default_value_t = DEFAULT_MIN_IDENTITY)]
    pub min_identity: f64,
}

/// Paralog builder stage: keep strong same-species hits, store the maximum
/// identity per (query, subject), and emit one line per query:
/// `pid<TAB>n<TAB>subj1 (id%), subj2 (id%), ...`.
pub fn build(args: &Args) -> Result<(), Report> {
    let genes = catalog::read_genes(&args.genes)?;
    let lengths: BTreeMap<&str, (&str, i64)> =
        genes.iter().map(|g| (g.pid.as_str(), (g.sp.as_str(), g.length))).collect();

    let hits = hits::read_hits(&args.hits)?;
    let paralogs = collect_paralogs(&hits, &lengths, args)?;

    info!("Writing paralogs for {} genes to {:?}", paralogs.len(), args.output);
    write_paralogs(&paralogs, &args.output)?;
    Ok(())
}

/// Max identity per (query, subject), same species only.
fn collect_paralogs<'a>(
    hits: &'a [Hit],
    lengths: &BTreeMap<&str, (&str, i64)>,
    args: &Args,
) -> Result<BTreeMap<&'a str, BTreeMap<&'a str, f64>>, Report> {
    let mut unknown = 0usize;
    let mut paralogs: BTreeMap<&str, BTreeMap<&str, f64>> = BTreeMap::new();
    for hit in hits {
        if hit.query == hit.subject {
            continue;
        }
        let query = lengths.get(hit.query.as_str()).copied();
        let subject = lengths.get(hit.subject.as_str()).copied();
        let (Some((sp_q, len_q)), Some((sp_s, len_s))) = (query, subject) else {
            for pid in [&hit.query, &hit.subject] {
                if !lengths.contains_key(pid.as_str()) {
                    unknown += 1;
                    if unknown > MAX_UNKNOWN_PID_WARNINGS {
                        return Err(eyre!(
                            "Too many hits referencing genes missing from the catalog \
                             (last one: {pid})."
                        ));
                    }
                    warn!("Hit references a gene missing from the catalog: {pid}");
                }
            }
            continue;
        };
        if sp_q != sp_s {
            continue;
        }

        // alignment must cover half of the shorter CDS, in amino acids
        let min_aa = len_q.min(len_s) as f64 / 3.0;
        if (hit.alen as f64) < DEFAULT_MIN_LENGTH_RATIO * min_aa {
            continue;
        }
        if hit.ident < args.min_identity || hit.evalue > DEFAULT_MAX_EVALUE {
            continue;
        }

        let ident = paralogs.entry(&hit.query).or_default().entry(&hit.subject).or_insert(0.0);
        if hit.ident > *ident {
            *ident = hit.ident;
        }
    }

    Ok(paralogs)
}

/// Write the three-column artifact, subjects by descending identity then pid.
fn write_paralogs(
    paralogs: &BTreeMap<&str, BTreeMap<&str, f64>>,
    path: &std::path::Path,
) -> Result<(), Report> {
    crate::utils::create_parent_dir(&path)?;
    let mut file = std::fs::File::create(path)
        .wrap_err_with(|| format!("Unable to create file: {path:?}"))?;

    for (query, subjects) in paralogs {
        let ordered = subjects
            .iter()
            .map(|(pid, ident)| (*pid, *ident))
            .sorted_by(|(pid_a, id_a), (pid_b, id_b)| {
                id_b.partial_cmp(id_a).unwrap_or(std::cmp::Ordering::Equal).then(pid_a.cmp(pid_b))
            })
            .map(|(pid, ident)| format!("{pid} ({ident}%)"))
            .join(", ");
        writeln!(file, "{query}\t{}\t{ordered}", subjects.len())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{colinear_genes, write_catalog_file};
    use color_eyre::eyre::{Report, Result};

    fn hit_line(query: &str, subject: &str, ident: f64, evalue: f64) -> String {
        format!("{query}\t{subject}\t{ident}\t300\t0\t0\t1\t300\t1\t300\t{evalue}\t500")
    }

    fn run(genes_n: i64, lines: &[String]) -> Result<Vec<String>, Report> {
        let dir = tempfile::tempdir()?;
        let genes_path = dir.path().join("genes.tsv");
        let hits_path = dir.path().join("hits.tsv");
        let out_path = dir.path().join("paralogs.tsv");

        write_catalog_file(&genes_path, &colinear_genes(&["A", "B"], genes_n))?;
        std::fs::write(&hits_path, lines.join("\n"))?;

        build(&Args {
            hits: hits_path,
            genes: genes_path,
            output: out_path.clone(),
            min_identity: DEFAULT_MIN_IDENTITY,
        })?;

        Ok(std::fs::read_to_string(&out_path)?.lines().map(String::from).collect())
    }

    #[test]
    fn paralogs_keep_max_identity() -> Result<(), Report> {
        let lines = vec![
            hit_line("A_001", "A_002", 60.0, 1e-30),
            hit_line("A_001", "A_002", 75.0, 1e-25),
            hit_line("A_001", "A_003", 50.0, 1e-30),
        ];
        let observed = run(3, &lines)?;
        assert_eq!(observed, vec!["A_001\t2\tA_002 (75%), A_003 (50%)"]);
        Ok(())
    }

    #[test]
    fn cross_species_and_self_hits_are_ignored() -> Result<(), Report> {
        let lines = vec![
            hit_line("A_001", "A_001", 100.0, 1e-80),
            hit_line("A_001", "B_001", 90.0, 1e-80),
        ];
        let observed = run(2, &lines)?;
        assert!(observed.is_empty());
        Ok(())
    }

    #[test]
    fn weak_hits_are_filtered() -> Result<(), Report> {
        let lines = vec![
            hit_line("A_001", "A_002", 30.0, 1e-30),
            hit_line("A_002", "A_001", 60.0, 1e-10),
        ];
        let observed = run(2, &lines)?;
        assert!(observed.is_empty());
        Ok(())
    }

    #[test]
    fn unknown_pids_upgrade_to_fatal() -> Result<(), Report> {
        // 6 bad hits, each with two unknown pids: the 11th lookup aborts
        let lines =
            (0..6).map(|i| hit_line(&format!("X_{i}"), &format!("Y_{i}"), 90.0, 1e-30)).collect_vec();
        assert!(run(1, &lines).is_err());
        Ok(())
    }
}
