//! Gene order conservation (GOC): a sliding-window score of how well
//! adjacent reference CDS keep adjacent orthologs in a target genome,
//! computed for every ordered species pair.

use crate::store::Store;
use clap::Parser;
use color_eyre::eyre::{Report, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Windows cover this many percent-units of the reference CDS count.
const WINDOW_PROPORTION: usize = 3;

/// Compute sliding-window gene order conservation per species pair.
#[derive(Clone, Debug, Deserialize, Parser, Serialize)]
pub struct Args {
    /// Path of the store.
    #[clap(short = 'd', long, required = true)]
    pub store: PathBuf,
}

/// GOC stage.
pub fn compute(args: &Args) -> Result<(), Report> {
    let store = Store::open(&args.store)?;
    store.reset_tables(&["goc"])?;

    let species: Vec<String> = {
        let mut stmt = store.conn().prepare("SELECT DISTINCT sp FROM genes ORDER BY sp")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut n_windows = 0usize;
    for reference in &species {
        let cds_ref = ordered_pids(&store, reference, true)?;
        let genes_ref = ordered_pids(&store, reference, false)?;

        for target in &species {
            if reference == target {
                continue;
            }
            let cds_tar = ordered_pids(&store, target, true)?;
            let orthologs = ortholog_positions(&store, reference, target)?;

            let windows = score_windows(&cds_ref, &genes_ref, &cds_tar, &orthologs);
            debug!("GOC {reference} vs {target}: {} windows", windows.len());

            let tx = store.conn().unchecked_transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO goc (sp1, sp2, pos, score) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (pos, score) in &windows {
                    stmt.execute(rusqlite::params![reference, target, pos, score])?;
                }
            }
            tx.commit()?;
            n_windows += windows.len();
        }
    }

    info!("Computed {n_windows} GOC windows for {} species", species.len());
    store.record_stage("goc", "")?;
    Ok(())
}

/// All pids of a species along the genome, parts in display order.
fn ordered_pids(store: &Store, sp: &str, cds_only: bool) -> Result<Vec<String>, Report> {
    let sql = match cds_only {
        true => {
            "SELECT g.pid FROM genes g
             JOIN genome_parts gp ON g.sp = gp.sp AND g.gpart = gp.gpart
             WHERE g.feat = 'CDS' AND g.sp = ?1
             ORDER BY gp.min, g.loc_start"
        }
        false => {
            "SELECT g.pid FROM genes g
             JOIN genome_parts gp ON g.sp = gp.sp AND g.gpart = gp.gpart
             WHERE g.sp = ?1
             ORDER BY gp.min, g.loc_start"
        }
    };
    let mut stmt = store.conn().prepare_cached(sql)?;
    let rows = stmt.query_map([sp], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// pid of the target ortholog for every reference pid that has one.
fn ortholog_positions(
    store: &Store,
    reference: &str,
    target: &str,
) -> Result<BTreeMap<String, String>, Report> {
    let mut stmt = store.conn().prepare_cached(
        "SELECT pid1, pid2 FROM orthos_all WHERE sp1 = ?1 AND sp2 = ?2 ORDER BY pid1, pid2",
    )?;
    let rows =
        stmt.query_map([reference, target], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut map = BTreeMap::new();
    for row in rows {
        let (pid1, pid2): (String, String) = row?;
        map.entry(pid1).or_insert(pid2);
    }
    Ok(map)
}

/// Slide a window along the reference CDS list, counting CDS whose
/// ortholog stays adjacent (in either direction) to the next CDS's
/// ortholog in the target. Opening a conserved region credits one extra
/// count. Returns `(pos, score)` rows; `pos` is the index of the window
/// centre within the full reference gene list.
fn score_windows(
    cds_ref: &[String],
    genes_ref: &[String],
    cds_tar: &[String],
    orthologs: &BTreeMap<String, String>,
) -> Vec<(i64, f64)> {
    let limit = cds_ref.len();
    let window_length = (limit as f64 / 100.0).ceil() as usize * WINDOW_PROPORTION;
    if window_length == 0 {
        return Vec::new();
    }

    let tar_index: BTreeMap<&str, usize> =
        cds_tar.iter().enumerate().map(|(i, pid)| (pid.as_str(), i)).collect();
    let gene_index: BTreeMap<&str, usize> =
        genes_ref.iter().enumerate().map(|(i, pid)| (pid.as_str(), i)).collect();

    let tar_ort: Vec<Option<&str>> =
        cds_ref.iter().map(|pid| orthologs.get(pid).map(String::as_str)).collect();

    let mut windows = Vec::new();
    let mut start = 0usize;
    let mut centre = (window_length as f64 / 2.0).ceil() as usize;

    while start + window_length < limit {
        let window = &tar_ort[start..start + window_length];
        let last = window.len() - 1;
        let tar_max = cds_tar.len().saturating_sub(1);

        let mut count = 0usize;
        let mut new_region = true;
        for (i, slot) in window.iter().enumerate() {
            let Some(t) = slot else {
                new_region = true;
                continue;
            };
            if i >= last {
                continue;
            }
            let Some(&it) = tar_index.get(t) else {
                continue;
            };
            if it != tar_max && Some(cds_tar[it + 1].as_str()) == window[i + 1] {
                count += 1;
                if new_region {
                    count += 1;
                    new_region = false;
                }
            } else if i > 0 && it != 0 {
                if Some(cds_tar[it - 1].as_str()) == window[i + 1] {
                    count += 1;
                    if new_region {
                        count += 1;
                        new_region = false;
                    }
                } else {
                    new_region = true;
                }
            }
        }

        let score = count as f64 / window.len() as f64;
        let pos = gene_index.get(cds_ref[centre].as_str()).copied().unwrap_or(centre);
        windows.push((pos as i64, score));

        start += 1;
        centre += 1;
    }

    windows
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    fn pids(sp: &str, n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{sp}_{i:03}")).collect_vec()
    }

    fn colinear_orthologs(n: usize) -> BTreeMap<String, String> {
        (1..=n).map(|i| (format!("A_{i:03}"), format!("B_{i:03}"))).collect()
    }

    #[test]
    fn colinear_genomes_score_one() {
        let a = pids("A", 5);
        let b = pids("B", 5);
        let windows = score_windows(&a, &a, &b, &colinear_orthologs(5));

        // window length 3, two windows, full conservation
        assert_eq!(windows, vec![(2, 1.0), (3, 1.0)]);
    }

    #[test]
    fn inverted_target_still_conserves_neighbors() {
        let a = pids("A", 5);
        let b = pids("B", 5);
        // A_i pairs B_{6-i}: target order reversed
        let orthologs: BTreeMap<String, String> =
            (1..=5).map(|i| (format!("A_{i:03}"), format!("B_{:03}", 6 - i))).collect();
        let windows = score_windows(&a, &a, &b, &orthologs);

        // backward adjacency counts, except at the target boundary gene
        assert_eq!(windows, vec![(2, 2.0 / 3.0), (3, 2.0 / 3.0)]);
    }

    #[test]
    fn missing_orthologs_break_regions() {
        let a = pids("A", 5);
        let b = pids("B", 5);
        let mut orthologs = colinear_orthologs(5);
        orthologs.remove("A_002");
        let windows = score_windows(&a, &a, &b, &orthologs);

        // first window [A_001, -, A_003]: nothing adjacent within it
        assert_eq!(windows[0].1, 0.0);
        // second window [-, A_003, A_004] reopens a region
        assert_eq!(windows[1].1, 2.0 / 3.0);
    }

    #[test]
    fn short_genomes_give_no_windows() {
        let a = pids("A", 3);
        let b = pids("B", 3);
        assert!(score_windows(&a, &a, &b, &colinear_orthologs(3)).is_empty());
    }
}
