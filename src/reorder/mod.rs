//! Assembly reorderer: renumber the display order of a fragmented genome
//! so its parts align with a complete reference genome.
//!
//! Each part is placed by the median reference position of its orthologs
//! and oriented by the sign trend of those positions. Parts with few,
//! widely scattered orthologs are ambiguous and pinned at the end instead
//! of displacing well-localized ones.

use crate::store::Store;
use clap::Parser;
use color_eyre::eyre::{eyre, Report, Result};
use itertools::Itertools;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Reorder fragmented genome assemblies against a reference.
#[derive(Clone, Debug, Deserialize, Parser, Serialize)]
pub struct Args {
    /// Path of the store.
    #[clap(short = 'd', long, required = true)]
    pub store: PathBuf,

    /// Reorder every fragmented genome against its closest complete one.
    #[clap(short = 'a', long, conflicts_with_all = ["model", "sample"])]
    pub auto: bool,

    /// Reference genome to reorder against.
    #[clap(short = 'm', long, requires = "sample")]
    pub model: Option<String>,

    /// Fragmented genome to reorder.
    #[clap(short = 's', long, requires = "model")]
    pub sample: Option<String>,

    /// Minimum ortholog count before a part can be called ambiguous.
    #[clap(long, default_value_t = 2)]
    pub ambiguous_min_orthologs: i64,

    /// Reference position range above which a part may be ambiguous.
    #[clap(long, default_value_t = 200)]
    pub ambiguous_range: i64,

    /// Ortholog count below which a part may be ambiguous.
    #[clap(long, default_value_t = 50)]
    pub ambiguous_max_count: i64,

    /// Maximum absolute direction trend of an ambiguous part.
    #[clap(long, default_value_t = 20)]
    pub ambiguous_max_cumul: i64,
}

// ----------------------------------------------------------------------------
// Part placement
// ----------------------------------------------------------------------------

/// Placement statistics of one genome part against the reference.
#[derive(Clone, Debug)]
struct PartStats {
    name: String,
    /// Median reference position; `None` sorts after every placed part.
    median: Option<f64>,
    /// Sum of the signs of consecutive reference position differences.
    cumul: i64,
}

impl PartStats {
    /// Summarize the reference positions of a part's orthologs, in gene
    /// order.
    fn new(name: &str, positions: &[i64], args: &Args) -> Self {
        let median = match positions.len() {
            0 => None,
            n if n % 2 == 1 => positions.iter().sorted().nth(n / 2).map(|&p| p as f64),
            n => {
                let sorted = positions.iter().sorted().collect_vec();
                Some((*sorted[n / 2 - 1] as f64 + *sorted[n / 2] as f64) / 2.0)
            }
        };

        let cumul: i64 =
            positions.iter().tuple_windows().map(|(a, b)| (b - a).signum()).sum();

        let count = positions.len() as i64;
        let range = match positions.iter().minmax().into_option() {
            Some((min, max)) => max - min,
            None => 0,
        };

        // a small but widely scattered part gives no trustworthy placement
        let ambiguous = count > args.ambiguous_min_orthologs
            && range > args.ambiguous_range
            && count < args.ambiguous_max_count
            && cumul.abs() <= args.ambiguous_max_cumul;

        PartStats {
            name: name.to_string(),
            median: if ambiguous { None } else { median },
            cumul,
        }
    }

    /// Placed parts by median then name; unplaced parts at the end.
    fn sort_key(&self) -> (f64, &str) {
        (self.median.unwrap_or(f64::INFINITY), &self.name)
    }
}

fn sort_parts(mut parts: Vec<PartStats>) -> Vec<PartStats> {
    parts.sort_by(|a, b| {
        let (ma, na) = a.sort_key();
        let (mb, nb) = b.sort_key();
        ma.partial_cmp(&mb).unwrap_or(std::cmp::Ordering::Equal).then(na.cmp(nb))
    });
    parts
}

// ----------------------------------------------------------------------------
// Stage
// ----------------------------------------------------------------------------

/// Assembly reorderer stage.
pub fn reorder(args: &Args) -> Result<(), Report> {
    let store = Store::open(&args.store)?;

    let jobs: Vec<(String, String)> = if args.auto {
        auto_jobs(&store)?
    } else {
        match (&args.sample, &args.model) {
            (Some(sample), Some(model)) => vec![(sample.clone(), model.clone())],
            _ => return Err(eyre!("Pass either --auto or both --model and --sample.")),
        }
    };

    for (sample, model) in &jobs {
        info!("Reordering {sample} against {model}");
        reorder_genome(&store, sample, model, args)?;
    }

    store.refresh_views()?;
    store.record_stage("reorder", &serde_json::to_string(&jobs)?)?;
    Ok(())
}

/// Pair every fragmented genome with the complete genome sharing the most
/// orthologs.
fn auto_jobs(store: &Store) -> Result<Vec<(String, String)>, Report> {
    let part_counts: Vec<(String, i64)> = {
        let mut stmt = store
            .conn()
            .prepare("SELECT sp, COUNT(*) FROM genome_parts GROUP BY sp ORDER BY sp")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let fragmented = part_counts.iter().filter(|(_, n)| *n > 1).map(|(sp, _)| sp).collect_vec();
    let complete = part_counts.iter().filter(|(_, n)| *n == 1).map(|(sp, _)| sp).collect_vec();

    let mut jobs = Vec::new();
    for sample in fragmented {
        let mut best: Option<(i64, &String)> = None;
        for &model in &complete {
            let shared: i64 = store.conn().query_row(
                "SELECT COUNT(*) FROM orthos_all WHERE sp1 = ?1 AND sp2 = ?2",
                [sample, model],
                |row| row.get(0),
            )?;
            // ties go to the alphabetically first reference
            if best.is_none() || best.is_some_and(|(n, _)| shared > n) {
                best = Some((shared, model));
            }
        }
        match best {
            Some((shared, model)) if shared > 0 => jobs.push((sample.clone(), model.clone())),
            _ => warn!("No complete reference shares orthologs with {sample}, skipping"),
        }
    }

    Ok(jobs)
}

fn reorder_genome(store: &Store, sample: &str, model: &str, args: &Args) -> Result<(), Report> {
    // sample genes per part, in original order
    let mut parts: BTreeMap<String, Vec<String>> = BTreeMap::new();
    {
        let mut stmt = store.conn().prepare_cached(
            "SELECT gpart, pid FROM genes WHERE sp = ?1 ORDER BY gpart, pnum_all",
        )?;
        let rows =
            stmt.query_map([sample], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?;
        for row in rows {
            let (gpart, pid) = row?;
            parts.entry(gpart).or_default().push(pid);
        }
    }
    if parts.is_empty() {
        return Err(eyre!("Genome {sample} has no genes in the store."));
    }

    // reference position of every sample gene with an ortholog
    let ortho_pos: BTreeMap<String, i64> = {
        let mut stmt = store.conn().prepare_cached(
            "SELECT pid1, pnum_all2 FROM orthos_all WHERE sp1 = ?1 AND sp2 = ?2
             ORDER BY pid1, pnum_all2",
        )?;
        let rows = stmt.query_map([sample, model], |row| {
            Ok((row.get::<_, String>(0)?, row.get(1)?))
        })?;
        let mut map = BTreeMap::new();
        for row in rows {
            let (pid, pos) = row?;
            map.entry(pid).or_insert(pos);
        }
        map
    };

    let stats = parts
        .iter()
        .map(|(name, pids)| {
            let positions =
                pids.iter().filter_map(|pid| ortho_pos.get(pid).copied()).collect_vec();
            PartStats::new(name, &positions, args)
        })
        .collect_vec();

    // place parts, orient each, renumber densely
    let mut display = Vec::new();
    for part in sort_parts(stats) {
        debug!("Part {} placed at {:?}, cumul {}", part.name, part.median, part.cumul);
        let mut pids = parts.remove(&part.name).unwrap_or_default();
        if part.cumul < 0 {
            pids.reverse();
        }
        display.extend(pids);
    }

    let tx = store.conn().unchecked_transaction()?;
    {
        let mut stmt =
            tx.prepare_cached("UPDATE genes SET pnum_display = ?1 WHERE pid = ?2")?;
        for (rank, pid) in display.iter().enumerate() {
            stmt.execute(rusqlite::params![rank as i64 + 1, pid])?;
        }

        tx.execute(
            "UPDATE genome_parts SET
                 min = (SELECT MIN(pnum_display) FROM genes g
                        WHERE g.sp = genome_parts.sp AND g.gpart = genome_parts.gpart),
                 max = (SELECT MAX(pnum_display) FROM genes g
                        WHERE g.sp = genome_parts.sp AND g.gpart = genome_parts.gpart)
             WHERE sp = ?1",
            [sample],
        )?;
        tx.execute(
            "UPDATE genomes SET max_pnum_display =
                 (SELECT MAX(pnum_display) FROM genes WHERE sp = ?1)
             WHERE sp = ?1",
            [sample],
        )?;
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Feature;
    use crate::testutil::{gene, gene_in_part, seed_genes, seed_ortho};
    use color_eyre::eyre::{Report, Result};

    fn default_args(path: &std::path::Path) -> Args {
        Args {
            store: path.to_path_buf(),
            auto: false,
            model: Some("M".to_string()),
            sample: Some("S".to_string()),
            ambiguous_min_orthologs: 2,
            ambiguous_range: 200,
            ambiguous_max_count: 50,
            ambiguous_max_cumul: 20,
        }
    }

    fn stats(name: &str, positions: &[i64]) -> PartStats {
        let dir = std::path::PathBuf::new();
        PartStats::new(name, positions, &default_args(&dir))
    }

    #[test]
    fn parts_sort_by_median_with_empty_last() {
        let parts = vec![
            stats("p1", &[100, 103, 106]),
            stats("p2", &[4, 5, 6]),
            stats("p3", &[46, 47, 48]),
            stats("p4", &[]),
        ];
        let order = sort_parts(parts).into_iter().map(|p| p.name).collect_vec();
        assert_eq!(order, vec!["p2", "p3", "p1", "p4"]);
    }

    #[test]
    fn median_averages_even_counts() {
        let part = stats("p", &[10, 20, 30, 40]);
        assert_eq!(part.median, Some(25.0));
    }

    #[test]
    fn scattered_small_parts_are_ambiguous() {
        // 4 orthologs spread over 900 reference positions, no trend
        let part = stats("p", &[10, 910, 20, 930]);
        assert_eq!(part.median, None);
        // a strongly trending part of the same spread stays placed
        let args = Args { ambiguous_max_cumul: 2, ..default_args(&std::path::PathBuf::new()) };
        let part = PartStats::new("p", &[10, 20, 910, 930], &args);
        assert_eq!(part.median, Some(465.0));
    }

    #[test]
    fn reversed_parts_flip() {
        let part = stats("p", &[30, 20, 10]);
        assert_eq!(part.cumul, -2);
    }

    fn two_part_store() -> Result<(tempfile::TempDir, PathBuf), Report> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.db");
        let store = Store::open(&path)?;

        let mut genes = Vec::new();
        for i in 1..=10 {
            genes.push(gene(&format!("M_{i:03}"), "M", i, Feature::Cds));
        }
        for i in 1..=3 {
            genes.push(gene_in_part(&format!("S_1{i:02}"), "S", "p1", i, Feature::Cds));
            genes.push(gene_in_part(&format!("S_2{i:02}"), "S", "p2", i, Feature::Cds));
        }
        seed_genes(&store, &genes)?;

        // p1 maps late in the reference, p2 early and reversed
        for (pid, mpos, order) in [
            ("S_101", 7, 1),
            ("S_102", 8, 2),
            ("S_103", 9, 3),
            ("S_201", 3, 4),
            ("S_202", 2, 5),
            ("S_203", 1, 6),
        ] {
            seed_ortho(&store, pid, &format!("M_{mpos:03}"), order, mpos)?;
        }
        store.refresh_views()?;
        Ok((dir, path))
    }

    fn display_order(store: &Store) -> Result<Vec<String>, Report> {
        let mut stmt = store
            .conn()
            .prepare("SELECT pid FROM genes WHERE sp = 'S' ORDER BY pnum_display")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[test]
    fn reorder_places_and_orients_parts() -> Result<(), Report> {
        let (_dir, path) = two_part_store()?;
        reorder(&default_args(&path))?;

        let store = Store::open(&path)?;
        // p2 (median 2) precedes p1 (median 8); p2 runs backwards, so its
        // genes flip
        assert_eq!(
            display_order(&store)?,
            vec!["S_203", "S_202", "S_201", "S_101", "S_102", "S_103"]
        );

        let (min, max): (i64, i64) = store.conn().query_row(
            "SELECT min, max FROM genome_parts WHERE sp = 'S' AND gpart = 'p2'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        assert_eq!((min, max), (1, 3));
        Ok(())
    }

    #[test]
    fn reordering_twice_is_idempotent() -> Result<(), Report> {
        let (_dir, path) = two_part_store()?;
        reorder(&default_args(&path))?;
        let store = Store::open(&path)?;
        let first = display_order(&store)?;
        drop(store);

        reorder(&default_args(&path))?;
        let store = Store::open(&path)?;
        assert_eq!(display_order(&store)?, first);
        Ok(())
    }

    #[test]
    fn auto_picks_the_closest_complete_genome() -> Result<(), Report> {
        let (_dir, path) = two_part_store()?;
        // a second complete genome sharing a single ortholog
        {
            let store = Store::open(&path)?;
            seed_genes(&store, &[gene("Z_001", "Z", 1, Feature::Cds)])?;
            seed_ortho(&store, "S_101", "Z_001", 1, 1)?;
            store.refresh_views()?;
        }

        let args = Args {
            auto: true,
            model: None,
            sample: None,
            ..default_args(&path)
        };
        reorder(&args)?;

        let store = Store::open(&path)?;
        // M shares six orthologs, Z one: S is reordered against M
        assert_eq!(display_order(&store)?[0], "S_203");
        Ok(())
    }
}
