//! Ranker: score the gene content of every break, optionally prune
//! low-quality breaks.
//!
//! Size columns follow the partner-side convention of the break finder:
//! `break_size1` counts genome-2 CDS, so `real_size1` carries the side-2
//! real size (and vice versa). Downstream views consume this cross-indexing
//! as is.

pub mod classify;

use crate::rank::classify::Category;
use crate::store::Store;
use clap::Parser;
use color_eyre::eyre::{Report, Result};
use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use strum::IntoEnumIterator;

/// Score break content; optionally prune low-quality breaks.
#[derive(Clone, Debug, Deserialize, Parser, Serialize)]
pub struct Args {
    /// Path of the store.
    #[clap(short = 'd', long, required = true)]
    pub store: PathBuf,

    /// Remove low-quality breaks after scoring.
    #[clap(short = 'C', long)]
    pub clean: bool,
}

// ----------------------------------------------------------------------------
// Side scores
// ----------------------------------------------------------------------------

/// One gene of a break side, in `pnum_all` order.
#[derive(Clone, Debug)]
struct BreakGene {
    feat: String,
    product: String,
    length: i64,
    delta_gc: f64,
    paralogs_n: i64,
    ortho: Option<String>,
}

/// Content scores of one break side.
#[derive(Clone, Debug, Default)]
struct SideScore {
    counts: BTreeMap<Category, i64>,
    trna: i64,
    trna_ext: i64,
    paralogs: i64,
    /// CDS without an ortholog partner.
    real_size: i64,
    /// Length-weighted mean delta GC over CDS.
    delta_gc: f64,
}

fn score_side(genes: &[BreakGene]) -> SideScore {
    let mut score = SideScore::default();
    let n = genes.len();
    let (mut gc_sum, mut len_sum) = (0.0, 0i64);

    for (i, gene) in genes.iter().enumerate() {
        if gene.feat == "tRNA" {
            score.trna += 1;
            // a tRNA right at an edge counts extended, and again within
            // the outer three positions of a large side
            if i == 0 || i + 1 == n {
                score.trna_ext += 1;
            }
            if n > 10 && (i < 3 || i + 3 >= n) {
                score.trna_ext += 1;
            }
        }

        if gene.feat == "CDS" {
            if gene.paralogs_n > 0 {
                score.paralogs += 1;
            }
            if gene.ortho.is_none() {
                score.real_size += 1;
            }
            gc_sum += gene.delta_gc * gene.length as f64;
            len_sum += gene.length;
        }

        for category in Category::iter() {
            if category.matches(&gene.product) {
                *score.counts.entry(category).or_default() += 1;
            }
        }
    }

    if score.trna > 0 {
        score.counts.insert(Category::TRna, score.trna);
    }
    if len_sum > 0 {
        score.delta_gc = gc_sum / len_sum as f64;
    }

    score
}

/// The stable content string: non-zero category counts in the fixed order.
fn content_string(score: &SideScore) -> String {
    Category::iter()
        .filter_map(|category| {
            let count = score.counts.get(&category).copied().unwrap_or(0);
            (count > 0).then(|| format!("{category}: {count}"))
        })
        .join(", ")
}

/// Two when both sides score, one when exactly one does, zero otherwise.
fn both_sides(side1: i64, side2: i64) -> i64 {
    (side1 > 0) as i64 + (side2 > 0) as i64
}

// ----------------------------------------------------------------------------
// Bad-break pruning
// ----------------------------------------------------------------------------

/// A break is bad when its content is nothing but orthologs: both real
/// sizes zero, or both sides small and mostly orthologous, or a large side
/// with at most a quarter of real genes.
fn is_bad(break_size1: i64, break_size2: i64, real_size1: i64, real_size2: i64) -> bool {
    if real_size1 == 0 && real_size2 == 0 {
        return true;
    }
    if real_size1 * 2 <= break_size1
        && real_size1 <= 2
        && real_size2 * 2 <= break_size2
        && real_size2 <= 2
    {
        return true;
    }
    (break_size1 > 4 && real_size1 * 4 <= break_size1)
        || (break_size2 > 4 && real_size2 * 4 <= break_size2)
}

// ----------------------------------------------------------------------------
// Stage
// ----------------------------------------------------------------------------

/// Ranker stage.
pub fn rank(args: &Args) -> Result<(), Report> {
    let store = Store::open(&args.store)?;
    store.reset_tables(&["breaks_ranking"])?;

    let breaks: Vec<(i64, i64, i64)> = {
        let mut stmt = store
            .conn()
            .prepare("SELECT breakid, break_size1, break_size2 FROM breaks ORDER BY breakid")?;
        let rows =
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let sides = load_sides(&store)?;
    let empty = Vec::new();

    let tx = store.conn().unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO breaks_ranking (breakid, real_size1, real_size2, tRNA_both,
                                         tRNA_both_ext, content1, content2,
                                         paralogs1, paralogs2, delta_GC1, delta_GC2)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        for &(breakid, _, _) in &breaks {
            let side1 = sides.get(&(breakid, 1)).unwrap_or(&empty);
            let side2 = sides.get(&(breakid, 2)).unwrap_or(&empty);
            let score1 = score_side(side1);
            let score2 = score_side(side2);

            stmt.execute(rusqlite::params![
                breakid,
                // real sizes are attributed to the partner side
                score2.real_size,
                score1.real_size,
                both_sides(score1.trna, score2.trna),
                both_sides(score1.trna_ext, score2.trna_ext),
                content_string(&score1),
                content_string(&score2),
                score1.paralogs,
                score2.paralogs,
                score1.delta_gc,
                score2.delta_gc,
            ])?;
        }
    }
    tx.commit()?;
    info!("Ranked {} breaks", breaks.len());

    if args.clean {
        prune(&store)?;
    }

    store.refresh_views()?;
    store.record_stage("rank", &format!("clean={}", args.clean))?;
    Ok(())
}

/// Break genes joined with their gene records, grouped per break side.
fn load_sides(store: &Store) -> Result<BTreeMap<(i64, i64), Vec<BreakGene>>, Report> {
    let mut stmt = store.conn().prepare(
        "SELECT bg.breakid, bg.side, g.feat, g.product, g.length, g.delta_GC,
                g.paralogs_n, bg.ortho
         FROM breaks_genes bg JOIN genes g ON bg.pid = g.pid
         ORDER BY bg.breakid, bg.side, g.pnum_all",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, i64>(1)?,
            BreakGene {
                feat: row.get(2)?,
                product: row.get(3)?,
                length: row.get(4)?,
                delta_gc: row.get(5)?,
                paralogs_n: row.get(6)?,
                ortho: row.get(7)?,
            },
        ))
    })?;

    let mut sides: BTreeMap<(i64, i64), Vec<BreakGene>> = BTreeMap::new();
    for row in rows {
        let (breakid, side, gene) = row?;
        sides.entry((breakid, side)).or_default().push(gene);
    }
    Ok(sides)
}

/// Delete bad breaks; cascades take their opposites, break genes and
/// ranking rows along.
fn prune(store: &Store) -> Result<(), Report> {
    let bad: Vec<i64> = {
        let mut stmt = store.conn().prepare(
            "SELECT b.breakid, b.break_size1, b.break_size2, r.real_size1, r.real_size2
             FROM breaks b JOIN breaks_ranking r ON b.breakid = r.breakid
             ORDER BY b.breakid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        rows.filter_map_ok(|(breakid, bs1, bs2, r1, r2)| {
            is_bad(bs1, bs2, r1, r2).then_some(breakid)
        })
        .collect::<rusqlite::Result<Vec<_>>>()?
    };

    let tx = store.conn().unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached("DELETE FROM breaks WHERE breakid = ?1")?;
        for breakid in &bad {
            // the opposite may already be gone through the cascade
            stmt.execute([breakid])?;
        }
    }
    tx.commit()?;

    info!("Pruned {} bad breaks", bad.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::break_scenario_store;
    use color_eyre::eyre::{Report, Result};

    fn break_gene(feat: &str, product: &str, ortho: Option<&str>) -> BreakGene {
        BreakGene {
            feat: feat.to_string(),
            product: product.to_string(),
            length: 900,
            delta_gc: 0.0,
            paralogs_n: 0,
            ortho: ortho.map(String::from),
        }
    }

    #[test]
    fn side_scores_count_features() {
        let genes = vec![
            break_gene("tRNA", "tRNA-Leu", None),
            break_gene("CDS", "putative integrase", None),
            break_gene("CDS", "ABC transporter", Some("B_010")),
            break_gene("CDS", "hypothetical protein", None),
        ];
        let score = score_side(&genes);

        assert_eq!(score.trna, 1);
        // the tRNA sits at position 0
        assert_eq!(score.trna_ext, 1);
        assert_eq!(score.real_size, 2);
        assert_eq!(score.counts[&Category::Mobile], 1);
        assert_eq!(score.counts[&Category::Transport], 1);
        assert_eq!(content_string(&score), "tRNA: 1, transport: 1, mobile: 1");
    }

    #[test]
    fn trna_ext_rewards_edges_of_large_sides() {
        // 12 genes with tRNA at positions 0, 2 and 6
        let mut genes = vec![break_gene("CDS", "x", None); 12];
        genes[0] = break_gene("tRNA", "tRNA-Gly", None);
        genes[2] = break_gene("tRNA", "tRNA-Asp", None);
        genes[6] = break_gene("tRNA", "tRNA-Met", None);
        let score = score_side(&genes);

        assert_eq!(score.trna, 3);
        // position 0 counts twice (edge + outer three), position 2 once
        assert_eq!(score.trna_ext, 3);
    }

    #[test]
    fn delta_gc_is_length_weighted() {
        let mut a = break_gene("CDS", "x", None);
        a.delta_gc = 0.1;
        a.length = 300;
        let mut b = break_gene("CDS", "y", None);
        b.delta_gc = 0.4;
        b.length = 900;
        let mut t = break_gene("tRNA", "tRNA-Leu", None);
        t.delta_gc = 9.0; // non-CDS, ignored

        let score = score_side(&[a, b, t]);
        let expected = (0.1 * 300.0 + 0.4 * 900.0) / 1200.0;
        assert!((score.delta_gc - expected).abs() < 1e-12);
    }

    #[test]
    fn paralogs_count_cds_with_annotations() {
        let mut gene = break_gene("CDS", "x", None);
        gene.paralogs_n = 3;
        let score = score_side(&[gene, break_gene("CDS", "y", None)]);
        assert_eq!(score.paralogs, 1);
    }

    #[test]
    fn bad_break_rules() {
        // both real sizes zero
        assert!(is_bad(3, 3, 0, 0));
        // both sides small and mostly orthologous
        assert!(is_bad(4, 4, 2, 1));
        // a large side with a quarter of real genes
        assert!(is_bad(20, 2, 5, 2));
        // a proper break: mostly real on both sides
        assert!(!is_bad(4, 3, 3, 3));
        // large but rich side survives
        assert!(!is_bad(20, 2, 6, 2));
    }

    #[test]
    fn ranking_applies_the_real_size_swap() -> Result<(), Report> {
        let (_dir, path) = break_scenario_store()?;

        // strip A_003's partner: the A break now holds two real genes on
        // side 1 (A_003, A_004) and one on side 2 (B_003)
        {
            let store = Store::open(&path)?;
            store
                .conn()
                .execute("UPDATE breaks_genes SET ortho = NULL WHERE pid = 'A_003'", [])?;
        }
        rank(&Args { store: path.clone(), clean: false })?;

        let store = Store::open(&path)?;
        let (r1, r2): (i64, i64) = store.conn().query_row(
            "SELECT r.real_size1, r.real_size2 FROM breaks_ranking r
             JOIN breaks b ON b.breakid = r.breakid WHERE b.sp1 = 'A'",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        // real_size1 carries side 2's count and vice versa
        assert_eq!((r1, r2), (1, 2));
        Ok(())
    }

    #[test]
    fn clean_prunes_all_ortholog_breaks() -> Result<(), Report> {
        let (_dir, path) = break_scenario_store()?;

        // rewrite the break genes so every CDS inside has a partner,
        // making both real sizes zero
        {
            let store = Store::open(&path)?;
            store.conn().execute("UPDATE breaks_genes SET ortho = 'X_001'", [])?;
        }
        rank(&Args { store: path.clone(), clean: true })?;

        let store = Store::open(&path)?;
        let breaks: i64 =
            store.conn().query_row("SELECT COUNT(*) FROM breaks", [], |r| r.get(0))?;
        let rankings: i64 =
            store.conn().query_row("SELECT COUNT(*) FROM breaks_ranking", [], |r| r.get(0))?;
        assert_eq!(breaks, 0);
        assert_eq!(rankings, 0);
        Ok(())
    }
}
