//! Block finder: aggregate consecutive ortholog pairs into maximal synteny
//! blocks.
//!
//! A pair link joins two ortho pairs that are consecutive along genome 1
//! and consecutive in either direction along genome 2, within a CDS gap
//! tolerance on both sides. Directionally consistent links form a disjoint
//! union of paths; the greedy extension below yields exactly those paths,
//! which is the unique maximal decomposition.

use crate::store::Store;
use clap::Parser;
use color_eyre::eyre::{Report, Result};
use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

pub const DEFAULT_TOLERANCE: i64 = 2;

/// Aggregate consecutive ortholog pairs into maximal synteny blocks.
#[derive(Clone, Debug, Deserialize, Parser, Serialize)]
pub struct Args {
    /// Path of the store.
    #[clap(short = 'd', long, required = true)]
    pub store: PathBuf,

    /// Tolerated CDS gap between linked ortho pairs.
    #[clap(short = 't', long, default_value_t = DEFAULT_TOLERANCE)]
    pub tolerance: i64,
}

// ----------------------------------------------------------------------------
// Rows
// ----------------------------------------------------------------------------

/// One `orthos_all` row, the block finder's working set.
#[derive(Clone, Debug)]
struct OrthoRow {
    oid: i64,
    gpart1: String,
    gpart2: String,
    pnum_cds1: i64,
    pnum_cds2: i64,
    pnum_order1: i64,
    pnum_order2: i64,
}

#[derive(Clone, Debug)]
struct Link {
    start: usize,
    end: usize,
    direction: i64,
}

#[derive(Clone, Debug)]
struct Block {
    start: usize,
    end: usize,
    direction: i64,
    size: i64,
}

// ----------------------------------------------------------------------------
// Stage
// ----------------------------------------------------------------------------

/// Block finder stage.
pub fn find(args: &Args) -> Result<(), Report> {
    let store = Store::open(&args.store)?;
    // breaks reference blocks, so the whole derived chain goes first
    store.reset_tables(&["breaks_genes", "breaks_ranking", "breaks", "pairs", "blocks"])?;
    store.conn().execute("UPDATE orthos SET noblock = 0", [])?;

    let species_pairs: Vec<(String, String)> = {
        let mut stmt =
            store.conn().prepare("SELECT DISTINCT sp1, sp2 FROM orthos_all ORDER BY sp1, sp2")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut n_blocks = 0;
    for (sp1, sp2) in &species_pairs {
        let rows = load_orthos(&store, sp1, sp2)?;
        let links = find_links(&rows, args.tolerance);
        let n_links = links.len();
        mark_noblock(&store, &rows, &links)?;
        insert_links(&store, sp1, sp2, &rows, &links)?;

        let blocks = extend_blocks(&rows, links);
        insert_blocks(&store, sp1, sp2, &rows, &blocks)?;
        debug!("{sp1} vs {sp2}: {n_links} links, {} blocks", blocks.len());
        n_blocks += blocks.len();
    }

    info!("Found {n_blocks} synteny blocks across {} species pairs", species_pairs.len());
    store.refresh_views()?;
    store.record_stage("blocks", &format!("tolerance={}", args.tolerance))?;
    Ok(())
}

fn load_orthos(store: &Store, sp1: &str, sp2: &str) -> Result<Vec<OrthoRow>, Report> {
    let mut stmt = store.conn().prepare_cached(
        "SELECT oid, gpart1, gpart2, pnum_CDS1, pnum_CDS2, pnum_order1, pnum_order2
         FROM orthos_all WHERE sp1 = ?1 AND sp2 = ?2
         ORDER BY pnum_order1",
    )?;
    let rows = stmt.query_map([sp1, sp2], |row| {
        Ok(OrthoRow {
            oid: row.get(0)?,
            gpart1: row.get(1)?,
            gpart2: row.get(2)?,
            pnum_cds1: row.get(3)?,
            pnum_cds2: row.get(4)?,
            pnum_order1: row.get(5)?,
            pnum_order2: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Build the pair links of one species pair. Rows are ordered by
/// `pnum_order1`, so only adjacent rows can satisfy the order-1 condition.
fn find_links(rows: &[OrthoRow], tolerance: i64) -> Vec<Link> {
    let mut links = Vec::new();

    for (i, j) in (0..rows.len()).tuple_windows() {
        let (s, e) = (&rows[i], &rows[j]);
        if e.pnum_order1 != s.pnum_order1 + 1 {
            continue;
        }
        // pnum_CDS arithmetic is only meaningful within one genome part
        if s.gpart1 != e.gpart1 || s.gpart2 != e.gpart2 {
            continue;
        }
        // genome 1: forward within tolerance
        if e.pnum_cds1 <= s.pnum_cds1 || e.pnum_cds1 >= s.pnum_cds1 + 2 + tolerance {
            continue;
        }
        // genome 2: the same relation, in either direction
        let forward = e.pnum_order2 == s.pnum_order2 + 1
            && e.pnum_cds2 > s.pnum_cds2
            && e.pnum_cds2 < s.pnum_cds2 + 2 + tolerance;
        let reverse = e.pnum_order2 == s.pnum_order2 - 1
            && e.pnum_cds2 < s.pnum_cds2
            && e.pnum_cds2 > s.pnum_cds2 - 2 - tolerance;
        if forward || reverse {
            links.push(Link {
                start: i,
                end: j,
                direction: e.pnum_order2 - s.pnum_order2,
            });
        }
    }

    links
}

/// Orthos that are no endpoint of any link never enter a block.
fn mark_noblock(store: &Store, rows: &[OrthoRow], links: &[Link]) -> Result<(), Report> {
    let linked: BTreeSet<usize> =
        links.iter().flat_map(|l| [l.start, l.end]).collect();

    let tx = store.conn().unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached("UPDATE orthos SET noblock = 1 WHERE oid = ?1")?;
        for (i, row) in rows.iter().enumerate() {
            if !linked.contains(&i) {
                stmt.execute([row.oid])?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}

fn insert_links(
    store: &Store,
    sp1: &str,
    sp2: &str,
    rows: &[OrthoRow],
    links: &[Link],
) -> Result<(), Report> {
    let tx = store.conn().unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO pairs (sp1, sp2, oid_start, oid_end, direction, inblocks1, inblocks2)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for link in links {
            let (s, e) = (&rows[link.start], &rows[link.end]);
            stmt.execute(rusqlite::params![
                sp1,
                sp2,
                s.oid,
                e.oid,
                link.direction,
                e.pnum_cds1 - s.pnum_cds1 - 1,
                (e.pnum_cds2 - s.pnum_cds2).abs() - 1,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Greedy maximal extension: start from any unconsumed link, prepend while
/// a link ends at the block start, append while one starts at the block end.
fn extend_blocks(rows: &[OrthoRow], links: Vec<Link>) -> Vec<Block> {
    let mut by_start: BTreeMap<i64, usize> = BTreeMap::new();
    let mut by_end: BTreeMap<i64, usize> = BTreeMap::new();
    for (i, link) in links.iter().enumerate() {
        by_start.insert(rows[link.start].oid, i);
        by_end.insert(rows[link.end].oid, i);
    }

    let mut consumed = vec![false; links.len()];
    let mut blocks = Vec::new();

    for i in 0..links.len() {
        if consumed[i] {
            continue;
        }
        let link = &links[i];
        consumed[i] = true;
        by_start.remove(&rows[link.start].oid);
        by_end.remove(&rows[link.end].oid);

        let mut block =
            Block { start: link.start, end: link.end, direction: link.direction, size: 2 };

        // absorb links ending at the block start
        while let Some(&j) = by_end.get(&rows[block.start].oid) {
            consumed[j] = true;
            by_end.remove(&rows[block.start].oid);
            by_start.remove(&rows[links[j].start].oid);
            debug_assert_eq!(links[j].direction, block.direction);
            block.start = links[j].start;
            block.size += 1;
        }
        // adopt links starting at the block end
        while let Some(&j) = by_start.get(&rows[block.end].oid) {
            consumed[j] = true;
            by_start.remove(&rows[block.end].oid);
            by_end.remove(&rows[links[j].end].oid);
            debug_assert_eq!(links[j].direction, block.direction);
            block.end = links[j].end;
            block.size += 1;
        }

        blocks.push(block);
    }

    blocks
}

/// Insert blocks with their per-bucket orders: rank within
/// `(sp1, sp2, gpart1, gpart2, direction)` by the starting `pnum_CDS` on
/// each genome.
fn insert_blocks(
    store: &Store,
    sp1: &str,
    sp2: &str,
    rows: &[OrthoRow],
    blocks: &[Block],
) -> Result<(), Report> {
    // bucket key for a block, taken from its start ortho
    let bucket = |b: &Block| {
        let s = &rows[b.start];
        (s.gpart1.clone(), s.gpart2.clone(), b.direction)
    };

    let mut order1: BTreeMap<usize, i64> = BTreeMap::new();
    let mut order2: BTreeMap<usize, i64> = BTreeMap::new();
    let buckets: BTreeSet<_> = blocks.iter().map(&bucket).collect();
    for key in buckets {
        let members =
            blocks.iter().enumerate().filter(|&(_, b)| bucket(b) == key).collect_vec();
        for (rank, (i, _)) in members
            .iter()
            .sorted_by_key(|(_, b)| rows[b.start].pnum_cds1)
            .enumerate()
        {
            order1.insert(*i, rank as i64 + 1);
        }
        for (rank, (i, _)) in members
            .iter()
            .sorted_by_key(|(_, b)| rows[b.start].pnum_cds2)
            .enumerate()
        {
            order2.insert(*i, rank as i64 + 1);
        }
    }

    let tx = store.conn().unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO blocks (sp1, sp2, oid_start, oid_end, direction, block_size,
                                 block_order1, block_order2)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        let ordered = blocks
            .iter()
            .enumerate()
            .sorted_by_key(|(_, b)| {
                let s = &rows[b.start];
                (s.gpart1.clone(), s.gpart2.clone(), b.direction, s.pnum_cds1)
            })
            .collect_vec();
        for (i, block) in ordered {
            stmt.execute(rusqlite::params![
                sp1,
                sp2,
                rows[block.start].oid,
                rows[block.end].oid,
                block.direction,
                block.size,
                order1[&i],
                order2[&i],
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Feature;
    use crate::testutil::{colinear_genes, gene, seed_colinear_orthos, seed_genes, seed_ortho};
    use color_eyre::eyre::{Report, Result};

    fn find_in(store: &Store, tolerance: i64) -> Result<(), Report> {
        // drive the stage logic against an in-memory store
        let species_pairs: Vec<(String, String)> = {
            let mut stmt = store
                .conn()
                .prepare("SELECT DISTINCT sp1, sp2 FROM orthos_all ORDER BY sp1, sp2")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        for (sp1, sp2) in &species_pairs {
            let rows = load_orthos(store, sp1, sp2)?;
            let links = find_links(&rows, tolerance);
            mark_noblock(store, &rows, &links)?;
            insert_links(store, sp1, sp2, &rows, &links)?;
            let blocks = extend_blocks(&rows, links);
            insert_blocks(store, sp1, sp2, &rows, &blocks)?;
        }
        store.refresh_views()?;
        Ok(())
    }

    fn block_rows(store: &Store, sp1: &str, sp2: &str) -> Result<Vec<(i64, i64, i64)>, Report> {
        let mut stmt = store.conn().prepare(
            "SELECT block_size, direction, block_order1 FROM blocks
             WHERE sp1 = ?1 AND sp2 = ?2 ORDER BY block_order1",
        )?;
        let rows = stmt.query_map([sp1, sp2], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[test]
    fn perfect_colinearity_gives_one_block() -> Result<(), Report> {
        let store = Store::in_memory()?;
        seed_genes(&store, &colinear_genes(&["A", "B"], 5))?;
        seed_colinear_orthos(&store, "A", "B", 5)?;
        find_in(&store, DEFAULT_TOLERANCE)?;

        assert_eq!(block_rows(&store, "A", "B")?, vec![(5, 1, 1)]);
        assert_eq!(block_rows(&store, "B", "A")?, vec![(5, 1, 1)]);
        let noblock: i64 =
            store.conn().query_row("SELECT COUNT(*) FROM orthos WHERE noblock = 1", [], |r| {
                r.get(0)
            })?;
        assert_eq!(noblock, 0);
        Ok(())
    }

    #[test]
    fn gap_beyond_tolerance_splits_blocks() -> Result<(), Report> {
        let store = Store::in_memory()?;
        let mut genes = colinear_genes(&["B"], 5);
        // A has 5 orthologous CDS but a stretch of extra CDS after the third
        for i in 1..=3 {
            genes.push(gene(&format!("A_{i:03}"), "A", i, Feature::Cds));
        }
        for i in 4..=5 {
            // shifted by 5 unshared CDS
            genes.push(gene(&format!("A_{i:03}"), "A", i + 5, Feature::Cds));
        }
        for i in 1..=5 {
            genes.push(gene(&format!("A_9{i:02}"), "A", i + 3, Feature::Cds));
        }
        seed_genes(&store, &genes)?;
        for i in 1..=5i64 {
            seed_ortho(&store, &format!("A_{i:03}"), &format!("B_{i:03}"), i, i)?;
        }
        store.refresh_views()?;
        find_in(&store, DEFAULT_TOLERANCE)?;

        // CDS gap of 5 on genome 1 exceeds 2 + tolerance
        assert_eq!(block_rows(&store, "A", "B")?, vec![(3, 1, 1), (2, 1, 2)]);
        Ok(())
    }

    #[test]
    fn inversion_gets_reverse_direction() -> Result<(), Report> {
        let store = Store::in_memory()?;
        seed_genes(&store, &colinear_genes(&["A", "B"], 4))?;
        // genome 2 runs backwards: A_i pairs B_{5-i}
        for i in 1..=4i64 {
            seed_ortho(&store, &format!("A_{i:03}"), &format!("B_{:03}", 5 - i), i, 5 - i)?;
        }
        store.refresh_views()?;
        find_in(&store, DEFAULT_TOLERANCE)?;

        assert_eq!(block_rows(&store, "A", "B")?, vec![(4, -1, 1)]);
        Ok(())
    }

    #[test]
    fn isolated_ortho_is_noblock() -> Result<(), Report> {
        let store = Store::in_memory()?;
        seed_genes(&store, &colinear_genes(&["A", "B"], 9))?;
        // two consecutive pairs, then one far-away singleton
        seed_ortho(&store, "A_001", "B_001", 1, 1)?;
        seed_ortho(&store, "A_002", "B_002", 2, 2)?;
        seed_ortho(&store, "A_009", "B_005", 3, 3)?;
        store.refresh_views()?;
        find_in(&store, DEFAULT_TOLERANCE)?;

        assert_eq!(block_rows(&store, "A", "B")?, vec![(2, 1, 1)]);
        let noblock: Vec<String> = {
            let mut stmt =
                store.conn().prepare("SELECT pid1 FROM orthos WHERE noblock = 1 ORDER BY pid1")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        assert_eq!(noblock, vec!["A_009"]);
        Ok(())
    }

    #[test]
    fn links_chain_across_small_gaps() -> Result<(), Report> {
        let store = Store::in_memory()?;
        let mut genes = Vec::new();
        // genome 1 has an extra CDS between each orthologous pair
        for i in 1..=3i64 {
            genes.push(gene(&format!("A_{i:03}"), "A", i * 2 - 1, Feature::Cds));
            genes.push(gene(&format!("A_x{i:02}"), "A", i * 2, Feature::Cds));
            genes.push(gene(&format!("B_{i:03}"), "B", i, Feature::Cds));
        }
        seed_genes(&store, &genes)?;
        for i in 1..=3i64 {
            seed_ortho(&store, &format!("A_{i:03}"), &format!("B_{i:03}"), i, i)?;
        }
        store.refresh_views()?;
        find_in(&store, DEFAULT_TOLERANCE)?;

        // CDS gaps of 1 are within the default tolerance
        assert_eq!(block_rows(&store, "A", "B")?, vec![(3, 1, 1)]);
        Ok(())
    }
}
