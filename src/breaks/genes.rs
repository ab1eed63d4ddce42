//! Break-gene extractor: materialize the gene contents on each side of
//! each break.

use crate::store::Store;
use clap::Parser;
use color_eyre::eyre::{eyre, Report, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Materialize the gene contents on each side of each break.
#[derive(Clone, Debug, Deserialize, Parser, Serialize)]
pub struct Args {
    /// Path of the store.
    #[clap(short = 'd', long, required = true)]
    pub store: PathBuf,
}

#[derive(Clone, Debug)]
struct BreakRow {
    breakid: i64,
    sp1: String,
    sp2: String,
    gpart1: String,
    gpart2: String,
    left1: String,
    right1: String,
    left2: String,
    right2: String,
}

/// Genes ordered per part, and the rank of every pid.
struct GeneRanks {
    by_part: BTreeMap<(String, String), Vec<(i64, String)>>,
    pnum_all: BTreeMap<String, i64>,
}

impl GeneRanks {
    fn load(store: &Store) -> Result<Self, Report> {
        let mut stmt = store
            .conn()
            .prepare("SELECT pid, sp, gpart, pnum_all FROM genes ORDER BY sp, gpart, pnum_all")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut by_part: BTreeMap<(String, String), Vec<(i64, String)>> = BTreeMap::new();
        let mut pnum_all = BTreeMap::new();
        for row in rows {
            let (pid, sp, gpart, pnum) = row?;
            by_part.entry((sp, gpart)).or_default().push((pnum, pid.clone()));
            pnum_all.insert(pid, pnum);
        }
        Ok(GeneRanks { by_part, pnum_all })
    }

    fn rank(&self, pid: &str) -> Result<i64, Report> {
        self.pnum_all
            .get(pid)
            .copied()
            .ok_or_else(|| eyre!("Break flank references a gene missing from the store: {pid}"))
    }

    /// Genes strictly between two flanks, interval ordered min..max
    /// whatever the break direction.
    fn between(&self, sp: &str, gpart: &str, left: &str, right: &str) -> Result<Vec<&str>, Report> {
        let a = self.rank(left)?;
        let b = self.rank(right)?;
        let (min, max) = (a.min(b), a.max(b));

        let genes = self
            .by_part
            .get(&(sp.to_string(), gpart.to_string()))
            .map(|part| {
                part.iter()
                    .filter(|(pnum, _)| *pnum > min && *pnum < max)
                    .map(|(_, pid)| pid.as_str())
                    .collect()
            })
            .unwrap_or_default();
        Ok(genes)
    }
}

/// Break-gene extractor stage.
pub fn extract(args: &Args) -> Result<(), Report> {
    let store = Store::open(&args.store)?;
    store.reset_tables(&["breaks_genes"])?;

    let breaks = load_breaks(&store)?;
    let ranks = GeneRanks::load(&store)?;
    let orthologs = load_ortholog_map(&store)?;

    let tx = store.conn().unchecked_transaction()?;
    let mut n_genes = 0usize;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO breaks_genes (breakid, pid, side, ortho, ortho_in)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;

        for brk in &breaks {
            let side1 = ranks.between(&brk.sp1, &brk.gpart1, &brk.left1, &brk.right1)?;
            let side2 = ranks.between(&brk.sp2, &brk.gpart2, &brk.left2, &brk.right2)?;
            let set1: BTreeSet<&str> = side1.iter().copied().collect();
            let set2: BTreeSet<&str> = side2.iter().copied().collect();

            let empty = BTreeMap::new();
            let fwd = orthologs
                .get(&(brk.sp1.clone(), brk.sp2.clone()))
                .unwrap_or(&empty);
            let bwd = orthologs
                .get(&(brk.sp2.clone(), brk.sp1.clone()))
                .unwrap_or(&empty);

            for (side, genes, partners, other) in
                [(1, &side1, fwd, &set2), (2, &side2, bwd, &set1)]
            {
                for pid in genes {
                    let ortho = partners.get(*pid).map(String::as_str);
                    // a partner landing inside the same break marks a
                    // misplaced ortholog
                    let ortho_in = ortho.is_some_and(|o| other.contains(o));
                    stmt.execute(rusqlite::params![brk.breakid, pid, side, ortho, ortho_in])?;
                    n_genes += 1;
                }
            }
        }
    }
    tx.commit()?;

    info!("Extracted {n_genes} break genes for {} breaks", breaks.len());
    store.refresh_views()?;
    store.record_stage("break_genes", "")?;
    Ok(())
}

fn load_breaks(store: &Store) -> Result<Vec<BreakRow>, Report> {
    let mut stmt = store.conn().prepare(
        "SELECT breakid, sp1, sp2, gpart1, gpart2, left1, right1, left2, right2
         FROM breaks_all ORDER BY breakid",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(BreakRow {
            breakid: row.get(0)?,
            sp1: row.get(1)?,
            sp2: row.get(2)?,
            gpart1: row.get(3)?,
            gpart2: row.get(4)?,
            left1: row.get(5)?,
            right1: row.get(6)?,
            left2: row.get(7)?,
            right2: row.get(8)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// pid1 -> pid2 per ordered species pair.
fn load_ortholog_map(
    store: &Store,
) -> Result<BTreeMap<(String, String), BTreeMap<String, String>>, Report> {
    let mut stmt = store.conn().prepare("SELECT sp1, sp2, pid1, pid2 FROM orthos_all")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut map: BTreeMap<(String, String), BTreeMap<String, String>> = BTreeMap::new();
    for row in rows {
        let (sp1, sp2, pid1, pid2) = row?;
        map.entry((sp1, sp2)).or_default().insert(pid1, pid2);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::break_scenario_store;
    use color_eyre::eyre::{Report, Result};

    fn break_genes(store: &Store, sp1: &str) -> Result<Vec<(String, i64, Option<String>, i64)>, Report> {
        let mut stmt = store.conn().prepare(
            "SELECT bg.pid, bg.side, bg.ortho, bg.ortho_in
             FROM breaks_genes bg JOIN breaks b ON bg.breakid = b.breakid
             WHERE b.sp1 = ?1 ORDER BY bg.side, bg.pid",
        )?;
        let rows = stmt.query_map([sp1], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    #[test]
    fn break_sides_and_misplaced_orthologs() -> Result<(), Report> {
        let (_dir, path) = break_scenario_store()?;
        let store = Store::open(&path)?;

        let observed = break_genes(&store, "A")?;
        assert_eq!(
            observed,
            vec![
                ("A_003".to_string(), 1, Some("B_004".to_string()), 1),
                ("A_004".to_string(), 1, None, 0),
                ("B_003".to_string(), 2, None, 0),
                ("B_004".to_string(), 2, Some("A_003".to_string()), 1),
            ]
        );

        // the mirror break sees the same genes with the sides swapped
        let mirrored = break_genes(&store, "B")?;
        assert_eq!(mirrored.iter().filter(|(_, side, _, _)| *side == 1).count(), 2);
        assert_eq!(mirrored[0].0, "B_003");
        Ok(())
    }

    #[test]
    fn extraction_is_idempotent() -> Result<(), Report> {
        let (_dir, path) = break_scenario_store()?;
        extract(&Args { store: path.clone() })?;

        let store = Store::open(&path)?;
        let n: i64 =
            store.conn().query_row("SELECT COUNT(*) FROM breaks_genes", [], |r| r.get(0))?;
        assert_eq!(n, 8);
        Ok(())
    }
}
