//! Shared helpers for unit tests: synthetic genes and pre-seeded stores.

use crate::catalog::{Feature, Gene};
use crate::store::Store;
use crate::{blocks, breaks};
use color_eyre::eyre::{Report, Result};
use std::path::PathBuf;

/// A synthetic single-part gene; `pnum` doubles as every rank and as the
/// kilobase coordinate.
pub fn gene(pid: &str, sp: &str, pnum: i64, feat: Feature) -> Gene {
    gene_in_part(pid, sp, "chr", pnum, feat)
}

pub fn gene_in_part(pid: &str, sp: &str, gpart: &str, pnum: i64, feat: Feature) -> Gene {
    Gene {
        pid: pid.to_string(),
        sp: sp.to_string(),
        gpart: gpart.to_string(),
        pnum_all: pnum,
        pnum_cds: if feat == Feature::Cds { pnum } else { -1 },
        pnum_display: pnum,
        feat,
        loc_start: pnum * 1000,
        loc_end: pnum * 1000 + 900,
        strand: 1,
        length: 900,
        product: "hypothetical protein".to_string(),
        gc: 0.5,
        delta_gc: 0.0,
        paralogs_n: 0,
        paralogs: None,
    }
}

/// A catalog of `n` colinear CDS for each listed species, pids `{sp}_{i:03}`.
pub fn colinear_genes(species: &[&str], n: i64) -> Vec<Gene> {
    let mut genes = Vec::new();
    for sp in species {
        for i in 1..=n {
            genes.push(gene(&format!("{sp}_{i:03}"), sp, i, Feature::Cds));
        }
    }
    genes
}

/// Write a gene catalog file with the input-contract header.
pub fn write_catalog_file(path: &std::path::Path, genes: &[Gene]) -> Result<(), Report> {
    use crate::utils::table::Table;
    let mut table = Table::new();
    table.headers =
        "sp\tgpart\tpid\tpnum_CDS\tpnum_all\tfeat\tloc_start\tloc_end\tstrand\tlength\tsequence\tproduct\tGC\tdelta_GC"
            .split('\t')
            .map(String::from)
            .collect();
    for g in genes {
        table.rows.push(vec![
            g.sp.clone(),
            g.gpart.clone(),
            g.pid.clone(),
            g.pnum_cds.to_string(),
            g.pnum_all.to_string(),
            g.feat.to_string(),
            g.loc_start.to_string(),
            g.loc_end.to_string(),
            g.strand.to_string(),
            g.length.to_string(),
            "ATG".to_string(),
            g.product.clone(),
            g.gc.to_string(),
            g.delta_gc.to_string(),
        ]);
    }
    table.write(path)
}

/// Insert genes directly into a store, bypassing the catalog file.
pub fn seed_genes(store: &Store, genes: &[Gene]) -> Result<(), Report> {
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

/// A store with one break per orientation between species A and B: six CDS
/// each, `A_003`/`A_004` and `B_003`/`B_004` inside the break, with the
/// crossed pair `A_003 <-> B_004` misplaced into it. Blocks found with
/// tolerance 0, breaks with no included blocks, break genes extracted.
pub fn break_scenario_store() -> Result<(tempfile::TempDir, PathBuf), Report> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store.db");
    let store = Store::open(&path)?;

    let mut genes = Vec::new();
    for sp in ["A", "B"] {
        for i in 1..=6 {
            genes.push(gene(&format!("{sp}_{i:03}"), sp, i, Feature::Cds));
        }
    }
    seed_genes(&store, &genes)?;

    for (pid1, pid2, o1, o2, r1, r2) in [
        ("A_001", "B_001", 1, 1, 1, 1),
        ("A_002", "B_002", 2, 2, 2, 2),
        ("A_003", "B_004", 3, 3, 3, 3),
        ("A_005", "B_005", 4, 4, 4, 4),
        ("A_006", "B_006", 5, 5, 5, 5),
    ] {
        seed_ortho(&store, pid1, pid2, o1, o2)?;
        seed_ortho(&store, pid2, pid1, r1, r2)?;
    }
    store.refresh_views()?;
    drop(store);

    blocks::find(&blocks::Args { store: path.clone(), tolerance: 0 })?;
    breaks::find(&breaks::Args { store: path.clone(), max_included_blocks: 0 })?;
    breaks::genes::extract(&breaks::genes::Args { store: path.clone() })?;
    Ok((dir, path))
}

/// Insert one ortholog pair with explicit per-genome orders.
pub fn seed_ortho(
    store: &Store,
    pid1: &str,
    pid2: &str,
    order1: i64,
    order2: i64,
) -> Result<(), Report> {
    store.conn().execute(
        "INSERT INTO orthos (pid1, pid2, o_ident, o_alen, pnum_order1, pnum_order2)
         VALUES (?1, ?2, 100.0, 300, ?3, ?4)",
        rusqlite::params![pid1, pid2, order1, order2],
    )?;
    Ok(())
}

/// Insert ortholog pairs `(sp1_i, sp2_i)` for every CDS of `sp1`, in both
/// orientations, with orders matching the colinear layout.
pub fn seed_colinear_orthos(store: &Store, sp1: &str, sp2: &str, n: i64) -> Result<(), Report> {
    let tx = store.conn().unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO orthos (pid1, pid2, o_ident, o_alen, pnum_order1, pnum_order2)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for i in 1..=n {
            let pid1 = format!("{sp1}_{i:03}");
            let pid2 = format!("{sp2}_{i:03}");
            stmt.execute(rusqlite::params![pid1, pid2, 100.0, 300, i, i])?;
            stmt.execute(rusqlite::params![pid2, pid1, 100.0, 300, i, i])?;
        }
    }
    tx.commit()?;
    store.refresh_views()?;
    Ok(())
}
