//! Break finder: derive breaks between near-consecutive blocks, keep the
//! shortest break at every endpoint, match opposites across the two
//! orientations of each species pair, and fingerprint the survivors.

pub mod genes;

use crate::store::Store;
use clap::Parser;
use color_eyre::eyre::{Report, Result};
use itertools::Itertools;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_MAX_INCLUDED_BLOCKS: i64 = 0;

/// Derive breaks between near-consecutive blocks.
#[derive(Clone, Debug, Deserialize, Parser, Serialize)]
pub struct Args {
    /// Path of the store.
    #[clap(short = 'd', long, required = true)]
    pub store: PathBuf,

    /// Maximum number of blocks included inside a break.
    #[clap(short = 'b', long, default_value_t = DEFAULT_MAX_INCLUDED_BLOCKS)]
    pub max_included_blocks: i64,
}

// ----------------------------------------------------------------------------
// Rows
// ----------------------------------------------------------------------------

/// One `blocks_all` row, the break finder's working set.
#[derive(Clone, Debug)]
struct BlockRow {
    blockid: i64,
    sp1: String,
    sp2: String,
    gpart1: String,
    gpart2: String,
    direction: i64,
    order1: i64,
    order2: i64,
    cds_start1: i64,
    cds_end1: i64,
    cds_start2: i64,
    cds_end2: i64,
    pid_start1: String,
    pid_end1: String,
    pid_start2: String,
    pid_end2: String,
}

/// A break candidate between two blocks of one bucket.
#[derive(Clone, Debug)]
struct BreakDraft {
    sp1: String,
    sp2: String,
    gpart1: String,
    gpart2: String,
    direction: i64,
    left_block: i64,
    right_block: i64,
    break_size1: i64,
    break_size2: i64,
    inblocks1: i64,
    inblocks2: i64,
    /// Flanking gene ids: last/first genes of the adjacent blocks.
    left1: String,
    right1: String,
    left2: String,
    right2: String,
    left_order1: i64,
    opposite: Option<usize>,
}

// ----------------------------------------------------------------------------
// Stage
// ----------------------------------------------------------------------------

/// Break finder stage.
pub fn find(args: &Args) -> Result<(), Report> {
    let store = Store::open(&args.store)?;
    // children first: their foreign keys point at breaks
    store.reset_tables(&["breaks_genes", "breaks_ranking", "breaks"])?;

    let rows = load_blocks(&store)?;

    // bucket by (sp1, sp2, gpart1, gpart2, direction)
    let mut buckets: BTreeMap<(String, String, String, String, i64), Vec<&BlockRow>> =
        BTreeMap::new();
    for row in &rows {
        let key = (
            row.sp1.clone(),
            row.sp2.clone(),
            row.gpart1.clone(),
            row.gpart2.clone(),
            row.direction,
        );
        buckets.entry(key).or_default().push(row);
    }

    let mut drafts = Vec::new();
    for bucket in buckets.values_mut() {
        bucket.sort_by_key(|b| b.order1);
        let candidates = candidates(bucket, args.max_included_blocks);
        drafts.extend(cleanup(candidates));
    }

    // deterministic numbering before opposite matching
    drafts.sort_by(|a, b| {
        (&a.sp1, &a.sp2, &a.gpart1, &a.gpart2, a.direction, a.left_order1).cmp(&(
            &b.sp1,
            &b.sp2,
            &b.gpart1,
            &b.gpart2,
            b.direction,
            b.left_order1,
        ))
    });

    let survivors = match_opposites(drafts);
    info!("Keeping {} breaks", survivors.len());
    insert_breaks(&store, &survivors)?;

    store.refresh_views()?;
    store.record_stage("breaks", &format!("max_included_blocks={}", args.max_included_blocks))?;
    Ok(())
}

fn load_blocks(store: &Store) -> Result<Vec<BlockRow>, Report> {
    let mut stmt = store.conn().prepare(
        "SELECT blockid, sp1, sp2, gpart1, gpart2, direction,
                block_order1, block_order2,
                pnum_CDS_start1, pnum_CDS_end1, pnum_CDS_start2, pnum_CDS_end2,
                pid_start1, pid_end1, pid_start2, pid_end2
         FROM blocks_all ORDER BY sp1, sp2, gpart1, gpart2, direction, block_order1",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(BlockRow {
            blockid: row.get(0)?,
            sp1: row.get(1)?,
            sp2: row.get(2)?,
            gpart1: row.get(3)?,
            gpart2: row.get(4)?,
            direction: row.get(5)?,
            order1: row.get(6)?,
            order2: row.get(7)?,
            cds_start1: row.get(8)?,
            cds_end1: row.get(9)?,
            cds_start2: row.get(10)?,
            cds_end2: row.get(11)?,
            pid_start1: row.get(12)?,
            pid_end1: row.get(13)?,
            pid_start2: row.get(14)?,
            pid_end2: row.get(15)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Enumerate break candidates of one bucket: ordered block pairs adjacent
/// along genome 1 and, direction-consistently, along genome 2.
fn candidates(bucket: &[&BlockRow], max_included_blocks: i64) -> Vec<BreakDraft> {
    let mut drafts = Vec::new();

    for (i, a) in bucket.iter().enumerate() {
        for b in &bucket[i + 1..] {
            let gap1 = b.order1 - a.order1;
            if gap1 <= 0 || gap1 >= 2 + max_included_blocks {
                continue;
            }
            let gap2 = b.order2 - a.order2;
            let adjacent2 = match a.direction {
                1 => gap2 > 0 && gap2 < 2 + max_included_blocks,
                _ => gap2 < 0 && gap2 > -2 - max_included_blocks,
            };
            if !adjacent2 {
                continue;
            }

            drafts.push(BreakDraft {
                sp1: a.sp1.clone(),
                sp2: a.sp2.clone(),
                gpart1: a.gpart1.clone(),
                gpart2: a.gpart2.clone(),
                direction: a.direction,
                left_block: a.blockid,
                right_block: b.blockid,
                break_size1: (b.cds_start2 - a.cds_end2).abs() - 1,
                break_size2: (b.cds_start1 - a.cds_end1).abs() - 1,
                inblocks1: gap1 - 1,
                inblocks2: gap2.abs() - 1,
                left1: a.pid_end1.clone(),
                right1: b.pid_start1.clone(),
                left2: a.pid_end2.clone(),
                right2: b.pid_start2.clone(),
                left_order1: a.order1,
                opposite: None,
            });
        }
    }

    drafts
}

/// Shortest-at-endpoint cleanup, run once per endpoint: partition by the
/// endpoint, keep the break minimizing `break_size1 + break_size2`, first
/// encountered on ties. Groups are visited ascending for the left
/// endpoint, descending for the right, keeping the policy
/// direction-symmetric.
fn cleanup(candidates: Vec<BreakDraft>) -> Vec<BreakDraft> {
    let pass1 = retain_shortest(candidates, |d| d.left_block, false);
    retain_shortest(pass1, |d| d.right_block, true)
}

fn retain_shortest<F>(candidates: Vec<BreakDraft>, endpoint: F, descending: bool) -> Vec<BreakDraft>
where
    F: Fn(&BreakDraft) -> i64,
{
    let mut groups: BTreeMap<i64, Vec<BreakDraft>> = BTreeMap::new();
    for draft in candidates {
        groups.entry(endpoint(&draft)).or_default().push(draft);
    }

    let keys = match descending {
        false => groups.keys().copied().collect_vec(),
        true => groups.keys().rev().copied().collect_vec(),
    };

    let mut retained = Vec::new();
    for key in keys {
        let Some(group) = groups.remove(&key) else { continue };
        let Some(shortest) = group
            .into_iter()
            .min_by_key(|d| d.break_size1 + d.break_size2)
        else {
            continue;
        };
        retained.push(shortest);
    }
    retained
}

/// Match every break with its mirror in the reverse orientation: the
/// opposite's genome-1 flanks are this break's genome-2 flanks, in the
/// given or reversed order, and vice versa. Orphans are deleted.
fn match_opposites(drafts: Vec<BreakDraft>) -> Vec<BreakDraft> {
    let mut index: BTreeMap<(&str, &str, &str), Vec<usize>> = BTreeMap::new();
    for (i, d) in drafts.iter().enumerate() {
        index.entry((&d.sp1, &d.left1, &d.right1)).or_default().push(i);
    }

    let mut matched: Vec<Option<usize>> = vec![None; drafts.len()];
    for i in 0..drafts.len() {
        if matched[i].is_some() {
            continue;
        }
        let d = &drafts[i];
        // the mirror is keyed by our genome-2 flanks, reversed when the
        // break straddles an inversion
        let keys =
            [(d.sp2.as_str(), d.left2.as_str(), d.right2.as_str()),
             (d.sp2.as_str(), d.right2.as_str(), d.left2.as_str())];
        'search: for key in keys {
            let Some(candidates) = index.get(&key) else { continue };
            for &j in candidates {
                if j == i || matched[j].is_some() {
                    continue;
                }
                let m = &drafts[j];
                let mutual = (m.left2 == d.left1 && m.right2 == d.right1)
                    || (m.left2 == d.right1 && m.right2 == d.left1);
                if mutual {
                    matched[i] = Some(j);
                    matched[j] = Some(i);
                    break 'search;
                }
            }
        }
    }

    // renumber the survivors and resolve opposite indices
    let kept: Vec<usize> = (0..drafts.len()).filter(|&i| matched[i].is_some()).collect();
    let new_index: BTreeMap<usize, usize> =
        kept.iter().enumerate().map(|(new, &old)| (old, new)).collect();

    let mut survivors = Vec::with_capacity(kept.len());
    for &old in &kept {
        let mut draft = drafts[old].clone();
        draft.opposite = matched[old].and_then(|j| new_index.get(&j).copied());
        debug_assert!(draft.opposite.is_some());
        survivors.push(draft);
    }

    for (i, d) in drafts.iter().enumerate() {
        if matched[i].is_none() {
            warn!(
                "Break {}:{}..{} / {}:{}..{} has no opposite, deleting",
                d.sp1, d.left1, d.right1, d.sp2, d.left2, d.right2
            );
        }
    }

    survivors
}

/// The stable fingerprint of a break: SHA1 over the four flanking pids.
/// Species names are deliberately excluded so identical biological breaks
/// are recognized across store reruns.
fn fingerprint(left1: &str, right1: &str, left2: &str, right2: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update([left1, right1, left2, right2].join("|").as_bytes());
    format!("{:x}", hasher.finalize())
}

fn insert_breaks(store: &Store, drafts: &[BreakDraft]) -> Result<(), Report> {
    let tx = store.conn().unchecked_transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO breaks (breakid, sp1, sp2, left_block, right_block, direction,
                                 break_size1, break_size2, inblocks1, inblocks2, break_sum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        for (i, d) in drafts.iter().enumerate() {
            stmt.execute(rusqlite::params![
                i as i64 + 1,
                d.sp1,
                d.sp2,
                d.left_block,
                d.right_block,
                d.direction,
                d.break_size1,
                d.break_size2,
                d.inblocks1,
                d.inblocks2,
                fingerprint(&d.left1, &d.right1, &d.left2, &d.right2),
            ])?;
        }

        // opposites reference breakids, so they resolve in a second pass
        let mut stmt =
            tx.prepare_cached("UPDATE breaks SET opposite = ?1 WHERE breakid = ?2")?;
        for (i, d) in drafts.iter().enumerate() {
            if let Some(j) = d.opposite {
                stmt.execute(rusqlite::params![j as i64 + 1, i as i64 + 1])?;
            }
        }
    }
    tx.commit()?;
    Ok(())
}
