//! Ortholog builder: best reciprocal hits with synteny rescue.
//!
//! Similarity hits are reduced, per ordered species pair, to a best-matches
//! map under a three-way e-value/identity tie policy. Unambiguous reciprocal
//! best hits are paired directly; ambiguous candidates are deferred into
//! bipartite groups and resolved by a fixed-point loop that uses the pairs
//! already committed around them as synteny evidence.

use crate::catalog::{self, Gene};
use crate::hits::{self, Hit};
use crate::utils::table::Table;
use clap::Parser;
use color_eyre::eyre::{eyre, Report, Result};
use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

pub const DEFAULT_MIN_LENGTH_RATIO: f64 = 0.4;
pub const DEFAULT_MIN_IDENTITY: f64 = 40.0;
pub const DEFAULT_MAX_EVALUE: f64 = 1e-10;
pub const DEFAULT_EVALUE_TOLERANCE: f64 = 1.0;

/// Build ortholog pairs from similarity hits.
#[derive(Clone, Debug, Deserialize, Parser, Serialize)]
pub struct Args {
    /// Similarity hits file (12-column tab-separated).
    #[clap(short = 'i', long, required = true)]
    pub hits: PathBuf,

    /// Gene catalog file.
    #[clap(short = 'g', long, required = true)]
    pub genes: PathBuf,

    /// Output ortholog pairs file.
    #[clap(short = 'o', long, required = true)]
    pub output: PathBuf,

    /// Minimum alignment length as a fraction of the shorter protein.
    #[clap(long, default_value_t = DEFAULT_MIN_LENGTH_RATIO)]
    pub min_length_ratio: f64,

    /// Minimum percent identity.
    #[clap(long, default_value_t = DEFAULT_MIN_IDENTITY)]
    pub min_identity: f64,

    /// Maximum e-value.
    #[clap(long, default_value_t = DEFAULT_MAX_EVALUE)]
    pub max_evalue: f64,

    /// Factor within which two e-values count as equal.
    #[clap(long, default_value_t = DEFAULT_EVALUE_TOLERANCE)]
    pub evalue_tolerance: f64,
}

// ----------------------------------------------------------------------------
// Gene index
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct GeneLite {
    sp: String,
    gpart: String,
    pnum_cds: i64,
    /// Nucleotide length.
    length: i64,
}

/// Catalog lookups needed for pairing: by pid, and CDS rank neighbors.
struct GeneIndex {
    by_pid: BTreeMap<String, GeneLite>,
    by_rank: BTreeMap<(String, String, i64), String>,
}

impl GeneIndex {
    fn new(genes: &[Gene]) -> Self {
        let mut by_pid = BTreeMap::new();
        let mut by_rank = BTreeMap::new();
        for g in genes {
            by_pid.insert(
                g.pid.clone(),
                GeneLite {
                    sp: g.sp.clone(),
                    gpart: g.gpart.clone(),
                    pnum_cds: g.pnum_cds,
                    length: g.length,
                },
            );
            if g.is_cds() {
                by_rank.insert((g.sp.clone(), g.gpart.clone(), g.pnum_cds), g.pid.clone());
            }
        }
        GeneIndex { by_pid, by_rank }
    }

    fn get(&self, pid: &str) -> Result<&GeneLite, Report> {
        self.by_pid
            .get(pid)
            .ok_or_else(|| eyre!("Hit references a gene missing from the catalog: {pid}"))
    }

    /// The CDS neighbors of a gene at ranks -1 and +1 within its part.
    fn neighbors(&self, pid: &str) -> Vec<&str> {
        let Some(gene) = self.by_pid.get(pid) else { return Vec::new() };
        [-1i64, 1]
            .into_iter()
            .filter_map(|offset| {
                let key = (gene.sp.clone(), gene.gpart.clone(), gene.pnum_cds + offset);
                self.by_rank.get(&key).map(String::as_str)
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Best matches
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct BestMatch {
    evalue: f64,
    ident: f64,
    alen: i64,
    matches: Vec<String>,
}

impl BestMatch {
    fn from_hit(hit: &Hit) -> Self {
        BestMatch {
            evalue: hit.evalue,
            ident: hit.ident,
            alen: hit.alen,
            matches: vec![hit.subject.clone()],
        }
    }
}

/// Two e-values are equal within a tolerance factor (1.0 = exactly equal).
fn evalues_equal(a: f64, b: f64, tolerance: f64) -> bool {
    a <= b * tolerance && b <= a * tolerance
}

type BestMap = BTreeMap<(String, String), BTreeMap<String, BestMatch>>;

/// Reduce surviving hits to the best-matches map of every ordered species
/// pair. The tie policy, evaluated in order: a strictly better e-value
/// resets the best; an equal-within-tolerance e-value with higher identity
/// resets it; with identical identity the subject is appended.
fn best_matches(hits: &[Hit], index: &GeneIndex, args: &Args) -> Result<BestMap, Report> {
    let mut best: BestMap = BTreeMap::new();

    for hit in hits {
        let query = index.get(&hit.query)?;
        let subject = index.get(&hit.subject)?;
        if query.sp == subject.sp {
            continue;
        }

        // min-length gate: alignment must cover a fraction of the shorter
        // protein (catalog lengths are nucleotides)
        let min_aa = query.length.min(subject.length) as f64 / 3.0;
        if (hit.alen as f64) < args.min_length_ratio * min_aa {
            continue;
        }
        if hit.ident < args.min_identity || hit.evalue > args.max_evalue {
            continue;
        }

        let entry = best
            .entry((query.sp.clone(), subject.sp.clone()))
            .or_default()
            .entry(hit.query.clone());

        match entry {
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(BestMatch::from_hit(hit));
            }
            std::collections::btree_map::Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                if evalues_equal(hit.evalue, current.evalue, args.evalue_tolerance) {
                    if hit.ident > current.ident {
                        *current = BestMatch::from_hit(hit);
                    } else if hit.ident == current.ident
                        && !current.matches.contains(&hit.subject)
                    {
                        current.matches.push(hit.subject.clone());
                    }
                } else if hit.evalue < current.evalue {
                    *current = BestMatch::from_hit(hit);
                }
            }
        }
    }

    Ok(best)
}

// ----------------------------------------------------------------------------
// Bipartite groups
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
struct Group {
    side_a: BTreeSet<String>,
    side_b: BTreeSet<String>,
}

/// Union-find-like bipartite buckets: candidate sets joined via any shared
/// endpoint share a group.
#[derive(Debug, Default)]
struct Groups {
    groups: Vec<Option<Group>>,
    gid_a: BTreeMap<String, usize>,
    gid_b: BTreeMap<String, usize>,
}

impl Groups {
    fn add(&mut self, side_a: &[String], side_b: &[String]) {
        // every group already touching an endpoint merges into the oldest
        let gids: BTreeSet<usize> = side_a
            .iter()
            .filter_map(|p| self.gid_a.get(p))
            .chain(side_b.iter().filter_map(|p| self.gid_b.get(p)))
            .copied()
            .collect();

        let target = match gids.iter().next() {
            Some(&gid) => gid,
            None => {
                self.groups.push(None);
                self.groups.len() - 1
            }
        };

        let mut group = self.groups[target].take().unwrap_or_default();
        for &gid in gids.iter().skip(1) {
            if let Some(merged) = self.groups[gid].take() {
                for pid in &merged.side_a {
                    self.gid_a.insert(pid.clone(), target);
                }
                for pid in &merged.side_b {
                    self.gid_b.insert(pid.clone(), target);
                }
                group.side_a.extend(merged.side_a);
                group.side_b.extend(merged.side_b);
            }
        }

        for pid in side_a {
            group.side_a.insert(pid.clone());
            self.gid_a.insert(pid.clone(), target);
        }
        for pid in side_b {
            group.side_b.insert(pid.clone());
            self.gid_b.insert(pid.clone(), target);
        }
        self.groups[target] = Some(group);
    }
}

// ----------------------------------------------------------------------------
// Pairing
// ----------------------------------------------------------------------------

/// One emitted ortholog pair, `pid1` always from the first species.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RawPair {
    pub pid1: String,
    pub pid2: String,
    pub o_ident: f64,
    pub o_alen: i64,
}

#[derive(Debug, Default)]
struct Pairing {
    emitted: BTreeSet<(String, String)>,
    pairs: Vec<RawPair>,
    paired_a: BTreeMap<String, String>,
    paired_b: BTreeMap<String, String>,
}

impl Pairing {
    /// Commit a pair unless either endpoint is already consumed.
    fn commit(&mut self, pid_a: &str, pid_b: &str, ident: f64, alen: i64) -> bool {
        if self.paired_a.contains_key(pid_a) || self.paired_b.contains_key(pid_b) {
            return false;
        }
        if !self.emitted.insert((pid_a.to_string(), pid_b.to_string())) {
            return false;
        }
        self.pairs.push(RawPair {
            pid1: pid_a.to_string(),
            pid2: pid_b.to_string(),
            o_ident: ident,
            o_alen: alen,
        });
        self.paired_a.insert(pid_a.to_string(), pid_b.to_string());
        self.paired_b.insert(pid_b.to_string(), pid_a.to_string());
        true
    }
}

/// Resolve one unordered species pair into ortholog pairs.
fn pair_species(
    index: &GeneIndex,
    fwd: &BTreeMap<String, BestMatch>,
    bwd: &BTreeMap<String, BestMatch>,
) -> Vec<RawPair> {
    let mut pairing = Pairing::default();
    let mut groups = Groups::default();

    resolve_queries(fwd, bwd, false, &mut pairing, &mut groups);
    resolve_queries(bwd, fwd, true, &mut pairing, &mut groups);
    solve_groups(index, &groups, &mut pairing);

    pairing.pairs
}

/// Best-reciprocal-hit resolution for the queries of one direction.
/// With `mirror` set, queries belong to the second species and commit into
/// the `(pid_a, pid_b)` orientation swapped.
fn resolve_queries(
    fwd: &BTreeMap<String, BestMatch>,
    bwd: &BTreeMap<String, BestMatch>,
    mirror: bool,
    pairing: &mut Pairing,
    groups: &mut Groups,
) {
    for (query, best) in fwd {
        let matches = best.matches.iter().cloned().sorted().dedup().collect_vec();

        if matches.len() == 1 {
            let target = &matches[0];
            let Some(back) = bwd.get(target) else {
                debug!("No backward best for {target}, dropping {query}");
                continue;
            };
            let back_matches = back.matches.iter().cloned().sorted().dedup().collect_vec();

            if back_matches.len() == 1 {
                // unique forward, unique backward: pair if reciprocal
                if back_matches[0] == *query {
                    match mirror {
                        false => pairing.commit(query, target, best.ident, best.alen),
                        true => pairing.commit(target, query, best.ident, best.alen),
                    };
                }
            } else if back_matches.contains(query) {
                // unique forward, multi backward containing the query
                match mirror {
                    false => groups.add(&[query.clone()], &[target.clone()]),
                    true => groups.add(&[target.clone()], &[query.clone()]),
                }
            }
        } else {
            // multi forward: keep candidates whose reverse best contains us
            let candidates = matches
                .into_iter()
                .filter(|t| bwd.get(t).is_some_and(|b| b.matches.contains(query)))
                .collect_vec();
            if !candidates.is_empty() {
                match mirror {
                    false => groups.add(&[query.clone()], &candidates),
                    true => groups.add(&candidates, &[query.clone()]),
                }
            }
        }
    }
}

/// The synteny solving loop: iterate until no new pair emerges in a round.
fn solve_groups(index: &GeneIndex, groups: &Groups, pairing: &mut Pairing) {
    loop {
        let mut new_pairs = 0;

        for group in groups.groups.iter().flatten() {
            // restore the members not yet consumed by a committed pair
            let side_a = group
                .side_a
                .iter()
                .filter(|p| !pairing.paired_a.contains_key(*p))
                .cloned()
                .collect_vec();
            let side_b = group
                .side_b
                .iter()
                .filter(|p| !pairing.paired_b.contains_key(*p))
                .cloned()
                .collect_vec();
            if side_a.is_empty() || side_b.is_empty() {
                continue;
            }

            // a single leftover on each side pairs by elimination
            if side_a.len() == 1 && side_b.len() == 1 {
                if pairing.commit(&side_a[0], &side_b[0], 0.0, 0) {
                    new_pairs += 1;
                }
                continue;
            }

            // neighbors already paired vouch for candidates whose own
            // neighbors hold the partner
            let mut potential: BTreeSet<(&str, &str)> = BTreeSet::new();
            for f in &side_a {
                for neighbor in index.neighbors(f) {
                    let Some(partner) = pairing.paired_a.get(neighbor) else { continue };
                    for t in &side_b {
                        if index.neighbors(t).contains(&partner.as_str()) {
                            potential.insert((f.as_str(), t.as_str()));
                        }
                    }
                }
            }

            // keep only pairs unique on both sides this round
            let mut count_a: BTreeMap<&str, usize> = BTreeMap::new();
            let mut count_b: BTreeMap<&str, usize> = BTreeMap::new();
            for &(f, t) in &potential {
                *count_a.entry(f).or_default() += 1;
                *count_b.entry(t).or_default() += 1;
            }
            let unique = potential
                .iter()
                .filter(|(f, t)| count_a[f] == 1 && count_b[t] == 1)
                .map(|(f, t)| (f.to_string(), t.to_string()))
                .collect_vec();
            for (f, t) in unique {
                if pairing.commit(&f, &t, 0.0, 0) {
                    new_pairs += 1;
                }
            }
        }

        if new_pairs == 0 {
            break;
        }
    }
}

// ----------------------------------------------------------------------------
// Stage
// ----------------------------------------------------------------------------

/// Ortholog builder stage: read hits and catalog, pair every species pair,
/// write the sorted, 1-based `oid`-numbered pairs.
pub fn build(args: &Args) -> Result<(), Report> {
    let genes = catalog::read_genes(&args.genes)?;
    let index = GeneIndex::new(&genes);
    let hits = hits::read_hits(&args.hits)?;
    info!("Pairing orthologs from {} hits, {} genes", hits.len(), genes.len());

    let best = best_matches(&hits, &index, args)?;

    // unordered species pairs, alphabetical
    let species_pairs: BTreeSet<(String, String)> = best
        .keys()
        .map(|(a, b)| (a.min(b).clone(), a.max(b).clone()))
        .collect();

    let empty = BTreeMap::new();
    let mut all_pairs = Vec::new();
    for (sp_a, sp_b) in &species_pairs {
        let fwd = best.get(&(sp_a.clone(), sp_b.clone())).unwrap_or(&empty);
        let bwd = best.get(&(sp_b.clone(), sp_a.clone())).unwrap_or(&empty);
        let pairs = pair_species(&index, fwd, bwd);
        debug!("{sp_a} vs {sp_b}: {} ortholog pairs", pairs.len());

        // emit both orientations so every ordered species pair is covered
        for pair in &pairs {
            all_pairs.push(RawPair {
                pid1: pair.pid2.clone(),
                pid2: pair.pid1.clone(),
                o_ident: pair.o_ident,
                o_alen: pair.o_alen,
            });
        }
        all_pairs.extend(pairs);
    }

    all_pairs.sort_by(|a, b| (&a.pid1, &a.pid2).cmp(&(&b.pid1, &b.pid2)));
    info!("Writing {} ortholog pairs to {:?}", all_pairs.len(), args.output);
    write_pairs(&all_pairs, &args.output)?;
    Ok(())
}

/// Write ortholog pairs with the header `oid, pid1, pid2, o_ident, o_alen`.
fn write_pairs(pairs: &[RawPair], path: &std::path::Path) -> Result<(), Report> {
    let mut table = Table::new();
    table.headers =
        ["oid", "pid1", "pid2", "o_ident", "o_alen"].into_iter().map(String::from).collect();
    for (i, pair) in pairs.iter().enumerate() {
        table.rows.push(vec![
            (i + 1).to_string(),
            pair.pid1.clone(),
            pair.pid2.clone(),
            pair.o_ident.to_string(),
            pair.o_alen.to_string(),
        ]);
    }
    table.write(path)
}
