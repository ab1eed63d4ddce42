//! Break-graph analyzer: group homologous breaks across species pairs,
//! collapse species with identical relationships, and detect cycles.
//!
//! Every break is an undirected association between two species, keyed by
//! its genome-1 flanking gene pair. Breaks sharing a key, or linked as
//! opposites, belong to one graph. Within a graph, species whose neighbor
//! sets are identical merge into a composite node; the cycle measure is
//! the node count of the 2-edge-connected core left by iterative leaf
//! pruning.

use crate::store::Store;
use clap::Parser;
use color_eyre::eyre::{Report, Result};
use itertools::Itertools;
use log::{info, warn};
use petgraph::graph::{Graph, NodeIndex};
use petgraph::Undirected;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

/// Group similar breaks across species pairs into graphs, detect cycles.
#[derive(Clone, Debug, Deserialize, Parser, Serialize)]
pub struct Args {
    /// Path of the store.
    #[clap(short = 'd', long, required = true)]
    pub store: PathBuf,
}

#[derive(Clone, Debug)]
struct BreakNode {
    breakid: i64,
    sp1: String,
    sp2: String,
    left1: String,
    right1: String,
    opposite: Option<i64>,
}

/// The collapsed species graph of one break group.
#[derive(Clone, Debug)]
struct GraphSummary {
    /// Edges between composite node labels, deduplicated, lower label first.
    edges: Vec<(String, String)>,
    /// Nodes surviving iterative leaf pruning.
    cycle: i64,
}

// ----------------------------------------------------------------------------
// Grouping
// ----------------------------------------------------------------------------

/// Transitive closure over "shares the genome-1 flank key" and "is the
/// opposite of a member". Returns groups in order of their smallest break.
fn group_breaks(breaks: &[BreakNode]) -> Vec<Vec<usize>> {
    let mut by_key: BTreeMap<(&str, &str, &str), Vec<usize>> = BTreeMap::new();
    let mut by_id: BTreeMap<i64, usize> = BTreeMap::new();
    for (i, brk) in breaks.iter().enumerate() {
        by_key.entry((&brk.sp1, &brk.left1, &brk.right1)).or_default().push(i);
        by_id.insert(brk.breakid, i);
    }

    let mut visited = vec![false; breaks.len()];
    let mut groups = Vec::new();

    for start in 0..breaks.len() {
        if visited[start] {
            continue;
        }
        let mut members = Vec::new();
        let mut queue = VecDeque::from([start]);
        visited[start] = true;

        while let Some(i) = queue.pop_front() {
            members.push(i);
            let brk = &breaks[i];

            let same_key = by_key
                .get(&(brk.sp1.as_str(), brk.left1.as_str(), brk.right1.as_str()))
                .into_iter()
                .flatten()
                .copied();
            let opposite = brk.opposite.and_then(|id| by_id.get(&id)).copied();

            for j in same_key.chain(opposite) {
                if !visited[j] {
                    visited[j] = true;
                    queue.push_back(j);
                }
            }
        }

        members.sort_unstable();
        groups.push(members);
    }

    groups
}

// ----------------------------------------------------------------------------
// Species graph
// ----------------------------------------------------------------------------

/// Collapse identical-neighborhood species and prune to the cycle core.
fn species_graph(members: &[&BreakNode]) -> GraphSummary {
    // neighbor sets per species
    let mut neighbors: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for brk in members {
        neighbors.entry(&brk.sp1).or_default().insert(&brk.sp2);
        neighbors.entry(&brk.sp2).or_default().insert(&brk.sp1);
    }

    // species with identical relationships share a composite label
    let mut twins: BTreeMap<&BTreeSet<&str>, Vec<&str>> = BTreeMap::new();
    for (sp, set) in &neighbors {
        twins.entry(set).or_default().push(sp);
    }
    let label: BTreeMap<&str, String> = twins
        .values()
        .flat_map(|species| {
            let name = species.iter().sorted().join(" ");
            species.iter().map(move |sp| (*sp, name.clone())).collect_vec()
        })
        .collect();

    // edges between composite nodes
    let mut edges: BTreeSet<(String, String)> = BTreeSet::new();
    for brk in members {
        let a = &label[brk.sp1.as_str()];
        let b = &label[brk.sp2.as_str()];
        if a != b {
            edges.insert((a.min(b).clone(), a.max(b).clone()));
        }
    }

    // build the collapsed graph
    let mut graph: Graph<String, usize, Undirected> = Graph::new_undirected();
    let mut indices: BTreeMap<&str, NodeIndex> = BTreeMap::new();
    for name in label.values().sorted().dedup() {
        indices.insert(name.as_str(), graph.add_node(name.clone()));
    }
    for (from, to) in &edges {
        graph.add_edge(indices[from.as_str()], indices[to.as_str()], 1);
    }

    // iteratively prune leaf nodes until only the cycle core remains
    loop {
        let leaves = graph
            .node_indices()
            .filter(|&n| graph.neighbors(n).count() < 2)
            .collect_vec();
        if leaves.is_empty() {
            break;
        }
        // remove from the highest index down, so the swap-removal keeps
        // the remaining indices valid
        for n in leaves.into_iter().sorted_by(|a, b| b.cmp(a)) {
            graph.remove_node(n);
        }
    }

    GraphSummary { edges: edges.into_iter().collect(), cycle: graph.node_count() as i64 }
}

// ----------------------------------------------------------------------------
// Stage
// ----------------------------------------------------------------------------

/// Break-graph analyzer stage.
pub fn analyze(args: &Args) -> Result<(), Report> {
    let store = Store::open(&args.store)?;
    store.reset_tables(&["breaks_graph"])?;
    store.conn().execute("UPDATE breaks_ranking SET cycle = 0, graphid = NULL", [])?;

    let breaks = load_breaks(&store)?;
    if !breaks.is_empty() {
        let ranked: i64 =
            store.conn().query_row("SELECT COUNT(*) FROM breaks_ranking", [], |r| r.get(0))?;
        if ranked == 0 {
            warn!("No ranking rows found; run the rank stage before graphs");
        }
    }

    let groups = group_breaks(&breaks);

    let tx = store.conn().unchecked_transaction()?;
    {
        let mut insert_edge = tx.prepare_cached(
            "INSERT INTO breaks_graph (graphid, from_name, to_name) VALUES (?1, ?2, ?3)",
        )?;
        let mut update_ranking = tx.prepare_cached(
            "UPDATE breaks_ranking SET cycle = ?1, graphid = ?2 WHERE breakid = ?3",
        )?;

        for (graphid, group) in groups.iter().enumerate() {
            let graphid = graphid as i64 + 1;
            let members = group.iter().map(|&i| &breaks[i]).collect_vec();
            let summary = species_graph(&members);

            for (from, to) in &summary.edges {
                insert_edge.execute(rusqlite::params![graphid, from, to])?;
            }
            for brk in &members {
                update_ranking.execute(rusqlite::params![summary.cycle, graphid, brk.breakid])?;
            }
        }
    }
    tx.commit()?;

    info!("Analyzed {} break graphs from {} breaks", groups.len(), breaks.len());
    store.record_stage("graphs", "")?;
    Ok(())
}

fn load_breaks(store: &Store) -> Result<Vec<BreakNode>, Report> {
    let mut stmt = store.conn().prepare(
        "SELECT breakid, sp1, sp2, left1, right1, opposite
         FROM breaks_all ORDER BY breakid",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(BreakNode {
            breakid: row.get(0)?,
            sp1: row.get(1)?,
            sp2: row.get(2)?,
            left1: row.get(3)?,
            right1: row.get(4)?,
            opposite: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
