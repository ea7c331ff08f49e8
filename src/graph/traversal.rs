//! Graph walks: neighbors, breadth-first, depth-first and reachability.
//!
//! Every walk reads through a [`GraphReader`]. Pass a [`Snapshot`] or a
//! pin rather than the engine when the whole walk must see one version;
//! the engine answers each hop from whatever version is current.
//!
//! Results are node ids in visit order, start nodes first, each id once.
//! Edges may point at ids that have no node yet (analysis of the target
//! file may not have run), and walks report those ids like any other.
//!
//! [`Snapshot`]: crate::graph::Snapshot

use std::collections::{HashMap, HashSet};

use crate::graph::GraphReader;
use crate::storage::query::EdgeQuery;

/// Which way edges are followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Outgoing,
    Incoming,
}

fn edge_query(id: u128, edge_types: &[String], direction: Direction) -> EdgeQuery {
    let query = EdgeQuery {
        edge_types: edge_types.to_vec(),
        ..EdgeQuery::default()
    };
    match direction {
        Direction::Outgoing => query.src(id),
        Direction::Incoming => query.dst(id),
    }
}

/// Distinct ids one hop from `id`, in edge order. An empty `edge_types`
/// follows every type.
pub fn neighbors<R>(reader: &R, id: u128, edge_types: &[String], direction: Direction) -> Vec<u128>
where
    R: GraphReader + ?Sized,
{
    let mut seen = HashSet::new();
    reader
        .query_edges(&edge_query(id, edge_types, direction))
        .into_iter()
        .map(|e| match direction {
            Direction::Outgoing => e.dst,
            Direction::Incoming => e.src,
        })
        .filter(|other| seen.insert(*other))
        .collect()
}

/// Level-by-level walk from `start`, at most `max_depth` hops out.
pub fn bfs<F>(start: &[u128], max_depth: usize, mut next: F) -> Vec<u128>
where
    F: FnMut(u128) -> Vec<u128>,
{
    let mut visited: HashSet<u128> = HashSet::new();
    let mut order = Vec::new();
    let mut frontier: Vec<u128> = start.iter().copied().filter(|id| visited.insert(*id)).collect();
    order.extend(&frontier);

    for _ in 0..max_depth {
        if frontier.is_empty() {
            break;
        }
        let mut level = Vec::new();
        for id in frontier {
            for n in next(id) {
                if visited.insert(n) {
                    level.push(n);
                }
            }
        }
        order.extend(&level);
        frontier = level;
    }
    order
}

/// Pre-order depth-first walk from `start`, at most `max_depth` hops out.
///
/// A node first met deep in one branch is expanded again if another branch
/// reaches it in fewer hops, so the set of ids returned equals that of
/// [`bfs`] with the same bound; only the order differs.
pub fn dfs<F>(start: &[u128], max_depth: usize, mut next: F) -> Vec<u128>
where
    F: FnMut(u128) -> Vec<u128>,
{
    let mut depth_of: HashMap<u128, usize> = HashMap::new();
    let mut order = Vec::new();
    let mut stack: Vec<(u128, usize)> = start.iter().rev().map(|id| (*id, 0)).collect();

    while let Some((id, depth)) = stack.pop() {
        match depth_of.get(&id) {
            Some(&best) if best <= depth => continue,
            Some(_) => {}
            None => order.push(id),
        }
        depth_of.insert(id, depth);
        if depth == max_depth {
            continue;
        }
        let mut children = next(id);
        children.reverse();
        stack.extend(children.into_iter().map(|n| (n, depth + 1)));
    }
    order
}

/// Ids reachable from `start` within `max_depth` hops, following edges
/// backwards (towards their sources) when `backward` is set.
pub fn reachability<R>(reader: &R, start: &[u128], max_depth: usize, edge_types: &[String], backward: bool) -> Vec<u128>
where
    R: GraphReader + ?Sized,
{
    let direction = if backward { Direction::Incoming } else { Direction::Outgoing };
    bfs(start, max_depth, |id| neighbors(reader, id, edge_types, direction))
}
