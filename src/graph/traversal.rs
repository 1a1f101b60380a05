//! BFS traversal over a [`NeighborLookup`].
//!
//! Both searches hold only call-local state (frontier, visited set) and fetch every
//! hop from the store. A lookup failure aborts the whole call. An optional deadline
//! is checked once per dequeue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::TraversalConfig;
use crate::error::{KgraphError, Result};

use super::lookup::{Direction, NeighborLookup};

/// Per-call traversal limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalOptions {
    /// Give up with [`KgraphError::DeadlineExceeded`] once this much time has passed
    pub timeout: Option<Duration>,
}

impl TraversalOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout) }
    }
}

impl From<&TraversalConfig> for TraversalOptions {
    fn from(config: &TraversalConfig) -> Self {
        Self {
            timeout: config.timeout(),
        }
    }
}

struct Deadline {
    at: Option<(Instant, Duration)>,
}

impl Deadline {
    fn start(options: &TraversalOptions) -> Self {
        Self {
            at: options.timeout.map(|timeout| (Instant::now() + timeout, timeout)),
        }
    }

    fn check(&self, expanded: usize) -> Result<()> {
        match self.at {
            Some((at, timeout)) if Instant::now() >= at => Err(KgraphError::DeadlineExceeded { timeout, expanded }),
            _ => Ok(()),
        }
    }
}

fn require_node(name: &str, what: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(KgraphError::InvalidInput(format!("{} node must not be empty", what)));
    }
    Ok(())
}

/// Which edges a shortest-path hop may follow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Reach {
    /// Outgoing edges only
    #[default]
    Directed,
    /// Outgoing then incoming edges
    Undirected,
}

/// Result of [`shortest_path`]. An empty `path` means no route exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShortestPath {
    pub path: Vec<String>,
    pub distance: Option<usize>,
    /// Distinct nodes discovered, start included
    pub nodes_visited: usize,
    /// Nodes whose neighbors were fetched
    pub expansions: usize,
}

impl ShortestPath {
    pub fn found(&self) -> bool {
        self.distance.is_some()
    }

    /// Hop count, or -1 when no route exists
    pub fn distance_or_sentinel(&self) -> i64 {
        self.distance.map_or(-1, |d| d as i64)
    }
}

fn reconstruct(parents: &HashMap<String, Option<String>>, last: &str) -> Vec<String> {
    let mut path = vec![last.to_string()];
    let mut cursor = parents.get(last).cloned().flatten();
    while let Some(node) = cursor {
        cursor = parents.get(&node).cloned().flatten();
        path.push(node);
    }
    path.reverse();
    path
}

/// Unweighted BFS shortest path from `from` to `to`.
///
/// Every node is expanded at most once. Among several shortest paths the one
/// discovered first in lookup enumeration order is reported.
pub async fn shortest_path<L>(
    lookup: &L,
    from: &str,
    to: &str,
    reach: Reach,
    options: TraversalOptions,
) -> Result<ShortestPath>
where
    L: NeighborLookup + ?Sized,
{
    require_node(from, "start")?;
    require_node(to, "target")?;

    if from == to {
        return Ok(ShortestPath {
            path: vec![from.to_string()],
            distance: Some(0),
            nodes_visited: 1,
            expansions: 0,
        });
    }

    let deadline = Deadline::start(&options);
    // Doubles as the visited set
    let mut parents: HashMap<String, Option<String>> = HashMap::new();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    let mut expansions = 0;

    parents.insert(from.to_string(), None);
    queue.push_back((from.to_string(), 0));

    while let Some((node, distance)) = queue.pop_front() {
        deadline.check(expansions)?;
        expansions += 1;

        let mut neighbors = lookup.neighbors(&node, Direction::Outgoing, None).await?;
        if reach == Reach::Undirected {
            neighbors.extend(lookup.neighbors(&node, Direction::Incoming, None).await?);
        }

        for neighbor in neighbors {
            if neighbor == to {
                parents.insert(neighbor.clone(), Some(node.clone()));
                let path = reconstruct(&parents, &neighbor);
                log::debug!(
                    "shortest path {} -> {}: {} hops, {} expansions",
                    from,
                    to,
                    distance + 1,
                    expansions
                );
                return Ok(ShortestPath {
                    path,
                    distance: Some(distance + 1),
                    nodes_visited: parents.len(),
                    expansions,
                });
            }
            if !parents.contains_key(&neighbor) {
                parents.insert(neighbor.clone(), Some(node.clone()));
                queue.push_back((neighbor, distance + 1));
            }
        }
    }

    log::debug!("no path {} -> {} after {} expansions", from, to, expansions);
    Ok(ShortestPath {
        path: Vec::new(),
        distance: None,
        nodes_visited: parents.len(),
        expansions,
    })
}

/// Accumulated classification of a path: an even number of flips is neutral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationState {
    Neutral,
    Flipped,
}

impl RelationState {
    pub fn toggle(self) -> Self {
        match self {
            RelationState::Neutral => RelationState::Flipped,
            RelationState::Flipped => RelationState::Neutral,
        }
    }
}

/// Parameters of a relation-alternating search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationQuery {
    /// Relation that keeps the state
    pub neutral: String,
    /// Relation that toggles the state
    pub flip: String,
    /// State a node must carry at the target distance to be reported
    pub want: RelationState,
}

impl RelationQuery {
    pub fn new(neutral: impl Into<String>, flip: impl Into<String>, want: RelationState) -> Self {
        Self {
            neutral: neutral.into(),
            flip: flip.into(),
            want,
        }
    }

    pub fn synonyms(config: &TraversalConfig) -> Self {
        Self::new(&config.synonym_relation, &config.antonym_relation, RelationState::Neutral)
    }

    pub fn antonyms(config: &TraversalConfig) -> Self {
        Self::new(&config.synonym_relation, &config.antonym_relation, RelationState::Flipped)
    }
}

/// A node reached at exactly the requested distance with the wanted state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistantMatch {
    pub node: String,
    pub path: Vec<String>,
}

/// Parse a user-supplied distance; anything below 1 is an input error
pub fn validate_distance(distance: i64) -> Result<usize> {
    if distance <= 0 {
        return Err(KgraphError::InvalidInput(format!(
            "distance must be a positive integer, got {}",
            distance
        )));
    }
    usize::try_from(distance).map_err(|_| KgraphError::InvalidInput(format!("distance {} is too large", distance)))
}

struct Frontier {
    node: String,
    distance: usize,
    path: Vec<String>,
    state: RelationState,
}

/// Relation-alternating BFS from `start`.
///
/// Edges labelled `query.neutral` or `query.flip` are followed in both directions.
/// A `(node, distance)` pair is enqueued at most once and a path never revisits one
/// of its own nodes; both rules together decide which paths are explored. Search
/// stops at `distance` hops.
pub async fn distant_relations<L>(
    lookup: &L,
    start: &str,
    distance: usize,
    query: &RelationQuery,
    options: TraversalOptions,
) -> Result<Vec<DistantMatch>>
where
    L: NeighborLookup + ?Sized,
{
    require_node(start, "start")?;
    if distance == 0 {
        return Err(KgraphError::InvalidInput(
            "distance must be a positive integer, got 0".to_string(),
        ));
    }

    let deadline = Deadline::start(&options);
    let mut visited: HashSet<(String, usize)> = HashSet::new();
    let mut queue = VecDeque::new();
    let mut results = Vec::new();
    let mut expanded = 0;

    queue.push_back(Frontier {
        node: start.to_string(),
        distance: 0,
        path: vec![start.to_string()],
        state: RelationState::Neutral,
    });

    let hops = [(query.neutral.as_str(), false), (query.flip.as_str(), true)];

    while let Some(current) = queue.pop_front() {
        deadline.check(expanded)?;

        if current.distance == distance {
            if current.state == query.want {
                results.push(DistantMatch {
                    node: current.node,
                    path: current.path,
                });
            }
            continue;
        }

        expanded += 1;
        let next_distance = current.distance + 1;
        for (relation, flips) in hops {
            let mut neighbors = lookup.neighbors(&current.node, Direction::Incoming, Some(relation)).await?;
            neighbors.extend(lookup.neighbors(&current.node, Direction::Outgoing, Some(relation)).await?);

            let state = if flips { current.state.toggle() } else { current.state };
            for neighbor in neighbors {
                if current.path.contains(&neighbor) || visited.contains(&(neighbor.clone(), next_distance)) {
                    continue;
                }
                visited.insert((neighbor.clone(), next_distance));
                let mut path = current.path.clone();
                path.push(neighbor.clone());
                queue.push_back(Frontier {
                    node: neighbor,
                    distance: next_distance,
                    path,
                    state,
                });
            }
        }
    }

    log::debug!(
        "relation search from {} at distance {}: {} matches, {} expansions",
        start,
        distance,
        results.len(),
        expanded
    );
    Ok(results)
}

/// Nodes `distance` hops away whose path carries an even number of flips
pub async fn distant_synonyms<L>(
    lookup: &L,
    start: &str,
    distance: usize,
    config: &TraversalConfig,
    options: TraversalOptions,
) -> Result<Vec<DistantMatch>>
where
    L: NeighborLookup + ?Sized,
{
    distant_relations(lookup, start, distance, &RelationQuery::synonyms(config), options).await
}

/// Nodes `distance` hops away whose path carries an odd number of flips
pub async fn distant_antonyms<L>(
    lookup: &L,
    start: &str,
    distance: usize,
    config: &TraversalConfig,
    options: TraversalOptions,
) -> Result<Vec<DistantMatch>>
where
    L: NeighborLookup + ?Sized,
{
    distant_relations(lookup, start, distance, &RelationQuery::antonyms(config), options).await
}
