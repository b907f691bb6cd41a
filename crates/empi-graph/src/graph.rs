//! Graph construction and analysis.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use tracing::info;
use uuid::Uuid;

use crate::types::{
    CrosswalkRow, GraphError, GroupResult, MatchAnalysis, MatchGroupOut, PersonReassignment,
    ResultRow,
};

#[derive(Debug, Clone)]
struct PersonNode {
    id: i64,
    created: DateTime<Utc>,
    version: i64,
    record_count: i64,
}

#[derive(Debug, Clone)]
struct RecordNode {
    id: i64,
    person_id: i64,
    person_version: i64,
}

#[derive(Debug, Clone)]
enum Node {
    Person(PersonNode),
    Record(RecordNode),
}

#[derive(Debug, Clone)]
enum EdgeKind {
    Result {
        row_number: i64,
        match_probability: f64,
    },
    Membership,
}

/// Undirected graph over Persons and PersonRecords.
///
/// Result edges connect two records; membership edges connect a person to
/// each of its records. Weakly connected components of the full graph are the
/// match groups; components of the auto-match subgraph (membership edges plus
/// result edges above the threshold) are the clusters that collapse onto a
/// representative person.
pub struct MatchGraph {
    graph: UnGraph<Node, EdgeKind>,
    node_by_record_id: HashMap<i64, NodeIndex>,
}

impl MatchGraph {
    /// Build the graph from scored pairs and the person crosswalk.
    ///
    /// The crosswalk must cover exactly the persons owning the records
    /// referenced by `results`; a missing or extra person is fatal, because
    /// it means the caller locked the wrong row set.
    pub fn new(results: &[ResultRow], crosswalk: &[CrosswalkRow]) -> Result<Self, GraphError> {
        if results.is_empty() {
            return Err(GraphError::EmptyResults);
        }
        if crosswalk.is_empty() {
            return Err(GraphError::EmptyCrosswalk);
        }

        info!(
            "Creating match graph over {} results and {} crosswalk rows",
            results.len(),
            crosswalk.len()
        );
        let start = Instant::now();

        let mut graph = UnGraph::new_undirected();
        let mut node_by_person_id: HashMap<i64, NodeIndex> = HashMap::new();
        let mut node_by_record_id: HashMap<i64, NodeIndex> = HashMap::new();

        for row in crosswalk {
            let person_idx = *node_by_person_id.entry(row.person_id).or_insert_with(|| {
                graph.add_node(Node::Person(PersonNode {
                    id: row.person_id,
                    created: row.person_created,
                    version: row.person_version,
                    record_count: row.record_count,
                }))
            });
            let record_idx = *node_by_record_id
                .entry(row.person_record_id)
                .or_insert_with(|| {
                    graph.add_node(Node::Record(RecordNode {
                        id: row.person_record_id,
                        person_id: row.person_id,
                        person_version: row.person_version,
                    }))
                });

            graph.add_edge(person_idx, record_idx, EdgeKind::Membership);
        }

        let mut persons_from_results: HashSet<i64> = HashSet::new();

        for row in results {
            let mut endpoint = |record_id: i64| -> Result<NodeIndex, GraphError> {
                let idx = *node_by_record_id
                    .get(&record_id)
                    .ok_or(GraphError::MissingCrosswalkEntry(record_id))?;
                if let Node::Record(rec) = &graph[idx] {
                    persons_from_results.insert(rec.person_id);
                }
                Ok(idx)
            };

            let left = endpoint(row.person_record_l_id)?;
            let right = endpoint(row.person_record_r_id)?;

            graph.add_edge(
                left,
                right,
                EdgeKind::Result {
                    row_number: row.row_number,
                    match_probability: row.match_probability,
                },
            );
        }

        if persons_from_results.len() != node_by_person_id.len() {
            return Err(GraphError::CrosswalkMismatch);
        }

        info!("Created match graph in {:?}", start.elapsed());

        Ok(MatchGraph {
            graph,
            node_by_record_id,
        })
    }

    /// Run the full analysis, consuming the graph.
    ///
    /// Record nodes are re-pointed at their representative person in place as
    /// auto-match clusters resolve, so residual person sets reflect the state
    /// after reassignment.
    pub fn analyze(mut self, auto_match_threshold: f64) -> MatchAnalysis {
        info!(
            "Analyzing match graph using auto-match threshold {}",
            auto_match_threshold
        );
        let start = Instant::now();

        let node_count = self.graph.node_count();

        // Weakly connected components over the full edge set: one match group
        // per component.
        let mut components = UnionFind::new(node_count);
        for edge in self.graph.edge_references() {
            components.union(edge.source().index(), edge.target().index());
        }
        let labels = components.into_labeling();

        let mut slot_by_label: HashMap<usize, usize> = HashMap::new();
        let mut group_uuids: Vec<Uuid> = Vec::new();
        let mut group_persons: Vec<HashSet<i64>> = Vec::new();
        let mut group_of_node: Vec<usize> = vec![0; node_count];

        for idx in self.graph.node_indices() {
            let slot = *slot_by_label.entry(labels[idx.index()]).or_insert_with(|| {
                group_uuids.push(Uuid::new_v4());
                group_persons.push(HashSet::new());
                group_uuids.len() - 1
            });
            group_of_node[idx.index()] = slot;
            if let Node::Record(rec) = &self.graph[idx] {
                group_persons[slot].insert(rec.person_id);
            }
        }

        let results: Vec<GroupResult> = self
            .graph
            .edge_references()
            .filter_map(|edge| match edge.weight() {
                EdgeKind::Result { row_number, .. } => Some(GroupResult {
                    result_row_number: *row_number,
                    match_group_uuid: group_uuids[group_of_node[edge.source().index()]],
                }),
                EdgeKind::Membership => None,
            })
            .collect();

        let mut group_of_person: HashMap<i64, usize> = HashMap::new();
        for idx in self.graph.node_indices() {
            if let Node::Person(person) = &self.graph[idx] {
                group_of_person.insert(person.id, group_of_node[idx.index()]);
            }
        }

        // Auto-match clusters: filter edges by predicate over the shared node
        // arena instead of copying out per-group subgraphs.
        let mut auto_components = UnionFind::new(node_count);
        for edge in self.graph.edge_references() {
            let keep = match edge.weight() {
                EdgeKind::Membership => true,
                EdgeKind::Result {
                    match_probability, ..
                } => *match_probability > auto_match_threshold,
            };
            if keep {
                auto_components.union(edge.source().index(), edge.target().index());
            }
        }
        let auto_labels = auto_components.into_labeling();

        let mut cluster_by_label: HashMap<usize, usize> = HashMap::new();
        let mut clusters: Vec<Vec<NodeIndex>> = Vec::new();
        for idx in self.graph.node_indices() {
            let slot = *cluster_by_label
                .entry(auto_labels[idx.index()])
                .or_insert_with(|| {
                    clusters.push(Vec::new());
                    clusters.len() - 1
                });
            clusters[slot].push(idx);
        }

        let mut person_actions: Vec<PersonReassignment> = Vec::new();

        for cluster in &clusters {
            let mut person_nodes: Vec<PersonNode> = Vec::new();
            let mut record_indices: Vec<NodeIndex> = Vec::new();

            for &idx in cluster {
                match &self.graph[idx] {
                    Node::Person(person) => person_nodes.push(person.clone()),
                    Node::Record(_) => record_indices.push(idx),
                }
            }

            // Every record carries a membership edge, so a cluster always
            // holds at least one person.
            let Some(chosen) = choose_person(&person_nodes) else {
                continue;
            };
            let chosen = chosen.clone();
            let chosen_slot = group_of_person[&chosen.id];

            for idx in record_indices {
                if let Node::Record(rec) = &mut self.graph[idx] {
                    if rec.person_id == chosen.id {
                        continue;
                    }
                    person_actions.push(PersonReassignment {
                        match_group_uuid: group_uuids[chosen_slot],
                        person_record_id: rec.id,
                        from_person_id: rec.person_id,
                        from_person_version: rec.person_version,
                        to_person_id: chosen.id,
                        to_person_version: chosen.version,
                    });
                    group_persons[chosen_slot].remove(&rec.person_id);
                    rec.person_id = chosen.id;
                }
            }
        }

        let match_groups: Vec<MatchGroupOut> = group_uuids
            .iter()
            .zip(&group_persons)
            .map(|(uuid, persons)| MatchGroupOut {
                uuid: *uuid,
                matched: persons.len() == 1,
            })
            .collect();

        info!(
            "Completed match analysis in {:?}: {} groups, {} reassignments",
            start.elapsed(),
            match_groups.len(),
            person_actions.len()
        );

        MatchAnalysis {
            match_groups,
            results,
            person_actions,
        }
    }

    /// Number of distinct records in the graph.
    pub fn record_count(&self) -> usize {
        self.node_by_record_id.len()
    }
}

/// Pick the representative person of an auto-match cluster.
///
/// Most records first, then oldest, then lowest id. The key is a total
/// order, so the choice is deterministic.
fn choose_person(persons: &[PersonNode]) -> Option<&PersonNode> {
    persons
        .iter()
        .min_by_key(|person| (Reverse(person.record_count), person.created, person.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CrosswalkRow, ResultRow};

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn result(row_number: i64, probability: f64, left: i64, right: i64) -> ResultRow {
        ResultRow {
            row_number,
            match_probability: probability,
            person_record_l_id: left,
            person_record_r_id: right,
        }
    }

    fn xwalk(person: i64, created: &str, record_count: i64, record: i64) -> CrosswalkRow {
        CrosswalkRow {
            person_id: person,
            person_created: ts(created),
            person_version: 1,
            record_count,
            person_record_id: record,
        }
    }

    fn group_for(analysis: &MatchAnalysis, row_number: i64) -> Uuid {
        analysis
            .results
            .iter()
            .find(|r| r.result_row_number == row_number)
            .unwrap()
            .match_group_uuid
    }

    #[test]
    fn empty_results_is_fatal() {
        let crosswalk = vec![xwalk(1, "2024-01-01T00:00:00Z", 1, 10)];
        assert!(matches!(
            MatchGraph::new(&[], &crosswalk),
            Err(GraphError::EmptyResults)
        ));
    }

    #[test]
    fn empty_crosswalk_is_fatal() {
        let results = vec![result(0, 0.9, 10, 11)];
        assert!(matches!(
            MatchGraph::new(&results, &[]),
            Err(GraphError::EmptyCrosswalk)
        ));
    }

    #[test]
    fn missing_crosswalk_record_is_fatal() {
        let results = vec![result(0, 0.9, 10, 11)];
        let crosswalk = vec![xwalk(1, "2024-01-01T00:00:00Z", 1, 10)];
        assert!(matches!(
            MatchGraph::new(&results, &crosswalk),
            Err(GraphError::MissingCrosswalkEntry(11))
        ));
    }

    #[test]
    fn extra_crosswalk_person_is_fatal() {
        let results = vec![result(0, 0.9, 10, 11)];
        let crosswalk = vec![
            xwalk(1, "2024-01-01T00:00:00Z", 1, 10),
            xwalk(2, "2024-01-01T00:00:00Z", 1, 11),
            // Person 3 owns a record no result references.
            xwalk(3, "2024-01-01T00:00:00Z", 1, 12),
        ];
        assert!(matches!(
            MatchGraph::new(&results, &crosswalk),
            Err(GraphError::CrosswalkMismatch)
        ));
    }

    #[test]
    fn potential_match_produces_unmatched_group_without_actions() {
        let results = vec![result(0, 0.5, 10, 11)];
        let crosswalk = vec![
            xwalk(1, "2024-01-01T00:00:00Z", 1, 10),
            xwalk(2, "2024-01-02T00:00:00Z", 1, 11),
        ];
        let analysis = MatchGraph::new(&results, &crosswalk)
            .unwrap()
            .analyze(0.8);

        assert_eq!(analysis.match_groups.len(), 1);
        assert!(!analysis.match_groups[0].matched);
        assert_eq!(analysis.results.len(), 1);
        assert_eq!(group_for(&analysis, 0), analysis.match_groups[0].uuid);
        assert!(analysis.person_actions.is_empty());
    }

    #[test]
    fn auto_match_reassigns_to_older_person() {
        let results = vec![result(0, 0.95, 10, 11)];
        let crosswalk = vec![
            xwalk(1, "2024-01-01T00:00:00Z", 1, 10),
            xwalk(2, "2024-01-02T00:00:00Z", 1, 11),
        ];
        let analysis = MatchGraph::new(&results, &crosswalk)
            .unwrap()
            .analyze(0.8);

        assert_eq!(analysis.match_groups.len(), 1);
        assert!(analysis.match_groups[0].matched);
        assert_eq!(analysis.person_actions.len(), 1);

        let action = &analysis.person_actions[0];
        assert_eq!(action.person_record_id, 11);
        assert_eq!(action.from_person_id, 2);
        assert_eq!(action.to_person_id, 1);
        assert_eq!(action.match_group_uuid, analysis.match_groups[0].uuid);
    }

    #[test]
    fn probability_equal_to_threshold_is_not_auto() {
        let results = vec![result(0, 0.8, 10, 11)];
        let crosswalk = vec![
            xwalk(1, "2024-01-01T00:00:00Z", 1, 10),
            xwalk(2, "2024-01-02T00:00:00Z", 1, 11),
        ];
        let analysis = MatchGraph::new(&results, &crosswalk)
            .unwrap()
            .analyze(0.8);

        assert!(analysis.person_actions.is_empty());
        assert!(!analysis.match_groups[0].matched);
    }

    #[test]
    fn representative_prefers_highest_record_count() {
        let results = vec![result(0, 0.99, 10, 11)];
        let crosswalk = vec![
            // Person 1 is older but person 2 holds more records.
            xwalk(1, "2024-01-01T00:00:00Z", 1, 10),
            xwalk(2, "2024-06-01T00:00:00Z", 3, 11),
        ];
        let analysis = MatchGraph::new(&results, &crosswalk)
            .unwrap()
            .analyze(0.8);

        assert_eq!(analysis.person_actions.len(), 1);
        let action = &analysis.person_actions[0];
        assert_eq!(action.person_record_id, 10);
        assert_eq!(action.from_person_id, 1);
        assert_eq!(action.to_person_id, 2);
    }

    #[test]
    fn representative_ties_break_on_created_then_id() {
        // Equal record counts, equal created: lowest id wins.
        let results = vec![result(0, 0.99, 10, 11)];
        let crosswalk = vec![
            xwalk(7, "2024-01-01T00:00:00Z", 1, 11),
            xwalk(3, "2024-01-01T00:00:00Z", 1, 10),
        ];
        let analysis = MatchGraph::new(&results, &crosswalk)
            .unwrap()
            .analyze(0.8);

        assert_eq!(analysis.person_actions.len(), 1);
        assert_eq!(analysis.person_actions[0].to_person_id, 3);
    }

    #[test]
    fn disjoint_pairs_become_separate_groups() {
        let results = vec![result(0, 0.5, 10, 11), result(1, 0.5, 12, 13)];
        let crosswalk = vec![
            xwalk(1, "2024-01-01T00:00:00Z", 1, 10),
            xwalk(2, "2024-01-01T00:00:00Z", 1, 11),
            xwalk(3, "2024-01-01T00:00:00Z", 1, 12),
            xwalk(4, "2024-01-01T00:00:00Z", 1, 13),
        ];
        let analysis = MatchGraph::new(&results, &crosswalk)
            .unwrap()
            .analyze(0.8);

        assert_eq!(analysis.match_groups.len(), 2);
        assert_ne!(group_for(&analysis, 0), group_for(&analysis, 1));
    }

    #[test]
    fn transitive_auto_cluster_collapses_onto_one_person() {
        // 10 -0.95- 11 -0.92- 12, all above the threshold.
        let results = vec![result(0, 0.95, 10, 11), result(1, 0.92, 11, 12)];
        let crosswalk = vec![
            xwalk(1, "2024-01-01T00:00:00Z", 1, 10),
            xwalk(2, "2024-01-02T00:00:00Z", 1, 11),
            xwalk(3, "2024-01-03T00:00:00Z", 1, 12),
        ];
        let analysis = MatchGraph::new(&results, &crosswalk)
            .unwrap()
            .analyze(0.8);

        assert_eq!(analysis.match_groups.len(), 1);
        assert!(analysis.match_groups[0].matched);
        assert_eq!(analysis.person_actions.len(), 2);
        for action in &analysis.person_actions {
            assert_eq!(action.to_person_id, 1);
        }
    }

    #[test]
    fn partial_auto_match_leaves_group_unmatched() {
        // 10/11 auto-match; 12 joins the group only through a potential edge.
        let results = vec![result(0, 0.95, 10, 11), result(1, 0.5, 11, 12)];
        let crosswalk = vec![
            xwalk(1, "2024-01-01T00:00:00Z", 1, 10),
            xwalk(2, "2024-01-02T00:00:00Z", 1, 11),
            xwalk(3, "2024-01-03T00:00:00Z", 1, 12),
        ];
        let analysis = MatchGraph::new(&results, &crosswalk)
            .unwrap()
            .analyze(0.8);

        assert_eq!(analysis.match_groups.len(), 1);
        assert!(!analysis.match_groups[0].matched);
        assert_eq!(analysis.person_actions.len(), 1);
        assert_eq!(analysis.person_actions[0].person_record_id, 11);
        assert_eq!(analysis.person_actions[0].to_person_id, 1);
    }

    #[test]
    fn record_already_owned_by_representative_moves_nothing() {
        // Both records already belong to person 1.
        let results = vec![result(0, 0.95, 10, 11)];
        let crosswalk = vec![
            xwalk(1, "2024-01-01T00:00:00Z", 2, 10),
            xwalk(1, "2024-01-01T00:00:00Z", 2, 11),
        ];
        let analysis = MatchGraph::new(&results, &crosswalk)
            .unwrap()
            .analyze(0.8);

        assert!(analysis.person_actions.is_empty());
        assert!(analysis.match_groups[0].matched);
    }

    #[test]
    fn shared_person_bridges_groups_into_one_component() {
        // Records 10 and 11 belong to the same person; results touch each of
        // them separately, so everything lands in a single group.
        let results = vec![result(0, 0.5, 10, 12), result(1, 0.5, 11, 13)];
        let crosswalk = vec![
            xwalk(1, "2024-01-01T00:00:00Z", 2, 10),
            xwalk(1, "2024-01-01T00:00:00Z", 2, 11),
            xwalk(2, "2024-01-02T00:00:00Z", 1, 12),
            xwalk(3, "2024-01-03T00:00:00Z", 1, 13),
        ];
        let analysis = MatchGraph::new(&results, &crosswalk)
            .unwrap()
            .analyze(0.8);

        assert_eq!(analysis.match_groups.len(), 1);
        assert_eq!(group_for(&analysis, 0), group_for(&analysis, 1));
    }

    #[test]
    fn auto_match_within_larger_potential_component_keeps_group_uuid() {
        // One component, two auto clusters: {10,11} collapses, 12 stays.
        let results = vec![
            result(0, 0.95, 10, 11),
            result(1, 0.5, 10, 12),
        ];
        let crosswalk = vec![
            xwalk(1, "2024-01-01T00:00:00Z", 1, 10),
            xwalk(2, "2024-01-02T00:00:00Z", 1, 11),
            xwalk(3, "2024-01-03T00:00:00Z", 1, 12),
        ];
        let analysis = MatchGraph::new(&results, &crosswalk)
            .unwrap()
            .analyze(0.8);

        assert_eq!(analysis.match_groups.len(), 1);
        let group = analysis.match_groups[0].uuid;
        assert_eq!(analysis.person_actions.len(), 1);
        assert_eq!(analysis.person_actions[0].match_group_uuid, group);
        // Persons 1 and 3 remain, so the group is not fully matched.
        assert!(!analysis.match_groups[0].matched);
    }

    #[test]
    fn reassignment_carries_observed_versions() {
        let results = vec![result(0, 0.95, 10, 11)];
        let crosswalk = vec![
            CrosswalkRow {
                person_id: 1,
                person_created: ts("2024-01-01T00:00:00Z"),
                person_version: 4,
                record_count: 1,
                person_record_id: 10,
            },
            CrosswalkRow {
                person_id: 2,
                person_created: ts("2024-01-02T00:00:00Z"),
                person_version: 7,
                record_count: 1,
                person_record_id: 11,
            },
        ];
        let analysis = MatchGraph::new(&results, &crosswalk)
            .unwrap()
            .analyze(0.8);

        let action = &analysis.person_actions[0];
        assert_eq!(action.from_person_version, 7);
        assert_eq!(action.to_person_version, 4);
    }
}
