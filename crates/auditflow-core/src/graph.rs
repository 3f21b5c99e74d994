// crates/auditflow-core/src/graph.rs
// ============================================================================
// Module: Execution Graph
// Description: Immutable typed DAG built once per run from plugin specs.
// Purpose: Single source of truth for a run's topology, node identity, and
//          routing resolution.
// Dependencies: crate::{error, hashing, identifiers, model, schema}
// ============================================================================

//! ## Overview
//! The graph is built once, validated exhaustively, and never mutated
//! afterward — the runtime never sees an unvalidated graph. Node identity is
//! a deterministic content hash so that two builds of the same
//! configuration agree, which checkpoint compatibility depends on.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::num::NonZeroU64;

use auditflow_expr::parse_condition;
use serde::Serialize;
use serde_json::Value;

use crate::error::GraphError;
use crate::hashing::DEFAULT_HASH_ALGORITHM;
use crate::hashing::hash_canonical_json;
use crate::identifiers::EdgeId;
use crate::identifiers::NodeId;
use crate::identifiers::RunId;
use crate::model::Determinism;
use crate::model::Edge;
use crate::model::EdgeMode;
use crate::model::Node;
use crate::model::NodeType;
use crate::schema::SchemaContract;
use crate::schema::check_compatible;
use crate::schema::check_not_mixed;

/// How a transform routes a row that its `process` call rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorRoute {
    /// Drop the row; record a `transform_errors` entry but emit no edge.
    Discard,
    /// Divert the row to the named sink.
    Sink(String),
}

/// Declarative per-node-type wiring, supplied by the assembly entry point
/// before the graph is built.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Emits rows into the graph.
    Source {
        /// Connection name or sink name the emitted rows are routed to.
        on_success: String,
        /// Sink name quarantined rows are diverted to, if the source
        /// performs validation.
        quarantine_sink: Option<String>,
        /// Effective output schema contract.
        output_schema: SchemaContract,
    },
    /// Maps one row to at most one row.
    Transform {
        /// Connection name this node listens on.
        input: String,
        /// Connection name or sink name for successful rows.
        on_success: String,
        /// Routing for rows the transform rejects.
        on_error: ErrorRoute,
        /// Effective input schema contract.
        input_schema: SchemaContract,
        /// Effective output schema contract.
        output_schema: SchemaContract,
    },
    /// Buffers rows and transforms a batch; topologically identical to a
    /// transform.
    Aggregation {
        /// Connection name this node listens on.
        input: String,
        /// Connection name or sink name for the aggregation's output.
        on_success: String,
        /// Effective input schema contract.
        input_schema: SchemaContract,
        /// Effective output schema contract.
        output_schema: SchemaContract,
    },
    /// Evaluates a condition and routes the token.
    Gate {
        /// Connection name this node listens on.
        input: String,
        /// Gate condition source text, evaluated by `auditflow-expr`.
        condition: String,
        /// Route label to destination name (sink name, processing-node
        /// connection name, or the literal `"fork"`).
        routes: BTreeMap<String, String>,
        /// Branch names to duplicate the token across when a route resolves
        /// to `Fork`.
        fork_to: Vec<String>,
    },
    /// Joins multiple fork branches into one token.
    Coalesce {
        /// Coalesce name, used by `get_coalesce_id_map`/`get_branch_to_coalesce_map`.
        name: String,
        /// Branch name to the connection name of that branch's producer.
        branches: BTreeMap<String, String>,
        /// Connection name or sink name for the merged token.
        on_success: String,
    },
    /// Terminal write destination.
    Sink {
        /// Sink name, used by gate routes and `get_sink_id_map`.
        name: String,
    },
}

impl NodeKind {
    const fn node_type(&self) -> NodeType {
        match self {
            Self::Source { .. } => NodeType::Source,
            Self::Transform { .. } => NodeType::Transform,
            Self::Aggregation { .. } => NodeType::Aggregation,
            Self::Gate { .. } => NodeType::Gate,
            Self::Coalesce { .. } => NodeType::Coalesce,
            Self::Sink { .. } => NodeType::Sink,
        }
    }
}

/// One node's assembly-time specification, before node identity is assigned.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// Implementing plugin name.
    pub plugin_name: String,
    /// Implementing plugin version.
    pub plugin_version: String,
    /// Declared determinism.
    pub determinism: Determinism,
    /// Raw configuration, canonicalized for node-identity hashing.
    pub config: Value,
    /// Type-specific wiring.
    pub kind: NodeKind,
}

#[derive(Serialize)]
struct NodeIdentityKey<'a> {
    plugin_name: &'a str,
    plugin_version: &'a str,
    config: &'a Value,
    position: usize,
}

/// Resolved destination of a gate route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDestination {
    /// Route to the named sink.
    Sink(String),
    /// Move via the labeled edge to a downstream processing node.
    ProcessingNode(NodeId),
    /// Duplicate the token across the gate's declared fork branches.
    Fork,
}

/// The immutable, validated execution graph for one run.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    nodes: BTreeMap<NodeId, Node>,
    kinds: BTreeMap<NodeId, NodeKind>,
    edges: Vec<Edge>,
    source_id: NodeId,
    step_map: BTreeMap<NodeId, u32>,
    sink_id_map: BTreeMap<String, NodeId>,
    transform_id_map: BTreeMap<String, NodeId>,
    gate_id_map: BTreeMap<String, NodeId>,
    coalesce_id_map: BTreeMap<String, NodeId>,
    branch_to_coalesce_map: BTreeMap<String, String>,
    route_resolution_map: BTreeMap<(NodeId, String), RouteDestination>,
    terminal_sink_map: BTreeMap<NodeId, String>,
    edge_by_label: BTreeMap<(NodeId, String), EdgeId>,
}

impl ExecutionGraph {
    /// Builds and validates a graph from plugin specs. `run_id` seeds the
    /// edge-identifier sequence; it is not otherwise part of node identity.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] describing the first validation failure found.
    pub fn from_plugin_specs(run_id: RunId, specs: Vec<NodeSpec>) -> Result<Self, GraphError> {
        let builder = GraphBuilder::new(run_id, specs);
        builder.build()
    }

    /// Returns the run's single source node identifier.
    #[must_use]
    pub fn source(&self) -> NodeId {
        self.source_id.clone()
    }

    /// Returns every node in the graph.
    #[must_use]
    pub fn nodes(&self) -> &BTreeMap<NodeId, Node> {
        &self.nodes
    }

    /// Returns the wiring kind for one node.
    #[must_use]
    pub fn kind(&self, node_id: &NodeId) -> Option<&NodeKind> {
        self.kinds.get(node_id)
    }

    /// Returns every edge in the graph.
    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Returns the step index assigned to a node.
    #[must_use]
    pub fn step_index(&self, node_id: &NodeId) -> Option<u32> {
        self.step_map.get(node_id).copied()
    }

    /// Maps sink name to node identifier.
    #[must_use]
    pub fn get_sink_id_map(&self) -> &BTreeMap<String, NodeId> {
        &self.sink_id_map
    }

    /// Maps a transform's input connection name to node identifier.
    #[must_use]
    pub fn get_transform_id_map(&self) -> &BTreeMap<String, NodeId> {
        &self.transform_id_map
    }

    /// Maps a gate's input connection name to node identifier.
    #[must_use]
    pub fn get_config_gate_id_map(&self) -> &BTreeMap<String, NodeId> {
        &self.gate_id_map
    }

    /// Maps coalesce name to node identifier.
    #[must_use]
    pub fn get_coalesce_id_map(&self) -> &BTreeMap<String, NodeId> {
        &self.coalesce_id_map
    }

    /// Maps fork branch name to the coalesce **name** that owns it.
    #[must_use]
    pub fn get_branch_to_coalesce_map(&self) -> &BTreeMap<String, String> {
        &self.branch_to_coalesce_map
    }

    /// Maps `(gate_node, route_label)` to its resolved destination.
    #[must_use]
    pub fn get_route_resolution_map(&self) -> &BTreeMap<(NodeId, String), RouteDestination> {
        &self.route_resolution_map
    }

    /// Maps a processing node to the sink name its `on_success` resolves to,
    /// when that resolution is direct (not via another processing node).
    #[must_use]
    pub fn get_terminal_sink_map(&self) -> &BTreeMap<NodeId, String> {
        &self.terminal_sink_map
    }

    /// Finds the edge leaving `from` labeled `label`, if one exists.
    #[must_use]
    pub fn edge_by_label(&self, from: &NodeId, label: &str) -> Option<&Edge> {
        let edge_id = self.edge_by_label.get(&(from.clone(), label.to_string()))?;
        self.edges.iter().find(|e| &e.edge_id == edge_id)
    }
}

struct GraphBuilder {
    run_id: RunId,
    specs: Vec<NodeSpec>,
}

impl GraphBuilder {
    const fn new(run_id: RunId, specs: Vec<NodeSpec>) -> Self {
        Self { run_id, specs }
    }

    fn build(self) -> Result<ExecutionGraph, GraphError> {
        let run_id = self.run_id;
        let node_ids = self.assign_node_ids()?;
        let nodes = self.build_node_records(&node_ids);

        let source_id = Self::find_source(&nodes)?;
        let sink_id_map = Self::build_sink_id_map(&nodes, &node_ids, &self.specs);
        if sink_id_map.is_empty() {
            return Err(GraphError::NoSinks);
        }
        let consumer_by_connection = self.build_consumer_by_connection(&node_ids);

        let mut edges = Vec::new();
        let mut edge_seq = 0u64;
        let mut edge_by_label = BTreeMap::new();
        let mut route_resolution_map = BTreeMap::new();
        let mut terminal_sink_map = BTreeMap::new();
        let mut branch_to_coalesce_map = BTreeMap::new();
        let mut coalesce_id_map = BTreeMap::new();
        let mut transform_id_map = BTreeMap::new();
        let mut gate_id_map = BTreeMap::new();

        for (position, spec) in self.specs.iter().enumerate() {
            let node_id = node_ids[position].clone();
            match &spec.kind {
                NodeKind::Source { on_success, quarantine_sink, .. } => {
                    Self::link(
                        &node_id,
                        on_success,
                        "continue",
                        EdgeMode::Move,
                        &sink_id_map,
                        &consumer_by_connection,
                        &mut edges,
                        &mut edge_seq,
                        &mut edge_by_label,
                        &mut terminal_sink_map,
                    )?;
                    if let Some(sink_name) = quarantine_sink {
                        let sink_id = sink_id_map.get(sink_name).cloned().ok_or_else(|| {
                            GraphError::UnknownRouteSink {
                                gate: node_id.clone(),
                                route: "__quarantine__".to_string(),
                                sink: sink_name.clone(),
                            }
                        })?;
                        Self::push_edge(
                            &node_id,
                            &sink_id,
                            "__quarantine__",
                            EdgeMode::Divert,
                            &mut edges,
                            &mut edge_seq,
                            &mut edge_by_label,
                        )?;
                    }
                }
                NodeKind::Transform { input, on_success, on_error, .. } => {
                    transform_id_map.insert(input.clone(), node_id.clone());
                    Self::link(
                        &node_id,
                        on_success,
                        "continue",
                        EdgeMode::Move,
                        &sink_id_map,
                        &consumer_by_connection,
                        &mut edges,
                        &mut edge_seq,
                        &mut edge_by_label,
                        &mut terminal_sink_map,
                    )?;
                    if let ErrorRoute::Sink(sink_name) = on_error {
                        let sink_id = sink_id_map.get(sink_name).cloned().ok_or_else(|| {
                            GraphError::UnknownRouteSink {
                                gate: node_id.clone(),
                                route: "__error__".to_string(),
                                sink: sink_name.clone(),
                            }
                        })?;
                        let digest =
                            hash_canonical_json(DEFAULT_HASH_ALGORITHM, &format!("{node_id}:on_error")).map_err(
                                |_| GraphError::MissingQuarantineEdge { node_id: node_id.clone() },
                            )?;
                        let label = format!("__error_{}__", &digest.value[..16.min(digest.value.len())]);
                        Self::push_edge(
                            &node_id,
                            &sink_id,
                            &label,
                            EdgeMode::Divert,
                            &mut edges,
                            &mut edge_seq,
                            &mut edge_by_label,
                        )?;
                    }
                }
                NodeKind::Aggregation { input, on_success, .. } => {
                    transform_id_map.insert(input.clone(), node_id.clone());
                    Self::link(
                        &node_id,
                        on_success,
                        "continue",
                        EdgeMode::Move,
                        &sink_id_map,
                        &consumer_by_connection,
                        &mut edges,
                        &mut edge_seq,
                        &mut edge_by_label,
                        &mut terminal_sink_map,
                    )?;
                }
                NodeKind::Gate { input, condition, routes, fork_to } => {
                    parse_condition(condition)
                        .map_err(|source| GraphError::InvalidGateCondition { node_id: node_id.clone(), source })?;
                    gate_id_map.insert(input.clone(), node_id.clone());
                    for (route_label, destination) in routes {
                        let resolved = if destination == "fork" {
                            RouteDestination::Fork
                        } else if let Some(sink_id) = sink_id_map.get(destination) {
                            Self::push_edge(
                                &node_id,
                                sink_id,
                                route_label,
                                EdgeMode::Move,
                                &mut edges,
                                &mut edge_seq,
                                &mut edge_by_label,
                            )?;
                            RouteDestination::Sink(destination.clone())
                        } else if let Some(target) = consumer_by_connection.get(destination) {
                            Self::push_edge(
                                &node_id,
                                target,
                                route_label,
                                EdgeMode::Move,
                                &mut edges,
                                &mut edge_seq,
                                &mut edge_by_label,
                            )?;
                            RouteDestination::ProcessingNode(target.clone())
                        } else {
                            return Err(GraphError::UnknownRouteSink {
                                gate: node_id.clone(),
                                route: route_label.clone(),
                                sink: destination.clone(),
                            });
                        };
                        route_resolution_map.insert((node_id.clone(), route_label.clone()), resolved);
                    }
                    for branch in fork_to {
                        let target = consumer_by_connection.get(branch).ok_or_else(|| {
                            GraphError::InvalidForkBranch {
                                branch: branch.clone(),
                                reason: "no node declares this branch as its input connection".to_string(),
                            }
                        })?;
                        Self::push_edge(
                            &node_id,
                            target,
                            branch,
                            EdgeMode::Copy,
                            &mut edges,
                            &mut edge_seq,
                            &mut edge_by_label,
                        )?;
                    }
                }
                NodeKind::Coalesce { name, branches, on_success } => {
                    coalesce_id_map.insert(name.clone(), node_id.clone());
                    for branch_name in branches.keys() {
                        if branch_to_coalesce_map.contains_key(branch_name) {
                            return Err(GraphError::InvalidForkBranch {
                                branch: branch_name.clone(),
                                reason: "branch name is declared by more than one coalesce".to_string(),
                            });
                        }
                        branch_to_coalesce_map.insert(branch_name.clone(), name.clone());
                    }
                    // Branch edges into this coalesce are created when each
                    // branch's producer node is visited, via the
                    // `consumer_by_connection` entries registered for this
                    // coalesce's branches in `build_consumer_by_connection`.
                    Self::link(
                        &node_id,
                        on_success,
                        "continue",
                        EdgeMode::Move,
                        &sink_id_map,
                        &consumer_by_connection,
                        &mut edges,
                        &mut edge_seq,
                        &mut edge_by_label,
                        &mut terminal_sink_map,
                    )?;
                }
                NodeKind::Sink { .. } => {}
            }
        }

        for (branch_name, _) in &branch_to_coalesce_map {
            let declared_by_some_fork = self.specs.iter().any(|spec| {
                matches!(&spec.kind, NodeKind::Gate { fork_to, .. } if fork_to.contains(branch_name))
            });
            if !declared_by_some_fork {
                return Err(GraphError::InvalidForkBranch {
                    branch: branch_name.clone(),
                    reason: "branch does not appear in any gate's fork_to list".to_string(),
                });
            }
        }

        for edge in &mut edges {
            edge.run_id = run_id;
        }

        Self::check_reachable(&source_id, &nodes, &edges)?;
        Self::check_acyclic(&nodes, &edges)?;
        Self::check_schema_compatibility(&nodes, &edges)?;
        Self::check_coalesce_schema_mixing(&self.specs, &node_ids, &nodes, &edges)?;

        let step_map = Self::build_step_map(&self.specs, &node_ids, &source_id);

        Ok(ExecutionGraph {
            nodes,
            kinds: self.specs.iter().zip(node_ids.iter()).map(|(s, id)| (id.clone(), s.kind.clone())).collect(),
            edges,
            source_id,
            step_map,
            sink_id_map,
            transform_id_map,
            gate_id_map,
            coalesce_id_map,
            branch_to_coalesce_map,
            route_resolution_map,
            terminal_sink_map,
            edge_by_label,
        })
    }

    fn assign_node_ids(&self) -> Result<Vec<NodeId>, GraphError> {
        Ok(self
            .specs
            .iter()
            .enumerate()
            .map(|(position, spec)| {
                let key = NodeIdentityKey {
                    plugin_name: &spec.plugin_name,
                    plugin_version: &spec.plugin_version,
                    config: &spec.config,
                    position,
                };
                let digest = hash_canonical_json(DEFAULT_HASH_ALGORITHM, &key).unwrap_or_else(|_| {
                    crate::hashing::hash_bytes(DEFAULT_HASH_ALGORITHM, format!("{position}:{}", spec.config).as_bytes())
                });
                NodeId::new(digest.value)
            })
            .collect())
    }

    fn build_node_records(&self, node_ids: &[NodeId]) -> BTreeMap<NodeId, Node> {
        let mut nodes = BTreeMap::new();
        for (position, spec) in self.specs.iter().enumerate() {
            let node_id = node_ids[position].clone();
            let config_hash =
                hash_canonical_json(DEFAULT_HASH_ALGORITHM, &spec.config).unwrap_or_else(|_| {
                    crate::hashing::hash_bytes(DEFAULT_HASH_ALGORITHM, spec.config.to_string().as_bytes())
                });
            let (input_schema_contract, output_schema_contract) = match &spec.kind {
                NodeKind::Source { output_schema, .. } => (None, Some(output_schema.clone())),
                NodeKind::Transform { input_schema, output_schema, .. } => {
                    (Some(input_schema.clone()), Some(output_schema.clone()))
                }
                NodeKind::Aggregation { input_schema, output_schema, .. } => {
                    (Some(input_schema.clone()), Some(output_schema.clone()))
                }
                NodeKind::Gate { .. } | NodeKind::Coalesce { .. } => (None, None),
                NodeKind::Sink { .. } => (None, None),
            };
            nodes.insert(
                node_id.clone(),
                Node {
                    node_id,
                    run_id: self.run_id,
                    plugin_name: spec.plugin_name.clone(),
                    plugin_version: spec.plugin_version.clone(),
                    node_type: spec.kind.node_type(),
                    determinism: spec.determinism,
                    config_hash,
                    config_json: spec.config.clone(),
                    input_schema_contract,
                    output_schema_contract,
                },
            );
        }
        nodes
    }

    fn find_source(nodes: &BTreeMap<NodeId, Node>) -> Result<NodeId, GraphError> {
        let sources: Vec<&NodeId> =
            nodes.iter().filter(|(_, n)| n.node_type == NodeType::Source).map(|(id, _)| id).collect();
        match sources.as_slice() {
            [single] => Ok((*single).clone()),
            other => Err(GraphError::SourceCountInvalid { count: other.len() }),
        }
    }

    fn build_sink_id_map(
        nodes: &BTreeMap<NodeId, Node>,
        node_ids: &[NodeId],
        specs: &[NodeSpec],
    ) -> BTreeMap<String, NodeId> {
        let mut map = BTreeMap::new();
        for (position, spec) in specs.iter().enumerate() {
            if let NodeKind::Sink { name } = &spec.kind {
                let node_id = node_ids[position].clone();
                if nodes.contains_key(&node_id) {
                    map.insert(name.clone(), node_id);
                }
            }
        }
        map
    }

    /// Maps every consumer's declared `input` connection name to its node
    /// identifier. Sinks are addressed by name, not by this map, because a
    /// sink's listening connection is defined to equal its declared name.
    fn build_consumer_by_connection(&self, node_ids: &[NodeId]) -> BTreeMap<String, NodeId> {
        let mut map = BTreeMap::new();
        for (position, spec) in self.specs.iter().enumerate() {
            let node_id = node_ids[position].clone();
            match &spec.kind {
                NodeKind::Transform { input, .. }
                | NodeKind::Aggregation { input, .. }
                | NodeKind::Gate { input, .. } => {
                    map.insert(input.clone(), node_id);
                }
                NodeKind::Sink { name } => {
                    map.insert(name.clone(), node_id);
                }
                NodeKind::Coalesce { branches, .. } => {
                    for producer_connection in branches.values() {
                        map.insert(producer_connection.clone(), node_id.clone());
                    }
                }
                NodeKind::Source { .. } => {}
            }
        }
        map
    }

    #[allow(clippy::too_many_arguments, reason = "edge construction needs the full build context")]
    fn link(
        from: &NodeId,
        connection: &str,
        label: &str,
        mode: EdgeMode,
        sink_id_map: &BTreeMap<String, NodeId>,
        consumer_by_connection: &BTreeMap<String, NodeId>,
        edges: &mut Vec<Edge>,
        edge_seq: &mut u64,
        edge_by_label: &mut BTreeMap<(NodeId, String), EdgeId>,
        terminal_sink_map: &mut BTreeMap<NodeId, String>,
    ) -> Result<(), GraphError> {
        if let Some(sink_id) = sink_id_map.get(connection) {
            Self::push_edge(from, sink_id, label, mode, edges, edge_seq, edge_by_label)?;
            terminal_sink_map.insert(from.clone(), connection.to_string());
            Ok(())
        } else if let Some(target) = consumer_by_connection.get(connection) {
            Self::push_edge(from, target, label, mode, edges, edge_seq, edge_by_label)
        } else {
            Err(GraphError::DanglingConnection { from_node: from.clone(), connection: connection.to_string() })
        }
    }

    fn push_edge(
        from: &NodeId,
        to: &NodeId,
        label: &str,
        mode: EdgeMode,
        edges: &mut Vec<Edge>,
        edge_seq: &mut u64,
        edge_by_label: &mut BTreeMap<(NodeId, String), EdgeId>,
    ) -> Result<(), GraphError> {
        let key = (from.clone(), label.to_string());
        if edge_by_label.contains_key(&key) {
            return Err(GraphError::DuplicateEdgeLabel { from_node: from.clone(), label: label.to_string() });
        }
        *edge_seq += 1;
        let edge_id = EdgeId::new(NonZeroU64::new(*edge_seq).unwrap_or(NonZeroU64::MIN));
        edges.push(Edge {
            edge_id,
            // Overwritten with the real run id once the full edge set is built.
            run_id: RunId::new(NonZeroU64::MIN),
            from_node: from.clone(),
            to_node: to.clone(),
            label: label.to_string(),
            default_mode: mode,
        });
        edge_by_label.insert(key, edge_id);
        Ok(())
    }

    fn check_reachable(
        source_id: &NodeId,
        nodes: &BTreeMap<NodeId, Node>,
        edges: &[Edge],
    ) -> Result<(), GraphError> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![source_id.clone()];
        visited.insert(source_id.clone());
        while let Some(current) = stack.pop() {
            for edge in edges.iter().filter(|e| e.from_node == current && e.default_mode != EdgeMode::Divert) {
                if visited.insert(edge.to_node.clone()) {
                    stack.push(edge.to_node.clone());
                }
            }
        }
        for node_id in nodes.keys() {
            if !visited.contains(node_id) {
                return Err(GraphError::UnreachableNode { node_id: node_id.clone() });
            }
        }
        Ok(())
    }

    fn check_acyclic(nodes: &BTreeMap<NodeId, Node>, edges: &[Edge]) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: BTreeMap<NodeId, Mark> = BTreeMap::new();

        fn visit(
            node: &NodeId,
            nodes: &BTreeMap<NodeId, Node>,
            edges: &[Edge],
            marks: &mut BTreeMap<NodeId, Mark>,
        ) -> Result<(), GraphError> {
            match marks.get(node) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(GraphError::CycleDetected { node_id: node.clone() });
                }
                None => {}
            }
            marks.insert(node.clone(), Mark::Visiting);
            for edge in edges.iter().filter(|e| &e.from_node == node && e.default_mode != EdgeMode::Divert) {
                visit(&edge.to_node, nodes, edges, marks)?;
            }
            marks.insert(node.clone(), Mark::Done);
            Ok(())
        }

        for node_id in nodes.keys() {
            visit(node_id, nodes, edges, &mut marks)?;
        }
        Ok(())
    }

    fn check_schema_compatibility(nodes: &BTreeMap<NodeId, Node>, edges: &[Edge]) -> Result<(), GraphError> {
        for edge in edges.iter().filter(|e| e.default_mode != EdgeMode::Divert) {
            let producer_schema =
                nodes.get(&edge.from_node).and_then(|n| n.output_schema_contract.clone()).unwrap_or(SchemaContract::Observed);
            let Some(consumer) = nodes.get(&edge.to_node) else { continue };
            let Some(consumer_schema) = consumer.input_schema_contract.clone() else { continue };
            check_compatible(&producer_schema, &consumer_schema).map_err(|source| GraphError::SchemaIncompatible {
                from_node: edge.from_node.clone(),
                to_node: edge.to_node.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn check_coalesce_schema_mixing(
        specs: &[NodeSpec],
        node_ids: &[NodeId],
        nodes: &BTreeMap<NodeId, Node>,
        edges: &[Edge],
    ) -> Result<(), GraphError> {
        for (position, spec) in specs.iter().enumerate() {
            let NodeKind::Coalesce { name, .. } = &spec.kind else { continue };
            let coalesce_id = &node_ids[position];
            let branch_schemas: Vec<SchemaContract> = edges
                .iter()
                .filter(|e| &e.to_node == coalesce_id)
                .filter_map(|e| nodes.get(&e.from_node))
                .filter_map(|n| n.output_schema_contract.clone())
                .collect();
            check_not_mixed(&format!("coalesce `{name}`"), branch_schemas.iter()).map_err(|source| {
                GraphError::SchemaIncompatible { from_node: coalesce_id.clone(), to_node: coalesce_id.clone(), source }
            })?;
        }
        Ok(())
    }

    fn build_step_map(specs: &[NodeSpec], node_ids: &[NodeId], source_id: &NodeId) -> BTreeMap<NodeId, u32> {
        let mut step_map = BTreeMap::new();
        step_map.insert(source_id.clone(), 0);
        let mut step = 1u32;
        for node_type in [NodeType::Transform, NodeType::Aggregation, NodeType::Gate, NodeType::Coalesce, NodeType::Sink] {
            for (position, spec) in specs.iter().enumerate() {
                if spec.kind.node_type() == node_type {
                    step_map.insert(node_ids[position].clone(), step);
                    step += 1;
                }
            }
        }
        step_map
    }
}

#[cfg(test)]
#[path = "graph/tests.rs"]
mod tests;
