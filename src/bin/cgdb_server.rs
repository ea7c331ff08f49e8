//! cgdb-server - Unix socket server for GraphEngine
//!
//! Serves any number of databases to local clients. The database named on
//! the command line is registered as `default` and every connection starts
//! attached to it; `openDatabase` switches to another one, persistent under
//! the data directory or ephemeral in memory. Each connection gets its own
//! session: at most one open batch (an engine allows one at a time across
//! all sessions) plus any snapshot pins it takes.
//!
//! Usage:
//!   cgdb-server /path/to/graph.cgdb [--socket /tmp/cgdb.sock] [--config cgdb.json] [--create]
//!               [--data-dir /path/to/databases] [--slow-query-ms 100]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]
//!
//! Payloads are maps with a `cmd` tag and an optional `requestId` that is
//! echoed back. Node ids travel as decimal strings. Clients that send
//! `hello` with protocol version 2 receive large query results as a series
//! of `nodesChunk` / `edgesChunk` frames instead of one frame.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use cgdb::database_manager::{AccessMode, DatabaseInfo, DatabaseManager, DEFAULT_DATABASE};
use cgdb::graph::traversal::{self, Direction};
use cgdb::graph::{DiffSummary, SnapshotDiff};
use cgdb::metrics::{Metrics, MetricsSnapshot, DEFAULT_SLOW_THRESHOLD_MS};
use cgdb::session::{ClientId, ClientSession};
use cgdb::storage::compaction::CompactionResult;
use cgdb::{
    id_from_semantic, CommitDelta, EdgeQuery, EdgeRecord, EngineConfig, EngineStats, GraphEngine,
    GraphError, GraphReader, NodeQuery, NodeRecord, ReclaimResult, SnapshotInfo,
};

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// Highest protocol version this server speaks.
const PROTOCOL_VERSION: u32 = 2;

/// Query results larger than this are streamed to v2 clients.
const STREAMING_THRESHOLD: usize = 100;

const STREAMING_CHUNK_SIZE: usize = 500;

const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

// ============================================================================
// Command Line
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "cgdb-server", version, about = "Code-graph database server over a Unix socket")]
struct Args {
    /// Database directory
    db_path: PathBuf,

    /// Unix socket path
    #[arg(long, default_value = "/tmp/cgdb.sock")]
    socket: PathBuf,

    /// Engine configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Create the database if it does not exist
    #[arg(long)]
    create: bool,

    /// Never compact in the background
    #[arg(long)]
    no_auto_compact: bool,

    /// Where databases created over the wire live (default: the parent of db_path)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Requests at least this slow are logged and kept in the metrics
    #[arg(long, default_value_t = DEFAULT_SLOW_THRESHOLD_MS)]
    slow_query_ms: u64,
}

// ============================================================================
// Wire Protocol Types
// ============================================================================

/// Request from client
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    Hello {
        #[serde(default)]
        protocol_version: Option<u32>,
        #[serde(default)]
        client_id: Option<String>,
    },
    Ping,

    // ── Batches ──
    BeginBatch,
    AddNode {
        node: WireNode,
    },
    AddNodes {
        nodes: Vec<WireNode>,
    },
    AddEdge {
        edge: WireEdge,
    },
    AddEdges {
        edges: Vec<WireEdge>,
    },
    #[serde(rename_all = "camelCase")]
    CommitBatch {
        partitions: Vec<String>,
        #[serde(default)]
        protected_types: Vec<String>,
    },
    AbortBatch,

    // ── Reads ──
    GetNode {
        id: String,
    },
    QueryNodes {
        #[serde(default)]
        query: NodeQuery,
    },
    QueryEdges {
        #[serde(default)]
        query: WireEdgeQuery,
    },
    #[serde(rename_all = "camelCase")]
    DiffSnapshots {
        from: u64,
        to: u64,
        #[serde(default)]
        summary_only: bool,
    },
    FindDependentPartitions {
        partitions: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    CountNodesByType {
        #[serde(default)]
        types: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    CountEdgesByType {
        #[serde(default)]
        types: Vec<String>,
    },

    // ── Traversal ──
    #[serde(rename_all = "camelCase")]
    Neighbors {
        id: String,
        #[serde(default)]
        edge_types: Vec<String>,
        #[serde(default)]
        backward: bool,
    },
    #[serde(rename_all = "camelCase")]
    Bfs {
        start_ids: Vec<String>,
        max_depth: usize,
        #[serde(default)]
        edge_types: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Dfs {
        start_ids: Vec<String>,
        max_depth: usize,
        #[serde(default)]
        edge_types: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Reachability {
        start_ids: Vec<String>,
        max_depth: usize,
        #[serde(default)]
        edge_types: Vec<String>,
        #[serde(default)]
        backward: bool,
    },

    // ── Databases ──
    CreateDatabase {
        name: String,
        #[serde(default)]
        ephemeral: bool,
    },
    OpenDatabase {
        name: String,
        #[serde(default = "default_mode")]
        mode: String,
    },
    CloseDatabase,
    DropDatabase {
        name: String,
    },
    ListDatabases,
    CurrentDatabase,

    // ── Versions ──
    TagSnapshot {
        name: String,
        #[serde(default)]
        version: Option<u64>,
    },
    UntagSnapshot {
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    ListSnapshots {
        #[serde(default)]
        tagged_only: bool,
    },
    PinSnapshot {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        version: Option<u64>,
    },
    UnpinSnapshot {
        version: u64,
    },

    // ── Maintenance ──
    Compact {
        #[serde(default)]
        force: bool,
    },
    Reclaim,
    Stats,
    Shutdown,
}

impl Request {
    fn name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::Ping => "ping",
            Request::BeginBatch => "beginBatch",
            Request::AddNode { .. } => "addNode",
            Request::AddNodes { .. } => "addNodes",
            Request::AddEdge { .. } => "addEdge",
            Request::AddEdges { .. } => "addEdges",
            Request::CommitBatch { .. } => "commitBatch",
            Request::AbortBatch => "abortBatch",
            Request::GetNode { .. } => "getNode",
            Request::QueryNodes { .. } => "queryNodes",
            Request::QueryEdges { .. } => "queryEdges",
            Request::DiffSnapshots { .. } => "diffSnapshots",
            Request::FindDependentPartitions { .. } => "findDependentPartitions",
            Request::CountNodesByType { .. } => "countNodesByType",
            Request::CountEdgesByType { .. } => "countEdgesByType",
            Request::Neighbors { .. } => "neighbors",
            Request::Bfs { .. } => "bfs",
            Request::Dfs { .. } => "dfs",
            Request::Reachability { .. } => "reachability",
            Request::CreateDatabase { .. } => "createDatabase",
            Request::OpenDatabase { .. } => "openDatabase",
            Request::CloseDatabase => "closeDatabase",
            Request::DropDatabase { .. } => "dropDatabase",
            Request::ListDatabases => "listDatabases",
            Request::CurrentDatabase => "currentDatabase",
            Request::TagSnapshot { .. } => "tagSnapshot",
            Request::UntagSnapshot { .. } => "untagSnapshot",
            Request::ListSnapshots { .. } => "listSnapshots",
            Request::PinSnapshot { .. } => "pinSnapshot",
            Request::UnpinSnapshot { .. } => "unpinSnapshot",
            Request::Compact { .. } => "compact",
            Request::Reclaim => "reclaim",
            Request::Stats => "stats",
            Request::Shutdown => "shutdown",
        }
    }
}

fn default_mode() -> String {
    AccessMode::ReadWrite.as_str().to_string()
}

/// Response to client
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    HelloOk {
        ok: bool,
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
        #[serde(rename = "serverVersion")]
        server_version: String,
        features: Vec<String>,
    },
    Pong {
        pong: bool,
        version: String,
    },
    Ok {
        ok: bool,
    },
    BatchStarted {
        ok: bool,
        #[serde(rename = "baseVersion")]
        base_version: u64,
    },
    Staged {
        ok: bool,
        #[serde(rename = "stagedNodes")]
        staged_nodes: usize,
        #[serde(rename = "stagedEdges")]
        staged_edges: usize,
    },
    BatchCommitted {
        ok: bool,
        delta: WireCommitDelta,
    },
    BatchAborted {
        ok: bool,
        aborted: bool,
    },
    Node {
        node: Option<WireNode>,
    },
    Nodes {
        nodes: Vec<WireNode>,
    },
    NodesChunk {
        nodes: Vec<WireNode>,
        done: bool,
        #[serde(rename = "chunkIndex")]
        chunk_index: u32,
    },
    Edges {
        edges: Vec<WireEdge>,
    },
    EdgesChunk {
        edges: Vec<WireEdge>,
        done: bool,
        #[serde(rename = "chunkIndex")]
        chunk_index: u32,
    },
    Diff {
        diff: WireSnapshotDiff,
    },
    Dependents {
        partitions: Vec<String>,
    },
    Counts {
        counts: BTreeMap<String, u64>,
    },
    Ids {
        ids: Vec<String>,
    },
    DatabaseCreated {
        ok: bool,
        #[serde(rename = "databaseId")]
        database_id: String,
    },
    DatabaseOpened {
        ok: bool,
        #[serde(rename = "databaseId")]
        database_id: String,
        mode: String,
        #[serde(rename = "nodeCount")]
        node_count: u64,
        #[serde(rename = "edgeCount")]
        edge_count: u64,
    },
    DatabaseList {
        databases: Vec<DatabaseInfo>,
    },
    CurrentDb {
        database: Option<String>,
        mode: Option<String>,
    },
    Tagged {
        ok: bool,
        name: String,
        version: u64,
    },
    Snapshots {
        snapshots: Vec<SnapshotInfo>,
    },
    Pinned {
        ok: bool,
        version: u64,
    },
    Unpinned {
        ok: bool,
        released: bool,
    },
    Compacted {
        ok: bool,
        result: CompactionResult,
    },
    Reclaimed {
        ok: bool,
        result: ReclaimResult,
    },
    Stats {
        database: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        stats: Option<EngineStats>,
        metrics: MetricsSnapshot,
    },
    ErrorWithCode {
        error: String,
        code: String,
    },
}

impl From<GraphError> for Response {
    fn from(e: GraphError) -> Self {
        Response::ErrorWithCode {
            error: e.to_string(),
            code: e.code().to_string(),
        }
    }
}

/// Request envelope: captures requestId alongside the tagged Request.
#[derive(Deserialize)]
struct RequestEnvelope {
    #[serde(default, rename = "requestId")]
    request_id: Option<String>,
    #[serde(flatten)]
    request: Request,
}

/// Response envelope: wraps Response with optional requestId for echo-back.
#[derive(Serialize)]
struct ResponseEnvelope {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(flatten)]
    response: Response,
}

/// Node representation for wire protocol.
///
/// `id` may be omitted on writes; it is derived from `semanticId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub semantic_id: String,
    pub node_type: String,
    pub name: String,
    pub partition: String,
    #[serde(default)]
    pub content_hash: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
}

/// Edge representation for wire protocol.
///
/// Endpoints are decimal ids or semantic ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEdge {
    pub src: String,
    pub dst: String,
    pub edge_type: String,
    pub partition: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metadata: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WireEdgeQuery {
    pub partition: Option<String>,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub edge_types: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCommitDelta {
    pub partitions: Vec<String>,
    pub nodes_added: u64,
    pub nodes_removed: u64,
    pub nodes_modified: u64,
    pub edges_added: u64,
    pub edges_removed: u64,
    pub edges_modified: u64,
    pub removed_node_ids: Vec<String>,
    pub changed_node_types: Vec<String>,
    pub changed_edge_types: Vec<String>,
    pub manifest_version: u64,
}

impl From<CommitDelta> for WireCommitDelta {
    fn from(d: CommitDelta) -> Self {
        Self {
            partitions: d.partitions,
            nodes_added: d.nodes_added,
            nodes_removed: d.nodes_removed,
            nodes_modified: d.nodes_modified,
            edges_added: d.edges_added,
            edges_removed: d.edges_removed,
            edges_modified: d.edges_modified,
            removed_node_ids: d.removed_node_ids.into_iter().map(id_to_string).collect(),
            changed_node_types: d.changed_node_types.into_iter().collect(),
            changed_edge_types: d.changed_edge_types.into_iter().collect(),
            manifest_version: d.manifest_version,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSnapshotDiff {
    pub summary: DiffSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_nodes: Option<Vec<WireNode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_nodes: Option<Vec<WireNode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_nodes: Option<Vec<WireNode>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_edges: Option<Vec<WireEdge>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_edges: Option<Vec<WireEdge>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_edges: Option<Vec<WireEdge>>,
}

impl WireSnapshotDiff {
    fn new(diff: SnapshotDiff, summary_only: bool) -> Self {
        let summary = diff.summary();
        if summary_only {
            return Self {
                summary,
                added_nodes: None,
                removed_nodes: None,
                modified_nodes: None,
                added_edges: None,
                removed_edges: None,
                modified_edges: None,
            };
        }
        let nodes = |v: Vec<NodeRecord>| Some(v.iter().map(record_to_wire_node).collect());
        let edges = |v: Vec<EdgeRecord>| Some(v.iter().map(record_to_wire_edge).collect());
        Self {
            summary,
            added_nodes: nodes(diff.added_nodes),
            removed_nodes: nodes(diff.removed_nodes),
            modified_nodes: nodes(diff.modified_nodes),
            added_edges: edges(diff.added_edges),
            removed_edges: edges(diff.removed_edges),
            modified_edges: edges(diff.modified_edges),
        }
    }
}

// ============================================================================
// ID Conversion (string <-> u128)
// ============================================================================

/// Decimal id, or a semantic id to hash.
fn string_to_id(s: &str) -> u128 {
    s.parse::<u128>().unwrap_or_else(|_| id_from_semantic(s))
}

fn id_to_string(id: u128) -> String {
    id.to_string()
}

fn ids_response(ids: Vec<u128>) -> Response {
    Response::Ids {
        ids: ids.into_iter().map(id_to_string).collect(),
    }
}

// ============================================================================
// Conversion functions
// ============================================================================

fn wire_node_to_record(node: WireNode) -> cgdb::Result<NodeRecord> {
    let id = match &node.id {
        Some(s) => s
            .parse::<u128>()
            .map_err(|_| GraphError::Protocol(format!("node id {:?} is not a decimal u128", s)))?,
        None => id_from_semantic(&node.semantic_id),
    };
    Ok(NodeRecord {
        id,
        semantic_id: node.semantic_id,
        node_type: node.node_type,
        name: node.name,
        partition: node.partition,
        content_hash: node.content_hash,
        metadata: node.metadata,
    })
}

fn record_to_wire_node(record: &NodeRecord) -> WireNode {
    WireNode {
        id: Some(id_to_string(record.id)),
        semantic_id: record.semantic_id.clone(),
        node_type: record.node_type.clone(),
        name: record.name.clone(),
        partition: record.partition.clone(),
        content_hash: record.content_hash,
        metadata: record.metadata.clone(),
    }
}

fn wire_edge_to_record(edge: WireEdge) -> EdgeRecord {
    EdgeRecord {
        src: string_to_id(&edge.src),
        dst: string_to_id(&edge.dst),
        edge_type: edge.edge_type,
        partition: edge.partition,
        metadata: edge.metadata,
    }
}

fn record_to_wire_edge(record: &EdgeRecord) -> WireEdge {
    WireEdge {
        src: id_to_string(record.src),
        dst: id_to_string(record.dst),
        edge_type: record.edge_type.clone(),
        partition: record.partition.clone(),
        metadata: record.metadata.clone(),
    }
}

fn wire_edge_query(query: WireEdgeQuery) -> EdgeQuery {
    EdgeQuery {
        partition: query.partition,
        src: query.src.as_deref().map(string_to_id),
        dst: query.dst.as_deref().map(string_to_id),
        edge_types: query.edge_types,
    }
}

// ============================================================================
// Request Handler
// ============================================================================

/// What every connection shares.
struct ServerState {
    manager: DatabaseManager,
    metrics: Metrics,
}

impl ServerState {
    fn new(manager: DatabaseManager, metrics: Metrics) -> Self {
        Self { manager, metrics }
    }

    /// A new session, attached read-write to the default database when one
    /// is registered.
    fn connect(&self, client_id: ClientId) -> ClientSession {
        let mut session = ClientSession::new(client_id);
        if let Ok(db) = self.manager.open_database(DEFAULT_DATABASE) {
            session.set_database(db, AccessMode::ReadWrite);
        }
        session
    }

    /// Detach `session` from its database. An ephemeral database nobody
    /// else uses goes away with it.
    fn release(&self, session: &mut ClientSession) {
        if let Some(db) = session.close() {
            self.manager.cleanup_ephemeral_if_unused(&db.name);
        }
    }
}

fn handle_request(state: &ServerState, session: &mut ClientSession, request: Request) -> Response {
    match dispatch(state, session, request) {
        Ok(response) => response,
        Err(e) => e.into(),
    }
}

fn dispatch(state: &ServerState, session: &mut ClientSession, request: Request) -> cgdb::Result<Response> {
    let response = match request {
        Request::Hello {
            protocol_version,
            client_id,
        } => {
            session.protocol_version = protocol_version.unwrap_or(1).min(PROTOCOL_VERSION);
            tracing::debug!(
                client = session.id,
                client_name = client_id.as_deref().unwrap_or("-"),
                protocol = session.protocol_version,
                "hello"
            );
            Response::HelloOk {
                ok: true,
                protocol_version: PROTOCOL_VERSION,
                server_version: env!("CARGO_PKG_VERSION").to_string(),
                features: [
                    "batches",
                    "snapshots",
                    "pins",
                    "streaming",
                    "compaction",
                    "traversal",
                    "multiDatabase",
                    "ephemeral",
                    "metrics",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            }
        }
        Request::Ping => Response::Pong {
            pong: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
        },

        Request::BeginBatch => {
            session.begin_batch()?;
            Response::BatchStarted {
                ok: true,
                base_version: session.engine()?.version(),
            }
        }
        Request::AddNode { node } => {
            let batch = session.batch_mut()?;
            batch.add_node(wire_node_to_record(node)?)?;
            staged(session)?
        }
        Request::AddNodes { nodes } => {
            let batch = session.batch_mut()?;
            for node in nodes {
                batch.add_node(wire_node_to_record(node)?)?;
            }
            staged(session)?
        }
        Request::AddEdge { edge } => {
            session.batch_mut()?.add_edge(wire_edge_to_record(edge))?;
            staged(session)?
        }
        Request::AddEdges { edges } => {
            session
                .batch_mut()?
                .add_edges(edges.into_iter().map(wire_edge_to_record))?;
            staged(session)?
        }
        Request::CommitBatch {
            partitions,
            protected_types,
        } => {
            let batch = session.take_batch()?;
            let partitions: Vec<&str> = partitions.iter().map(String::as_str).collect();
            let protected: Vec<&str> = protected_types.iter().map(String::as_str).collect();
            let start = Instant::now();
            let delta = batch.commit(&partitions, &protected)?;
            state.metrics.record_commit(start.elapsed(), &delta);
            session.database()?.trigger_compaction();
            Response::BatchCommitted {
                ok: true,
                delta: delta.into(),
            }
        }
        Request::AbortBatch => Response::BatchAborted {
            ok: true,
            aborted: session.abort_batch(),
        },

        Request::GetNode { id } => Response::Node {
            node: session
                .engine()?
                .get_node(string_to_id(&id))
                .as_ref()
                .map(record_to_wire_node),
        },
        Request::QueryNodes { query } => Response::Nodes {
            nodes: session
                .engine()?
                .query_nodes(&query)
                .iter()
                .map(record_to_wire_node)
                .collect(),
        },
        Request::QueryEdges { query } => Response::Edges {
            edges: session
                .engine()?
                .query_edges(&wire_edge_query(query))
                .iter()
                .map(record_to_wire_edge)
                .collect(),
        },
        Request::DiffSnapshots {
            from,
            to,
            summary_only,
        } => Response::Diff {
            diff: WireSnapshotDiff::new(session.engine()?.diff_snapshots(from, to)?, summary_only),
        },
        Request::FindDependentPartitions { partitions } => {
            let partitions: Vec<&str> = partitions.iter().map(String::as_str).collect();
            Response::Dependents {
                partitions: session.engine()?.find_dependent_partitions(&partitions),
            }
        }
        Request::CountNodesByType { types } => Response::Counts {
            counts: session.engine()?.snapshot().count_nodes_by_type(&types),
        },
        Request::CountEdgesByType { types } => Response::Counts {
            counts: session.engine()?.snapshot().count_edges_by_type(&types),
        },

        // Walks read one snapshot from start to finish.
        Request::Neighbors {
            id,
            edge_types,
            backward,
        } => {
            let snapshot = session.engine()?.snapshot();
            let direction = if backward { Direction::Incoming } else { Direction::Outgoing };
            ids_response(traversal::neighbors(&*snapshot, string_to_id(&id), &edge_types, direction))
        }
        Request::Bfs {
            start_ids,
            max_depth,
            edge_types,
        } => {
            let snapshot = session.engine()?.snapshot();
            let start: Vec<u128> = start_ids.iter().map(|s| string_to_id(s)).collect();
            ids_response(traversal::bfs(&start, max_depth, |id| {
                traversal::neighbors(&*snapshot, id, &edge_types, Direction::Outgoing)
            }))
        }
        Request::Dfs {
            start_ids,
            max_depth,
            edge_types,
        } => {
            let snapshot = session.engine()?.snapshot();
            let start: Vec<u128> = start_ids.iter().map(|s| string_to_id(s)).collect();
            ids_response(traversal::dfs(&start, max_depth, |id| {
                traversal::neighbors(&*snapshot, id, &edge_types, Direction::Outgoing)
            }))
        }
        Request::Reachability {
            start_ids,
            max_depth,
            edge_types,
            backward,
        } => {
            let snapshot = session.engine()?.snapshot();
            let start: Vec<u128> = start_ids.iter().map(|s| string_to_id(s)).collect();
            ids_response(traversal::reachability(&*snapshot, &start, max_depth, &edge_types, backward))
        }

        Request::CreateDatabase { name, ephemeral } => {
            state.manager.create_database(&name, ephemeral)?;
            Response::DatabaseCreated {
                ok: true,
                database_id: name,
            }
        }
        Request::OpenDatabase { name, mode } => {
            let mode: AccessMode = mode.parse()?;
            let db = state.manager.open_database(&name)?;
            if let Some(previous) = session.set_database(db.clone(), mode) {
                state.manager.cleanup_ephemeral_if_unused(&previous.name);
            }
            let snapshot = db.engine().snapshot();
            Response::DatabaseOpened {
                ok: true,
                database_id: name,
                mode: mode.as_str().to_string(),
                node_count: snapshot.node_count(),
                edge_count: snapshot.edge_count(),
            }
        }
        Request::CloseDatabase => {
            if !session.has_database() {
                return Err(GraphError::NoDatabaseSelected);
            }
            state.release(session);
            Response::Ok { ok: true }
        }
        Request::DropDatabase { name } => {
            state.manager.drop_database(&name)?;
            Response::Ok { ok: true }
        }
        Request::ListDatabases => Response::DatabaseList {
            databases: state.manager.list_databases(),
        },
        Request::CurrentDatabase => Response::CurrentDb {
            database: session.current_db_name().map(str::to_string),
            mode: session
                .has_database()
                .then(|| session.access_mode.as_str().to_string()),
        },

        Request::TagSnapshot { name, version } => {
            let engine = session.writable_engine()?;
            let version = match version {
                Some(v) => {
                    engine.tag_version(&name, v)?;
                    v
                }
                None => engine.tag_snapshot(&name)?,
            };
            Response::Tagged {
                ok: true,
                name,
                version,
            }
        }
        Request::UntagSnapshot { name } => {
            session.writable_engine()?.untag_snapshot(&name)?;
            Response::Ok { ok: true }
        }
        Request::ListSnapshots { tagged_only } => Response::Snapshots {
            snapshots: session.engine()?.list_snapshots(tagged_only),
        },
        Request::PinSnapshot { name, version } => {
            let engine = session.engine()?;
            let pin = match (name, version) {
                (Some(name), _) => engine.pin_snapshot(&name)?,
                (None, Some(v)) => engine.pin_version(v)?,
                (None, None) => engine.pin_current(),
            };
            Response::Pinned {
                ok: true,
                version: session.add_pin(pin),
            }
        }
        Request::UnpinSnapshot { version } => Response::Unpinned {
            ok: true,
            released: session.release_pin(version),
        },

        Request::Compact { force } => {
            let engine = session.writable_engine()?;
            let result = if force { engine.compact_all()? } else { engine.compact()? };
            Response::Compacted { ok: true, result }
        }
        Request::Reclaim => Response::Reclaimed {
            ok: true,
            result: session.writable_engine()?.reclaim()?,
        },
        Request::Stats => Response::Stats {
            database: session.current_db_name().map(str::to_string),
            stats: session.engine().ok().map(|engine| engine.stats()),
            metrics: state.metrics.snapshot(),
        },
        Request::Shutdown => Response::Ok { ok: true },
    };
    Ok(response)
}

fn staged(session: &mut ClientSession) -> cgdb::Result<Response> {
    let batch = session.batch_mut()?;
    Ok(Response::Staged {
        ok: true,
        staged_nodes: batch.node_count(),
        staged_edges: batch.edge_count(),
    })
}

// ============================================================================
// Streaming Support
// ============================================================================

/// Result of handling a request.
#[derive(Debug)]
enum HandleResult {
    /// One response frame, still to be written by the caller.
    Single(Response),
    /// Chunk frames were already written to the stream.
    Streamed,
}

/// Write `items` as chunk frames when there are more than the threshold.
fn stream_chunks<W, T>(
    items: Vec<T>,
    request_id: &Option<String>,
    out: &mut W,
    single: impl FnOnce(Vec<T>) -> Response,
    chunk: impl Fn(Vec<T>, bool, u32) -> Response,
) -> HandleResult
where
    W: Write,
    T: Clone,
{
    if items.len() <= STREAMING_THRESHOLD {
        return HandleResult::Single(single(items));
    }

    let num_chunks = items.len().div_ceil(STREAMING_CHUNK_SIZE);
    for (i, part) in items.chunks(STREAMING_CHUNK_SIZE).enumerate() {
        let envelope = ResponseEnvelope {
            request_id: request_id.clone(),
            response: chunk(part.to_vec(), i + 1 == num_chunks, i as u32),
        };
        let bytes = match rmp_serde::to_vec_named(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "serialize error during streaming");
                return HandleResult::Streamed;
            }
        };
        if let Err(e) = write_message(out, &bytes) {
            tracing::debug!(error = %e, "write error during streaming (implicit cancel)");
            return HandleResult::Streamed;
        }
    }
    HandleResult::Streamed
}

fn handle_query_nodes_streaming<W: Write>(
    engine: &GraphEngine,
    query: NodeQuery,
    request_id: &Option<String>,
    out: &mut W,
) -> HandleResult {
    let nodes: Vec<WireNode> = engine
        .query_nodes(&query)
        .iter()
        .map(record_to_wire_node)
        .collect();
    stream_chunks(
        nodes,
        request_id,
        out,
        |nodes| Response::Nodes { nodes },
        |nodes, done, chunk_index| Response::NodesChunk {
            nodes,
            done,
            chunk_index,
        },
    )
}

fn handle_query_edges_streaming<W: Write>(
    engine: &GraphEngine,
    query: WireEdgeQuery,
    request_id: &Option<String>,
    out: &mut W,
) -> HandleResult {
    let edges: Vec<WireEdge> = engine
        .query_edges(&wire_edge_query(query))
        .iter()
        .map(record_to_wire_edge)
        .collect();
    stream_chunks(
        edges,
        request_id,
        out,
        |edges| Response::Edges { edges },
        |edges, done, chunk_index| Response::EdgesChunk {
            edges,
            done,
            chunk_index,
        },
    )
}

// ============================================================================
// Client Connection Handler
// ============================================================================

fn read_message<R: Read>(stream: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    // Read 4-byte length prefix (big-endian)
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn write_message<W: Write>(stream: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = u32::try_from(data.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_BYTES)
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Response too large: {} bytes", data.len()),
            )
        })?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(data)?;
    stream.flush()
}

/// What the connection loop does after one request.
#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Disconnect,
    Shutdown,
}

/// Serve one request from `stream`.
fn serve_one<S: Read + Write>(state: &ServerState, session: &mut ClientSession, stream: &mut S) -> Flow {
    let msg = match read_message(stream) {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            tracing::info!(client = session.id, "client disconnected");
            return Flow::Disconnect;
        }
        Err(e) => {
            tracing::warn!(client = session.id, error = %e, "read error");
            return Flow::Disconnect;
        }
    };

    let (request_id, request) = match rmp_serde::from_slice::<RequestEnvelope>(&msg) {
        Ok(env) => (env.request_id, env.request),
        Err(e) => {
            let envelope = ResponseEnvelope {
                request_id: None,
                response: GraphError::Protocol(format!("Invalid request: {}", e)).into(),
            };
            let written = rmp_serde::to_vec_named(&envelope)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                .and_then(|bytes| write_message(stream, &bytes));
            return match written {
                Ok(()) => Flow::Continue,
                Err(_) => Flow::Disconnect,
            };
        }
    };

    let is_shutdown = matches!(request, Request::Shutdown);
    let start = Instant::now();
    let op = request.name();

    let streaming = session.protocol_version >= 2;
    let handle_result = match request {
        Request::QueryNodes { query } if streaming => match session.engine() {
            Ok(engine) => handle_query_nodes_streaming(engine, query, &request_id, stream),
            Err(e) => HandleResult::Single(e.into()),
        },
        Request::QueryEdges { query } if streaming => match session.engine() {
            Ok(engine) => handle_query_edges_streaming(engine, query, &request_id, stream),
            Err(e) => HandleResult::Single(e.into()),
        },
        other => HandleResult::Single(handle_request(state, session, other)),
    };
    state.metrics.record_request(op, start.elapsed());
    tracing::debug!(
        client = session.id,
        op,
        duration_ms = start.elapsed().as_millis() as u64,
        "request handled"
    );

    if let HandleResult::Single(response) = handle_result {
        let envelope = ResponseEnvelope { request_id, response };
        match rmp_serde::to_vec_named(&envelope) {
            Ok(bytes) => {
                if let Err(e) = write_message(stream, &bytes) {
                    tracing::warn!(client = session.id, error = %e, "write error");
                    return Flow::Disconnect;
                }
            }
            Err(e) => tracing::error!(error = %e, "serialize error"),
        }
    }
    if is_shutdown {
        Flow::Shutdown
    } else {
        Flow::Continue
    }
}

fn handle_client(mut stream: UnixStream, state: Arc<ServerState>, client_id: ClientId, socket: Arc<PathBuf>) {
    tracing::info!(client = client_id, "client connected");
    let mut session = state.connect(client_id);

    loop {
        match serve_one(&state, &mut session, &mut stream) {
            Flow::Continue => {}
            Flow::Disconnect => break,
            Flow::Shutdown => {
                tracing::info!(client = client_id, "shutdown requested");
                state.release(&mut session);
                finish(&socket);
            }
        }
    }
    state.release(&mut session);
}

/// Remove the socket and exit. Open batches are discarded.
fn finish(socket: &Path) -> ! {
    let _ = std::fs::remove_file(socket);
    tracing::info!("exiting");
    std::process::exit(0);
}

// ============================================================================
// Main
// ============================================================================

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if args.no_auto_compact {
        config.compaction.auto_compact = false;
    }
    let auto_compact = config.compaction.auto_compact;

    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => args
            .db_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting cgdb-server");
    let engine = if args.create {
        GraphEngine::open_or_create(&args.db_path, config.clone())
    } else {
        GraphEngine::open(&args.db_path, config.clone())
    }
    .with_context(|| format!("failed to open database {}", args.db_path.display()))?;

    let stats = engine.stats();
    tracing::info!(
        path = %args.db_path.display(),
        version = stats.version,
        nodes = stats.total_nodes,
        edges = stats.total_edges,
        "database ready"
    );

    if args.socket.exists() {
        if UnixStream::connect(&args.socket).is_ok() {
            bail!("another server is listening on {}", args.socket.display());
        }
        std::fs::remove_file(&args.socket)
            .with_context(|| format!("failed to remove stale socket {}", args.socket.display()))?;
    }
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("failed to bind {}", args.socket.display()))?;
    let manager = DatabaseManager::new(data_dir.clone(), config);
    manager
        .register_default(engine)
        .context("failed to register the default database")?;
    tracing::info!(
        socket = %args.socket.display(),
        data_dir = %data_dir.display(),
        auto_compact,
        slow_query_ms = args.slow_query_ms,
        "listening"
    );

    let state = Arc::new(ServerState::new(manager, Metrics::with_slow_threshold(args.slow_query_ms)));
    let socket = Arc::new(args.socket.clone());

    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("failed to register signal handlers")?;
    let socket_for_signal = Arc::clone(&socket);
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::info!(signal = sig, "received signal, shutting down");
            finish(&socket_for_signal);
        }
    });

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&state);
                let socket = Arc::clone(&socket);
                thread::spawn(move || handle_client(stream, state, client_id, socket));
            }
            Err(e) => tracing::warn!(error = %e, "accept error"),
        }
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod protocol_tests {
    use super::*;
    use std::io::Cursor;

    fn state_in(data_dir: &Path) -> ServerState {
        let manager = DatabaseManager::new(data_dir, EngineConfig::relaxed());
        manager
            .register_default(GraphEngine::create_ephemeral(EngineConfig::relaxed()))
            .unwrap();
        ServerState::new(manager, Metrics::new())
    }

    /// Only ephemeral databases are created through this state.
    fn setup() -> (ServerState, ClientSession) {
        let state = state_in(&std::env::temp_dir());
        let session = state.connect(1);
        (state, session)
    }

    fn ids_of(response: Response) -> Vec<u128> {
        match response {
            Response::Ids { ids } => ids.iter().map(|s| string_to_id(s)).collect(),
            other => panic!("Expected Ids, got {:?}", other),
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn wire_node(sem: &str, node_type: &str, partition: &str) -> WireNode {
        WireNode {
            id: None,
            semantic_id: sem.to_string(),
            node_type: node_type.to_string(),
            name: sem.to_string(),
            partition: partition.to_string(),
            content_hash: 0,
            metadata: String::new(),
        }
    }

    fn wire_edge(src: &str, dst: &str, partition: &str) -> WireEdge {
        WireEdge {
            src: src.to_string(),
            dst: dst.to_string(),
            edge_type: "CALLS".to_string(),
            partition: partition.to_string(),
            metadata: String::new(),
        }
    }

    fn commit(state: &ServerState, session: &mut ClientSession, nodes: Vec<WireNode>, edges: Vec<WireEdge>, partitions: &[&str]) -> WireCommitDelta {
        handle_request(state, session, Request::BeginBatch);
        handle_request(state, session, Request::AddNodes { nodes });
        handle_request(state, session, Request::AddEdges { edges });
        let request = Request::CommitBatch {
            partitions: partitions.iter().map(|p| p.to_string()).collect(),
            protected_types: vec![],
        };
        match handle_request(state, session, request) {
            Response::BatchCommitted { ok, delta } => {
                assert!(ok);
                delta
            }
            other => panic!("Expected BatchCommitted, got {:?}", other),
        }
    }

    fn frame(value: serde_json::Value) -> Vec<u8> {
        let payload = rmp_serde::to_vec_named(&value).unwrap();
        let mut out = (payload.len() as u32).to_be_bytes().to_vec();
        out.extend(payload);
        out
    }

    fn read_frames(bytes: &[u8]) -> Vec<serde_json::Value> {
        let mut cursor = Cursor::new(bytes);
        let mut out = Vec::new();
        while let Some(msg) = read_message(&mut cursor).unwrap() {
            out.push(rmp_serde::from_slice(&msg).unwrap());
        }
        out
    }

    /// In-memory duplex stream: reads from `input`, writes to `output`.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    // ============================================================================
    // Hello / Ping
    // ============================================================================

    #[test]
    fn test_hello_negotiates_version() {
        let (state, mut session) = setup();
        let request = Request::Hello {
            protocol_version: Some(9),
            client_id: Some("test-client".to_string()),
        };
        match handle_request(&state, &mut session, request) {
            Response::HelloOk { ok, protocol_version, features, .. } => {
                assert!(ok);
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert!(features.contains(&"streaming".to_string()));
            }
            other => panic!("Expected HelloOk, got {:?}", other),
        }
        assert_eq!(session.protocol_version, PROTOCOL_VERSION);
    }

    // ============================================================================
    // Batches
    // ============================================================================

    #[test]
    fn test_commit_replaces_partition() {
        let (state, mut session) = setup();
        let delta = commit(
            &state,
            &mut session,
            vec![wire_node("a", "FUNCTION", "a.js"), wire_node("b", "FUNCTION", "a.js")],
            vec![wire_edge("a", "b", "a.js")],
            &["a.js"],
        );
        assert_eq!(delta.nodes_added, 2);
        assert_eq!(delta.edges_added, 1);

        let delta = commit(&state, &mut session, vec![wire_node("a", "FUNCTION", "a.js")], vec![], &["a.js"]);
        assert_eq!(delta.nodes_removed, 1);
        assert_eq!(delta.edges_removed, 1);
        assert_eq!(delta.removed_node_ids, vec![id_to_string(id_from_semantic("b"))]);
        assert_eq!(delta.manifest_version, 3);
    }

    #[test]
    fn test_batch_errors_carry_codes() {
        let (state, mut session) = setup();
        let request = Request::AddNode { node: wire_node("a", "FUNCTION", "a.js") };
        match handle_request(&state, &mut session, request) {
            Response::ErrorWithCode { code, .. } => assert_eq!(code, "PROTOCOL_ERROR"),
            other => panic!("Expected error, got {:?}", other),
        }

        handle_request(&state, &mut session, Request::BeginBatch);
        let mut other_session = state.connect(2);
        match handle_request(&state, &mut other_session, Request::BeginBatch) {
            Response::ErrorWithCode { code, .. } => assert_eq!(code, "CONFLICT"),
            other => panic!("Expected conflict, got {:?}", other),
        }

        let mut forged = wire_node("a", "FUNCTION", "a.js");
        forged.id = Some("12".to_string());
        match handle_request(&state, &mut session, Request::AddNode { node: forged }) {
            Response::ErrorWithCode { code, .. } => assert_eq!(code, "PROTOCOL_ERROR"),
            other => panic!("Expected error, got {:?}", other),
        }

        match handle_request(&state, &mut session, Request::AbortBatch) {
            Response::BatchAborted { aborted, .. } => assert!(aborted),
            other => panic!("Expected BatchAborted, got {:?}", other),
        }
        assert!(matches!(
            handle_request(&state, &mut other_session, Request::BeginBatch),
            Response::BatchStarted { ok: true, .. }
        ));
    }

    #[test]
    fn test_dependents_and_diff() {
        let (state, mut session) = setup();
        commit(&state, &mut session, vec![wire_node("lib", "FUNCTION", "lib.js")], vec![], &["lib.js"]);
        commit(
            &state,
            &mut session,
            vec![wire_node("app", "FUNCTION", "app.js")],
            vec![wire_edge("app", "lib", "app.js")],
            &["app.js"],
        );

        let request = Request::FindDependentPartitions { partitions: vec!["lib.js".into()] };
        match handle_request(&state, &mut session, request) {
            Response::Dependents { partitions } => assert_eq!(partitions, vec!["app.js".to_string()]),
            other => panic!("Expected Dependents, got {:?}", other),
        }

        let request = Request::DiffSnapshots { from: 1, to: 3, summary_only: true };
        match handle_request(&state, &mut session, request) {
            Response::Diff { diff } => {
                assert_eq!(diff.summary.nodes_added, 2);
                assert_eq!(diff.summary.edges_added, 1);
                assert!(diff.added_nodes.is_none());
            }
            other => panic!("Expected Diff, got {:?}", other),
        }
    }

    // ============================================================================
    // Tags and pins
    // ============================================================================

    #[test]
    fn test_tag_pin_and_disconnect() {
        let (state, mut session) = setup();
        commit(&state, &mut session, vec![wire_node("a", "FUNCTION", "a.js")], vec![], &["a.js"]);

        match handle_request(&state, &mut session, Request::TagSnapshot { name: "base".into(), version: None }) {
            Response::Tagged { version, .. } => assert_eq!(version, 2),
            other => panic!("Expected Tagged, got {:?}", other),
        }
        match handle_request(&state, &mut session, Request::PinSnapshot { name: Some("base".into()), version: None }) {
            Response::Pinned { version, .. } => assert_eq!(version, 2),
            other => panic!("Expected Pinned, got {:?}", other),
        }
        let engine = session.engine().unwrap().clone();
        assert_eq!(engine.pinned_versions(), vec![2]);

        match handle_request(&state, &mut session, Request::ListSnapshots { tagged_only: true }) {
            Response::Snapshots { snapshots } => assert_eq!(snapshots[0].tags, vec!["base".to_string()]),
            other => panic!("Expected Snapshots, got {:?}", other),
        }

        state.release(&mut session);
        assert!(engine.pinned_versions().is_empty());
        assert!(!session.has_database());
    }

    // ============================================================================
    // Traversal and counts
    // ============================================================================

    #[test]
    fn test_traversal_commands() {
        let (state, mut session) = setup();
        let mut reads = wire_edge("eval", "env", "a.js");
        reads.edge_type = "READS".to_string();
        commit(
            &state,
            &mut session,
            ["main", "parse", "eval", "lex", "env"]
                .iter()
                .map(|n| wire_node(n, "FUNCTION", "a.js"))
                .collect(),
            vec![
                wire_edge("main", "parse", "a.js"),
                wire_edge("main", "eval", "a.js"),
                wire_edge("parse", "lex", "a.js"),
                wire_edge("eval", "lex", "a.js"),
                reads,
            ],
            &["a.js"],
        );
        let id = |s: &str| id_from_semantic(s);
        let main = id_to_string(id("main"));

        let request = Request::Neighbors {
            id: id_to_string(id("lex")),
            edge_types: vec![],
            backward: true,
        };
        let mut callers = ids_of(handle_request(&state, &mut session, request));
        callers.sort_unstable();
        let mut expected = vec![id("parse"), id("eval")];
        expected.sort_unstable();
        assert_eq!(callers, expected);

        let request = Request::Bfs {
            start_ids: vec![main.clone()],
            max_depth: 1,
            edge_types: strings(&["CALLS"]),
        };
        let level = ids_of(handle_request(&state, &mut session, request));
        assert_eq!(level[0], id("main"));
        assert_eq!(level.len(), 3);

        let request = Request::Dfs {
            start_ids: vec![main.clone()],
            max_depth: 10,
            edge_types: strings(&["CALLS"]),
        };
        let mut deep = ids_of(handle_request(&state, &mut session, request));
        assert_eq!(deep.len(), 4);
        assert!(!deep.contains(&id("env")));
        deep.sort_unstable();

        let request = Request::Reachability {
            start_ids: vec![main],
            max_depth: 10,
            edge_types: strings(&["CALLS"]),
            backward: false,
        };
        let mut reached = ids_of(handle_request(&state, &mut session, request));
        reached.sort_unstable();
        assert_eq!(reached, deep);
    }

    #[test]
    fn test_count_commands() {
        let (state, mut session) = setup();
        commit(
            &state,
            &mut session,
            vec![
                wire_node("m", "MODULE", "a.js"),
                wire_node("f", "FUNCTION", "a.js"),
                wire_node("g", "FUNCTION", "a.js"),
            ],
            vec![wire_edge("f", "g", "a.js")],
            &["a.js"],
        );
        match handle_request(&state, &mut session, Request::CountNodesByType { types: vec![] }) {
            Response::Counts { counts } => {
                assert_eq!(counts.get("FUNCTION"), Some(&2));
                assert_eq!(counts.get("MODULE"), Some(&1));
            }
            other => panic!("Expected Counts, got {:?}", other),
        }
        match handle_request(&state, &mut session, Request::CountEdgesByType { types: strings(&["CALLS"]) }) {
            Response::Counts { counts } => assert_eq!(counts.get("CALLS"), Some(&1)),
            other => panic!("Expected Counts, got {:?}", other),
        }
    }

    // ============================================================================
    // Databases
    // ============================================================================

    #[test]
    fn test_connections_start_on_default() {
        let (state, mut session) = setup();
        match handle_request(&state, &mut session, Request::CurrentDatabase) {
            Response::CurrentDb { database, mode } => {
                assert_eq!(database.as_deref(), Some(DEFAULT_DATABASE));
                assert_eq!(mode.as_deref(), Some("rw"));
            }
            other => panic!("Expected CurrentDb, got {:?}", other),
        }
    }

    #[test]
    fn test_ephemeral_database_lifecycle() {
        let (state, mut session) = setup();
        let request = Request::CreateDatabase { name: "scratch".into(), ephemeral: true };
        assert!(matches!(
            handle_request(&state, &mut session, request),
            Response::DatabaseCreated { ok: true, .. }
        ));
        let request = Request::CreateDatabase { name: "scratch".into(), ephemeral: true };
        match handle_request(&state, &mut session, request) {
            Response::ErrorWithCode { code, .. } => assert_eq!(code, "DATABASE_EXISTS"),
            other => panic!("Expected error, got {:?}", other),
        }

        let request = Request::OpenDatabase { name: "scratch".into(), mode: "rw".into() };
        match handle_request(&state, &mut session, request) {
            Response::DatabaseOpened { database_id, node_count, .. } => {
                assert_eq!(database_id, "scratch");
                assert_eq!(node_count, 0);
            }
            other => panic!("Expected DatabaseOpened, got {:?}", other),
        }
        commit(&state, &mut session, vec![wire_node("a", "FUNCTION", "a.js")], vec![], &["a.js"]);

        // The default database is untouched.
        let mut other = state.connect(2);
        match handle_request(&state, &mut other, Request::GetNode { id: id_to_string(id_from_semantic("a")) }) {
            Response::Node { node } => assert!(node.is_none()),
            other => panic!("Expected Node, got {:?}", other),
        }
        match handle_request(&state, &mut other, Request::DropDatabase { name: "scratch".into() }) {
            Response::ErrorWithCode { code, .. } => assert_eq!(code, "DATABASE_IN_USE"),
            other => panic!("Expected error, got {:?}", other),
        }

        match handle_request(&state, &mut session, Request::ListDatabases) {
            Response::DatabaseList { databases } => {
                let names: Vec<&str> = databases.iter().map(|d| d.name.as_str()).collect();
                assert_eq!(names, vec![DEFAULT_DATABASE, "scratch"]);
            }
            other => panic!("Expected DatabaseList, got {:?}", other),
        }

        // The last connection leaving an ephemeral database releases it.
        assert!(matches!(
            handle_request(&state, &mut session, Request::CloseDatabase),
            Response::Ok { ok: true }
        ));
        assert!(!state.manager.database_exists("scratch"));
        match handle_request(&state, &mut session, Request::CloseDatabase) {
            Response::ErrorWithCode { code, .. } => assert_eq!(code, "NO_DATABASE_SELECTED"),
            other => panic!("Expected error, got {:?}", other),
        }
        match handle_request(&state, &mut session, Request::QueryNodes { query: NodeQuery::new() }) {
            Response::ErrorWithCode { code, .. } => assert_eq!(code, "NO_DATABASE_SELECTED"),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_read_only_connection_rejects_writes() {
        let (state, mut session) = setup();
        let request = Request::OpenDatabase { name: DEFAULT_DATABASE.into(), mode: "ro".into() };
        assert!(matches!(
            handle_request(&state, &mut session, request),
            Response::DatabaseOpened { ok: true, .. }
        ));
        for request in [Request::BeginBatch, Request::TagSnapshot { name: "t".into(), version: None }] {
            match handle_request(&state, &mut session, request) {
                Response::ErrorWithCode { code, .. } => assert_eq!(code, "READ_ONLY_MODE"),
                other => panic!("Expected error, got {:?}", other),
            }
        }
        assert!(matches!(
            handle_request(&state, &mut session, Request::ListSnapshots { tagged_only: false }),
            Response::Snapshots { .. }
        ));

        let request = Request::OpenDatabase { name: DEFAULT_DATABASE.into(), mode: "sideways".into() };
        match handle_request(&state, &mut session, request) {
            Response::ErrorWithCode { code, .. } => assert_eq!(code, "PROTOCOL_ERROR"),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_persistent_database_lives_under_data_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        let state = state_in(dir.path());
        let mut session = state.connect(1);

        let request = Request::CreateDatabase { name: "project".into(), ephemeral: false };
        handle_request(&state, &mut session, request);
        assert!(dir.path().join("project.cgdb").is_dir());

        let request = Request::OpenDatabase { name: "project".into(), mode: "rw".into() };
        handle_request(&state, &mut session, request);
        commit(&state, &mut session, vec![wire_node("a", "FUNCTION", "a.js")], vec![], &["a.js"]);
        state.release(&mut session);
        drop(state);

        // A restarted server finds it on disk.
        let state = state_in(dir.path());
        let mut session = state.connect(1);
        let request = Request::OpenDatabase { name: "project".into(), mode: "ro".into() };
        match handle_request(&state, &mut session, request) {
            Response::DatabaseOpened { node_count, mode, .. } => {
                assert_eq!(node_count, 1);
                assert_eq!(mode, "ro");
            }
            other => panic!("Expected DatabaseOpened, got {:?}", other),
        }
        state.release(&mut session);
        assert!(matches!(
            handle_request(&state, &mut session, Request::DropDatabase { name: "project".into() }),
            Response::Ok { ok: true }
        ));
        assert!(!dir.path().join("project.cgdb").exists());
    }

    #[test]
    fn test_stats_carry_metrics() {
        let (state, mut session) = setup();
        let mut duplex = Duplex {
            input: Cursor::new(frame(serde_json::json!({"cmd": "ping"}))),
            output: Vec::new(),
        };
        assert_eq!(serve_one(&state, &mut session, &mut duplex), Flow::Continue);
        commit(&state, &mut session, vec![wire_node("a", "FUNCTION", "a.js")], vec![], &["a.js"]);

        match handle_request(&state, &mut session, Request::Stats) {
            Response::Stats { database, stats, metrics } => {
                assert_eq!(database.as_deref(), Some(DEFAULT_DATABASE));
                assert_eq!(stats.map(|s| s.total_nodes), Some(1));
                assert_eq!(metrics.request_count, 1);
                assert_eq!(metrics.top_operations[0].operation, "ping");
                assert_eq!(metrics.commit_count, 1);
                assert_eq!(metrics.last_commit_nodes, 1);
            }
            other => panic!("Expected Stats, got {:?}", other),
        }

        state.release(&mut session);
        match handle_request(&state, &mut session, Request::Stats) {
            Response::Stats { stats, database, .. } => {
                assert!(stats.is_none());
                assert!(database.is_none());
            }
            other => panic!("Expected Stats, got {:?}", other),
        }
    }

    // ============================================================================
    // Framing and streaming
    // ============================================================================

    #[test]
    fn test_envelope_echoes_request_id() {
        let (state, mut session) = setup();
        let mut input = frame(serde_json::json!({"cmd": "ping", "requestId": "r1"}));
        input.extend(frame(serde_json::json!({"cmd": "noSuchCommand"})));
        let mut duplex = Duplex { input: Cursor::new(input), output: Vec::new() };

        assert_eq!(serve_one(&state, &mut session, &mut duplex), Flow::Continue);
        assert_eq!(serve_one(&state, &mut session, &mut duplex), Flow::Continue);
        assert_eq!(serve_one(&state, &mut session, &mut duplex), Flow::Disconnect);

        let frames = read_frames(&duplex.output);
        assert_eq!(frames[0]["requestId"], "r1");
        assert_eq!(frames[0]["pong"], true);
        assert_eq!(frames[1]["code"], "PROTOCOL_ERROR");
    }

    #[test]
    fn test_large_queries_stream_in_chunks() {
        let (state, mut session) = setup();
        let nodes = (0..1200).map(|i| wire_node(&format!("n{}", i), "VARIABLE", "big.js")).collect();
        commit(&state, &mut session, nodes, vec![], &["big.js"]);
        session.protocol_version = 2;

        let input = frame(serde_json::json!({
            "cmd": "queryNodes",
            "requestId": "q",
            "query": {"nodeType": "VARIABLE"}
        }));
        let mut duplex = Duplex { input: Cursor::new(input), output: Vec::new() };
        assert_eq!(serve_one(&state, &mut session, &mut duplex), Flow::Continue);

        let frames = read_frames(&duplex.output);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f["requestId"] == "q"));
        assert_eq!(frames[0]["nodes"].as_array().unwrap().len(), 500);
        assert_eq!(frames[2]["nodes"].as_array().unwrap().len(), 200);
        assert_eq!(frames[2]["chunkIndex"], 2);
        assert_eq!(frames[1]["done"], false);
        assert_eq!(frames[2]["done"], true);
    }

    #[test]
    fn test_small_queries_use_one_frame() {
        let (state, mut session) = setup();
        commit(&state, &mut session, vec![wire_node("a", "FUNCTION", "a.js")], vec![], &["a.js"]);
        session.protocol_version = 2;
        let mut out = Vec::new();
        let result = handle_query_nodes_streaming(session.engine().unwrap(), NodeQuery::new(), &None, &mut out);
        match result {
            HandleResult::Single(Response::Nodes { nodes }) => assert_eq!(nodes.len(), 1),
            other => panic!("Expected single Nodes, got {:?}", other),
        }
        assert!(out.is_empty());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut input = Cursor::new(((MAX_FRAME_BYTES + 1) as u32).to_be_bytes().to_vec());
        let err = read_message(&mut input).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_shutdown_stops_the_loop() {
        let (state, mut session) = setup();
        let mut duplex = Duplex {
            input: Cursor::new(frame(serde_json::json!({"cmd": "shutdown"}))),
            output: Vec::new(),
        };
        assert_eq!(serve_one(&state, &mut session, &mut duplex), Flow::Shutdown);
        assert_eq!(read_frames(&duplex.output)[0]["ok"], true);
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["cgdb-server", "/tmp/g", "--create", "--no-auto-compact"]).unwrap();
        assert!(args.create);
        assert!(args.no_auto_compact);
        assert_eq!(args.socket, PathBuf::from("/tmp/cgdb.sock"));
        assert_eq!(args.slow_query_ms, DEFAULT_SLOW_THRESHOLD_MS);
        assert!(args.data_dir.is_none());
        assert!(Args::try_parse_from(["cgdb-server"]).is_err());
    }
}
