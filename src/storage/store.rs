//! Segment storage backends.
//!
//! A `SegmentStore` turns records into published, immutable segments and
//! opens them again. The disk backend keeps one file per segment under
//! `segments/`; the memory backend keeps the encoded bytes in a map and is
//! used by ephemeral engines. Both go through the same encoder and the same
//! validating reader.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::DurabilityMode;
use crate::error::{GraphError, Result};
use crate::storage::durable::{self, sync_dir, write_atomic};
use crate::storage::segment::{EdgeSegment, NodeSegment};
use crate::storage::types::{EdgeRecord, NodeRecord, SegmentMeta, SegmentType};
use crate::storage::writer::{encode_edges, encode_nodes};

pub const SEGMENTS_DIR: &str = "segments";

fn segment_file_name(id: u64, kind: SegmentType) -> String {
    format!("seg_{:06}_{}.seg", id, kind.as_str())
}

/// Inverse of [`segment_file_name`].
fn parse_segment_file_name(name: &str) -> Option<(u64, SegmentType)> {
    let rest = name.strip_prefix("seg_")?.strip_suffix(".seg")?;
    let (id, kind) = rest.split_once('_')?;
    let kind = match kind {
        "nodes" => SegmentType::Nodes,
        "edges" => SegmentType::Edges,
        _ => return None,
    };
    Some((id.parse().ok()?, kind))
}

#[derive(Debug)]
pub enum SegmentStore {
    Disk {
        dir: PathBuf,
        durability: DurabilityMode,
    },
    Memory(Mutex<HashMap<(u64, SegmentType), Arc<[u8]>>>),
}

impl SegmentStore {
    /// Disk store rooted at `<db>/segments`. Leftover temp files are swept.
    pub fn disk(db_root: &Path, durability: DurabilityMode) -> Result<Self> {
        let dir = db_root.join(SEGMENTS_DIR);
        fs::create_dir_all(&dir)?;
        let swept = durable::sweep_tmp_files(&dir)?;
        if swept > 0 {
            tracing::info!(swept, "removed partial segment files");
        }
        Ok(SegmentStore::Disk { dir, durability })
    }

    pub fn memory() -> Self {
        SegmentStore::Memory(Mutex::new(HashMap::new()))
    }

    fn path(dir: &Path, id: u64, kind: SegmentType) -> PathBuf {
        dir.join(segment_file_name(id, kind))
    }

    fn put(&self, id: u64, kind: SegmentType, bytes: Vec<u8>) -> Result<()> {
        match self {
            SegmentStore::Disk { dir, durability } => {
                let path = Self::path(dir, id, kind);
                if path.exists() {
                    return Err(GraphError::Integrity(format!(
                        "Segment {} already exists",
                        path.display()
                    )));
                }
                write_atomic(&path, &bytes, *durability)
            }
            SegmentStore::Memory(map) => {
                let mut map = map
                    .lock()
                    .map_err(|_| GraphError::Integrity("segment map poisoned".into()))?;
                map.insert((id, kind), bytes.into());
                Ok(())
            }
        }
    }

    fn get_shared(&self, id: u64, kind: SegmentType) -> Result<Arc<[u8]>> {
        match self {
            SegmentStore::Memory(map) => map
                .lock()
                .map_err(|_| GraphError::Integrity("segment map poisoned".into()))?
                .get(&(id, kind))
                .cloned()
                .ok_or_else(|| missing(id, kind)),
            SegmentStore::Disk { .. } => Err(missing(id, kind)),
        }
    }

    /// Encode and publish a node segment.
    pub fn write_nodes(&self, id: u64, records: Vec<NodeRecord>) -> Result<SegmentMeta> {
        let (bytes, meta) = encode_nodes(records)?;
        self.put(id, SegmentType::Nodes, bytes)?;
        Ok(meta)
    }

    /// Encode and publish an edge segment.
    pub fn write_edges(&self, id: u64, records: Vec<EdgeRecord>) -> Result<SegmentMeta> {
        let (bytes, meta) = encode_edges(records)?;
        self.put(id, SegmentType::Edges, bytes)?;
        Ok(meta)
    }

    /// Make renames of freshly written segments durable.
    pub fn sync(&self) -> Result<()> {
        match self {
            SegmentStore::Disk { dir, durability } => sync_dir(dir, *durability),
            SegmentStore::Memory(_) => Ok(()),
        }
    }

    pub fn open_nodes(&self, id: u64) -> Result<Arc<NodeSegment>> {
        let seg = match self {
            SegmentStore::Disk { dir, .. } => {
                let path = Self::path(dir, id, SegmentType::Nodes);
                if !path.exists() {
                    return Err(missing(id, SegmentType::Nodes));
                }
                NodeSegment::open(&path)?
            }
            SegmentStore::Memory(_) => NodeSegment::from_shared(self.get_shared(id, SegmentType::Nodes)?)?,
        };
        Ok(Arc::new(seg))
    }

    pub fn open_edges(&self, id: u64) -> Result<Arc<EdgeSegment>> {
        let seg = match self {
            SegmentStore::Disk { dir, .. } => {
                let path = Self::path(dir, id, SegmentType::Edges);
                if !path.exists() {
                    return Err(missing(id, SegmentType::Edges));
                }
                EdgeSegment::open(&path)?
            }
            SegmentStore::Memory(_) => EdgeSegment::from_shared(self.get_shared(id, SegmentType::Edges)?)?,
        };
        Ok(Arc::new(seg))
    }

    /// Delete a segment. Missing segments are not an error.
    ///
    /// Open mappings stay readable on Unix after the unlink.
    pub fn remove(&self, id: u64, kind: SegmentType) -> Result<()> {
        match self {
            SegmentStore::Disk { dir, .. } => match fs::remove_file(Self::path(dir, id, kind)) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            SegmentStore::Memory(map) => {
                map.lock()
                    .map_err(|_| GraphError::Integrity("segment map poisoned".into()))?
                    .remove(&(id, kind));
                Ok(())
            }
        }
    }

    /// Every stored segment, in id order.
    pub fn list(&self) -> Result<Vec<(u64, SegmentType)>> {
        let mut out = match self {
            SegmentStore::Disk { dir, .. } => {
                let mut out = Vec::new();
                for entry in fs::read_dir(dir)? {
                    let entry = entry?;
                    if let Some(parsed) = entry.file_name().to_str().and_then(parse_segment_file_name) {
                        out.push(parsed);
                    }
                }
                out
            }
            SegmentStore::Memory(map) => map
                .lock()
                .map_err(|_| GraphError::Integrity("segment map poisoned".into()))?
                .keys()
                .copied()
                .collect(),
        };
        out.sort_by_key(|(id, kind)| (*id, *kind as u8));
        Ok(out)
    }
}

fn missing(id: u64, kind: SegmentType) -> GraphError {
    GraphError::NotFound(format!("{} segment {} (reclaimed)", kind.as_str(), id))
}
