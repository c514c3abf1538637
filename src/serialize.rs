//! serialize.rs — snapshot save/load for smallworld.
//!
//! The stream is a flat sequence of big-endian primitives framing
//! bincode-encoded id/item payloads. A node's level count is derived from
//! its adjacency (`links.len() - 1`); no separate level field is stored.
//! The distance metric is a type, not data — the caller supplies it again
//! at `load`.
//!
//! Per-node layout: the id (or -1 for a vacant slot), the level count,
//! each level's neighbour list as a single size-prefixed pass, then the
//! item payload exactly once and the deleted flag exactly once.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::{
    errors::{Error, Result},
    graph::{Graph, Registry},
    math::Metric,
    node::{Item, Node, NodeId},
    params::Params,
    store::NodeStore,
    Hnsw, Key,
};

const SNAPSHOT_VERSION: u8 = 0x01;

/// Write the full index state to `writer`.
///
/// Holds the global lock for the duration, so the snapshot is consistent
/// with respect to completed inserts and removals.
pub(crate) fn save<K: Key, M: Metric, W: Write>(
    index: &Hnsw<K, M>,
    writer: &mut W,
) -> Result<()> {
    let graph = &index.graph;
    let p = &graph.params;
    let registry = graph.registry.lock();

    writer.write_u8(SNAPSHOT_VERSION)?;
    writer.write_i32::<BigEndian>(p.dims as i32)?;
    writer.write_i32::<BigEndian>(graph.store.capacity() as i32)?;
    writer.write_i32::<BigEndian>(p.m as i32)?;
    writer.write_i32::<BigEndian>(p.max_m as i32)?;
    writer.write_i32::<BigEndian>(p.max_m0 as i32)?;
    writer.write_f64::<BigEndian>(p.level_lambda)?;
    writer.write_i32::<BigEndian>(index.ef.load(Ordering::Relaxed) as i32)?;
    writer.write_i32::<BigEndian>(p.ef_construction as i32)?;
    writer.write_u8(p.remove_enabled as u8)?;
    writer.write_i32::<BigEndian>(registry.node_count as i32)?;

    writer.write_i32::<BigEndian>(registry.lookup.len() as i32)?;
    for (id, &node_id) in &registry.lookup {
        write_blob(writer, &encode(id)?)?;
        writer.write_i32::<BigEndian>(node_id as i32)?;
    }

    writer.write_i32::<BigEndian>(registry.tombstones.len() as i32)?;
    for (id, &version) in &registry.tombstones {
        write_blob(writer, &encode(id)?)?;
        writer.write_i64::<BigEndian>(version as i64)?;
    }

    writer.write_i32::<BigEndian>(registry.node_count as i32)?;
    for node_id in 0..registry.node_count {
        let Some(node) = graph.store.get(node_id) else {
            writer.write_i32::<BigEndian>(-1)?;
            continue;
        };
        writer.write_i32::<BigEndian>(node.id as i32)?;

        let links = node.links.lock().clone();
        writer.write_i32::<BigEndian>(links.len() as i32)?;
        for level in &links {
            writer.write_i32::<BigEndian>(level.len() as i32)?;
            for &neighbour in level {
                writer.write_i32::<BigEndian>(neighbour as i32)?;
            }
        }

        write_blob(writer, &encode(node.item().as_ref())?)?;
        writer.write_u8(node.is_deleted() as u8)?;
    }

    let entry_id = index
        .graph
        .entry
        .read()
        .as_ref()
        .map_or(-1, |ep| ep.id as i32);
    writer.write_i32::<BigEndian>(entry_id)?;

    info!(nodes = registry.node_count, "snapshot written");
    Ok(())
}

/// Rebuild an index from a snapshot stream.
///
/// A malformed or truncated stream fails with `Io`, `Serialization` or
/// `Snapshot`; the partially built value is dropped, never returned.
pub(crate) fn load<K: Key, M: Metric, R: Read>(
    reader: &mut R,
    metric: M,
) -> Result<Hnsw<K, M>> {
    let version = reader.read_u8()?;
    if version != SNAPSHOT_VERSION {
        return Err(Error::Snapshot(format!(
            "unsupported snapshot version {version:#04x}"
        )));
    }

    let dims = read_len(reader, "dims")?;
    let max_items = read_len(reader, "max_items")?;
    let m = read_len(reader, "m")?;
    let max_m = read_len(reader, "max_m")?;
    let max_m0 = read_len(reader, "max_m0")?;
    let level_lambda = reader.read_f64::<BigEndian>()?;
    let ef = read_len(reader, "ef")?;
    let ef_construction = read_len(reader, "ef_construction")?;
    let remove_enabled = reader.read_u8()? != 0;
    let node_count = read_len(reader, "node_count")?;
    if node_count > max_items {
        return Err(Error::Snapshot(format!(
            "node count {node_count} exceeds capacity {max_items}"
        )));
    }

    let lookup_len = read_len(reader, "lookup length")?;
    let mut lookup = rustc_hash::FxHashMap::default();
    for _ in 0..lookup_len {
        let id: K = decode(&read_blob(reader)?)?;
        let node_id = read_len(reader, "lookup entry")?;
        lookup.insert(id, node_id as NodeId);
    }

    let tombstones_len = read_len(reader, "tombstone length")?;
    let mut tombstones = rustc_hash::FxHashMap::default();
    for _ in 0..tombstones_len {
        let id: K = decode(&read_blob(reader)?)?;
        let version = reader.read_i64::<BigEndian>()? as u64;
        tombstones.insert(id, version);
    }

    let slot_len = read_len(reader, "node array length")?;
    let mut slots: Vec<Option<Arc<Node<K>>>> = Vec::with_capacity(slot_len);
    for _ in 0..slot_len {
        let id = reader.read_i32::<BigEndian>()?;
        if id < 0 {
            slots.push(None);
            continue;
        }

        let levels = read_len(reader, "level count")?;
        if levels == 0 {
            return Err(Error::Snapshot(format!("node {id} has no levels")));
        }
        let mut links = Vec::with_capacity(levels);
        for _ in 0..levels {
            let size = read_len(reader, "neighbour count")?;
            let mut level = Vec::with_capacity(size);
            for _ in 0..size {
                level.push(read_len(reader, "neighbour id")? as NodeId);
            }
            links.push(level);
        }

        let item: Item<K> = decode(&read_blob(reader)?)?;
        let deleted = reader.read_u8()? != 0;
        slots.push(Some(Arc::new(Node::restore(
            id as NodeId,
            links,
            item,
            deleted,
        ))));
    }

    let store = NodeStore::from_slots(slots, max_items);

    let entry_id = reader.read_i32::<BigEndian>()?;
    let entry = if entry_id < 0 {
        None
    } else {
        let Some(node) = store.get(entry_id as NodeId) else {
            return Err(Error::Snapshot(format!(
                "entry point {entry_id} has no node"
            )));
        };
        Some(node)
    };

    let params = Params {
        dims,
        max_items,
        m,
        max_m,
        max_m0,
        ef_construction,
        level_lambda,
        remove_enabled,
    };
    let registry = Registry {
        node_count,
        lookup,
        tombstones,
    };

    info!(nodes = node_count, "snapshot loaded");
    Ok(Hnsw {
        metric,
        ef: AtomicUsize::new(ef),
        graph: Graph::from_parts(params, store, registry, entry),
    })
}

/* ---------------- framing helpers ------------------------------------- */

fn write_blob<W: Write>(writer: &mut W, blob: &[u8]) -> Result<()> {
    writer.write_u32::<BigEndian>(blob.len() as u32)?;
    writer.write_all(blob)?;
    Ok(())
}

fn read_blob<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    let mut blob = vec![0u8; len];
    reader.read_exact(&mut blob)?;
    Ok(blob)
}

/// Read an i32 that must be a non-negative count or size.
fn read_len<R: Read>(reader: &mut R, what: &str) -> Result<usize> {
    let value = reader.read_i32::<BigEndian>()?;
    if value < 0 {
        return Err(Error::Snapshot(format!("negative {what}: {value}")));
    }
    Ok(value as usize)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
}
