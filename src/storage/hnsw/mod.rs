// HNSW graph index over L2-normalized vectors.
//
// Slots are dense: every inserted vector receives the next integer slot,
// and the graph never reuses or frees a slot. Deletion is handled one
// level up by rebuilding a fresh graph from the surviving vectors.

#[cfg(test)]
mod tests;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{RagError, Result};

pub const DEFAULT_M: usize = 16;
pub const DEFAULT_EF_CONSTRUCTION: usize = 80;
pub const DEFAULT_EF_SEARCH: usize = 16;

/// Slot value returned by `search` for padding positions when fewer than
/// `k` vectors exist in the graph.
pub const INVALID_SLOT: i64 = -1;

const MAGIC: u32 = 0x4C52_484E; // "LRHN"
const FORMAT_VERSION: u16 = 1;
const MAX_LEVEL: u8 = 16;

/// Graph construction and search parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswParams {
    /// Max neighbors per node per layer.
    pub m: usize,
    /// Beam width while inserting.
    pub ef_construction: usize,
    /// Beam width while searching.
    pub ef_search: usize,
}

impl Default for HnswParams {
    #[inline]
    fn default() -> Self {
        Self {
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef_search: DEFAULT_EF_SEARCH,
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    level: u8,
    vector: Vec<f32>,
    // neighbors[l] holds the slot ids connected at layer l, 0..=level
    neighbors: Vec<Vec<u32>>,
}

/// Candidate ordered by similarity score. NaN compares equal so the heap
/// stays total-ordered.
#[derive(Debug, Clone, Copy)]
struct Scored {
    score: f32,
    slot: u32,
}

impl PartialEq for Scored {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2-normalize a vector in place. Zero vectors are left untouched.
#[inline]
pub fn normalize(vector: &mut [f32]) {
    let norm = dot(vector, vector).sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// HNSW graph with inner-product similarity over unit vectors.
#[derive(Debug)]
pub struct HnswGraph {
    params: HnswParams,
    m_max0: usize,
    level_mult: f32,
    dim: usize,
    nodes: Vec<Node>,
    entry_point: Option<u32>,
    level_max: u8,
    // LCG state for level selection; fixed seed keeps builds deterministic
    rng_state: u64,
}

impl HnswGraph {
    #[inline]
    pub fn new(dim: usize, params: HnswParams) -> Self {
        let level_mult = 1.0 / (params.m.max(2) as f32).ln();

        Self {
            params,
            m_max0: params.m * 2,
            level_mult,
            dim,
            nodes: Vec::new(),
            entry_point: None,
            level_max: 0,
            rng_state: 42,
        }
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.dim
    }

    #[inline]
    pub fn params(&self) -> HnswParams {
        self.params
    }

    /// Number of vectors stored (the next slot to be assigned).
    #[inline]
    pub fn ntotal(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Stored vector for a slot, if the slot exists.
    #[inline]
    pub fn vector(&self, slot: usize) -> Option<&[f32]> {
        self.nodes.get(slot).map(|n| n.vector.as_slice())
    }

    /// Insert a vector and return its slot. The caller is responsible for
    /// normalizing the vector first.
    #[inline]
    pub fn add_point(&mut self, vector: Vec<f32>) -> Result<u32> {
        if vector.is_empty() {
            return Err(RagError::Index("cannot insert an empty vector".to_string()));
        }
        if vector.len() != self.dim {
            return Err(RagError::Index(format!(
                "vector dimension {} does not match index dimension {}",
                vector.len(),
                self.dim
            )));
        }

        let slot = self.nodes.len() as u32;
        let level = self.select_level();
        self.nodes.push(Node {
            level,
            vector,
            neighbors: vec![Vec::new(); usize::from(level) + 1],
        });

        let Some(mut ep) = self.entry_point else {
            self.entry_point = Some(slot);
            self.level_max = level;
            return Ok(slot);
        };

        // Greedy descent through the layers above the new node's level.
        let query = self.nodes[slot as usize].vector.clone();
        let mut layer = i32::from(self.level_max);
        while layer > i32::from(level) {
            ep = self.greedy_closest(ep, &query, layer as u8);
            layer -= 1;
        }

        // Connect at every layer from the node's level down to 0.
        for lc in (0..=level.min(self.level_max)).rev() {
            let found = self.beam_search(ep, &query, self.params.ef_construction, lc);

            let m_limit = if lc == 0 { self.m_max0 } else { self.params.m };
            let selected: Vec<u32> = found.iter().take(m_limit).map(|(s, _)| *s).collect();

            for &neighbor in &selected {
                self.link(neighbor, slot, lc);
                self.link(slot, neighbor, lc);
            }
            for &neighbor in &selected {
                self.prune(neighbor, lc, m_limit);
            }

            if let Some(&(best, _)) = found.first() {
                ep = best;
            }
        }

        if level > self.level_max {
            self.entry_point = Some(slot);
            self.level_max = level;
        }

        Ok(slot)
    }

    /// Nearest-neighbor search. Always returns exactly `k` pairs of
    /// `(slot, score)`; positions beyond the number of stored vectors are
    /// padded with `(INVALID_SLOT, 0.0)`.
    #[inline]
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(i64, f32)> {
        let mut results = Vec::with_capacity(k);

        if let Some(mut ep) = self.entry_point {
            let mut layer = i32::from(self.level_max);
            while layer > 0 {
                ep = self.greedy_closest(ep, query, layer as u8);
                layer -= 1;
            }

            let ef = k.max(self.params.ef_search);
            let found = self.beam_search(ep, query, ef, 0);
            results.extend(
                found
                    .into_iter()
                    .take(k)
                    .map(|(slot, score)| (i64::from(slot), score)),
            );
        }

        results.resize(k, (INVALID_SLOT, 0.0));
        results
    }

    fn select_level(&mut self) -> u8 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        let r = ((self.rng_state >> 33) as f32 / (u32::MAX as f32)).max(1e-7);

        let level = (-r.ln() * self.level_mult).floor() as u8;
        level.min(MAX_LEVEL)
    }

    fn similarity(&self, slot: u32, query: &[f32]) -> f32 {
        self.nodes
            .get(slot as usize)
            .map_or(f32::NEG_INFINITY, |n| dot(&n.vector, query))
    }

    /// Hill-climb to the most similar node reachable at one layer.
    fn greedy_closest(&self, entry: u32, query: &[f32], layer: u8) -> u32 {
        let mut current = entry;
        let mut current_sim = self.similarity(current, query);

        loop {
            let mut changed = false;

            let neighbors = self.nodes[current as usize]
                .neighbors
                .get(usize::from(layer));
            if let Some(neighbors) = neighbors {
                for &neighbor in neighbors {
                    let sim = self.similarity(neighbor, query);
                    if sim > current_sim {
                        current = neighbor;
                        current_sim = sim;
                        changed = true;
                    }
                }
            }

            if !changed {
                return current;
            }
        }
    }

    /// Beam search at one layer; returns up to `ef` results sorted by
    /// descending similarity.
    fn beam_search(&self, entry: u32, query: &[f32], ef: usize, layer: u8) -> Vec<(u32, f32)> {
        let mut visited: HashSet<u32> = HashSet::new();
        // explore best-first
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        // keep the ef best seen so far; min-heap so the worst pops first
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();

        let entry_sim = self.similarity(entry, query);
        visited.insert(entry);
        candidates.push(Scored {
            score: entry_sim,
            slot: entry,
        });
        results.push(Reverse(Scored {
            score: entry_sim,
            slot: entry,
        }));

        while let Some(Scored { score, slot }) = candidates.pop() {
            let worst = results
                .peek()
                .map_or(f32::NEG_INFINITY, |r| r.0.score);
            if score < worst && results.len() >= ef {
                break;
            }

            let neighbors = self.nodes[slot as usize].neighbors.get(usize::from(layer));
            if let Some(neighbors) = neighbors {
                for &neighbor in neighbors {
                    if !visited.insert(neighbor) {
                        continue;
                    }

                    let sim = self.similarity(neighbor, query);
                    let worst = results
                        .peek()
                        .map_or(f32::NEG_INFINITY, |r| r.0.score);
                    if sim > worst || results.len() < ef {
                        candidates.push(Scored {
                            score: sim,
                            slot: neighbor,
                        });
                        results.push(Reverse(Scored {
                            score: sim,
                            slot: neighbor,
                        }));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut found: Vec<(u32, f32)> = results
            .into_iter()
            .map(|r| (r.0.slot, r.0.score))
            .collect();
        found.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        found
    }

    fn link(&mut self, from: u32, to: u32, layer: u8) {
        if let Some(node) = self.nodes.get_mut(from as usize) {
            while node.neighbors.len() <= usize::from(layer) {
                node.neighbors.push(Vec::new());
            }
            let list = &mut node.neighbors[usize::from(layer)];
            if !list.contains(&to) {
                list.push(to);
            }
        }
    }

    /// Drop the least similar connections once a node exceeds its degree
    /// bound for a layer.
    fn prune(&mut self, slot: u32, layer: u8, max_neighbors: usize) {
        let (vector, neighbors) = {
            let Some(node) = self.nodes.get(slot as usize) else {
                return;
            };
            let Some(list) = node.neighbors.get(usize::from(layer)) else {
                return;
            };
            if list.len() <= max_neighbors {
                return;
            }
            (node.vector.clone(), list.clone())
        };

        let mut scored: Vec<(u32, f32)> = neighbors
            .into_iter()
            .map(|n| (n, self.similarity(n, &vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let pruned: Vec<u32> = scored
            .into_iter()
            .take(max_neighbors)
            .map(|(n, _)| n)
            .collect();

        if let Some(node) = self.nodes.get_mut(slot as usize) {
            node.neighbors[usize::from(layer)] = pruned;
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Serialize the graph to its binary on-disk representation.
    #[inline]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();

        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf.extend_from_slice(&(self.dim as u32).to_le_bytes());
        buf.extend_from_slice(&(self.params.m as u16).to_le_bytes());
        buf.extend_from_slice(&(self.params.ef_construction as u16).to_le_bytes());
        buf.extend_from_slice(&(self.params.ef_search as u16).to_le_bytes());
        buf.extend_from_slice(&(self.nodes.len() as u32).to_le_bytes());
        buf.push(self.level_max);
        buf.extend_from_slice(&self.entry_point.unwrap_or(u32::MAX).to_le_bytes());

        for node in &self.nodes {
            buf.push(node.level);
            for &v in &node.vector {
                buf.extend_from_slice(&v.to_le_bytes());
            }
            for list in &node.neighbors {
                buf.extend_from_slice(&(list.len() as u16).to_le_bytes());
                for &n in list {
                    buf.extend_from_slice(&n.to_le_bytes());
                }
            }
        }

        buf
    }

    /// Reconstruct a graph from its binary representation.
    #[inline]
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);

        if reader.read_u32()? != MAGIC {
            return Err(RagError::Index("invalid index file magic".to_string()));
        }
        let version = reader.read_u16()?;
        if version != FORMAT_VERSION {
            return Err(RagError::Index(format!(
                "unsupported index format version {version}"
            )));
        }

        let dim = reader.read_u32()? as usize;
        let m = usize::from(reader.read_u16()?);
        let ef_construction = usize::from(reader.read_u16()?);
        let ef_search = usize::from(reader.read_u16()?);
        let node_count = reader.read_u32()? as usize;
        let level_max = reader.read_u8()?;
        let entry_raw = reader.read_u32()?;

        let mut graph = Self::new(
            dim,
            HnswParams {
                m,
                ef_construction,
                ef_search,
            },
        );
        graph.level_max = level_max;
        graph.entry_point = (entry_raw != u32::MAX).then_some(entry_raw);

        for _ in 0..node_count {
            let level = reader.read_u8()?;
            let mut vector = Vec::with_capacity(dim);
            for _ in 0..dim {
                vector.push(reader.read_f32()?);
            }

            let mut neighbors = Vec::with_capacity(usize::from(level) + 1);
            for _ in 0..=level {
                let count = usize::from(reader.read_u16()?);
                let mut list = Vec::with_capacity(count);
                for _ in 0..count {
                    let neighbor = reader.read_u32()?;
                    if neighbor as usize >= node_count {
                        return Err(RagError::Index(format!(
                            "neighbor slot {neighbor} out of bounds (ntotal {node_count})"
                        )));
                    }
                    list.push(neighbor);
                }
                neighbors.push(list);
            }

            graph.nodes.push(Node {
                level,
                vector,
                neighbors,
            });
        }

        if let Some(entry) = graph.entry_point
            && entry as usize >= graph.nodes.len()
        {
            return Err(RagError::Index(format!(
                "entry point {entry} out of bounds (ntotal {})",
                graph.nodes.len()
            )));
        }

        Ok(graph)
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| RagError::Index("truncated index file".to_string()))?;
        let slice = &self.bytes[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_f32(&mut self) -> Result<f32> {
        let bytes = self.take(4)?;
        Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}
