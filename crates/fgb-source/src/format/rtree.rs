//! Packed Hilbert R-tree, as laid out in a FlatGeobuf index.
//!
//! Nodes are stored level by level with the root first and the leaves
//! last. Each node is 40 bytes: `min_x, min_y, max_x, max_y` as f64 followed
//! by a u64 offset. For leaves the offset is the feature's byte offset
//! relative to the start of feature data; for interior nodes it is the
//! index of the node's first child.

use crate::types::Envelope;

/// Serialized size of one node.
pub const NODE_ITEM_LEN: usize = 40;

/// Hilbert curve resolution used for sorting.
const HILBERT_MAX: f64 = ((1u32 << 16) - 1) as f64;

/// One node of the tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeItem {
    pub envelope: Envelope,
    pub offset: u64,
}

impl NodeItem {
    pub fn new(envelope: Envelope, offset: u64) -> Self {
        Self { envelope, offset }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.envelope.min_x.to_le_bytes());
        out.extend_from_slice(&self.envelope.min_y.to_le_bytes());
        out.extend_from_slice(&self.envelope.max_x.to_le_bytes());
        out.extend_from_slice(&self.envelope.max_y.to_le_bytes());
        out.extend_from_slice(&self.offset.to_le_bytes());
    }
}

/// A feature located by an index search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureRef {
    /// Byte offset relative to the start of feature data.
    pub offset: u64,
    /// Byte length including the size prefix. `None` for the last feature
    /// when the file length is unknown.
    pub length: Option<u64>,
    /// Position of the feature in file order.
    pub index: usize,
    pub envelope: Envelope,
}

/// Level bounds as `(first_node, end_node)` pairs, leaves first.
pub fn level_bounds(num_items: u64, node_size: u16) -> Vec<(usize, usize)> {
    let node_size = node_size.max(2) as u64;
    let mut level_num_nodes = vec![num_items];
    let mut n = num_items;
    let mut num_nodes = n;
    loop {
        n = n.div_ceil(node_size);
        num_nodes += n;
        level_num_nodes.push(n);
        if n <= 1 {
            break;
        }
    }

    let mut bounds = Vec::with_capacity(level_num_nodes.len());
    let mut end = num_nodes;
    for size in level_num_nodes {
        bounds.push(((end - size) as usize, end as usize));
        end -= size;
    }
    bounds
}

/// Total number of nodes for a tree over `num_items` leaves.
pub fn num_nodes(num_items: u64, node_size: u16) -> usize {
    if num_items == 0 {
        return 0;
    }
    level_bounds(num_items, node_size)
        .first()
        .map(|(_, end)| *end)
        .unwrap_or(0)
}

/// Index size in bytes.
pub fn index_size(num_items: u64, node_size: u16) -> u64 {
    (num_nodes(num_items, node_size) * NODE_ITEM_LEN) as u64
}

/// Read-only view over serialized index bytes.
#[derive(Debug, Clone)]
pub struct PackedRTree {
    data: bytes::Bytes,
    num_items: u64,
    node_size: u16,
    level_bounds: Vec<(usize, usize)>,
    /// Offset where feature data ends, relative to feature data start.
    data_end: Option<u64>,
}

impl PackedRTree {
    /// Wrap index bytes. Returns `None` if `data` is shorter than the tree.
    pub fn from_bytes(data: bytes::Bytes, num_items: u64, node_size: u16) -> Option<Self> {
        if (data.len() as u64) < index_size(num_items, node_size) {
            return None;
        }
        Some(Self {
            data,
            num_items,
            node_size,
            level_bounds: level_bounds(num_items, node_size),
            data_end: None,
        })
    }

    /// Build an in-memory tree over `envelopes`, kept in the given order.
    ///
    /// Each envelope is stored with its position as offset, so search
    /// results report it as both `index` and `offset`.
    pub fn from_envelopes(envelopes: &[Envelope], node_size: u16) -> Self {
        let leaves: Vec<NodeItem> = envelopes
            .iter()
            .enumerate()
            .map(|(i, envelope)| NodeItem::new(*envelope, i as u64))
            .collect();
        let num_items = leaves.len() as u64;
        Self {
            data: bytes::Bytes::from(build(&leaves, node_size)),
            num_items,
            node_size,
            level_bounds: level_bounds(num_items, node_size),
            data_end: Some(num_items),
        }
    }

    /// Record where feature data ends so the last feature has a length.
    pub fn set_data_end(&mut self, data_end: u64) {
        self.data_end = Some(data_end);
    }

    pub fn num_items(&self) -> u64 {
        self.num_items
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    fn node(&self, index: usize) -> NodeItem {
        let base = index * NODE_ITEM_LEN;
        let f = |i: usize| {
            let start = base + i * 8;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&self.data[start..start + 8]);
            buf
        };
        NodeItem {
            envelope: Envelope::new(
                f64::from_le_bytes(f(0)),
                f64::from_le_bytes(f(1)),
                f64::from_le_bytes(f(2)),
                f64::from_le_bytes(f(3)),
            ),
            offset: u64::from_le_bytes(f(4)),
        }
    }

    fn leaves_start(&self) -> usize {
        self.level_bounds.first().map(|(start, _)| *start).unwrap_or(0)
    }

    /// Bounds of the whole tree (the root node).
    pub fn bounds(&self) -> Envelope {
        if self.num_items == 0 {
            return Envelope::empty();
        }
        self.node(0).envelope
    }

    /// Byte offset of the leaf at `index` in file order.
    pub fn leaf_offset(&self, index: usize) -> u64 {
        self.node(self.leaves_start() + index).offset
    }

    /// Byte offsets of every feature in file order.
    pub fn feature_offsets(&self) -> Vec<u64> {
        (0..self.num_items as usize)
            .map(|i| self.leaf_offset(i))
            .collect()
    }

    /// Check that leaf offsets never decrease in file order.
    ///
    /// Returns the index of the first leaf whose offset is below its
    /// predecessor's. Feature lengths are derived from consecutive offsets.
    pub fn check_offsets(&self) -> Result<(), usize> {
        let mut previous = 0;
        for index in 0..self.num_items as usize {
            let offset = self.leaf_offset(index);
            if offset < previous {
                return Err(index);
            }
            previous = offset;
        }
        Ok(())
    }

    fn feature_ref(&self, index: usize, envelope: Envelope) -> FeatureRef {
        let offset = self.leaf_offset(index);
        let length = if index + 1 < self.num_items as usize {
            self.leaf_offset(index + 1).checked_sub(offset)
        } else {
            self.data_end.map(|end| end.saturating_sub(offset))
        };
        FeatureRef {
            offset,
            length,
            index,
            envelope,
        }
    }

    /// All features whose bounding box intersects `envelope`, in no
    /// particular order.
    pub fn search(&self, envelope: &Envelope) -> Vec<FeatureRef> {
        let mut results = Vec::new();
        if self.num_items == 0 || self.level_bounds.is_empty() {
            return results;
        }

        let leaves_start = self.leaves_start();
        let node_size = self.node_size.max(2) as usize;
        let mut stack = vec![(0usize, self.level_bounds.len() - 1)];

        while let Some((node_index, level)) = stack.pop() {
            let is_leaf_level = node_index >= leaves_start;
            let level_end = self.level_bounds[level].1;
            let end = (node_index + node_size).min(level_end);

            for pos in node_index..end {
                let node = self.node(pos);
                if !envelope.intersects(&node.envelope) {
                    continue;
                }
                if is_leaf_level {
                    results.push(self.feature_ref(pos - leaves_start, node.envelope));
                } else if level > 0 {
                    stack.push((node.offset as usize, level - 1));
                }
            }
        }

        results
    }
}

/// Build the serialized index for leaves already in file order.
///
/// `leaves` carry feature envelopes and byte offsets.
pub fn build(leaves: &[NodeItem], node_size: u16) -> Vec<u8> {
    let num_items = leaves.len() as u64;
    if num_items == 0 {
        return Vec::new();
    }

    let bounds = level_bounds(num_items, node_size);
    let total = num_nodes(num_items, node_size);
    let node_size = node_size.max(2) as usize;

    let mut nodes = vec![NodeItem::new(Envelope::empty(), 0); total];
    let leaves_start = bounds[0].0;
    nodes[leaves_start..leaves_start + leaves.len()].copy_from_slice(leaves);

    for level in 0..bounds.len() - 1 {
        let (start, end) = bounds[level];
        let mut parent = bounds[level + 1].0;
        let mut pos = start;
        while pos < end {
            let mut node = NodeItem::new(Envelope::empty(), pos as u64);
            for _ in 0..node_size {
                if pos >= end {
                    break;
                }
                node.envelope.expand(&nodes[pos].envelope);
                pos += 1;
            }
            nodes[parent] = node;
            parent += 1;
        }
    }

    let mut out = Vec::with_capacity(total * NODE_ITEM_LEN);
    for node in &nodes {
        node.write_to(&mut out);
    }
    out
}

/// Hilbert value of an envelope's center within `extent`.
pub fn hilbert_value(envelope: &Envelope, extent: &Envelope) -> u32 {
    let scale = |v: f64, min: f64, size: f64| -> u32 {
        if size <= 0.0 {
            0
        } else {
            (HILBERT_MAX * ((v - min) / size)).floor().clamp(0.0, HILBERT_MAX) as u32
        }
    };
    let (cx, cy) = envelope.center();
    let x = scale(cx, extent.min_x, extent.width());
    let y = scale(cy, extent.min_y, extent.height());
    hilbert(x, y)
}

// Fast Hilbert curve index for 16 bit coordinates.
fn hilbert(x: u32, y: u32) -> u32 {
    let mut a = x ^ y;
    let mut b = 0xFFFF ^ a;
    let mut c = 0xFFFF ^ (x | y);
    let mut d = x & (y ^ 0xFFFF);

    let mut aa = a | (b >> 1);
    let mut bb = (a >> 1) ^ a;
    let mut cc = ((c >> 1) ^ (b & (d >> 1))) ^ c;
    let mut dd = ((a & (c >> 1)) ^ (d >> 1)) ^ d;

    a = aa;
    b = bb;
    c = cc;
    d = dd;
    aa = (a & (a >> 2)) ^ (b & (b >> 2));
    bb = (a & (b >> 2)) ^ (b & ((a ^ b) >> 2));
    cc ^= (a & (c >> 2)) ^ (b & (d >> 2));
    dd ^= (b & (c >> 2)) ^ ((a ^ b) & (d >> 2));

    a = aa;
    b = bb;
    c = cc;
    d = dd;
    aa = (a & (a >> 4)) ^ (b & (b >> 4));
    bb = (a & (b >> 4)) ^ (b & ((a ^ b) >> 4));
    cc ^= (a & (c >> 4)) ^ (b & (d >> 4));
    dd ^= (b & (c >> 4)) ^ ((a ^ b) & (d >> 4));

    a = aa;
    b = bb;
    c = cc;
    d = dd;
    cc ^= (a & (c >> 8)) ^ (b & (d >> 8));
    dd ^= (b & (c >> 8)) ^ ((a ^ b) & (d >> 8));

    a = cc ^ (cc >> 1);
    b = dd ^ (dd >> 1);

    let mut i0 = x ^ y;
    let mut i1 = b | (0xFFFF ^ (i0 | a));

    i0 = (i0 | (i0 << 8)) & 0x00FF_00FF;
    i0 = (i0 | (i0 << 4)) & 0x0F0F_0F0F;
    i0 = (i0 | (i0 << 2)) & 0x3333_3333;
    i0 = (i0 | (i0 << 1)) & 0x5555_5555;

    i1 = (i1 | (i1 << 8)) & 0x00FF_00FF;
    i1 = (i1 | (i1 << 4)) & 0x0F0F_0F0F;
    i1 = (i1 | (i1 << 2)) & 0x3333_3333;
    i1 = (i1 | (i1 << 1)) & 0x5555_5555;

    (i1 << 1) | i0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_leaves(n: usize) -> Vec<NodeItem> {
        (0..n)
            .map(|i| {
                let x = (i % 10) as f64;
                let y = (i / 10) as f64;
                NodeItem::new(Envelope::new(x, y, x + 0.5, y + 0.5), (i * 100) as u64)
            })
            .collect()
    }

    #[test]
    fn test_level_bounds_single_item() {
        // A single leaf still gets a root above it
        assert_eq!(level_bounds(1, 16), vec![(1, 2), (0, 1)]);
        assert_eq!(num_nodes(1, 16), 2);
    }

    #[test]
    fn test_level_bounds_multi_level() {
        let bounds = level_bounds(300, 16);
        // 300 leaves -> 19 -> 2 -> 1
        assert_eq!(bounds.len(), 4);
        assert_eq!(bounds[0], (22, 322));
        assert_eq!(bounds[3], (0, 1));
        assert_eq!(index_size(300, 16), 322 * 40);
        assert_eq!(index_size(0, 16), 0);
    }

    #[test]
    fn test_build_and_search() {
        let leaves = grid_leaves(100);
        let data = build(&leaves, 16);
        let mut tree = PackedRTree::from_bytes(bytes::Bytes::from(data), 100, 16).unwrap();
        tree.set_data_end(100 * 100);

        assert_eq!(tree.bounds(), Envelope::new(0.0, 0.0, 9.5, 9.5));

        let mut hits = tree.search(&Envelope::new(2.2, 2.2, 3.1, 3.1));
        hits.sort_by_key(|r| r.index);
        let indexes: Vec<usize> = hits.iter().map(|r| r.index).collect();
        assert_eq!(indexes, vec![22, 23, 32, 33]);
        assert!(hits.iter().all(|r| r.length == Some(100)));

        let last = tree.search(&Envelope::new(9.1, 9.1, 9.2, 9.2));
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].offset, 9900);
        assert_eq!(last[0].length, Some(100));

        assert!(tree.search(&Envelope::new(50.0, 50.0, 60.0, 60.0)).is_empty());
        assert_eq!(tree.search(&Envelope::world()).len(), 100);
    }

    #[test]
    fn test_last_feature_length_unknown_without_data_end() {
        let leaves = grid_leaves(3);
        let tree = PackedRTree::from_bytes(bytes::Bytes::from(build(&leaves, 16)), 3, 16).unwrap();
        let hits = tree.search(&Envelope::new(2.0, 0.0, 2.5, 0.5));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].length, None);
    }

    #[test]
    fn test_descending_offsets_detected() {
        let mut leaves = grid_leaves(5);
        leaves[3].offset = 150;
        let tree = PackedRTree::from_bytes(bytes::Bytes::from(build(&leaves, 16)), 5, 16).unwrap();
        assert_eq!(tree.check_offsets(), Err(3));

        // Searching still never underflows
        let hits = tree.search(&Envelope::new(2.0, 0.0, 2.5, 0.5));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].length, None);

        let ascending = PackedRTree::from_bytes(bytes::Bytes::from(build(&grid_leaves(5), 16)), 5, 16).unwrap();
        assert_eq!(ascending.check_offsets(), Ok(()));
    }

    #[test]
    fn test_from_envelopes_reports_positions() {
        let envelopes: Vec<Envelope> = (0..40)
            .map(|i| Envelope::new(i as f64, 0.0, i as f64 + 1.0, 1.0))
            .collect();
        let tree = PackedRTree::from_envelopes(&envelopes, 8);
        assert_eq!(tree.check_offsets(), Ok(()));

        let mut hits: Vec<usize> = tree
            .search(&Envelope::new(10.5, 0.5, 12.5, 0.5))
            .iter()
            .map(|r| r.index)
            .collect();
        hits.sort_unstable();
        assert_eq!(hits, vec![10, 11, 12]);

        assert!(PackedRTree::from_envelopes(&[], 8).search(&Envelope::world()).is_empty());
    }

    #[test]
    fn test_from_bytes_rejects_short_index() {
        assert!(PackedRTree::from_bytes(bytes::Bytes::from(vec![0u8; 40]), 10, 16).is_none());
    }

    #[test]
    fn test_hilbert_value_in_range() {
        let extent = Envelope::new(0.0, 0.0, 10.0, 10.0);
        let a = hilbert_value(&Envelope::new(0.0, 0.0, 0.0, 0.0), &extent);
        let b = hilbert_value(&Envelope::new(10.0, 10.0, 10.0, 10.0), &extent);
        assert_ne!(a, b);

        let degenerate = Envelope::new(1.0, 1.0, 1.0, 1.0);
        assert_eq!(hilbert_value(&degenerate, &degenerate), hilbert(0, 0));
    }
}
