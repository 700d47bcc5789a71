//! FlatGeobuf binary layout: header, packed Hilbert R-tree and features.

pub(crate) mod feature;
pub(crate) mod header;
pub(crate) mod rtree;

pub use feature::{Feature, Value};
pub use header::{ColumnMeta, HeaderMeta};
pub use rtree::{FeatureRef, PackedRTree, NODE_ITEM_LEN};

/// Magic bytes at the start of every file, carrying the format version.
pub const MAGIC_BYTES: [u8; MAGIC_LEN] =
    [b'f', b'g', b'b', flatgeobuf::VERSION, b'f', b'g', b'b', 0];

/// Length of the magic bytes at the start of every file.
pub const MAGIC_LEN: usize = 8;

/// Length of the little-endian size prefix on the header and every feature.
pub const SIZE_PREFIX_LEN: usize = 4;
