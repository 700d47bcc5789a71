//! Header parsing.

use flatgeobuf::{size_prefixed_root_as_header, ColumnType, GeometryType};
use serde::Serialize;

use super::{MAGIC_BYTES, MAGIC_LEN, SIZE_PREFIX_LEN};
use crate::error::{Result, SourceError};
use crate::types::Envelope;

/// Owned copy of the parts of a FlatGeobuf header this crate uses.
#[derive(Debug, Clone)]
pub struct HeaderMeta {
    pub name: Option<String>,
    pub geometry_type: GeometryType,
    pub columns: Vec<ColumnMeta>,
    pub features_count: u64,
    pub index_node_size: u16,
    pub envelope: Option<Envelope>,
    /// Size of the header flatbuffer, excluding the magic bytes and prefix.
    pub header_size: usize,
}

/// Name and type of one attribute column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(skip)]
    pub column_type: ColumnType,
}

impl ColumnMeta {
    /// True for column types decoded as numbers.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self.column_type,
            ColumnType::Byte
                | ColumnType::UByte
                | ColumnType::Short
                | ColumnType::UShort
                | ColumnType::Int
                | ColumnType::UInt
                | ColumnType::Long
                | ColumnType::ULong
                | ColumnType::Float
                | ColumnType::Double
        )
    }

    /// True for boolean columns.
    pub fn is_boolean(&self) -> bool {
        self.column_type == ColumnType::Bool
    }
}

impl HeaderMeta {
    /// Offset of the first byte after the header (start of the index).
    pub fn index_offset(&self) -> u64 {
        (MAGIC_LEN + SIZE_PREFIX_LEN + self.header_size) as u64
    }

    /// Geometry type name as used in FlatGeobuf ("Polygon", "MultiPolygon", ...).
    pub fn geometry_type_name(&self) -> &'static str {
        self.geometry_type.variant_name().unwrap_or("Unknown")
    }

    /// Bytes needed to hold the magic, size prefix and header, read from the
    /// size prefix. `None` if `data` is too short or not a FlatGeobuf file.
    pub fn required_len(data: &[u8]) -> Option<u64> {
        if data.len() < MAGIC_LEN + SIZE_PREFIX_LEN
            || data[..MAGIC_LEN - 1] != MAGIC_BYTES[..MAGIC_LEN - 1]
        {
            return None;
        }
        let prefix: [u8; 4] = data[MAGIC_LEN..MAGIC_LEN + SIZE_PREFIX_LEN].try_into().ok()?;
        Some((MAGIC_LEN + SIZE_PREFIX_LEN) as u64 + u32::from_le_bytes(prefix) as u64)
    }

    /// Parse the header from the first bytes of a file.
    ///
    /// `data` must start at byte 0. Returns a Format error when the magic
    /// bytes do not match or `data` is too short to contain the header.
    pub fn parse(url: &str, data: &[u8]) -> Result<Self> {
        if data.len() < MAGIC_LEN + SIZE_PREFIX_LEN {
            return Err(SourceError::format(url, "file too short for FlatGeobuf header"));
        }

        // The last magic byte is the patch version and may differ
        if data[..MAGIC_LEN - 1] != MAGIC_BYTES[..MAGIC_LEN - 1] {
            return Err(SourceError::format(url, "magic bytes mismatch"));
        }

        let size_bytes: [u8; 4] = data[MAGIC_LEN..MAGIC_LEN + SIZE_PREFIX_LEN]
            .try_into()
            .map_err(|_| SourceError::format(url, "truncated header size"))?;
        let header_size = u32::from_le_bytes(size_bytes) as usize;

        let start = MAGIC_LEN + SIZE_PREFIX_LEN;
        let end = start + header_size;
        if data.len() < end {
            return Err(SourceError::format(
                url,
                format!(
                    "truncated header: need {} bytes, have {}",
                    end,
                    data.len()
                ),
            ));
        }

        // Parse from the size prefix so flatbuffer alignment matches the writer
        let header = size_prefixed_root_as_header(&data[MAGIC_LEN..end])
            .map_err(|e| SourceError::format(url, format!("invalid header flatbuffer: {}", e)))?;

        let columns = header
            .columns()
            .map(|columns| {
                columns
                    .iter()
                    .map(|column| ColumnMeta {
                        name: column.name().to_string(),
                        column_type: column.type_(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let envelope = header.envelope().and_then(|env| {
            if env.len() >= 4 {
                Some(Envelope::new(env.get(0), env.get(1), env.get(2), env.get(3)))
            } else {
                None
            }
        });

        Ok(Self {
            name: header.name().map(str::to_string),
            geometry_type: header.geometry_type(),
            columns,
            features_count: header.features_count(),
            index_node_size: header.index_node_size(),
            envelope,
            header_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixed(magic: [u8; MAGIC_LEN], header_size: u32) -> Vec<u8> {
        let mut data = magic.to_vec();
        data.extend_from_slice(&header_size.to_le_bytes());
        data
    }

    #[test]
    fn test_magic_bytes_layout() {
        assert_eq!(&MAGIC_BYTES[..3], b"fgb");
        assert_eq!(MAGIC_BYTES[3], flatgeobuf::VERSION);
        assert_eq!(&MAGIC_BYTES[4..], b"fgb\0");
    }

    #[test]
    fn test_required_len_ignores_patch_version() {
        assert_eq!(HeaderMeta::required_len(&prefixed(MAGIC_BYTES, 100)), Some(112));

        let mut patched = MAGIC_BYTES;
        patched[MAGIC_LEN - 1] = 1;
        assert_eq!(HeaderMeta::required_len(&prefixed(patched, 100)), Some(112));

        let mut wrong_version = MAGIC_BYTES;
        wrong_version[3] = flatgeobuf::VERSION + 1;
        assert_eq!(HeaderMeta::required_len(&prefixed(wrong_version, 100)), None);
        assert_eq!(HeaderMeta::required_len(&MAGIC_BYTES), None);
    }
}
