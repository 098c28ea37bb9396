//! The metadata schema: a compact description of how the packed metadata
//! section is laid out.
//!
//! The schema is written as its own section
//! ([`SectionType::METADATA_SCHEMA`][crate::section::SectionType::METADATA_SCHEMA])
//! so the table layout can evolve without breaking old readers. It lists,
//! per table, the row count and the bit width of every column; the
//! metadata section is then nothing but the concatenated bit-packed
//! tables plus the string buffers.

use super::{Error, Result, packing};

/// The schema format version written by this crate.
pub const SCHEMA_VERSION: u8 = 1;

/// Identifies one packed table within the metadata section.
///
/// Tables appear in the metadata payload in ascending id order. Unknown
/// ids are rejected; absent tables are simply not listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TableId {
    Chunks = 0,
    Directories = 1,
    Inodes = 2,
    DirEntries = 3,
    ChunkTable = 4,
    SymlinkTable = 5,
    Uids = 6,
    Gids = 7,
    Modes = 8,
    Devices = 9,
    SharedFiles = 10,
    NameIndex = 11,
    SymlinkIndex = 12,
    BlockCategories = 13,
}

impl TableId {
    pub(crate) fn from_raw(raw: u64) -> Result<Self> {
        use TableId::*;
        Ok(match raw {
            0 => Chunks,
            1 => Directories,
            2 => Inodes,
            3 => DirEntries,
            4 => ChunkTable,
            5 => SymlinkTable,
            6 => Uids,
            7 => Gids,
            8 => Modes,
            9 => Devices,
            10 => SharedFiles,
            11 => NameIndex,
            12 => SymlinkIndex,
            13 => BlockCategories,
            _ => return Err(Error::new(format!("unknown table id {raw}"))),
        })
    }

    /// The number of columns of this table.
    pub(crate) fn field_count(self) -> usize {
        match self {
            TableId::Chunks | TableId::Directories => 3,
            TableId::Inodes => 6,
            TableId::DirEntries => 2,
            _ => 1,
        }
    }
}

/// The layout of one table: its row count and per-column bit widths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub id: TableId,
    pub rows: u64,
    pub widths: Vec<u8>,
}

impl TableLayout {
    /// Total packed bits per row.
    pub(crate) fn row_bits(&self) -> u64 {
        self.widths.iter().map(|&w| u64::from(w)).sum()
    }
}

/// The parsed schema of a metadata section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    pub tables: Vec<TableLayout>,
}

impl Schema {
    /// Parse a schema section payload.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let input = &mut &bytes[..];
        let (&version, rest) = input
            .split_first()
            .ok_or_else(|| Error::new("empty schema"))?;
        *input = rest;
        if version != SCHEMA_VERSION {
            return Err(Error::new(format!("unsupported schema version {version}")));
        }

        let table_count = packing::read_uvarint(input)?;
        let mut tables = Vec::with_capacity(table_count.min(64) as usize);
        for _ in 0..table_count {
            let id = TableId::from_raw(packing::read_uvarint(input)?)?;
            let rows = packing::read_uvarint(input)?;
            let field_count = packing::read_uvarint(input)? as usize;
            if field_count != id.field_count() {
                return Err(Error::new(format!(
                    "table {id:?} declares {field_count} fields, expected {}",
                    id.field_count()
                )));
            }
            let widths = input
                .split_off(..field_count)
                .ok_or_else(|| Error::new("truncated schema field widths"))?
                .to_vec();
            if widths.iter().any(|&w| w > 64) {
                return Err(Error::new(format!("table {id:?} has a field wider than 64 bits")));
            }
            tables.push(TableLayout { id, rows, widths });
        }
        if !input.is_empty() {
            return Err(Error::new("trailing bytes after schema"));
        }
        if !tables.is_sorted_by_key(|t| t.id) {
            return Err(Error::new("schema tables are not in id order"));
        }
        if tables.windows(2).any(|w| w[0].id == w[1].id) {
            return Err(Error::new("duplicate table in schema"));
        }
        Ok(Self { tables })
    }

    /// Serialize this schema to a section payload.
    ///
    /// The encoding is canonical: equal schemas serialize to equal bytes,
    /// and `Schema::parse(schema.to_bytes()) == schema`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![SCHEMA_VERSION];
        packing::write_uvarint(&mut out, self.tables.len() as u64);
        for t in &self.tables {
            packing::write_uvarint(&mut out, t.id as u64);
            packing::write_uvarint(&mut out, t.rows);
            packing::write_uvarint(&mut out, t.widths.len() as u64);
            out.extend_from_slice(&t.widths);
        }
        out
    }

    pub(crate) fn table(&self, id: TableId) -> Option<&TableLayout> {
        self.tables.iter().find(|t| t.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_roundtrip() {
        let schema = Schema {
            tables: vec![
                TableLayout { id: TableId::Chunks, rows: 1000, widths: vec![5, 24, 24] },
                TableLayout { id: TableId::Inodes, rows: 42, widths: vec![3, 1, 1, 0, 20, 20] },
                TableLayout { id: TableId::ChunkTable, rows: 43, widths: vec![10] },
            ],
        };
        let bytes = schema.to_bytes();
        assert_eq!(Schema::parse(&bytes).unwrap(), schema);
    }

    #[test]
    fn schema_rejects_malformed() {
        assert!(Schema::parse(&[]).is_err());
        assert!(Schema::parse(&[99]).is_err());

        // Wrong field count for the Chunks table.
        let mut bad = vec![SCHEMA_VERSION];
        packing::write_uvarint(&mut bad, 1);
        packing::write_uvarint(&mut bad, TableId::Chunks as u64);
        packing::write_uvarint(&mut bad, 7);
        packing::write_uvarint(&mut bad, 1);
        bad.push(8);
        assert!(Schema::parse(&bad).is_err());

        // Out-of-order tables.
        let schema = Schema {
            tables: vec![
                TableLayout { id: TableId::Inodes, rows: 1, widths: vec![1; 6] },
                TableLayout { id: TableId::Chunks, rows: 1, widths: vec![1; 3] },
            ],
        };
        assert!(Schema::parse(&schema.to_bytes()).is_err());
    }
}
