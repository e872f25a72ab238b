//! Purpose: Schema and index metadata persisted between sink and source.
//! Exports: `ColumnType`, `ColumnModel`, `FieldDescriptor`, `DatasetHeader`, `ClusterFooter`,
//! `DatasetFooter`, `page_payload_*`.
//! Role: Typed view of the four record kinds; encode/decode via `format`.
//! Invariants: Decoding never trusts lengths; truncation and garbage map to `Corrupt`.
use std::ops::Range;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::format::{
    self, ByteReader, ByteWriter, RecordKind, RECORD_HEADER_LEN,
};

pub type ColumnId = u32;

/// Length of the page payload preamble (byte length + reserved).
pub const PAGE_PAYLOAD_PREAMBLE_LEN: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ColumnType {
    Index,
    Byte,
    Bit,
    Real64,
    Real32,
    Int64,
    Int32,
    Int16,
}

impl ColumnType {
    pub const ALL: [ColumnType; 8] = [
        ColumnType::Index,
        ColumnType::Byte,
        ColumnType::Bit,
        ColumnType::Real64,
        ColumnType::Real32,
        ColumnType::Int64,
        ColumnType::Int32,
        ColumnType::Int16,
    ];

    /// Stored size of one element in bytes.
    pub const fn element_size(self) -> usize {
        match self {
            ColumnType::Index => 4,
            ColumnType::Byte | ColumnType::Bit => 1,
            ColumnType::Real64 | ColumnType::Int64 => 8,
            ColumnType::Real32 | ColumnType::Int32 => 4,
            ColumnType::Int16 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ColumnType::Index => "index",
            ColumnType::Byte => "byte",
            ColumnType::Bit => "bit",
            ColumnType::Real64 => "real64",
            ColumnType::Real32 => "real32",
            ColumnType::Int64 => "int64",
            ColumnType::Int32 => "int32",
            ColumnType::Int16 => "int16",
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ColumnType::Index => 1,
            ColumnType::Byte => 2,
            ColumnType::Bit => 3,
            ColumnType::Real64 => 4,
            ColumnType::Real32 => 5,
            ColumnType::Int64 => 6,
            ColumnType::Int32 => 7,
            ColumnType::Int16 => 8,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ColumnType::Index),
            2 => Ok(ColumnType::Byte),
            3 => Ok(ColumnType::Bit),
            4 => Ok(ColumnType::Real64),
            5 => Ok(ColumnType::Real32),
            6 => Ok(ColumnType::Int64),
            7 => Ok(ColumnType::Int32),
            8 => Ok(ColumnType::Int16),
            _ => Err(Error::new(ErrorKind::Corrupt).with_message("invalid column type")),
        }
    }
}

/// Name, element type, sort flag, and optional offset column of one column.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ColumnModel {
    name: String,
    column_type: ColumnType,
    is_sorted: bool,
    offset_column: Option<String>,
}

impl ColumnModel {
    pub fn new(name: impl Into<String>, column_type: ColumnType, is_sorted: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            is_sorted,
            offset_column: None,
        }
    }

    pub fn with_offset_column(mut self, offset_column: impl Into<String>) -> Self {
        self.offset_column = Some(offset_column.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn is_sorted(&self) -> bool {
        self.is_sorted
    }

    pub fn offset_column(&self) -> Option<&str> {
        self.offset_column.as_deref()
    }

    pub fn element_size(&self) -> usize {
        self.column_type.element_size()
    }

    pub(crate) fn set_offset_column(&mut self, offset_column: Option<String>) {
        self.offset_column = offset_column;
    }

    /// Same column identity, ignoring the offset link (which only the header records).
    pub fn same_storage(&self, other: &ColumnModel) -> bool {
        self.name == other.name
            && self.column_type == other.column_type
            && self.is_sorted == other.is_sorted
    }

    fn encode(&self, writer: &mut ByteWriter) {
        writer.put_str(&self.name);
        writer.put_u8(self.column_type.to_u8());
        writer.put_bool(self.is_sorted);
        writer.put_str(self.offset_column.as_deref().unwrap_or(""));
    }

    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let name = reader.get_str()?;
        let column_type = ColumnType::from_u8(reader.get_u8()?)?;
        let is_sorted = reader.get_bool()?;
        let offset_column = reader.get_str()?;
        Ok(Self {
            name,
            column_type,
            is_sorted,
            offset_column: (!offset_column.is_empty()).then_some(offset_column),
        })
    }
}

/// One node of the logical field tree; the root fields have no parent.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub type_name: String,
    pub parent: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DatasetHeader {
    pub fields: Vec<FieldDescriptor>,
    pub columns: Vec<ColumnModel>,
}

impl DatasetHeader {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u32(self.fields.len() as u32);
        for field in &self.fields {
            writer.put_str(&field.name);
            writer.put_str(&field.type_name);
            writer.put_str(field.parent.as_deref().unwrap_or(""));
        }
        writer.put_u32(self.columns.len() as u32);
        for column in &self.columns {
            column.encode(&mut writer);
        }
        format::encode_record(RecordKind::Header, &writer.into_inner())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let body = format::decode_record(RecordKind::Header, buf)?;
        let mut reader = ByteReader::new(&buf[body]);
        let n_fields = reader.get_count(12)?;
        let mut fields = Vec::with_capacity(n_fields);
        for _ in 0..n_fields {
            let name = reader.get_str()?;
            let type_name = reader.get_str()?;
            let parent = reader.get_str()?;
            fields.push(FieldDescriptor {
                name,
                type_name,
                parent: (!parent.is_empty()).then_some(parent),
            });
        }
        let n_columns = reader.get_count(10)?;
        let mut columns = Vec::with_capacity(n_columns);
        for _ in 0..n_columns {
            columns.push(ColumnModel::decode(&mut reader)?);
        }
        reader.finish()?;
        Ok(Self { fields, columns })
    }
}

/// Range starts of the pages one column wrote within a single cluster.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PageRanges {
    pub range_starts: Vec<u64>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ClusterFooter {
    pub entry_range_start: u64,
    pub n_entries: u64,
    pub pages_per_column: Vec<PageRanges>,
}

impl ClusterFooter {
    pub fn with_columns(n_columns: usize) -> Self {
        Self {
            entry_range_start: 0,
            n_entries: 0,
            pages_per_column: vec![PageRanges::default(); n_columns],
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u64(self.entry_range_start);
        writer.put_u64(self.n_entries);
        writer.put_u32(self.pages_per_column.len() as u32);
        for pages in &self.pages_per_column {
            writer.put_u32(pages.range_starts.len() as u32);
            for start in &pages.range_starts {
                writer.put_u64(*start);
            }
        }
        format::encode_record(RecordKind::ClusterFooter, &writer.into_inner())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let body = format::decode_record(RecordKind::ClusterFooter, buf)?;
        let mut reader = ByteReader::new(&buf[body]);
        let entry_range_start = reader.get_u64()?;
        let n_entries = reader.get_u64()?;
        let n_columns = reader.get_count(4)?;
        let mut pages_per_column = Vec::with_capacity(n_columns);
        for _ in 0..n_columns {
            let n_pages = reader.get_count(8)?;
            let mut range_starts = Vec::with_capacity(n_pages);
            for _ in 0..n_pages {
                range_starts.push(reader.get_u64()?);
            }
            pages_per_column.push(PageRanges { range_starts });
        }
        reader.finish()?;
        Ok(Self {
            entry_range_start,
            n_entries,
            pages_per_column,
        })
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DatasetFooter {
    pub n_clusters: u64,
    pub n_entries: u64,
    pub n_elements_per_column: Vec<u64>,
}

impl DatasetFooter {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.put_u64(self.n_clusters);
        writer.put_u64(self.n_entries);
        writer.put_u32(self.n_elements_per_column.len() as u32);
        for n in &self.n_elements_per_column {
            writer.put_u64(*n);
        }
        format::encode_record(RecordKind::Footer, &writer.into_inner())
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let body = format::decode_record(RecordKind::Footer, buf)?;
        let mut reader = ByteReader::new(&buf[body]);
        let n_clusters = reader.get_u64()?;
        let n_entries = reader.get_u64()?;
        let n_columns = reader.get_count(8)?;
        let mut n_elements_per_column = Vec::with_capacity(n_columns);
        for _ in 0..n_columns {
            n_elements_per_column.push(reader.get_u64()?);
        }
        reader.finish()?;
        Ok(Self {
            n_clusters,
            n_entries,
            n_elements_per_column,
        })
    }
}

pub fn page_payload_encode(content: &[u8]) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    writer.put_u64(content.len() as u64);
    writer.pad_to(PAGE_PAYLOAD_PREAMBLE_LEN);
    writer.put_bytes(content);
    format::encode_record(RecordKind::PagePayload, &writer.into_inner())
}

/// Returns the byte range of the page content inside the record.
pub fn page_payload_decode(buf: &[u8]) -> Result<Range<usize>> {
    let body = format::decode_record(RecordKind::PagePayload, buf)?;
    let mut reader = ByteReader::new(&buf[body.clone()]);
    let size = usize::try_from(reader.get_u64()?)
        .map_err(|_| Error::new(ErrorKind::Corrupt).with_message("page size overflow"))?;
    reader.skip(PAGE_PAYLOAD_PREAMBLE_LEN - 8)?;
    if size != reader.remaining() {
        return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
            "page payload declares {size} bytes but carries {}",
            reader.remaining()
        )));
    }
    let start = body.start + reader.position();
    debug_assert_eq!(start, RECORD_HEADER_LEN + PAGE_PAYLOAD_PREAMBLE_LEN);
    Ok(start..start + size)
}

#[cfg(test)]
mod tests {
    use super::{
        page_payload_decode, page_payload_encode, ClusterFooter, ColumnModel, ColumnType,
        DatasetFooter, DatasetHeader, FieldDescriptor, PageRanges,
    };
    use crate::core::error::ErrorKind;

    fn sample_header() -> DatasetHeader {
        DatasetHeader {
            fields: vec![
                FieldDescriptor::new("tracks", "std::vector<float>"),
                FieldDescriptor::new("_0", "float").with_parent("tracks"),
            ],
            columns: vec![
                ColumnModel::new("tracks", ColumnType::Index, true),
                ColumnModel::new("_0", ColumnType::Real32, false).with_offset_column("tracks"),
            ],
        }
    }

    #[test]
    fn header_preserves_field_tree_and_offset_links() {
        let header = sample_header();
        let decoded = DatasetHeader::decode(&header.encode()).expect("decode");
        assert_eq!(decoded, header);
        assert!(decoded.fields[0].is_root());
        assert_eq!(decoded.fields[1].parent.as_deref(), Some("tracks"));
        assert_eq!(decoded.columns[1].offset_column(), Some("tracks"));
    }

    #[test]
    fn cluster_footer_keeps_empty_columns() {
        let footer = ClusterFooter {
            entry_range_start: 10,
            n_entries: 5,
            pages_per_column: vec![
                PageRanges { range_starts: vec![0, 4, 9] },
                PageRanges::default(),
            ],
        };
        let decoded = ClusterFooter::decode(&footer.encode()).expect("decode");
        assert_eq!(decoded, footer);
    }

    #[test]
    fn footer_rejects_trailing_bytes() {
        let footer = DatasetFooter {
            n_clusters: 2,
            n_entries: 40,
            n_elements_per_column: vec![40, 7],
        };
        let mut buf = footer.encode();
        assert_eq!(DatasetFooter::decode(&buf).expect("decode"), footer);

        buf.extend_from_slice(&[0u8; 8]);
        let len = (buf.len() - super::RECORD_HEADER_LEN) as u64;
        buf[16..24].copy_from_slice(&len.to_le_bytes());
        let err = DatasetFooter::decode(&buf).expect_err("trailing");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn page_payload_content_is_aligned() {
        let content: Vec<u8> = (0u8..24).collect();
        let buf = page_payload_encode(&content);
        let range = page_payload_decode(&buf).expect("decode");
        assert_eq!(range.start % 8, 0);
        assert_eq!(&buf[range], content.as_slice());
    }

    #[test]
    fn page_payload_rejects_size_mismatch() {
        let mut buf = page_payload_encode(&[1, 2, 3, 4]);
        buf[32..40].copy_from_slice(&5u64.to_le_bytes());
        let err = page_payload_decode(&buf).expect_err("size");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn element_sizes_match_stored_layout() {
        for column_type in ColumnType::ALL {
            assert!(column_type.element_size() > 0, "{}", column_type.name());
        }
        assert_eq!(ColumnType::Index.element_size(), 4);
        assert_eq!(ColumnType::Real64.element_size(), 8);
    }
}
