//! Purpose: On-disk record envelope, format versioning, and record key naming.
//! Exports: `RecordKind`, `DatasetKeys`, `encode_record`, `decode_record`, `ByteWriter`, `ByteReader`.
//! Role: Shared contract between `sink` (writes) and `source` (reads).
//! Invariants: Keys are deterministic; sink and source derive them from the same helpers.
//! Invariants: Record bodies start at an 8-byte aligned offset.

use crate::core::error::{Error, ErrorKind, Result};

pub const RECORD_MAGIC: [u8; 4] = *b"CPRC";
pub const FORMAT_VERSION: u32 = 1;
pub const SUPPORTED_FORMAT_VERSIONS: &[u32] = &[FORMAT_VERSION];
pub const RECORD_HEADER_LEN: usize = 32;

const KEY_HEADER: &str = "NTH";
const KEY_FOOTER: &str = "NTF";
const KEY_CLUSTER_FOOTER: &str = "NCF";
const KEY_PAGE_PAYLOAD: &str = "NPP";
const KEY_SEPARATOR: &str = "_";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordKind {
    Header = 1,
    Footer = 2,
    ClusterFooter = 3,
    PagePayload = 4,
}

impl RecordKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordKind::Header),
            2 => Ok(RecordKind::Footer),
            3 => Ok(RecordKind::ClusterFooter),
            4 => Ok(RecordKind::PagePayload),
            _ => Err(Error::new(ErrorKind::Corrupt).with_message("invalid record kind")),
        }
    }
}

/// Key namespace of one dataset inside a record store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatasetKeys {
    prefix: String,
}

impl DatasetKeys {
    pub fn new(dataset: &str) -> Self {
        Self {
            prefix: format!("{dataset}/"),
        }
    }

    pub fn header(&self) -> String {
        format!("{}{KEY_HEADER}", self.prefix)
    }

    pub fn footer(&self) -> String {
        format!("{}{KEY_FOOTER}", self.prefix)
    }

    pub fn cluster_footer(&self, cluster: u64) -> String {
        format!("{}{KEY_CLUSTER_FOOTER}{cluster}", self.prefix)
    }

    pub fn page(&self, cluster: u64, column: u32, page_in_cluster: u64) -> String {
        format!(
            "{}{KEY_PAGE_PAYLOAD}{cluster}{KEY_SEPARATOR}{column}{KEY_SEPARATOR}{page_in_cluster}",
            self.prefix
        )
    }
}

pub fn format_version_error(detected: u32) -> Error {
    let supported = SUPPORTED_FORMAT_VERSIONS
        .iter()
        .map(|version| version.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Error::new(ErrorKind::Corrupt)
        .with_message(format!(
            "unsupported record format version {detected} (supported: {supported})"
        ))
        .with_hint("Rewrite the dataset with a matching colpage version.")
}

/// Wraps `body` in the record envelope.
pub fn encode_record(kind: RecordKind, body: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; RECORD_HEADER_LEN + body.len()];
    buf[0..4].copy_from_slice(&RECORD_MAGIC);
    write_u32(&mut buf, 4, FORMAT_VERSION);
    buf[8] = kind as u8;
    write_u64(&mut buf, 16, body.len() as u64);
    buf[RECORD_HEADER_LEN..].copy_from_slice(body);
    buf
}

/// Validates the envelope and returns the body range within `buf`.
pub fn decode_record(expected: RecordKind, buf: &[u8]) -> Result<std::ops::Range<usize>> {
    if buf.len() < RECORD_HEADER_LEN {
        return Err(Error::new(ErrorKind::Corrupt).with_message("record too small"));
    }
    if buf[0..4] != RECORD_MAGIC {
        return Err(Error::new(ErrorKind::Corrupt).with_message("bad record magic"));
    }
    let version = read_u32(buf, 4);
    if !SUPPORTED_FORMAT_VERSIONS.contains(&version) {
        return Err(format_version_error(version));
    }
    let kind = RecordKind::from_u8(buf[8])?;
    if kind != expected {
        return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
            "unexpected record kind {kind:?} (expected {expected:?})"
        )));
    }
    let body_len = usize::try_from(read_u64(buf, 16))
        .map_err(|_| Error::new(ErrorKind::Corrupt).with_message("record length overflow"))?;
    let end = RECORD_HEADER_LEN
        .checked_add(body_len)
        .ok_or_else(|| Error::new(ErrorKind::Corrupt).with_message("record length overflow"))?;
    if end != buf.len() {
        return Err(Error::new(ErrorKind::Corrupt).with_message("record length mismatch"));
    }
    Ok(RECORD_HEADER_LEN..end)
}

/// Append-only little-endian encoder for record bodies.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn put_bytes(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    pub fn pad_to(&mut self, len: usize) {
        if self.buf.len() < len {
            self.buf.resize(len, 0);
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked decoder; truncation surfaces as `Corrupt`.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::new(ErrorKind::Corrupt).with_message("record body truncated"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(read_u32(self.take(4)?, 0))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(read_u64(self.take(8)?, 0))
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::new(ErrorKind::Corrupt).with_message("invalid bool byte")),
        }
    }

    pub fn get_str(&mut self) -> Result<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("invalid utf-8 string")
                .with_source(err)
        })
    }

    /// Reads a `u32` element count, rejecting counts that cannot fit in the rest of the body.
    pub fn get_count(&mut self, min_item_len: usize) -> Result<usize> {
        let count = self.get_u32()? as usize;
        if count.saturating_mul(min_item_len) > self.remaining() {
            return Err(Error::new(ErrorKind::Corrupt).with_message("element count exceeds record"));
        }
        Ok(count)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.take(len).map(|_| ())
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn finish(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("trailing bytes in record"));
        }
        Ok(())
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_4(buf, offset))
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_8(buf, offset))
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
