//! Structural indexing and byte-exact reassembly of tar diff streams.
//!
//! Several backends normalize or reorder their on-disk representation, so a
//! literal re-diff of a layer is not deterministic. Anything relying on
//! diff-content digests for distribution or verification breaks the moment
//! a re-produced diff differs by a single byte. The structural index is the
//! minimal extra state needed to guarantee determinism without storing a
//! second copy of the diff: it records the raw tar framing (headers,
//! padding, trailer) and references file content by name, size, and
//! checksum.
//!
//! # Format
//!
//! The index is gzip-compressed NDJSON with two entry types:
//!
//! ```json
//! {"type":2,"payload":"<base64 raw tar header/padding bytes>"}
//! {"type":1,"name":"etc/hosts","size":123,"crc64":"<base64 checksum>"}
//! {"type":2,"payload":"<base64 trailer>"}
//! ```
//!
//! Type-2 segments are replayed verbatim on reassembly. Type-1 entries name
//! a regular file whose content is read back live from the backend, guarded
//! by a CRC64/GO-ISO checksum. Only regular files with content get type-1
//! entries; directory, link, and extension-header payloads are raw segments.
//!
//! # Pieces
//!
//! - [`TarSplitPacker`] wraps the diff stream during registration and builds
//!   the index from the bytes flowing through it.
//! - [`TarSplitStream`] iterates a persisted index as [`TarSplitItem`]s.
//! - [`AssembledDiff`] is the reassembled stream: segments interleaved with
//!   live file content, byte-identical to what was originally applied.

use std::io::{BufRead, BufReader, Cursor, Read, Write};
use std::sync::Arc;

use base64::prelude::*;
use crc::{CRC_64_GO_ISO, Crc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use crate::driver::Driver;
use crate::error::{Result, StorageError};

/// CRC64/GO-ISO, the checksum guarding reassembled file content.
static CRC64_ISO: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

const BLOCK_SIZE: usize = 512;

const FILE_TYPE: u8 = 1;
const SEGMENT_TYPE: u8 = 2;

/// One line of the NDJSON index.
#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    /// Entry type discriminant: 1 for file, 2 for segment.
    #[serde(rename = "type")]
    type_id: u8,

    /// File name from the tar header (type 1 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    /// File size in bytes (type 1 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<u64>,

    /// CRC64/GO-ISO checksum, base64 big-endian (type 1 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    crc64: Option<String>,

    /// Base64 raw bytes (type 2 only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<String>,
}

impl IndexEntry {
    fn segment(bytes: &[u8]) -> Self {
        IndexEntry {
            type_id: SEGMENT_TYPE,
            name: None,
            size: None,
            crc64: None,
            payload: Some(BASE64_STANDARD.encode(bytes)),
        }
    }

    fn file(name: String, size: u64, crc64: u64) -> Self {
        IndexEntry {
            type_id: FILE_TYPE,
            name: Some(name),
            size: Some(size),
            crc64: Some(BASE64_STANDARD.encode(crc64.to_be_bytes())),
            payload: None,
        }
    }
}

/// Padding needed after `size` content bytes to reach a block boundary.
fn block_padding(size: u64) -> usize {
    let remainder = (size % BLOCK_SIZE as u64) as usize;
    if remainder > 0 { BLOCK_SIZE - remainder } else { 0 }
}

/// Parse a null/space-terminated octal header field.
fn parse_octal(field: &[u8]) -> std::result::Result<u64, String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let s = std::str::from_utf8(&field[..end])
        .map_err(|_| "octal field is not UTF-8".to_string())?
        .trim();
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 8).map_err(|e| format!("bad octal field {s:?}: {e}"))
}

/// Extract the entry name from a 512-byte header block, honoring the ustar
/// prefix field when the magic indicates POSIX format.
fn header_name(block: &[u8]) -> String {
    let extract = |start: usize, end: usize| {
        let bytes = &block[start..end];
        let stop = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..stop]).into_owned()
    };
    let name = extract(0, 100);
    // The prefix field only exists in POSIX ustar headers; GNU headers reuse
    // those bytes for other fields.
    if &block[257..263] == b"ustar\0" {
        let prefix = extract(345, 500);
        if !prefix.is_empty() {
            return format!("{prefix}/{name}");
        }
    }
    name
}

enum PackState {
    /// Accumulating a 512-byte header block.
    Header,
    /// Consuming regular-file content: checksummed, not stored.
    FileContent {
        name: String,
        size: u64,
        remaining: u64,
        digest: crc::Digest<'static, u64>,
    },
    /// Consuming zero padding after file content: stored raw.
    Padding { remaining: usize, buf: Vec<u8> },
    /// Consuming a non-file payload (long names, extension headers) plus its
    /// padding: stored raw.
    MetaContent {
        typeflag: u8,
        payload_len: usize,
        remaining: usize,
        buf: Vec<u8>,
    },
}

/// A reader adapter that builds a structural index from the tar stream
/// flowing through it.
///
/// Wraps the diff stream during registration: the backend reads the diff
/// through the packer, the packer parses the block structure in flight, and
/// [`finish`] yields the framed, compressed index once the stream has been
/// drained to the end.
///
/// [`finish`]: TarSplitPacker::finish
pub struct TarSplitPacker<R> {
    inner: R,
    state: PackState,
    block: Vec<u8>,
    pending_zeros: usize,
    long_name: Option<String>,
    entries: Vec<IndexEntry>,
    failed: Option<String>,
}

impl<R: Read> TarSplitPacker<R> {
    /// Wrap a diff stream, indexing everything subsequently read from it.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: PackState::Header,
            block: Vec::with_capacity(BLOCK_SIZE),
            pending_zeros: 0,
            long_name: None,
            entries: Vec::new(),
            failed: None,
        }
    }

    fn observe(&mut self, mut data: &[u8]) {
        if self.failed.is_some() {
            return;
        }
        while !data.is_empty() {
            match self.step(data) {
                Ok(consumed) => data = &data[consumed..],
                Err(msg) => {
                    self.failed = Some(msg);
                    return;
                }
            }
        }
    }

    fn step(&mut self, data: &[u8]) -> std::result::Result<usize, String> {
        match std::mem::replace(&mut self.state, PackState::Header) {
            PackState::Header => {
                let need = BLOCK_SIZE - self.block.len();
                let take = need.min(data.len());
                self.block.extend_from_slice(&data[..take]);
                if self.block.len() == BLOCK_SIZE {
                    let block = std::mem::take(&mut self.block);
                    self.process_header_block(&block)?;
                }
                Ok(take)
            }
            PackState::FileContent {
                name,
                size,
                mut remaining,
                mut digest,
            } => {
                let take = remaining.min(data.len() as u64) as usize;
                digest.update(&data[..take]);
                remaining -= take as u64;
                if remaining == 0 {
                    self.entries
                        .push(IndexEntry::file(name, size, digest.finalize()));
                    let padding = block_padding(size);
                    if padding > 0 {
                        self.state = PackState::Padding {
                            remaining: padding,
                            buf: Vec::new(),
                        };
                    }
                } else {
                    self.state = PackState::FileContent {
                        name,
                        size,
                        remaining,
                        digest,
                    };
                }
                Ok(take)
            }
            PackState::Padding {
                mut remaining,
                mut buf,
            } => {
                let take = remaining.min(data.len());
                buf.extend_from_slice(&data[..take]);
                remaining -= take;
                if remaining == 0 {
                    self.entries.push(IndexEntry::segment(&buf));
                } else {
                    self.state = PackState::Padding { remaining, buf };
                }
                Ok(take)
            }
            PackState::MetaContent {
                typeflag,
                payload_len,
                mut remaining,
                mut buf,
            } => {
                let take = remaining.min(data.len());
                buf.extend_from_slice(&data[..take]);
                remaining -= take;
                if remaining == 0 {
                    if typeflag == b'L' {
                        let payload = &buf[..payload_len];
                        let stop = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
                        self.long_name = Some(String::from_utf8_lossy(&payload[..stop]).into_owned());
                    }
                    self.entries.push(IndexEntry::segment(&buf));
                } else {
                    self.state = PackState::MetaContent {
                        typeflag,
                        payload_len,
                        remaining,
                        buf,
                    };
                }
                Ok(take)
            }
        }
    }

    fn process_header_block(&mut self, block: &[u8]) -> std::result::Result<(), String> {
        if block.iter().all(|&b| b == 0) {
            self.pending_zeros += BLOCK_SIZE;
            return Ok(());
        }
        self.flush_pending_zeros();

        let size = parse_octal(&block[124..136])?;
        let typeflag = block[156];
        self.entries.push(IndexEntry::segment(block));

        if typeflag == b'0' || typeflag == 0 {
            let long_name = self.long_name.take();
            if size > 0 {
                let name = long_name.unwrap_or_else(|| header_name(block));
                self.state = PackState::FileContent {
                    name,
                    size,
                    remaining: size,
                    digest: CRC64_ISO.digest(),
                };
            }
        } else if size > 0 {
            self.state = PackState::MetaContent {
                typeflag,
                payload_len: size as usize,
                remaining: size as usize + block_padding(size),
                buf: Vec::new(),
            };
        }
        Ok(())
    }

    fn flush_pending_zeros(&mut self) {
        if self.pending_zeros > 0 {
            self.entries
                .push(IndexEntry::segment(&vec![0u8; self.pending_zeros]));
            self.pending_zeros = 0;
        }
    }

    /// Finalize the index, returning the wrapped reader and the framed,
    /// gzip-compressed NDJSON bytes.
    ///
    /// The stream must have been drained to the end; a stream ending in the
    /// middle of an entry is rejected.
    pub fn finish(mut self) -> Result<(R, Vec<u8>)> {
        if let Some(msg) = self.failed.take() {
            return Err(StorageError::TarSplit(msg));
        }
        if !self.block.is_empty() || !matches!(self.state, PackState::Header) {
            return Err(StorageError::TarSplit(
                "diff stream ends mid-entry".to_string(),
            ));
        }
        self.flush_pending_zeros();

        let mut ndjson = Vec::new();
        for entry in &self.entries {
            let line = serde_json::to_string(entry)
                .map_err(|e| StorageError::TarSplit(format!("failed to encode index: {e}")))?;
            ndjson.extend_from_slice(line.as_bytes());
            ndjson.push(b'\n');
        }

        let mut compressed = Vec::new();
        {
            let mut encoder = GzEncoder::new(&mut compressed, Compression::fast());
            encoder.write_all(&ndjson)?;
            encoder.finish()?;
        }
        Ok((self.inner, compressed))
    }
}

impl<R: Read> Read for TarSplitPacker<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.observe(&buf[..n]);
        }
        Ok(n)
    }
}

/// Item yielded while iterating a persisted structural index.
#[derive(Debug)]
pub enum TarSplitItem {
    /// Raw bytes (header, padding, trailer) to replay verbatim.
    Segment(Vec<u8>),
    /// A regular file whose content is read back from the backend.
    File {
        /// Name from the tar header, backend-relative once `./` is stripped.
        name: String,
        /// Content length in bytes.
        size: u64,
        /// CRC64/GO-ISO checksum of the content, if recorded.
        crc64: Option<u64>,
    },
}

/// Pull-based reader over a persisted structural index.
pub struct TarSplitStream {
    reader: BufReader<GzDecoder<Box<dyn Read + Send>>>,
}

impl TarSplitStream {
    /// Open an index from its persisted (compressed) form.
    pub fn new(index: Box<dyn Read + Send>) -> Self {
        Self {
            reader: BufReader::new(GzDecoder::new(index)),
        }
    }

    /// Read the next item, or `None` at end of index.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<TarSplitItem>> {
        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .map_err(|e| StorageError::TarSplit(format!("failed to read index line: {e}")))?;
            if n == 0 {
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }
            let entry: IndexEntry = serde_json::from_str(&line)
                .map_err(|e| StorageError::TarSplit(format!("failed to parse index entry: {e}")))?;
            match entry.type_id {
                SEGMENT_TYPE => {
                    if let Some(payload) = entry.payload {
                        let bytes = BASE64_STANDARD.decode(&payload).map_err(|e| {
                            StorageError::TarSplit(format!("bad segment payload: {e}"))
                        })?;
                        if !bytes.is_empty() {
                            return Ok(Some(TarSplitItem::Segment(bytes)));
                        }
                    }
                }
                FILE_TYPE => {
                    let size = entry.size.unwrap_or(0);
                    if size == 0 {
                        continue;
                    }
                    let name = entry.name.ok_or_else(|| {
                        StorageError::TarSplit("file entry missing name".to_string())
                    })?;
                    let crc64 = match entry.crc64 {
                        Some(encoded) => {
                            let bytes = BASE64_STANDARD.decode(&encoded).map_err(|e| {
                                StorageError::TarSplit(format!("bad checksum encoding: {e}"))
                            })?;
                            let bytes: [u8; 8] = bytes.try_into().map_err(|_| {
                                StorageError::TarSplit("checksum is not 8 bytes".to_string())
                            })?;
                            Some(u64::from_be_bytes(bytes))
                        }
                        None => None,
                    };
                    return Ok(Some(TarSplitItem::File { name, size, crc64 }));
                }
                other => {
                    return Err(StorageError::TarSplit(format!(
                        "invalid index entry type: {other}"
                    )));
                }
            }
        }
    }
}

enum Pending {
    Idle,
    Bytes(Cursor<Vec<u8>>),
    File {
        reader: Box<dyn Read + Send>,
        remaining: u64,
    },
}

/// A diff stream reassembled from a structural index plus live backend
/// content, byte-identical to the stream originally applied.
pub struct AssembledDiff {
    items: TarSplitStream,
    driver: Arc<dyn Driver>,
    cache_id: String,
    pending: Pending,
}

impl AssembledDiff {
    /// Reassemble the diff of the layer whose backend state is `cache_id`
    /// from its persisted index.
    pub fn new(index: Box<dyn Read + Send>, driver: Arc<dyn Driver>, cache_id: String) -> Self {
        Self {
            items: TarSplitStream::new(index),
            driver,
            cache_id,
            pending: Pending::Idle,
        }
    }

    /// Verify a file's size and checksum with a first pass, then reopen it
    /// for streaming. Content that no longer matches the index fails the
    /// diff instead of silently producing altered bytes.
    fn open_verified(
        &self,
        name: &str,
        size: u64,
        expected: Option<u64>,
    ) -> std::io::Result<Box<dyn Read + Send>> {
        let path = name.strip_prefix("./").unwrap_or(name);
        if let Some(expected) = expected {
            let mut reader = self
                .driver
                .file_reader(&self.cache_id, path)
                .map_err(std::io::Error::other)?;
            let mut digest = CRC64_ISO.digest();
            let mut buf = [0u8; 8192];
            let mut total = 0u64;
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                digest.update(&buf[..n]);
                total += n as u64;
            }
            if total != size {
                return Err(std::io::Error::other(format!(
                    "file {path} size changed: expected {size}, found {total}"
                )));
            }
            let found = digest.finalize();
            if found != expected {
                return Err(std::io::Error::other(format!(
                    "file {path} checksum mismatch: expected {expected:016x}, found {found:016x}"
                )));
            }
        }
        self.driver
            .file_reader(&self.cache_id, path)
            .map_err(std::io::Error::other)
    }
}

impl Read for AssembledDiff {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match &mut self.pending {
                Pending::Bytes(cursor) => {
                    let n = cursor.read(buf)?;
                    if n > 0 {
                        return Ok(n);
                    }
                    self.pending = Pending::Idle;
                }
                Pending::File { reader, remaining } => {
                    if *remaining == 0 {
                        self.pending = Pending::Idle;
                        continue;
                    }
                    let cap = (*remaining).min(buf.len() as u64) as usize;
                    let n = reader.read(&mut buf[..cap])?;
                    if n == 0 {
                        return Err(std::io::Error::other(
                            "layer file truncated during diff reassembly",
                        ));
                    }
                    *remaining -= n as u64;
                    return Ok(n);
                }
                Pending::Idle => match self.items.next().map_err(std::io::Error::other)? {
                    None => return Ok(0),
                    Some(TarSplitItem::Segment(bytes)) => {
                        self.pending = Pending::Bytes(Cursor::new(bytes));
                    }
                    Some(TarSplitItem::File { name, size, crc64 }) => {
                        let reader = self.open_verified(&name, size, crc64)?;
                        self.pending = Pending::File {
                            reader,
                            remaining: size,
                        };
                    }
                },
            }
        }
    }
}
