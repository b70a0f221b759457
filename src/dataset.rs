//! Staging of downloaded vector and document-id blobs.
//!
//! Blobs are streamed into [`BlobSink`]s. [`StagingBuffer`] keeps bytes as
//! they arrive; [`Fp16NarrowingSink`] narrows little-endian f32 values to f16
//! on the fly so a float16 dataset never holds its f32 form in memory.
//! [`VectorsDataset`] is a view over the staged buffers.

use bytes::{BufMut, Bytes, BytesMut};
use half::f16;

use crate::error::{BuilderError, Result};
use crate::types::DataType;

/// Size of one staged document id (little-endian i32).
pub const DOC_ID_SIZE: usize = 4;

/// Upper bound on what a sink allocates up front. Larger blobs grow as
/// chunks arrive.
pub const MAX_RESERVE: usize = 256 << 20;

/// Destination of a streamed blob.
pub trait BlobSink: Send {
    /// Stored size of the blob, announced before the first chunk.
    fn reserve(&mut self, _len: u64) {}

    /// Append one chunk of the blob.
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Called once after the last chunk. Fails if the blob ended mid-element.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    /// Bytes accepted so far, as they arrived from the store.
    fn bytes_received(&self) -> u64;
}

fn check_limit(limit: Option<usize>, received: u64, chunk: usize) -> Result<()> {
    match limit {
        Some(limit) if received.saturating_add(chunk as u64) > limit as u64 => Err(BuilderError::Dataset(
            format!("blob is larger than the expected {limit} bytes"),
        )),
        _ => Ok(()),
    }
}

fn reserve_len(announced: u64, limit: Option<usize>) -> usize {
    let announced = usize::try_from(announced).unwrap_or(usize::MAX);
    announced.min(limit.unwrap_or(usize::MAX)).min(MAX_RESERVE)
}

/// Collects a blob verbatim.
#[derive(Debug, Default)]
pub struct StagingBuffer {
    buf: BytesMut,
    received: u64,
    limit: Option<usize>,
}

impl StagingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A buffer that refuses blobs longer than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

impl BlobSink for StagingBuffer {
    fn reserve(&mut self, len: u64) {
        let len = reserve_len(len, self.limit);
        self.buf.reserve(len.saturating_sub(self.buf.len()));
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        check_limit(self.limit, self.received, chunk.len())?;
        self.buf.extend_from_slice(chunk);
        self.received += chunk.len() as u64;
        Ok(())
    }

    fn bytes_received(&self) -> u64 {
        self.received
    }
}

/// Narrows a stream of little-endian f32 values to little-endian f16.
#[derive(Debug, Default)]
pub struct Fp16NarrowingSink {
    buf: BytesMut,
    // Bytes of an f32 split across two chunks.
    carry: [u8; 4],
    carry_len: usize,
    received: u64,
    // In source (f32) bytes.
    limit: Option<usize>,
}

impl Fp16NarrowingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that refuses f32 blobs longer than `source_limit` bytes.
    pub fn with_source_limit(source_limit: usize) -> Self {
        Self {
            limit: Some(source_limit),
            ..Self::default()
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    fn push(&mut self, raw: [u8; 4]) {
        let value = f16::from_f32(f32::from_le_bytes(raw));
        self.buf.put_u16_le(value.to_bits());
    }
}

impl BlobSink for Fp16NarrowingSink {
    fn reserve(&mut self, len: u64) {
        let staged = reserve_len(len, self.limit) / 2;
        self.buf.reserve(staged.saturating_sub(self.buf.len()));
    }

    fn write_chunk(&mut self, mut chunk: &[u8]) -> Result<()> {
        check_limit(self.limit, self.received, chunk.len())?;
        self.received += chunk.len() as u64;

        if self.carry_len > 0 {
            let take = (4 - self.carry_len).min(chunk.len());
            self.carry[self.carry_len..self.carry_len + take].copy_from_slice(&chunk[..take]);
            self.carry_len += take;
            chunk = &chunk[take..];
            if self.carry_len < 4 {
                return Ok(());
            }
            let raw = self.carry;
            self.push(raw);
            self.carry_len = 0;
        }

        let mut values = chunk.chunks_exact(4);
        for raw in values.by_ref() {
            self.push([raw[0], raw[1], raw[2], raw[3]]);
        }
        let rest = values.remainder();
        self.carry[..rest.len()].copy_from_slice(rest);
        self.carry_len = rest.len();
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.carry_len != 0 {
            return Err(BuilderError::Dataset(format!(
                "f32 vector blob ended with {} dangling bytes",
                self.carry_len
            )));
        }
        Ok(())
    }

    fn bytes_received(&self) -> u64 {
        self.received
    }
}

/// Sink matching the staged representation of `data_type`.
pub enum VectorSink {
    Raw(StagingBuffer),
    Narrowing(Fp16NarrowingSink),
}

impl VectorSink {
    /// `source_len` is the expected size of the remote blob. Longer blobs
    /// are refused; nothing is allocated until the store announces a size.
    pub fn for_data_type(data_type: DataType, source_len: usize) -> Self {
        match data_type {
            DataType::Float16 => {
                VectorSink::Narrowing(Fp16NarrowingSink::with_source_limit(source_len))
            }
            _ => VectorSink::Raw(StagingBuffer::with_limit(source_len)),
        }
    }

    pub fn freeze(self) -> Bytes {
        match self {
            VectorSink::Raw(buf) => buf.freeze(),
            VectorSink::Narrowing(sink) => sink.freeze(),
        }
    }
}

impl BlobSink for VectorSink {
    fn reserve(&mut self, len: u64) {
        match self {
            VectorSink::Raw(buf) => buf.reserve(len),
            VectorSink::Narrowing(sink) => sink.reserve(len),
        }
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        match self {
            VectorSink::Raw(buf) => buf.write_chunk(chunk),
            VectorSink::Narrowing(sink) => sink.write_chunk(chunk),
        }
    }

    fn finish(&mut self) -> Result<()> {
        match self {
            VectorSink::Raw(buf) => buf.finish(),
            VectorSink::Narrowing(sink) => sink.finish(),
        }
    }

    fn bytes_received(&self) -> u64 {
        match self {
            VectorSink::Raw(buf) => buf.bytes_received(),
            VectorSink::Narrowing(sink) => sink.bytes_received(),
        }
    }
}

/// View over the staged vectors and document ids of one build.
///
/// Owns the staged buffers until [`VectorsDataset::release`] is called.
/// After release every accessor fails and a second release does nothing.
#[derive(Debug)]
pub struct VectorsDataset {
    vectors: Option<Bytes>,
    doc_ids: Option<Bytes>,
    dimension: usize,
    doc_count: usize,
    data_type: DataType,
}

impl VectorsDataset {
    /// Wrap staged buffers, checking their sizes against the declared shape.
    pub fn parse(
        vectors: Bytes,
        doc_ids: Bytes,
        dimension: usize,
        doc_count: usize,
        data_type: DataType,
    ) -> Result<Self> {
        let overflow = || BuilderError::Dataset(format!("{doc_count} x {dimension} is too large"));
        let expected_ids = doc_count.checked_mul(DOC_ID_SIZE).ok_or_else(overflow)?;
        if doc_ids.len() != expected_ids {
            return Err(BuilderError::Dataset(format!(
                "doc id blob holds {} bytes, expected {expected_ids} for {doc_count} documents",
                doc_ids.len()
            )));
        }

        let expected_vectors = doc_count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(data_type.staged_element_size()))
            .ok_or_else(overflow)?;
        if vectors.len() != expected_vectors {
            return Err(BuilderError::Dataset(format!(
                "vector blob holds {} bytes, expected {expected_vectors} for {doc_count} x {dimension} {data_type} vectors",
                vectors.len()
            )));
        }

        Ok(Self {
            vectors: Some(vectors),
            doc_ids: Some(doc_ids),
            dimension,
            doc_count,
            data_type,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn doc_count(&self) -> usize {
        self.doc_count
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn is_released(&self) -> bool {
        self.vectors.is_none() && self.doc_ids.is_none()
    }

    fn released_error() -> BuilderError {
        BuilderError::Dataset("dataset buffers have been released".to_string())
    }

    /// Staged vector bytes, row-major.
    pub fn vector_bytes(&self) -> Result<&[u8]> {
        self.vectors.as_deref().ok_or_else(Self::released_error)
    }

    /// Shared handle to the staged vector buffer. The buffer is freed when
    /// the dataset is released and every handle is dropped.
    pub fn shared_vectors(&self) -> Result<Bytes> {
        self.vectors.clone().ok_or_else(Self::released_error)
    }

    /// Staged document-id bytes.
    pub fn doc_id_bytes(&self) -> Result<&[u8]> {
        self.doc_ids.as_deref().ok_or_else(Self::released_error)
    }

    /// Document ids in staging order.
    pub fn doc_ids(&self) -> Result<impl Iterator<Item = i64> + '_> {
        Ok(self
            .doc_id_bytes()?
            .chunks_exact(DOC_ID_SIZE)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64))
    }

    /// Row `row` widened to f32, whatever the staged element type.
    pub fn row_f32(&self, row: usize) -> Result<Vec<f32>> {
        if row >= self.doc_count {
            return Err(BuilderError::Dataset(format!(
                "row {row} out of range for {} documents",
                self.doc_count
            )));
        }
        let size = self.data_type.staged_element_size();
        let stride = self.dimension * size;
        let bytes = &self.vector_bytes()?[row * stride..(row + 1) * stride];

        let values = match self.data_type {
            DataType::Float => bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            DataType::Float16 => bytes
                .chunks_exact(2)
                .map(|b| f16::from_bits(u16::from_le_bytes([b[0], b[1]])).to_f32())
                .collect(),
            DataType::Byte => bytes.iter().map(|&b| b as i8 as f32).collect(),
            DataType::Binary => bytes.iter().map(|&b| b as f32).collect(),
        };
        Ok(values)
    }

    /// Drop the staged buffers. Idempotent.
    pub fn release(&mut self) {
        self.vectors = None;
        self.doc_ids = None;
    }
}
