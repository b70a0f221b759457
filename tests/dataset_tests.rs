mod common;

use assert_approx_eq::assert_approx_eq;
use bytes::Bytes;
use common::vectors::{encode_f32, encode_i8, encode_ids, random_vectors, sequential_ids};

use remote_index_builder::dataset::{
    BlobSink, Fp16NarrowingSink, StagingBuffer, VectorSink, VectorsDataset, MAX_RESERVE,
};
use remote_index_builder::error::BuilderError;
use remote_index_builder::types::DataType;

fn float_dataset(n: usize, dims: usize) -> (Vec<Vec<f32>>, VectorsDataset) {
    let vectors = random_vectors(n, dims);
    let dataset = VectorsDataset::parse(
        encode_f32(&vectors),
        encode_ids(&sequential_ids(n, 100)),
        dims,
        n,
        DataType::Float,
    )
    .unwrap();
    (vectors, dataset)
}

// ─── Sinks ───

#[test]
fn test_staging_buffer_concatenates_chunks() {
    let mut buf = StagingBuffer::new();
    buf.write_chunk(b"abc").unwrap();
    buf.write_chunk(b"").unwrap();
    buf.write_chunk(b"de").unwrap();
    buf.finish().unwrap();

    assert_eq!(buf.bytes_received(), 5);
    assert_eq!(buf.len(), 5);
    assert_eq!(buf.freeze(), Bytes::from_static(b"abcde"));
}

#[test]
fn test_narrowing_handles_values_split_across_chunks() {
    let values = [1.5f32, -2.25, 0.0, 65504.0, 1e-3];
    let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();

    // Chunk boundaries that cut through every position of an f32.
    let mut sink = Fp16NarrowingSink::new();
    for chunk in [&raw[..1], &raw[1..6], &raw[6..7], &raw[7..15], &raw[15..]] {
        sink.write_chunk(chunk).unwrap();
    }
    sink.finish().unwrap();
    assert_eq!(sink.bytes_received(), 20);

    let staged = sink.freeze();
    assert_eq!(staged.len(), 10);
    for (i, expected) in values.iter().enumerate() {
        let bits = u16::from_le_bytes([staged[2 * i], staged[2 * i + 1]]);
        assert_approx_eq!(half::f16::from_bits(bits).to_f32(), *expected, 1e-3);
    }
}

#[test]
fn test_narrowing_rejects_dangling_bytes() {
    let mut sink = Fp16NarrowingSink::new();
    sink.write_chunk(&[0u8; 6]).unwrap();
    match sink.finish() {
        Err(BuilderError::Dataset(msg)) => assert!(msg.contains("2 dangling bytes"), "{msg}"),
        other => panic!("expected dataset error, got {other:?}"),
    }
}

#[test]
fn test_vector_sink_picks_representation() {
    let vectors = random_vectors(2, 3);
    let raw = encode_f32(&vectors);

    let mut sink = VectorSink::for_data_type(DataType::Float16, raw.len());
    assert!(matches!(sink, VectorSink::Narrowing(_)));
    sink.write_chunk(&raw).unwrap();
    assert_eq!(sink.freeze().len(), raw.len() / 2);

    let mut sink = VectorSink::for_data_type(DataType::Byte, 6);
    assert!(matches!(sink, VectorSink::Raw(_)));
    sink.write_chunk(&[1, 2, 3, 4, 5, 6]).unwrap();
    assert_eq!(sink.freeze().len(), 6);
}

#[test]
fn test_sinks_refuse_bytes_past_limit() {
    let mut buf = StagingBuffer::with_limit(8);
    buf.write_chunk(&[0u8; 5]).unwrap();
    buf.write_chunk(&[0u8; 3]).unwrap();
    match buf.write_chunk(&[0u8; 1]) {
        Err(BuilderError::Dataset(msg)) => {
            assert!(msg.contains("larger than the expected 8 bytes"), "{msg}")
        }
        other => panic!("expected dataset error, got {other:?}"),
    }
    assert_eq!(buf.len(), 8);

    let mut sink = Fp16NarrowingSink::with_source_limit(8);
    sink.write_chunk(&[0u8; 8]).unwrap();
    assert!(matches!(sink.write_chunk(&[0u8; 4]), Err(BuilderError::Dataset(_))));
    assert_eq!(sink.freeze().len(), 4);
}

#[test]
fn test_reserve_is_capped_by_limit() {
    let mut buf = StagingBuffer::with_limit(64);
    buf.reserve(u64::MAX);
    assert!(buf.capacity() >= 64);
    assert!(buf.capacity() < MAX_RESERVE);

    let mut sink = Fp16NarrowingSink::with_source_limit(64);
    sink.reserve(u64::MAX);
    assert!(sink.capacity() >= 32);
    assert!(sink.capacity() < MAX_RESERVE);

    // The announced size wins when it is below the limit.
    let mut sink = VectorSink::for_data_type(DataType::Float, 1 << 40);
    sink.reserve(12);
    sink.write_chunk(&[0u8; 12]).unwrap();
    assert_eq!(sink.freeze().len(), 12);
}

// ─── Parsing ───

#[test]
fn test_parse_exposes_rows_and_ids() {
    let (vectors, dataset) = float_dataset(10, 4);

    assert_eq!(dataset.doc_count(), 10);
    assert_eq!(dataset.dimension(), 4);
    assert_eq!(dataset.row_f32(3).unwrap(), vectors[3]);
    let ids: Vec<i64> = dataset.doc_ids().unwrap().collect();
    assert_eq!(ids, (100..110).collect::<Vec<i64>>());
}

#[test]
fn test_parse_rejects_wrong_id_count() {
    let vectors = random_vectors(4, 2);
    let err = VectorsDataset::parse(
        encode_f32(&vectors),
        encode_ids(&sequential_ids(3, 0)),
        2,
        4,
        DataType::Float,
    )
    .unwrap_err();
    assert!(err.to_string().contains("doc id blob holds 12 bytes"), "{err}");
}

#[test]
fn test_parse_rejects_wrong_vector_size() {
    let vectors = random_vectors(4, 2);
    let err = VectorsDataset::parse(
        encode_f32(&vectors),
        encode_ids(&sequential_ids(4, 0)),
        3,
        4,
        DataType::Float,
    )
    .unwrap_err();
    assert!(matches!(err, BuilderError::Dataset(_)));
    assert!(err.to_string().contains("expected 48"), "{err}");
}

#[test]
fn test_parse_rejects_shape_that_overflows() {
    let err = VectorsDataset::parse(Bytes::new(), Bytes::new(), 1 << 62, 1 << 62, DataType::Float)
        .unwrap_err();
    assert!(matches!(err, BuilderError::Dataset(_)));
}

#[test]
fn test_byte_rows_are_signed() {
    let rows = vec![vec![-1i8, 127], vec![-128, 0]];
    let dataset = VectorsDataset::parse(
        encode_i8(&rows),
        encode_ids(&[7, -7]),
        2,
        2,
        DataType::Byte,
    )
    .unwrap();

    assert_eq!(dataset.row_f32(0).unwrap(), vec![-1.0, 127.0]);
    assert_eq!(dataset.row_f32(1).unwrap(), vec![-128.0, 0.0]);
    assert_eq!(dataset.doc_ids().unwrap().collect::<Vec<_>>(), vec![7, -7]);
}

#[test]
fn test_row_out_of_range() {
    let (_, dataset) = float_dataset(2, 2);
    assert!(dataset.row_f32(2).is_err());
}

// ─── Release ───

#[test]
fn test_release_is_idempotent_and_blocks_access() {
    let (_, mut dataset) = float_dataset(3, 2);
    assert!(!dataset.is_released());

    dataset.release();
    dataset.release();

    assert!(dataset.is_released());
    assert!(dataset.vector_bytes().is_err());
    assert!(dataset.doc_ids().is_err());
    assert!(dataset.row_f32(0).is_err());
    // Shape survives release.
    assert_eq!(dataset.doc_count(), 3);
}
