use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Generate `n` random vectors of dimension `dims` with uniform f32 values in [-1, 1].
pub fn random_vectors(n: usize, dims: usize) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..n)
        .map(|_| (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect())
        .collect()
}

/// Generate vectors clustered around `n_clusters` random unit centroids.
/// Returns (vectors, centroids).
pub fn clustered_vectors(
    n_clusters: usize,
    n_per_cluster: usize,
    dims: usize,
    noise: f32,
) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
    let mut rng = StdRng::seed_from_u64(123);

    let centroids: Vec<Vec<f32>> = (0..n_clusters)
        .map(|_| {
            let v: Vec<f32> = (0..dims).map(|_| rng.gen_range(-1.0..1.0)).collect();
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            v.iter().map(|x| x / norm).collect()
        })
        .collect();

    let mut vectors = Vec::with_capacity(n_clusters * n_per_cluster);
    for centroid in &centroids {
        for _ in 0..n_per_cluster {
            vectors.push(
                centroid
                    .iter()
                    .map(|&c| c + rng.gen_range(-noise..noise))
                    .collect(),
            );
        }
    }

    (vectors, centroids)
}

/// Little-endian f32 rows, the layout of a `.knnvec` blob.
pub fn encode_f32(vectors: &[Vec<f32>]) -> Bytes {
    let mut buf = BytesMut::new();
    for v in vectors {
        for x in v {
            buf.put_f32_le(*x);
        }
    }
    buf.freeze()
}

/// Signed byte rows for `byte` datasets.
pub fn encode_i8(vectors: &[Vec<i8>]) -> Bytes {
    let mut buf = BytesMut::new();
    for v in vectors {
        for x in v {
            buf.put_i8(*x);
        }
    }
    buf.freeze()
}

/// Little-endian i32 ids, the layout of a `.knndid` blob.
pub fn encode_ids(ids: &[i32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ids.len() * 4);
    for id in ids {
        buf.put_i32_le(*id);
    }
    buf.freeze()
}

/// Ids `offset..offset + n`.
pub fn sequential_ids(n: usize, offset: i32) -> Vec<i32> {
    (0..n as i32).map(|i| i + offset).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_vectors() {
        let vecs = random_vectors(10, 128);
        assert_eq!(vecs.len(), 10);
        assert_eq!(vecs[0].len(), 128);
    }

    #[test]
    fn test_encode_f32_layout() {
        let bytes = encode_f32(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[4..8], &2.0f32.to_le_bytes());
    }
}
