//! Chunk partitioning.
//!
//! Splits the ordered input into contiguous chunks. Chunk size shrinks as the
//! dataset grows so a single dispatch payload stays bounded.

use crate::model::Chunk;

/// Pick a chunk size for a dataset of `total_records`.
pub fn adaptive_chunk_size(total_records: usize) -> usize {
    match total_records {
        0..=5_000 => 1_000,
        5_001..=20_000 => 500,
        20_001..=50_000 => 250,
        _ => 100,
    }
}

/// Split `items` into `ceil(N / chunk_size)` contiguous chunks.
///
/// Order is preserved within and across chunks; only the last chunk may be
/// shorter. An empty input yields no chunks. A `chunk_size` of zero is
/// treated as one.
pub fn partition<T: Clone>(items: &[T], chunk_size: usize) -> Vec<Chunk<T>> {
    let chunk_size = chunk_size.max(1);
    let total = items.len().div_ceil(chunk_size);

    items
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, records)| Chunk {
            index,
            total,
            records: records.to_vec(),
        })
        .collect()
}

/// Check that `chunks` cover exactly `expected` records.
pub fn verify_coverage<T>(chunks: &[Chunk<T>], expected: usize) -> Result<(), String> {
    let covered: usize = chunks.iter().map(|c| c.len()).sum();
    if covered != expected {
        return Err(format!(
            "chunks cover {} records, expected {}",
            covered, expected
        ));
    }
    if let Some(empty) = chunks.iter().find(|c| c.is_empty()) {
        return Err(format!("chunk {} is empty", empty.index));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_sizes_and_order() {
        for n in [0usize, 1, 2, 99, 100, 101, 1_000, 10_007] {
            for c in [1usize, 3, 100, 1_000] {
                let items: Vec<usize> = (0..n).collect();
                let chunks = partition(&items, c);

                assert_eq!(chunks.len(), n.div_ceil(c), "n={} c={}", n, c);
                assert!(verify_coverage(&chunks, n).is_ok());

                let flattened: Vec<usize> =
                    chunks.iter().flat_map(|ch| ch.records.iter().copied()).collect();
                assert_eq!(flattened, items);

                for (i, chunk) in chunks.iter().enumerate() {
                    assert_eq!(chunk.index, i);
                    assert_eq!(chunk.total, chunks.len());
                    assert!(chunk.len() <= c);
                }
            }
        }
    }

    #[test]
    fn test_partition_empty() {
        let chunks = partition::<u32>(&[], 100);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_partition_zero_size_is_one() {
        let chunks = partition(&[1, 2, 3], 0);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_adaptive_chunk_size_shrinks() {
        assert_eq!(adaptive_chunk_size(0), 1_000);
        assert_eq!(adaptive_chunk_size(5_000), 1_000);
        assert_eq!(adaptive_chunk_size(10_000), 500);
        assert_eq!(adaptive_chunk_size(40_000), 250);
        assert_eq!(adaptive_chunk_size(200_000), 100);
    }

    #[test]
    fn test_verify_coverage_detects_loss() {
        let mut chunks = partition(&[1, 2, 3, 4], 2);
        chunks[1].records.pop();
        assert!(verify_coverage(&chunks, 4).is_err());
    }
}
