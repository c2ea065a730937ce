use rand::Rng;

use crate::{FinetuneError, Result};

/// Finds the first index in `(lo, hi]` where a monotonic predicate flips to true.
///
/// Returns `None` when `predicate(lo)` already holds or `predicate(hi)` does not.
pub fn binary_search<F>(predicate: F, lo: usize, hi: usize) -> Option<usize>
where
    F: Fn(usize) -> bool,
{
    if predicate(lo) || !predicate(hi) {
        return None;
    }
    let (mut lo, mut hi) = (lo, hi);
    while hi > lo + 1 {
        let mid = lo + (hi - lo) / 2;
        if predicate(mid) {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    Some(hi)
}

/// A window of tokens drawn from a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample<'a> {
    pub chunk: usize,
    /// Start position inside the chunk.
    pub offset: usize,
    pub tokens: &'a [u32],
}

/// Samples fixed-length windows from variable-length chunks.
///
/// Start positions are uniform over the concatenated corpus, restricted to
/// windows that do not cross a chunk boundary.
#[derive(Debug, Clone)]
pub struct ChunkSampler {
    chunks: Vec<Vec<u32>>,
    offsets: Vec<usize>,
}

impl ChunkSampler {
    pub fn new(chunks: Vec<Vec<u32>>) -> Result<Self> {
        if chunks.is_empty() {
            return Err(FinetuneError::initialization(
                "sampler requires at least one chunk",
            ));
        }
        if let Some(index) = chunks.iter().position(|chunk| chunk.is_empty()) {
            return Err(FinetuneError::initialization(format!(
                "chunk {index} is empty"
            )));
        }

        let mut offsets = Vec::with_capacity(chunks.len() + 1);
        offsets.push(0);
        for chunk in &chunks {
            let last = offsets[offsets.len() - 1];
            offsets.push(last + chunk.len());
        }

        Ok(Self { chunks, offsets })
    }

    pub fn total_size(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }

    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Prefix sums of chunk lengths, `num_chunks() + 1` entries starting at 0.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn chunks(&self) -> &[Vec<u32>] {
        &self.chunks
    }

    /// Largest window length accepted by [`ChunkSampler::sample`], if any.
    pub fn max_sample_length(&self) -> Option<usize> {
        self.average_chunk_len().checked_sub(1)
    }

    fn average_chunk_len(&self) -> usize {
        self.total_size() / self.chunks.len()
    }

    pub fn sample<R>(&self, rng: &mut R, length: usize) -> Result<Sample<'_>>
    where
        R: Rng + ?Sized,
    {
        let average = self.average_chunk_len();
        if length >= average {
            return Err(FinetuneError::SampleTooLong { length, average });
        }

        let total = self.total_size();
        let last_boundary = self.offsets.len() - 1;
        loop {
            let index = rng.gen_range(0..total - length);
            let Some(boundary) =
                binary_search(|j| self.offsets[j] > index, 0, last_boundary)
            else {
                continue;
            };
            let chunk = boundary - 1;
            if self.offsets[boundary] >= index + length {
                let offset = index - self.offsets[chunk];
                return Ok(Sample {
                    chunk,
                    offset,
                    tokens: &self.chunks[chunk][offset..offset + length],
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn binary_search_rejects_degenerate_ranges() {
        assert_eq!(binary_search(|_| true, 0, 10), None);
        assert_eq!(binary_search(|_| false, 0, 10), None);
        assert_eq!(binary_search(|i| i >= 7, 0, 10), Some(7));
        assert_eq!(binary_search(|i| i >= 1, 0, 1), Some(1));
    }

    #[test]
    fn offsets_are_prefix_sums() {
        let sampler = ChunkSampler::new(vec![vec![1; 4], vec![2; 6], vec![3; 5]]).unwrap();
        assert_eq!(sampler.offsets(), &[0, 4, 10, 15]);
        assert_eq!(sampler.total_size(), 15);
        assert_eq!(sampler.max_sample_length(), Some(4));
    }

    #[test]
    fn rejects_empty_inputs() {
        assert!(ChunkSampler::new(Vec::new()).is_err());
        assert!(ChunkSampler::new(vec![vec![1, 2], Vec::new()]).is_err());
    }

    #[test]
    fn length_must_stay_below_average_chunk() {
        let sampler = ChunkSampler::new(vec![vec![0; 10], vec![0; 10]]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        match sampler.sample(&mut rng, 10) {
            Err(FinetuneError::SampleTooLong { length, average }) => {
                assert_eq!((length, average), (10, 10));
            }
            other => panic!("expected SampleTooLong, got {other:?}"),
        }
        assert!(sampler.sample(&mut rng, 9).is_ok());
    }

    #[test]
    fn window_may_end_exactly_at_chunk_end() {
        let sampler = ChunkSampler::new(vec![vec![7; 3], vec![9; 3]]).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut saw_tail = false;
        for _ in 0..500 {
            let sample = sampler.sample(&mut rng, 2).unwrap();
            if sample.chunk == 0 && sample.offset == 1 {
                saw_tail = true;
            }
        }
        assert!(saw_tail);
    }
}
