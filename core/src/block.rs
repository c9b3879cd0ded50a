/// One fixed-size byte range of the remote resource. `range_end` is inclusive,
/// matching the `Range: bytes=a-b` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub index: u64,
    pub range_start: u64,
    pub range_end: u64,
}

impl Block {
    pub fn size(&self) -> u64 {
        if self.range_end >= self.range_start {
            self.range_end - self.range_start + 1
        } else {
            0
        }
    }
}

pub fn block_count(length: u64, block_size: u64) -> u64 {
    if block_size == 0 {
        return 0;
    }
    let mut count = length / block_size;
    if count * block_size < length {
        count += 1;
    }
    count
}

/// Range covered by block `index`, or `None` when the index is past the end.
pub fn block_at(index: u64, block_size: u64, length: u64) -> Option<Block> {
    let range_start = index.checked_mul(block_size)?;
    if range_start >= length {
        return None;
    }
    let range_end = range_start.saturating_add(block_size).min(length) - 1;
    Some(Block {
        index,
        range_start,
        range_end,
    })
}

/// Clamp the requested worker count to `[1, block_count]`.
pub fn clamp_workers(requested: u32, block_count: u64) -> u32 {
    let mut workers = requested as u64;
    if workers > block_count {
        workers = block_count;
    }
    if workers == 0 {
        workers = 1;
    }
    workers as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Blocks a worker visits when its cursor starts at its own index and
    /// advances by the worker count.
    fn striped_blocks(worker: u32, worker_count: u32, block_count: u64) -> Vec<u64> {
        (worker as u64..block_count)
            .step_by(worker_count as usize)
            .collect()
    }

    #[test]
    fn count_rounds_up_on_remainder() {
        assert_eq!(block_count(9_000_000, 3_000_000), 3);
        assert_eq!(block_count(9_000_001, 3_000_000), 4);
        assert_eq!(block_count(1, 3_000_000), 1);
        assert_eq!(block_count(0, 3_000_000), 0);
    }

    #[test]
    fn last_block_is_truncated_to_length() {
        let last = block_at(3, 1000, 3500).unwrap();
        assert_eq!(last.range_start, 3000);
        assert_eq!(last.range_end, 3499);
        assert_eq!(last.size(), 500);
        assert!(block_at(4, 1000, 3500).is_none());
    }

    #[test]
    fn worker_count_is_clamped() {
        assert_eq!(clamp_workers(8, 3), 3);
        assert_eq!(clamp_workers(0, 3), 1);
        assert_eq!(clamp_workers(3, 0), 1);
        assert_eq!(clamp_workers(2, 10), 2);
    }

    #[test]
    fn striped_assignment_is_disjoint_and_complete() {
        let length = 10_500u64;
        let block_size = 1000u64;
        let blocks = block_count(length, block_size);
        let workers = 3u32;

        let mut seen = HashSet::new();
        let mut ranges = Vec::new();
        for worker in 0..workers {
            for index in striped_blocks(worker, workers, blocks) {
                assert!(seen.insert(index), "block {} assigned twice", index);
                ranges.push(block_at(index, block_size, length).unwrap());
            }
        }
        assert_eq!(seen.len() as u64, blocks);

        ranges.sort_by_key(|block| block.range_start);
        for pair in ranges.windows(2) {
            assert!(pair[0].range_end < pair[1].range_start);
        }
        let total: u64 = ranges.iter().map(Block::size).sum();
        assert_eq!(total, length);
    }
}
