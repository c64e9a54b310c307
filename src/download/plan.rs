use std::ops::Range;

/// Chunk size used when none is configured.
pub const DEFAULT_CHUNK_SIZE: u64 = 10 << 20;
/// Smallest chunk size accepted from configuration.
pub const MIN_CHUNK_SIZE: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// Half-open byte range `[start, end)` of the artifact.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: usize,
    pub start: u64,
    pub end: u64,
    pub state: ChunkState,
    pub retries_left: u32,
    pub last_error: Option<String>,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<u64> {
        self.start..self.end
    }

    /// Value for the `Range` header; `None` for an empty chunk.
    pub fn range_header(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(format!("bytes={}-{}", self.start, self.end - 1))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub length: u64,
    pub chunk_size: u64,
    pub chunks: Vec<Chunk>,
}

impl ChunkPlan {
    /// Partitions `[0, length)` into chunks of `chunk_size` bytes, the last
    /// one holding the remainder. Without range support the whole file is
    /// one chunk; a zero-length file gets a single empty chunk.
    pub fn new(length: u64, chunk_size: u64, accepts_ranges: bool, retries: u32) -> Self {
        let chunk_size = if accepts_ranges {
            chunk_size.max(1)
        } else {
            length.max(1)
        };

        let mut chunks = Vec::new();
        let mut start = 0u64;
        loop {
            let end = start.saturating_add(chunk_size).min(length);
            chunks.push(Chunk {
                id: chunks.len(),
                start,
                end,
                state: ChunkState::Pending,
                retries_left: retries,
                last_error: None,
            });
            if end >= length {
                break;
            }
            start = end;
        }

        Self {
            length,
            chunk_size,
            chunks,
        }
    }

    pub fn count(&self, state: ChunkState) -> usize {
        self.chunks.iter().filter(|chunk| chunk.state == state).count()
    }

    pub fn remaining(&self) -> usize {
        self.chunks.len() - self.count(ChunkState::Done)
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|chunk| chunk.state == ChunkState::Done)
    }

    pub fn chunk(&self, id: usize) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    pub(crate) fn chunk_mut(&mut self, id: usize) -> Option<&mut Chunk> {
        self.chunks.get_mut(id)
    }
}
