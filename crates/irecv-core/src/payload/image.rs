//! Firmware images and chunk planning.
//!
//! An image is split into packet-sized chunks; the final chunk carries the
//! remainder, or a full packet when the length divides evenly. A chunk is
//! never empty.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

use tracing::{debug, info};

use crate::error::{IrecvError, Result};

/// Immutable image bytes loaded for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Read a whole file. A missing file and a failed allocation are both
    /// reported as distinct errors.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => IrecvError::FileNotFound(path.to_path_buf()),
            _ => IrecvError::Io(e),
        })?;

        let len = file.metadata()?.len() as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| IrecvError::AllocationFailure { len })?;
        file.read_to_end(&mut data)?;

        info!(path = %path.display(), len = data.len(), "Loaded image");
        Ok(Self { data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Chunk layout for a given packet size.
    pub fn plan(&self, packet_size: usize) -> ChunkPlan {
        ChunkPlan::new(self.data.len(), packet_size)
    }

    /// Bytes covered by `chunk`.
    pub fn chunk_bytes(&self, chunk: &Chunk) -> &[u8] {
        &self.data[chunk.offset..chunk.offset + chunk.len]
    }
}

/// A view into an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub offset: usize,
    pub len: usize,
}

/// Chunk count and trailing chunk size for an image length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub image_len: usize,
    pub packet_size: usize,
    pub count: usize,
    pub last_len: usize,
}

impl ChunkPlan {
    pub fn new(image_len: usize, packet_size: usize) -> Self {
        let count = image_len.div_ceil(packet_size);
        let last_len = match image_len % packet_size {
            0 if image_len > 0 => packet_size,
            rem => rem,
        };
        debug!(image_len, packet_size, count, last_len, "Chunk plan");
        Self {
            image_len,
            packet_size,
            count,
            last_len,
        }
    }

    pub fn chunk(&self, index: usize) -> Option<Chunk> {
        if index >= self.count {
            return None;
        }
        let len = if index + 1 == self.count {
            self.last_len
        } else {
            self.packet_size
        };
        Some(Chunk {
            index,
            offset: index * self.packet_size,
            len,
        })
    }

    pub fn is_last(&self, chunk: &Chunk) -> bool {
        chunk.index + 1 == self.count
    }

    pub fn iter(&self) -> ChunkIterator {
        ChunkIterator {
            plan: *self,
            current: 0,
        }
    }
}

/// Iterator over the chunks of a plan.
#[derive(Debug)]
pub struct ChunkIterator {
    plan: ChunkPlan,
    current: usize,
}

impl ChunkIterator {
    /// Get total number of chunks (including partial).
    pub fn total(&self) -> usize {
        self.plan.count
    }

    /// Get current chunk index (0-based).
    pub fn current(&self) -> usize {
        self.current
    }
}

impl Iterator for ChunkIterator {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk = self.plan.chunk(self.current)?;
        self.current += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.plan.count - self.current;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ChunkIterator {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(len: usize, packet: usize) -> Vec<usize> {
        ChunkPlan::new(len, packet).iter().map(|c| c.len).collect()
    }

    #[test]
    fn test_plan_with_remainder() {
        let plan = ChunkPlan::new(0x1801, 0x800);
        assert_eq!(plan.count, 4);
        assert_eq!(plan.last_len, 1);
        assert_eq!(sizes(0x1801, 0x800), vec![0x800, 0x800, 0x800, 0x1]);
    }

    #[test]
    fn test_plan_exact_multiple() {
        let plan = ChunkPlan::new(0x10000, 0x8000);
        assert_eq!(plan.count, 2);
        assert_eq!(plan.last_len, 0x8000);
        assert_eq!(sizes(0x10000, 0x8000), vec![0x8000, 0x8000]);
    }

    #[test]
    fn test_plan_smaller_than_packet() {
        assert_eq!(sizes(17, 0x800), vec![17]);
    }

    #[test]
    fn test_plan_empty() {
        let plan = ChunkPlan::new(0, 0x800);
        assert_eq!(plan.count, 0);
        assert_eq!(plan.iter().count(), 0);
    }

    #[test]
    fn test_chunks_cover_image() {
        for len in [1usize, 0x7FF, 0x800, 0x801, 0x1801, 0x12345] {
            for packet in [0x800usize, 0x8000] {
                let plan = ChunkPlan::new(len, packet);
                let chunks: Vec<Chunk> = plan.iter().collect();
                assert_eq!(chunks.len(), len.div_ceil(packet));
                assert_eq!(chunks.iter().map(|c| c.len).sum::<usize>(), len);
                assert!(chunks.iter().all(|c| c.len > 0 && c.offset + c.len <= len));
                assert!(plan.is_last(chunks.last().unwrap()));
            }
        }
    }

    #[test]
    fn test_chunk_bytes() {
        let image = FirmwareImage::from_bytes((0..0x900u32).map(|i| i as u8).collect());
        let plan = image.plan(0x800);
        let last = plan.chunk(1).unwrap();
        assert_eq!(image.chunk_bytes(&last).len(), 0x100);
        assert_eq!(image.chunk_bytes(&last)[0], 0x00);
        assert!(plan.chunk(2).is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let err = FirmwareImage::load("/nonexistent/iBSS.img3").unwrap_err();
        assert!(matches!(err, IrecvError::FileNotFound(_)));
    }

    #[test]
    fn test_load_file() {
        let path = std::env::temp_dir().join(format!("irecv-image-{}.bin", std::process::id()));
        std::fs::write(&path, [1u8, 2, 3, 4]).unwrap();
        let image = FirmwareImage::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(image.as_bytes(), &[1, 2, 3, 4]);
    }
}
