use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{MemoryError, Result};

/// Word-addressable backing store shared between the host and the device.
///
/// Every access is a relaxed-or-stronger atomic on a 32-bit word, so a device thread can write a
/// completion tag while a host thread polls it without any additional locking. Byte accessors
/// are provided for host copies and are implemented as read-modify-write on the covering words.
#[derive(Debug)]
pub struct DeviceMemory {
    words: Box<[AtomicU32]>,
    size: usize,
}

impl DeviceMemory {
    pub fn new(size: usize) -> Self {
        let word_count = size.div_ceil(4);
        let words = (0..word_count).map(|_| AtomicU32::new(0)).collect();
        Self { words, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn word_index(&self, offset: usize, dwords: usize) -> Result<usize> {
        if offset % 4 != 0 {
            return Err(MemoryError::Unaligned { offset, alignment: 4 });
        }
        let index = offset / 4;
        let end = index.checked_add(dwords).ok_or(MemoryError::Overflow)?;
        if end > self.words.len() {
            return Err(MemoryError::OutOfBounds {
                offset,
                len: dwords * 4,
                size: self.size,
            });
        }
        Ok(index)
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let index = self.word_index(offset, 1)?;
        Ok(self.words[index].load(Ordering::Acquire))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        let index = self.word_index(offset, 1)?;
        self.words[index].store(value, Ordering::Release);
        Ok(())
    }

    pub fn write_dwords(&self, offset: usize, dwords: &[u32]) -> Result<()> {
        let index = self.word_index(offset, dwords.len())?;
        for (slot, value) in self.words[index..index + dwords.len()].iter().zip(dwords) {
            slot.store(*value, Ordering::Release);
        }
        Ok(())
    }

    pub fn read_dwords(&self, offset: usize, count: usize) -> Result<Vec<u32>> {
        let index = self.word_index(offset, count)?;
        Ok(self.words[index..index + count]
            .iter()
            .map(|w| w.load(Ordering::Acquire))
            .collect())
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len()).ok_or(MemoryError::Overflow)?;
        if end > self.size {
            return Err(MemoryError::OutOfBounds {
                offset,
                len: data.len(),
                size: self.size,
            });
        }
        for (i, byte) in data.iter().enumerate() {
            let pos = offset + i;
            let shift = (pos % 4) * 8;
            let mask = !(0xFFu32 << shift);
            let word = &self.words[pos / 4];
            let _ = word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
                Some((w & mask) | (u32::from(*byte) << shift))
            });
        }
        Ok(())
    }

    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let end = offset.checked_add(dst.len()).ok_or(MemoryError::Overflow)?;
        if end > self.size {
            return Err(MemoryError::OutOfBounds {
                offset,
                len: dst.len(),
                size: self.size,
            });
        }
        for (i, byte) in dst.iter_mut().enumerate() {
            let pos = offset + i;
            let word = self.words[pos / 4].load(Ordering::Acquire);
            *byte = (word >> ((pos % 4) * 8)) as u8;
        }
        Ok(())
    }
}
