//! A growable byte region with typed little-endian access and the
//! incremental XOR checksum used to protect the log payload.

use crate::error::Result;

/// The checksum treats the covered bytes as an array of 64-bit
/// little-endian words, zero-padding the final partial word, and XORs the
/// words together. XOR is linear: changing bytes in a region R updates the
/// total as `new = old ^ fold(old R bytes) ^ fold(new R bytes)`, so every
/// in-place mutation costs O(size of change) rather than a rescan.
pub fn fold(bytes: &[u8]) -> u64 {
    let mut sum = 0;
    for chunk in bytes.chunks(8) {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        sum ^= u64::from_le_bytes(word);
    }
    sum
}

/// Rotates a checksum computed as if its region started at word offset 0
/// into position for a region starting at `offset` bytes into the payload
/// stream. Rotation composes additively mod 64, so a region's local fold
/// can be realigned without touching its bytes.
pub fn shift_checksum(sum: u64, offset: usize) -> u64 {
    sum.rotate_left(((offset & 7) << 3) as u32)
}

/// A contiguous mutable byte region with a cursor. The first 12 bytes hold
/// the file header; records follow. All multibyte values are
/// little-endian. Strings are written straight from their UTF-8 bytes,
/// with no intermediate buffer.
pub struct Buffer {
    /// The backing bytes, sized to the current capacity.
    pub hb: Vec<u8>,
    /// The cursor for sequential reads and writes.
    pub position: usize,
}

impl Buffer {
    /// Creates a zeroed buffer of the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self { hb: vec![0; capacity], position: 0 }
    }

    /// Creates a buffer over an existing image, padded to `capacity`.
    pub fn from_image(image: &[u8], capacity: usize) -> Self {
        let mut hb = vec![0; capacity.max(image.len())];
        hb[..image.len()].copy_from_slice(image);
        Self { hb, position: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.hb.len()
    }

    /// Folds the words of `[start, end)`, aligned to `start`.
    pub fn fold_range(&self, start: usize, end: usize) -> u64 {
        fold(&self.hb[start..end])
    }

    pub fn put_u8(&mut self, value: u8) {
        self.hb[self.position] = value;
        self.position += 1;
    }

    pub fn get_u8(&mut self) -> u8 {
        let value = self.hb[self.position];
        self.position += 1;
        value
    }

    pub fn put_u16(&mut self, value: u16) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn get_u16(&mut self) -> u16 {
        u16::from_le_bytes([self.get_u8(), self.get_u8()])
    }

    pub fn put_i32(&mut self, value: i32) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn get_i32(&mut self) -> i32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.hb[self.position..self.position + 4]);
        self.position += 4;
        i32::from_le_bytes(word)
    }

    pub fn put_i64(&mut self, value: i64) {
        self.put_bytes(&value.to_le_bytes());
    }

    pub fn get_i64(&mut self) -> i64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.hb[self.position..self.position + 8]);
        self.position += 8;
        i64::from_le_bytes(word)
    }

    /// Floats are stored by their raw bit patterns, so NaN payloads
    /// round-trip bit-exactly.
    pub fn put_f32(&mut self, value: f32) {
        self.put_i32(value.to_bits() as i32);
    }

    pub fn get_f32(&mut self) -> f32 {
        f32::from_bits(self.get_i32() as u32)
    }

    pub fn put_f64(&mut self, value: f64) {
        self.put_i64(value.to_bits() as i64);
    }

    pub fn get_f64(&mut self) -> f64 {
        f64::from_bits(self.get_i64() as u64)
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.hb[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
    }

    pub fn get_bytes(&mut self, len: usize) -> Vec<u8> {
        let bytes = self.hb[self.position..self.position + len].to_vec();
        self.position += len;
        bytes
    }

    /// Reads `len` bytes as a UTF-8 string.
    pub fn get_str(&mut self, len: usize) -> Result<String> {
        Ok(String::from_utf8(self.get_bytes(len))?)
    }
}
