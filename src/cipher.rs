//! Optional symmetric transforms applied to keys, values, and sidecar
//! blobs.

/// A symmetric transform over stored bytes.
///
/// Implementations must be deterministic: the same plaintext must always
/// produce the same ciphertext, because the store re-derives key
/// ciphertext lengths when relocating records. The integer transforms
/// must be length-preserving, since fixed-width records reserve exactly
/// the type's width. Booleans are never passed through the cipher.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8>;
    fn decrypt(&self, cipher: &[u8]) -> Vec<u8>;
    fn encrypt_i32(&self, value: i32) -> i32;
    fn decrypt_i32(&self, value: i32) -> i32;
    fn encrypt_i64(&self, value: i64) -> i64;
    fn decrypt_i64(&self, value: i64) -> i64;
}

/// A rolling XOR stream transform chained on the previous ciphertext
/// byte. Length-preserving and deterministic. This obfuscates the stored
/// bytes; it is not a cryptographic cipher.
pub struct XorCipher {
    key: [u8; 32],
    k32: u32,
    k64: u64,
}

impl XorCipher {
    pub fn new(seed: &[u8]) -> Self {
        let mut key = [0u8; 32];
        for (i, k) in key.iter_mut().enumerate() {
            *k = (i as u8).wrapping_mul(0x9d) ^ 0x6b;
        }
        for (i, b) in seed.iter().enumerate() {
            key[i % 32] ^= b.rotate_left((i % 7) as u32);
        }
        let k32 = u32::from_le_bytes([key[0], key[5], key[13], key[26]]);
        let k64 = crate::buffer::fold(&key);
        Self { key, k32, k64 }
    }
}

impl Cipher for XorCipher {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let mut prev = 0x5au8;
        plain
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let c = b ^ self.key[i % 32] ^ prev;
                prev = c;
                c
            })
            .collect()
    }

    fn decrypt(&self, cipher: &[u8]) -> Vec<u8> {
        let mut prev = 0x5au8;
        cipher
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let p = c ^ self.key[i % 32] ^ prev;
                prev = *c;
                p
            })
            .collect()
    }

    fn encrypt_i32(&self, value: i32) -> i32 {
        (value ^ self.k32 as i32).rotate_left(13)
    }

    fn decrypt_i32(&self, value: i32) -> i32 {
        value.rotate_right(13) ^ self.k32 as i32
    }

    fn encrypt_i64(&self, value: i64) -> i64 {
        (value ^ self.k64 as i64).rotate_left(29)
    }

    fn decrypt_i64(&self, value: i64) -> i64 {
        value.rotate_right(29) ^ self.k64 as i64
    }
}
