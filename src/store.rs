//! The persistent log engine and its public surface.
//!
//! A store keeps every key-value pair in a single binary log, mirrored in
//! memory as a byte buffer plus an index of live entries. Small values
//! live inline in records; values at or above the internal limit spill to
//! sidecar files written asynchronously. Mutations append, overwrite in
//! place when the encoded size is unchanged, or tombstone and reappend,
//! keeping the header checksum current incrementally. Tombstoned bytes
//! are tracked and compacted in place once thresholds fire.
//!
//! The on-disk layout starts with a 12-byte header: a packed size word
//! (28-bit payload size, bit 30 flags encryption) and an 8-byte XOR word
//! checksum over the payload. Records follow as
//! `info | key size | key | [value size] | value`, with the info byte
//! carrying the type tag, the tombstone flag, and the external flag.

use crate::blobs::{BlobWriter, Job};
use crate::buffer::{fold, shift_checksum, Buffer};
use crate::cache::{BigValue, BlobCache, ValueCache};
use crate::cipher::Cipher;
use crate::encoder::{string_set_encoder, Encoder, ErasedEncoder, STRING_SET_TAG};
use crate::entry::{
    DataType, Entry, ObjectValue, Var, VarValue, DELETE_MASK, EXTERNAL_MASK, TYPE_MASK, TYPE_SIZE,
};
use crate::error::Result;
use crate::invalids::Invalids;
use crate::io::{new_capacity, Backing, Mode, DATA_SIZE_LIMIT, DATA_START, PAGE_SIZE};
use crate::{errdata, errinput};

use rand::distributions::Alphanumeric;
use rand::Rng as _;
use std::any::Any;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Sidecar file names are exactly this many ASCII characters.
const NAME_SIZE: usize = 32;
/// Keys are at most this many bytes after optional encryption.
const KEY_LIMIT: usize = 255;
/// Inline variable values are at most this many bytes (2-byte size field).
const VALUE_LIMIT: usize = 0xffff;
/// Encoded values at or above this many bytes spill to a sidecar file.
const INTERNAL_LIMIT: usize = 8 << 10;
/// Header bit flagging an encrypted payload.
const ENCRYPTED_FLAG: u32 = 1 << 30;

/// Options for opening a [`Store`].
pub struct Options {
    path: PathBuf,
    name: String,
    mode: Mode,
    cipher: Option<Arc<dyn Cipher>>,
    internal_limit: usize,
    encoders: Vec<Arc<dyn ErasedEncoder>>,
}

impl Options {
    /// Creates options for the store `name` under the directory `path`.
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            mode: Mode::DualFile,
            cipher: None,
            internal_limit: INTERNAL_LIMIT,
            encoders: Vec::new(),
        }
    }

    /// Sets the durability mode. Defaults to [`Mode::DualFile`].
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Encrypts keys, values, and sidecar blobs with the given cipher.
    /// Opening an existing unencrypted store with a cipher rewrites it.
    pub fn cipher(mut self, cipher: impl Cipher + 'static) -> Self {
        self.cipher = Some(Arc::new(cipher));
        self
    }

    /// Registers an encoder for OBJECT values. May be called repeatedly;
    /// a duplicate tag replaces the earlier encoder.
    pub fn encoder<E: Encoder>(mut self, encoder: E) -> Self {
        self.encoders.push(Arc::new(encoder));
        self
    }

    /// Sets the spill threshold for large values, in encoded bytes.
    pub fn internal_limit(mut self, limit: usize) -> Self {
        self.internal_limit = limit.clamp(1, VALUE_LIMIT);
        self
    }

    /// Opens or creates the store.
    pub fn open(self) -> Result<Store> {
        Ok(Store { core: Mutex::new(Core::open(self)?) })
    }
}

/// A value of any storable type, as used by [`Store::get_all`] and
/// [`Store::put_all`].
#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Array(Vec<u8>),
    StringSet(HashSet<String>),
    Object { tag: String, value: Arc<dyn Any + Send + Sync> },
}

/// An embedded persistent key-value store backed by a single binary log.
///
/// All operations are internally synchronized by a per-store lock, so a
/// `Store` can be shared across threads. Reads never fail: a missing or
/// mismatched key yields `None`, and I/O or decode problems are logged
/// and degrade to the same. Writes only surface argument faults.
pub struct Store {
    core: Mutex<Core>,
}

impl Store {
    /// Opens a store with default options.
    pub fn open(path: impl Into<PathBuf>, name: impl Into<String>) -> Result<Store> {
        Options::new(path, name).open()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.core.lock().unwrap().index.contains_key(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.core.lock().unwrap().index.get(key) {
            Some(Entry::Bool { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i32> {
        match self.core.lock().unwrap().index.get(key) {
            Some(Entry::Int { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub fn get_float(&self, key: &str) -> Option<f32> {
        match self.core.lock().unwrap().index.get(key) {
            Some(Entry::Float { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub fn get_long(&self, key: &str) -> Option<i64> {
        match self.core.lock().unwrap().index.get(key) {
            Some(Entry::Long { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub fn get_double(&self, key: &str) -> Option<f64> {
        match self.core.lock().unwrap().index.get(key) {
            Some(Entry::Double { value, .. }) => Some(*value),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.core.lock().unwrap().get_string(key)
    }

    pub fn get_array(&self, key: &str) -> Option<Vec<u8>> {
        self.core.lock().unwrap().get_array(key)
    }

    pub fn get_string_set(&self, key: &str) -> Option<HashSet<String>> {
        let value = self.core.lock().unwrap().get_object_value(key)?;
        value.value.downcast::<HashSet<String>>().ok().map(|set| (*set).clone())
    }

    /// Returns the object stored under `key`, decoded as `T`. Yields
    /// `None` when the key is absent or holds a different type.
    pub fn get_object<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.core.lock().unwrap().get_object_value(key)?;
        value.value.downcast::<T>().ok()
    }

    pub fn put_bool(&self, key: &str, value: bool) -> Result<()> {
        self.core.lock().unwrap().put_fixed(key, Fixed::Bool(value))
    }

    pub fn put_int(&self, key: &str, value: i32) -> Result<()> {
        self.core.lock().unwrap().put_fixed(key, Fixed::Int(value))
    }

    pub fn put_float(&self, key: &str, value: f32) -> Result<()> {
        self.core.lock().unwrap().put_fixed(key, Fixed::Float(value))
    }

    pub fn put_long(&self, key: &str, value: i64) -> Result<()> {
        self.core.lock().unwrap().put_fixed(key, Fixed::Long(value))
    }

    pub fn put_double(&self, key: &str, value: f64) -> Result<()> {
        self.core.lock().unwrap().put_fixed(key, Fixed::Double(value))
    }

    pub fn put_string(&self, key: &str, value: &str) -> Result<()> {
        self.core.lock().unwrap().put_string(key, value)
    }

    pub fn put_array(&self, key: &str, value: &[u8]) -> Result<()> {
        self.core.lock().unwrap().put_array(key, value)
    }

    pub fn put_string_set(&self, key: &str, value: HashSet<String>) -> Result<()> {
        self.put_object(key, value, STRING_SET_TAG)
    }

    /// Stores `value` as an OBJECT record under the encoder registered
    /// for `tag`. Fails if no such encoder is registered.
    pub fn put_object<T: Send + Sync + 'static>(
        &self,
        key: &str,
        value: T,
        tag: &str,
    ) -> Result<()> {
        let value = ObjectValue { tag: tag.to_string(), value: Arc::new(value) };
        self.core.lock().unwrap().put_object_value(key, value)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.core.lock().unwrap().remove_key(key)
    }

    /// Removes every key and resets the log to its empty state.
    pub fn clear(&self) {
        self.core.lock().unwrap().clear()
    }

    /// Returns all live keys and their values, decoding external ones.
    pub fn get_all(&self) -> HashMap<String, Value> {
        self.core.lock().unwrap().get_all()
    }

    /// Stores a batch of values. Stops at the first argument fault.
    pub fn put_all(&self, values: HashMap<String, Value>) -> Result<()> {
        self.core.lock().unwrap().put_all(values)
    }

    /// Blocks until the log image and all pending sidecar writes are
    /// durable.
    pub fn sync(&self) -> Result<()> {
        self.core.lock().unwrap().sync()
    }

    #[cfg(test)]
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> R) -> R {
        f(&mut self.core.lock().unwrap())
    }
}

/// A fixed-width value, as handed to the shared put path.
#[derive(Clone, Copy)]
enum Fixed {
    Bool(bool),
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
}

impl Fixed {
    fn data_type(&self) -> DataType {
        match self {
            Fixed::Bool(_) => DataType::Boolean,
            Fixed::Int(_) => DataType::Int,
            Fixed::Float(_) => DataType::Float,
            Fixed::Long(_) => DataType::Long,
            Fixed::Double(_) => DataType::Double,
        }
    }

    /// Encodes the value as stored on disk. Booleans are never passed
    /// through the cipher; floats are encrypted via their bit patterns.
    fn encode(&self, cipher: Option<&Arc<dyn Cipher>>) -> Vec<u8> {
        match *self {
            Fixed::Bool(value) => vec![value as u8],
            Fixed::Int(value) => {
                cipher.map_or(value, |c| c.encrypt_i32(value)).to_le_bytes().to_vec()
            }
            Fixed::Float(value) => {
                let bits = value.to_bits() as i32;
                cipher.map_or(bits, |c| c.encrypt_i32(bits)).to_le_bytes().to_vec()
            }
            Fixed::Long(value) => {
                cipher.map_or(value, |c| c.encrypt_i64(value)).to_le_bytes().to_vec()
            }
            Fixed::Double(value) => {
                let bits = value.to_bits() as i64;
                cipher.map_or(bits, |c| c.encrypt_i64(bits)).to_le_bytes().to_vec()
            }
        }
    }

    /// Writes the encoded value at the buffer's cursor. Same encoding as
    /// [`Fixed::encode`], without the intermediate allocation.
    fn write_to(&self, buffer: &mut Buffer, cipher: Option<&Arc<dyn Cipher>>) {
        match *self {
            Fixed::Bool(value) => buffer.put_u8(value as u8),
            Fixed::Int(value) => buffer.put_i32(cipher.map_or(value, |c| c.encrypt_i32(value))),
            Fixed::Float(value) => match cipher {
                Some(c) => buffer.put_i32(c.encrypt_i32(value.to_bits() as i32)),
                None => buffer.put_f32(value),
            },
            Fixed::Long(value) => buffer.put_i64(cipher.map_or(value, |c| c.encrypt_i64(value))),
            Fixed::Double(value) => match cipher {
                Some(c) => buffer.put_i64(c.encrypt_i64(value.to_bits() as i64)),
                None => buffer.put_f64(value),
            },
        }
    }

    fn entry(&self, offset: usize) -> Entry {
        match *self {
            Fixed::Bool(value) => Entry::Bool { offset, value },
            Fixed::Int(value) => Entry::Int { offset, value },
            Fixed::Float(value) => Entry::Float { offset, value },
            Fixed::Long(value) => Entry::Long { offset, value },
            Fixed::Double(value) => Entry::Double { offset, value },
        }
    }

    /// Whether the entry already holds this exact value. Floats compare
    /// by bit pattern so NaN payloads count as equal to themselves.
    fn equals(&self, entry: &Entry) -> bool {
        match (*self, entry) {
            (Fixed::Bool(a), Entry::Bool { value, .. }) => a == *value,
            (Fixed::Int(a), Entry::Int { value, .. }) => a == *value,
            (Fixed::Float(a), Entry::Float { value, .. }) => a.to_bits() == value.to_bits(),
            (Fixed::Long(a), Entry::Long { value, .. }) => a == *value,
            (Fixed::Double(a), Entry::Double { value, .. }) => a.to_bits() == value.to_bits(),
            _ => false,
        }
    }
}

/// The engine state, guarded by the store's lock.
pub(crate) struct Core {
    dir: PathBuf,
    name: String,
    /// Directory holding this store's sidecar files.
    blob_dir: PathBuf,
    mode: Mode,
    backing: Backing,
    /// The full log image, header included. Source of truth for the
    /// backing files.
    pub(crate) buffer: Buffer,
    /// One past the last payload byte; `data_end - 12` is the data size.
    pub(crate) data_end: usize,
    /// XOR word checksum over `[12, data_end)`, kept incrementally.
    pub(crate) checksum: u64,
    pub(crate) index: HashMap<String, Entry>,
    pub(crate) invalids: Invalids,
    cipher: Option<Arc<dyn Cipher>>,
    /// Whether the current payload and sidecars are ciphertext. False
    /// between parsing an unencrypted image and finishing its rewrite,
    /// even though a cipher is configured.
    encrypted: bool,
    encoders: HashMap<String, Arc<dyn ErasedEncoder>>,
    blob_cache: BlobCache,
    value_cache: ValueCache,
    writer: Option<BlobWriter>,
    internal_limit: usize,
    need_rewrite: bool,
    /// True for the transient rewrite engine: commits are suppressed and
    /// sidecars are written inline.
    scratch: bool,
}

impl Core {
    fn open(options: Options) -> Result<Self> {
        let Options { path: dir, name, mode, cipher, internal_limit, encoders } = options;
        if name.is_empty() || name.contains(['/', '\\']) {
            return errinput!("invalid store name {name:?}");
        }
        log::info!("Opening store {name} in {}", dir.display());
        Self::clean_leftovers(&dir, &name);

        let mut registry: HashMap<String, Arc<dyn ErasedEncoder>> = HashMap::new();
        let builtin = string_set_encoder();
        registry.insert(Encoder::tag(&builtin).to_string(), Arc::new(builtin));
        for encoder in encoders {
            registry.insert(encoder.tag().to_string(), encoder);
        }

        let opened = Backing::open(&dir, &name, mode)?;
        let mut core = Core {
            blob_dir: dir.join(&name),
            dir,
            name,
            mode,
            backing: opened.backing,
            buffer: Buffer::new(PAGE_SIZE),
            data_end: DATA_START,
            checksum: 0,
            index: HashMap::new(),
            invalids: Invalids::default(),
            encrypted: cipher.is_some(),
            cipher,
            encoders: registry,
            blob_cache: BlobCache::new(),
            value_cache: ValueCache::new(),
            writer: None,
            internal_limit,
            need_rewrite: false,
            scratch: false,
        };
        core.write_header();
        core.load(opened.image_a, opened.image_b);
        if core.need_rewrite {
            core.rewrite_encrypted()?;
        }
        if mode == Mode::SyncBlocking {
            let _ = fs::remove_file(core.dir.join(format!("{}.tmp", core.name)));
        }
        log::info!("Indexed {} live keys in {}", core.index.len(), core.backing.describe());
        Ok(core)
    }

    /// Removes leftovers of an interrupted encryption rewrite.
    fn clean_leftovers(dir: &Path, name: &str) {
        let _ = fs::remove_file(dir.join(format!("temp_{name}.kvc")));
        let _ = fs::remove_file(dir.join(format!("temp_{name}.tmp")));
        let _ = fs::remove_dir_all(dir.join(format!("temp_{name}")));
    }

    /// Loads the store from the on-disk images: the primary first, then
    /// the alternate, then an empty store. A corrupt image is abandoned
    /// and its sibling's content written over it.
    fn load(&mut self, image_a: Vec<u8>, image_b: Option<Vec<u8>>) {
        match self.parse(&image_a) {
            Ok(()) => {
                // Repair a diverged secondary image (dual-file mode only;
                // in blocking mode the alternate is a stale .tmp).
                if self.mode == Mode::DualFile {
                    let stale = image_b.as_ref().map_or(true, |b| {
                        b.len() < self.data_end
                            || b[..self.data_end] != self.buffer.hb[..self.data_end]
                    });
                    if stale {
                        if let Err(error) = self.backing.rewrite(&self.buffer.hb, self.data_end) {
                            log::error!("failed to repair secondary image: {error}");
                        }
                    }
                }
            }
            Err(error) => {
                if !image_a.is_empty() {
                    log::error!("failed to parse primary image of {}: {error}", self.name);
                }
                let mut recovered = false;
                if let Some(image_b) = &image_b {
                    match self.parse(image_b) {
                        Ok(()) => {
                            log::info!("recovered {} from alternate image", self.name);
                            recovered = true;
                            if let Err(error) = self.backing.rewrite(&self.buffer.hb, self.data_end)
                            {
                                log::error!("failed to repair primary image: {error}");
                            }
                        }
                        Err(error) => {
                            if !image_b.is_empty() {
                                log::error!(
                                    "failed to parse alternate image of {}: {error}",
                                    self.name
                                );
                            }
                        }
                    }
                }
                if !recovered {
                    let had_data =
                        !image_a.is_empty() || image_b.as_ref().is_some_and(|b| !b.is_empty());
                    self.reset();
                    if had_data {
                        log::error!("no intact image, starting {} empty", self.name);
                        if let Err(error) = self.backing.rewrite(&self.buffer.hb, self.data_end) {
                            log::error!("failed to reset images: {error}");
                        }
                    } else {
                        self.commit(DATA_START..DATA_START);
                    }
                }
            }
        }
        if let Err(error) = self.backing.ensure_capacity(self.buffer.capacity()) {
            log::error!("failed to grow {}: {error}", self.backing.describe());
        }
    }

    /// Resets the in-memory state to an empty store.
    fn reset(&mut self) {
        self.buffer = Buffer::new(PAGE_SIZE);
        self.data_end = DATA_START;
        self.checksum = 0;
        self.index.clear();
        self.invalids.clear();
        self.need_rewrite = false;
        self.encrypted = self.cipher.is_some();
        self.write_header();
    }

    /// The cipher to apply to data written or read right now: none while
    /// an unencrypted image awaits its rewrite.
    fn active_cipher(&self) -> Option<&Arc<dyn Cipher>> {
        if self.encrypted {
            self.cipher.as_ref()
        } else {
            None
        }
    }

    /// Parses a candidate log image, replacing the in-memory state on
    /// success. On any error the current state is left untouched.
    fn parse(&mut self, image: &[u8]) -> Result<()> {
        let file_len = image.len();
        if file_len == 0 {
            return errdata!("empty image");
        }
        if file_len >= DATA_SIZE_LIMIT {
            return errdata!("image of {file_len} bytes exceeds the 256 MiB limit");
        }
        if file_len < DATA_START {
            return errdata!("image of {file_len} bytes is smaller than the header");
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&image[0..4]);
        let packed = u32::from_le_bytes(word);
        let data_size = (packed & 0x0fff_ffff) as usize;
        let had_encrypted = packed & ENCRYPTED_FLAG != 0;
        if data_size > file_len - DATA_START {
            return errdata!("data size {data_size} exceeds image size {file_len}");
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&image[4..12]);
        let stored_checksum = u64::from_le_bytes(word);
        let data_end = DATA_START + data_size;
        if fold(&image[DATA_START..data_end]) != stored_checksum {
            return errdata!("checksum mismatch");
        }
        if had_encrypted && self.cipher.is_none() {
            return errdata!("image is encrypted but no cipher is configured");
        }
        let cipher = if had_encrypted { self.cipher.clone() } else { None };

        let mut buffer = Buffer::from_image(image, new_capacity(PAGE_SIZE, file_len)?);
        let mut index: HashMap<String, Entry> = HashMap::new();
        let mut invalids = Invalids::default();
        buffer.position = DATA_START;

        while buffer.position < data_end {
            let start = buffer.position;
            let info = buffer.get_u8();
            let tag = info & TYPE_MASK;
            let Some(data_type) = DataType::from_tag(tag) else {
                return errdata!("unknown record type {tag} at offset {start}");
            };
            let key_size = buffer.get_u8() as usize;
            if key_size == 0 {
                return errdata!("zero key size at offset {start}");
            }
            if buffer.position + key_size > data_end {
                return errdata!("truncated record at offset {start}");
            }

            if info & DELETE_MASK != 0 {
                // Tombstone: skip the record and count its bytes.
                buffer.position += key_size;
                let value_len = match data_type.fixed_size() {
                    Some(size) => size,
                    None => {
                        if buffer.position + 2 > data_end {
                            return errdata!("truncated record at offset {start}");
                        }
                        2 + buffer.get_u16() as usize
                    }
                };
                let end = start + 2 + key_size + value_len;
                if end > data_end {
                    return errdata!("truncated record at offset {start}");
                }
                buffer.position = end;
                invalids.count(start, end);
                continue;
            }

            let key_bytes = buffer.get_bytes(key_size);
            let key = match &cipher {
                Some(c) => String::from_utf8(c.decrypt(&key_bytes))?,
                None => String::from_utf8(key_bytes)?,
            };

            let entry = match data_type.fixed_size() {
                Some(size) => {
                    if buffer.position + size > data_end {
                        return errdata!("truncated record at offset {start}");
                    }
                    let offset = buffer.position;
                    match data_type {
                        DataType::Boolean => {
                            let byte = buffer.get_u8();
                            if byte > 1 {
                                return errdata!("invalid boolean {byte} at offset {offset}");
                            }
                            Some(Entry::Bool { offset, value: byte == 1 })
                        }
                        DataType::Int => {
                            let raw = buffer.get_i32();
                            let value = cipher.as_ref().map_or(raw, |c| c.decrypt_i32(raw));
                            Some(Entry::Int { offset, value })
                        }
                        DataType::Float => {
                            let value = match &cipher {
                                Some(c) => f32::from_bits(c.decrypt_i32(buffer.get_i32()) as u32),
                                None => buffer.get_f32(),
                            };
                            Some(Entry::Float { offset, value })
                        }
                        DataType::Long => {
                            let raw = buffer.get_i64();
                            let value = cipher.as_ref().map_or(raw, |c| c.decrypt_i64(raw));
                            Some(Entry::Long { offset, value })
                        }
                        DataType::Double => {
                            let value = match &cipher {
                                Some(c) => f64::from_bits(c.decrypt_i64(buffer.get_i64()) as u64),
                                None => buffer.get_f64(),
                            };
                            Some(Entry::Double { offset, value })
                        }
                        _ => None,
                    }
                }
                None => {
                    if buffer.position + 2 > data_end {
                        return errdata!("truncated record at offset {start}");
                    }
                    let value_size = buffer.get_u16() as usize;
                    let offset = buffer.position;
                    if offset + value_size > data_end {
                        return errdata!("truncated record at offset {start}");
                    }
                    let external = info & EXTERNAL_MASK != 0;
                    let var = Var { start, offset, len: value_size, external };
                    if external {
                        if value_size != NAME_SIZE {
                            return errdata!("invalid external name size {value_size}");
                        }
                        let name = buffer.get_str(value_size)?;
                        match data_type {
                            DataType::String => {
                                Some(Entry::Str { var, value: VarValue::External(name) })
                            }
                            DataType::Array => {
                                Some(Entry::Array { var, value: VarValue::External(name) })
                            }
                            _ => Some(Entry::Object { var, value: VarValue::External(name) }),
                        }
                    } else {
                        let raw = buffer.get_bytes(value_size);
                        let plain = match &cipher {
                            Some(c) => c.decrypt(&raw),
                            None => raw,
                        };
                        match data_type {
                            DataType::String => Some(Entry::Str {
                                var,
                                value: VarValue::Inline(String::from_utf8(plain)?),
                            }),
                            DataType::Array => Some(Entry::Array {
                                var,
                                value: VarValue::Inline(Arc::new(plain)),
                            }),
                            _ => match Self::decode_object_payload(&self.encoders, &plain) {
                                Ok(value) => {
                                    Some(Entry::Object { var, value: VarValue::Inline(value) })
                                }
                                // The record stays on disk untouched; a
                                // later open with the encoder registered
                                // sees it again.
                                Err(error) => {
                                    log::warn!("skipping object for key {key}: {error}");
                                    None
                                }
                            },
                        }
                    }
                }
            };

            if let Some(entry) = entry {
                // A later record supersedes an earlier one for the same
                // key; the earlier bytes become garbage.
                if let Some(old) = index.insert(key, entry) {
                    let (old_start, old_end) = match old.var() {
                        Some(var) => (var.start, var.end()),
                        None => {
                            let offset = old.offset();
                            (offset - 2 - key_size, offset + TYPE_SIZE[old.data_type() as usize])
                        }
                    };
                    invalids.count(old_start, old_end);
                }
            }
        }

        if buffer.position != data_end {
            return errdata!("record walk ended at {} instead of {data_end}", buffer.position);
        }

        self.buffer = buffer;
        self.data_end = data_end;
        self.checksum = stored_checksum;
        self.index = index;
        self.invalids = invalids;
        self.encrypted = had_encrypted;
        self.need_rewrite = !had_encrypted && self.cipher.is_some() && data_end != DATA_START;
        Ok(())
    }

    /// Writes the packed size and checksum into the buffer's header.
    fn write_header(&mut self) {
        let data_size = (self.data_end - DATA_START) as u32;
        let packed = data_size | if self.encrypted { ENCRYPTED_FLAG } else { 0 };
        self.buffer.hb[0..4].copy_from_slice(&packed.to_le_bytes());
        self.buffer.hb[4..12].copy_from_slice(&self.checksum.to_le_bytes());
    }

    /// Flushes the header and a dirty range to the backing, best-effort.
    fn commit(&mut self, dirty: Range<usize>) {
        if self.scratch {
            return;
        }
        if let Err(error) = self.backing.commit(&self.buffer.hb, dirty) {
            log::error!("failed to flush {}: {error}", self.backing.describe());
        }
    }

    /// The key bytes as stored on disk: the UTF-8 key, encrypted when a
    /// cipher is active.
    fn encode_key(&self, key: &str) -> Result<Vec<u8>> {
        let bytes = match self.active_cipher() {
            Some(c) => c.encrypt(key.as_bytes()),
            None => key.as_bytes().to_vec(),
        };
        if bytes.is_empty() || bytes.len() > KEY_LIMIT {
            return errinput!("key length {} outside 1..={KEY_LIMIT}", bytes.len());
        }
        Ok(bytes)
    }

    /// Grows the buffer (and backing) to fit `additional` appended bytes.
    fn ensure_size(&mut self, additional: usize) -> Result<()> {
        let required = self.data_end + additional;
        if required <= self.buffer.capacity() {
            return Ok(());
        }
        let capacity = new_capacity(self.buffer.capacity(), required)?;
        self.buffer.hb.resize(capacity, 0);
        if let Err(error) = self.backing.ensure_capacity(capacity) {
            log::error!("failed to grow {}: {error}", self.backing.describe());
        }
        Ok(())
    }

    /// XORs the bytes of `range` out of and back into the checksum around
    /// an in-place overwrite. Call with the fold of the range before the
    /// write, then the fold after.
    fn apply_checksum_delta(&mut self, range: &Range<usize>, before: u64, after: u64) {
        self.checksum ^= shift_checksum(before ^ after, range.start - DATA_START);
    }

    fn put_fixed(&mut self, key: &str, value: Fixed) -> Result<()> {
        if key.is_empty() {
            return errinput!("key must not be empty");
        }
        let mut tombstoned = false;
        if let Some(entry) = self.index.get(key) {
            if entry.data_type() == value.data_type() {
                if value.equals(entry) {
                    return Ok(());
                }
                // Same size: overwrite the value bytes in place.
                let offset = entry.offset();
                let bytes = value.encode(self.active_cipher());
                let range = offset..offset + bytes.len();
                let before = self.buffer.fold_range(range.start, range.end);
                self.buffer.hb[range.clone()].copy_from_slice(&bytes);
                let after = self.buffer.fold_range(range.start, range.end);
                self.apply_checksum_delta(&range, before, after);
                self.index.insert(key.to_string(), value.entry(offset));
                self.write_header();
                self.commit(range);
                return Ok(());
            }
            // The key changed type: tombstone and reappend.
            self.tombstone_key(key)?;
            tombstoned = true;
        }

        let key_bytes = self.encode_key(key)?;
        let cipher = self.active_cipher().cloned();
        self.ensure_size(2 + key_bytes.len() + TYPE_SIZE[value.data_type() as usize])?;
        let start = self.data_end;
        self.buffer.position = start;
        self.buffer.put_u8(value.data_type() as u8);
        self.buffer.put_u8(key_bytes.len() as u8);
        self.buffer.put_bytes(&key_bytes);
        let offset = self.buffer.position;
        value.write_to(&mut self.buffer, cipher.as_ref());
        let end = self.buffer.position;
        self.checksum ^= shift_checksum(self.buffer.fold_range(start, end), start - DATA_START);
        self.data_end = end;
        self.index.insert(key.to_string(), value.entry(offset));
        self.write_header();
        self.commit(start..end);
        if tombstoned {
            self.check_gc();
        }
        Ok(())
    }

    fn put_string(&mut self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() {
            return errinput!("key must not be empty");
        }
        if let Some(Entry::Str { value: VarValue::Inline(old), .. }) = self.index.get(key) {
            if old == value {
                return Ok(());
            }
        }
        let stored: Cow<[u8]> = match self.active_cipher() {
            Some(c) => Cow::Owned(c.encrypt(value.as_bytes())),
            None => Cow::Borrowed(value.as_bytes()),
        };
        if stored.len() >= self.internal_limit {
            let cached = BigValue::Str(Arc::new(value.to_string()));
            self.put_external(key, DataType::String, Arc::new(stored.into_owned()), cached)
        } else {
            let value = value.to_string();
            self.put_inline(key, DataType::String, &stored, move |var| Entry::Str {
                var,
                value: VarValue::Inline(value),
            })
        }
    }

    fn put_array(&mut self, key: &str, value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return errinput!("key must not be empty");
        }
        if let Some(Entry::Array { value: VarValue::Inline(old), .. }) = self.index.get(key) {
            if old.as_slice() == value {
                return Ok(());
            }
        }
        let stored: Cow<[u8]> = match self.active_cipher() {
            Some(c) => Cow::Owned(c.encrypt(value)),
            None => Cow::Borrowed(value),
        };
        if stored.len() >= self.internal_limit {
            let cached = BigValue::Bytes(Arc::new(value.to_vec()));
            self.put_external(key, DataType::Array, Arc::new(stored.into_owned()), cached)
        } else {
            let value = Arc::new(value.to_vec());
            self.put_inline(key, DataType::Array, &stored, move |var| Entry::Array {
                var,
                value: VarValue::Inline(value),
            })
        }
    }

    fn put_object_value(&mut self, key: &str, value: ObjectValue) -> Result<()> {
        if key.is_empty() {
            return errinput!("key must not be empty");
        }
        let Some(encoder) = self.encoders.get(&value.tag).cloned() else {
            return errinput!("no encoder registered for tag {}", value.tag);
        };
        let encoded = match encoder.encode_value(value.value.as_ref()) {
            Ok(encoded) => encoded,
            // A failed encode degrades the put to a remove.
            Err(error) => {
                log::error!("failed to encode object for key {key}: {error}");
                return self.remove_key(key);
            }
        };
        if value.tag.len() > u8::MAX as usize {
            return errinput!("encoder tag {} exceeds 255 bytes", value.tag);
        }
        let mut payload = Vec::with_capacity(1 + value.tag.len() + encoded.len());
        payload.push(value.tag.len() as u8);
        payload.extend_from_slice(value.tag.as_bytes());
        payload.extend_from_slice(&encoded);

        let stored: Cow<[u8]> = match self.active_cipher() {
            Some(c) => Cow::Owned(c.encrypt(&payload)),
            None => Cow::Borrowed(&payload),
        };
        if stored.len() >= self.internal_limit {
            let cached = BigValue::Object(value.clone());
            let stored = Arc::new(stored.into_owned());
            self.put_external(key, DataType::Object, stored, cached)
        } else {
            let stored = stored.into_owned();
            self.put_inline(key, DataType::Object, &stored, move |var| Entry::Object {
                var,
                value: VarValue::Inline(value),
            })
        }
    }

    /// Writes a variable record with an inline value payload.
    fn put_inline(
        &mut self,
        key: &str,
        data_type: DataType,
        stored: &[u8],
        make_entry: impl FnOnce(Var) -> Entry,
    ) -> Result<()> {
        if stored.len() > VALUE_LIMIT {
            return errinput!("value of {} bytes exceeds the inline limit", stored.len());
        }
        let mut tombstoned = false;
        if let Some(entry) = self.index.get(key) {
            let same_shape = entry.data_type() == data_type
                && entry.var().is_some_and(|var| !var.external && var.len == stored.len());
            if same_shape {
                let var = *entry.var().expect("variable entry");
                let range = var.offset..var.offset + var.len;
                let before = self.buffer.fold_range(range.start, range.end);
                self.buffer.hb[range.clone()].copy_from_slice(stored);
                let after = self.buffer.fold_range(range.start, range.end);
                self.apply_checksum_delta(&range, before, after);
                self.value_cache.remove(key);
                self.index.insert(key.to_string(), make_entry(var));
                self.write_header();
                self.commit(range);
                return Ok(());
            }
            self.tombstone_key(key)?;
            tombstoned = true;
        }

        let var = self.append_var(key, data_type, stored, false)?;
        self.index.insert(key.to_string(), make_entry(var));
        self.commit(var.start..var.end());
        if tombstoned {
            self.check_gc();
        }
        Ok(())
    }

    /// Spills a large value to a fresh sidecar file and records its name.
    fn put_external(
        &mut self,
        key: &str,
        data_type: DataType,
        raw: Arc<Vec<u8>>,
        cached: BigValue,
    ) -> Result<()> {
        if raw.len() >= DATA_SIZE_LIMIT {
            return errinput!("value of {} bytes exceeds the 256 MiB limit", raw.len());
        }
        let name: String =
            rand::thread_rng().sample_iter(&Alphanumeric).take(NAME_SIZE).map(char::from).collect();

        let mut tombstoned = false;
        let mut old_name = None;
        let var = match self.index.get(key) {
            // An external record of the same type has identical layout:
            // overwrite the name in place.
            Some(entry)
                if entry.data_type() == data_type
                    && entry.var().is_some_and(|var| var.external) =>
            {
                old_name = entry.external_name().map(str::to_string);
                let var = *entry.var().expect("variable entry");
                let range = var.offset..var.offset + var.len;
                let before = self.buffer.fold_range(range.start, range.end);
                self.buffer.hb[range.clone()].copy_from_slice(name.as_bytes());
                let after = self.buffer.fold_range(range.start, range.end);
                self.apply_checksum_delta(&range, before, after);
                self.write_header();
                self.commit(range);
                var
            }
            Some(_) => {
                self.tombstone_key(key)?;
                tombstoned = true;
                let var = self.append_var(key, data_type, name.as_bytes(), true)?;
                self.commit(var.start..var.end());
                var
            }
            None => {
                let var = self.append_var(key, data_type, name.as_bytes(), true)?;
                self.commit(var.start..var.end());
                var
            }
        };

        let entry = match data_type {
            DataType::String => Entry::Str { var, value: VarValue::External(name.clone()) },
            DataType::Array => Entry::Array { var, value: VarValue::External(name.clone()) },
            _ => Entry::Object { var, value: VarValue::External(name.clone()) },
        };
        self.index.insert(key.to_string(), entry);

        let path = self.blob_dir.join(&name);
        if self.scratch {
            // The rewrite engine needs its sidecars on disk before the
            // swap, so it writes them inline.
            fs::create_dir_all(&self.blob_dir)?;
            fs::write(&path, raw.as_slice())?;
        } else {
            self.blob_cache.put(name, Arc::clone(&raw));
            self.value_cache.put(key.to_string(), cached);
            if let Some(old) = &old_name {
                self.blob_cache.remove(old);
            }
            let old_path = old_name.map(|old| self.blob_dir.join(old));
            match self.writer() {
                Ok(writer) => {
                    writer.submit(key, Job::Write { path, bytes: raw });
                    // Delete the replaced sidecar only after the new one
                    // lands; the jobs share the key's serialization tag.
                    if let Some(old_path) = old_path {
                        writer.submit(key, Job::Remove { path: old_path });
                    }
                }
                Err(error) => log::error!("failed to start sidecar writer: {error}"),
            }
        }
        if tombstoned {
            self.check_gc();
        }
        Ok(())
    }

    /// Appends a variable record at the data end and returns its
    /// geometry. The caller commits the range and indexes the entry.
    fn append_var(
        &mut self,
        key: &str,
        data_type: DataType,
        stored: &[u8],
        external: bool,
    ) -> Result<Var> {
        let key_bytes = self.encode_key(key)?;
        self.ensure_size(2 + key_bytes.len() + 2 + stored.len())?;
        let start = self.data_end;
        self.buffer.position = start;
        let info = data_type as u8 | if external { EXTERNAL_MASK } else { 0 };
        self.buffer.put_u8(info);
        self.buffer.put_u8(key_bytes.len() as u8);
        self.buffer.put_bytes(&key_bytes);
        self.buffer.put_u16(stored.len() as u16);
        let offset = self.buffer.position;
        self.buffer.put_bytes(stored);
        let end = self.buffer.position;
        self.checksum ^= shift_checksum(self.buffer.fold_range(start, end), start - DATA_START);
        self.data_end = end;
        self.write_header();
        Ok(Var { start, offset, len: stored.len(), external })
    }

    /// Tombstones the key's record and drops it from the index. The
    /// record's bytes are counted as invalid; an external value's sidecar
    /// is scheduled for deletion.
    fn tombstone_key(&mut self, key: &str) -> Result<()> {
        let Some(entry) = self.index.remove(key) else {
            return Ok(());
        };
        let (start, end) = match entry.var() {
            Some(var) => (var.start, var.end()),
            None => {
                let key_size = self.encode_key(key)?.len();
                let offset = entry.offset();
                (offset - 2 - key_size, offset + TYPE_SIZE[entry.data_type() as usize])
            }
        };
        let before = self.buffer.fold_range(start, start + 1);
        self.buffer.hb[start] |= DELETE_MASK;
        let after = self.buffer.fold_range(start, start + 1);
        self.apply_checksum_delta(&(start..start + 1), before, after);
        self.invalids.count(start, end);
        self.value_cache.remove(key);
        if let Some(name) = entry.external_name() {
            self.blob_cache.remove(name);
            let path = self.blob_dir.join(name);
            match self.writer() {
                Ok(writer) => writer.submit(key, Job::Remove { path }),
                Err(error) => log::error!("failed to start sidecar writer: {error}"),
            }
        }
        self.write_header();
        self.commit(start..start + 1);
        Ok(())
    }

    fn remove_key(&mut self, key: &str) -> Result<()> {
        self.tombstone_key(key)?;
        self.check_gc();
        Ok(())
    }

    fn clear(&mut self) {
        if let Some(writer) = &self.writer {
            writer.wait_idle();
        }
        self.index.clear();
        self.invalids.clear();
        self.blob_cache.clear();
        self.value_cache.clear();
        self.buffer = Buffer::new(PAGE_SIZE);
        self.data_end = DATA_START;
        self.checksum = 0;
        self.write_header();
        if let Err(error) = self.backing.truncate(PAGE_SIZE, &self.buffer.hb, self.data_end) {
            log::error!("failed to truncate {}: {error}", self.backing.describe());
        }
        if let Err(error) = self.backing.rewrite(&self.buffer.hb, self.data_end) {
            log::error!("failed to reset {}: {error}", self.backing.describe());
        }
        if let Err(error) = fs::remove_dir_all(&self.blob_dir) {
            if error.kind() != std::io::ErrorKind::NotFound {
                log::error!("failed to remove sidecar directory: {error}");
            }
        }
    }

    fn check_gc(&mut self) {
        if self.invalids.should_gc(self.data_end) {
            self.gc();
        }
    }

    /// Compacts the log in place: merges the tombstoned segments, shifts
    /// every live byte range down over them, relocates index offsets via
    /// a binary-searched relocation table, and rebuilds the checksum by
    /// rotating each moved region's fold to its new alignment.
    fn gc(&mut self) {
        if self.invalids.is_empty() {
            return;
        }
        self.invalids.merge();
        let segments = self.invalids.segments().to_vec();
        let reclaimed = self.invalids.bytes();
        let first_start = segments[0].start;
        let old_end = self.data_end;

        // (source, shift): live bytes at or beyond `source` move left by
        // `shift`, the cumulative size of the tombstones before them.
        let mut table = Vec::with_capacity(segments.len());
        let mut shift = 0;
        for (i, segment) in segments.iter().enumerate() {
            let dead = self.buffer.fold_range(segment.start, segment.end);
            self.checksum ^= shift_checksum(dead, segment.start - DATA_START);
            shift += segment.end - segment.start;
            table.push((segment.end, shift));

            let run_end = segments.get(i + 1).map_or(old_end, |next| next.start);
            if run_end > segment.end {
                let live = self.buffer.fold_range(segment.end, run_end);
                let new_start = segment.end - shift;
                self.checksum ^= shift_checksum(live, segment.end - DATA_START)
                    ^ shift_checksum(live, new_start - DATA_START);
                self.buffer.hb.copy_within(segment.end..run_end, new_start);
            }
        }

        self.data_end = old_end - shift;
        for entry in self.index.values_mut() {
            let anchor = entry.var().map_or(entry.offset(), |var| var.start);
            if anchor > first_start {
                let i = table.partition_point(|(source, _)| *source <= anchor);
                if i > 0 {
                    entry.relocate(table[i - 1].1);
                }
            }
        }
        self.invalids.clear();
        self.write_header();
        self.commit(first_start..old_end);
        log::info!("gc finish, reclaimed {reclaimed} bytes in {}", self.backing.describe());
        self.check_truncate();
    }

    /// Shrinks the backing once enough spare capacity sits beyond the
    /// data end.
    fn check_truncate(&mut self) {
        let capacity = self.buffer.capacity();
        if capacity.saturating_sub(self.data_end) < crate::io::TRUNCATE_THRESHOLD {
            return;
        }
        let Ok(target) = new_capacity(PAGE_SIZE, self.data_end) else {
            return;
        };
        if target >= capacity {
            return;
        }
        self.buffer.hb.truncate(target);
        if let Err(error) = self.backing.truncate(target, &self.buffer.hb, self.data_end) {
            log::error!("failed to truncate {}: {error}", self.backing.describe());
        }
        log::info!("truncate finish, capacity {target} bytes in {}", self.backing.describe());
    }

    fn get_string(&mut self, key: &str) -> Option<String> {
        match self.index.get(key) {
            Some(Entry::Str { value: VarValue::Inline(value), .. }) => Some(value.clone()),
            Some(Entry::Str { value: VarValue::External(name), .. }) => {
                let name = name.clone();
                if let Some(BigValue::Str(value)) = self.value_cache.get(key) {
                    return Some((*value).clone());
                }
                let plain = self.read_blob_or_remove(key, &name)?;
                match String::from_utf8(plain) {
                    Ok(value) => {
                        self.value_cache
                            .put(key.to_string(), BigValue::Str(Arc::new(value.clone())));
                        Some(value)
                    }
                    Err(error) => {
                        log::warn!("sidecar {name} for key {key} is not UTF-8: {error}");
                        None
                    }
                }
            }
            _ => None,
        }
    }

    fn get_array(&mut self, key: &str) -> Option<Vec<u8>> {
        match self.index.get(key) {
            Some(Entry::Array { value: VarValue::Inline(value), .. }) => Some((**value).clone()),
            Some(Entry::Array { value: VarValue::External(name), .. }) => {
                let name = name.clone();
                if let Some(BigValue::Bytes(value)) = self.value_cache.get(key) {
                    return Some((*value).clone());
                }
                let plain = self.read_blob_or_remove(key, &name)?;
                self.value_cache.put(key.to_string(), BigValue::Bytes(Arc::new(plain.clone())));
                Some(plain)
            }
            _ => None,
        }
    }

    fn get_object_value(&mut self, key: &str) -> Option<ObjectValue> {
        match self.index.get(key) {
            Some(Entry::Object { value: VarValue::Inline(value), .. }) => Some(value.clone()),
            Some(Entry::Object { value: VarValue::External(name), .. }) => {
                let name = name.clone();
                if let Some(BigValue::Object(value)) = self.value_cache.get(key) {
                    return Some(value);
                }
                let plain = self.read_blob_or_remove(key, &name)?;
                match Self::decode_object_payload(&self.encoders, &plain) {
                    Ok(value) => {
                        self.value_cache.put(key.to_string(), BigValue::Object(value.clone()));
                        Some(value)
                    }
                    // A value that no longer decodes is unreachable;
                    // drop it from the index but leave the record alone.
                    Err(error) => {
                        log::warn!("failed to decode object for key {key}: {error}");
                        self.index.remove(key);
                        None
                    }
                }
            }
            _ => None,
        }
    }

    /// Reads and decrypts an external value's bytes: from the blob cache,
    /// from the pending writer queue, or from the sidecar file. A missing
    /// or empty value removes the key.
    fn read_blob_or_remove(&mut self, key: &str, name: &str) -> Option<Vec<u8>> {
        let raw = self
            .blob_cache
            .get(name)
            .or_else(|| self.writer.as_ref().and_then(|w| w.pending_write(key)))
            .map(|bytes| (*bytes).clone())
            .or_else(|| match fs::read(self.blob_dir.join(name)) {
                Ok(bytes) => Some(bytes),
                Err(error) => {
                    log::warn!("failed to read sidecar {name} for key {key}: {error}");
                    None
                }
            });
        let plain = raw.map(|raw| match self.active_cipher() {
            Some(c) => c.decrypt(&raw),
            None => raw,
        });
        match plain {
            Some(plain) if !plain.is_empty() => Some(plain),
            _ => {
                if let Err(error) = self.remove_key(key) {
                    log::error!("failed to remove dangling key {key}: {error}");
                }
                None
            }
        }
    }

    /// Splits an OBJECT payload `{tag size, tag, encoded}` and decodes it
    /// with the registered encoder.
    fn decode_object_payload(
        encoders: &HashMap<String, Arc<dyn ErasedEncoder>>,
        plain: &[u8],
    ) -> Result<ObjectValue> {
        if plain.is_empty() {
            return errdata!("empty object payload");
        }
        let tag_size = plain[0] as usize;
        if 1 + tag_size > plain.len() {
            return errdata!("object tag extends beyond payload");
        }
        let Ok(tag) = std::str::from_utf8(&plain[1..1 + tag_size]) else {
            return errdata!("object tag is not UTF-8");
        };
        let Some(encoder) = encoders.get(tag) else {
            return errinput!("no encoder registered for tag {tag}");
        };
        let value = encoder.decode_value(&plain[1 + tag_size..])?;
        Ok(ObjectValue { tag: tag.to_string(), value })
    }

    fn get_all(&mut self) -> HashMap<String, Value> {
        let keys: Vec<String> = self.index.keys().cloned().collect();
        let mut all = HashMap::with_capacity(keys.len());
        for key in keys {
            let Some(entry) = self.index.get(&key).cloned() else {
                continue;
            };
            let value = match entry {
                Entry::Bool { value, .. } => Some(Value::Bool(value)),
                Entry::Int { value, .. } => Some(Value::Int(value)),
                Entry::Float { value, .. } => Some(Value::Float(value)),
                Entry::Long { value, .. } => Some(Value::Long(value)),
                Entry::Double { value, .. } => Some(Value::Double(value)),
                Entry::Str { .. } => self.get_string(&key).map(Value::String),
                Entry::Array { .. } => self.get_array(&key).map(Value::Array),
                Entry::Object { .. } => self.get_object_value(&key).map(|object| {
                    match object.value.clone().downcast::<HashSet<String>>() {
                        Ok(set) if object.tag == STRING_SET_TAG => Value::StringSet((*set).clone()),
                        _ => Value::Object { tag: object.tag, value: object.value },
                    }
                }),
            };
            if let Some(value) = value {
                all.insert(key, value);
            }
        }
        all
    }

    fn put_all(&mut self, values: HashMap<String, Value>) -> Result<()> {
        for (key, value) in values {
            match value {
                Value::Bool(v) => self.put_fixed(&key, Fixed::Bool(v))?,
                Value::Int(v) => self.put_fixed(&key, Fixed::Int(v))?,
                Value::Float(v) => self.put_fixed(&key, Fixed::Float(v))?,
                Value::Long(v) => self.put_fixed(&key, Fixed::Long(v))?,
                Value::Double(v) => self.put_fixed(&key, Fixed::Double(v))?,
                Value::String(v) => self.put_string(&key, &v)?,
                Value::Array(v) => self.put_array(&key, &v)?,
                Value::StringSet(v) => self.put_object_value(
                    &key,
                    ObjectValue { tag: STRING_SET_TAG.to_string(), value: Arc::new(v) },
                )?,
                Value::Object { tag, value } => {
                    self.put_object_value(&key, ObjectValue { tag, value })?
                }
            }
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(writer) = &self.writer {
            writer.wait_idle();
        }
        Ok(self.backing.sync()?)
    }

    fn writer(&mut self) -> Result<&BlobWriter> {
        if self.writer.is_none() {
            self.writer = Some(BlobWriter::new()?);
        }
        Ok(self.writer.as_ref().expect("writer initialized"))
    }

    /// Rewrites the whole log through a transient engine to introduce
    /// encryption over an existing unencrypted store.
    fn rewrite_encrypted(&mut self) -> Result<()> {
        let Some(cipher) = self.cipher.clone() else {
            return Ok(());
        };
        log::info!("Rewriting {} to introduce encryption", self.name);
        let temp_name = format!("temp_{}", self.name);
        let old_externals: Vec<String> = self
            .index
            .values()
            .filter_map(|entry| entry.external_name().map(str::to_string))
            .collect();

        let opened = Backing::open(&self.dir, &temp_name, Mode::SyncBlocking)?;
        let mut temp = Core {
            dir: self.dir.clone(),
            blob_dir: self.dir.join(&temp_name),
            name: temp_name.clone(),
            mode: Mode::SyncBlocking,
            backing: opened.backing,
            buffer: Buffer::new(PAGE_SIZE),
            data_end: DATA_START,
            checksum: 0,
            index: HashMap::new(),
            invalids: Invalids::default(),
            encrypted: true,
            cipher: Some(cipher),
            encoders: self.encoders.clone(),
            blob_cache: BlobCache::new(),
            value_cache: ValueCache::new(),
            writer: None,
            internal_limit: self.internal_limit,
            need_rewrite: false,
            scratch: true,
        };
        temp.write_header();

        let keys: Vec<String> = self.index.keys().cloned().collect();
        for key in keys {
            let Some(entry) = self.index.get(&key).cloned() else {
                continue;
            };
            match entry {
                Entry::Bool { value, .. } => temp.put_fixed(&key, Fixed::Bool(value))?,
                Entry::Int { value, .. } => temp.put_fixed(&key, Fixed::Int(value))?,
                Entry::Float { value, .. } => temp.put_fixed(&key, Fixed::Float(value))?,
                Entry::Long { value, .. } => temp.put_fixed(&key, Fixed::Long(value))?,
                Entry::Double { value, .. } => temp.put_fixed(&key, Fixed::Double(value))?,
                Entry::Str { value: VarValue::Inline(value), .. } => {
                    temp.put_string(&key, &value)?
                }
                Entry::Array { value: VarValue::Inline(value), .. } => {
                    temp.put_array(&key, &value)?
                }
                Entry::Object { value: VarValue::Inline(value), .. } => {
                    temp.put_object_value(&key, value)?
                }
                Entry::Str { .. } => {
                    if let Some(value) = self.get_string(&key) {
                        temp.put_string(&key, &value)?;
                    }
                }
                Entry::Array { .. } => {
                    if let Some(value) = self.get_array(&key) {
                        temp.put_array(&key, &value)?;
                    }
                }
                Entry::Object { .. } => {
                    if let Some(value) = self.get_object_value(&key) {
                        temp.put_object_value(&key, value)?;
                    }
                }
            }
        }
        temp.backing.rewrite(&temp.buffer.hb, temp.data_end)?;

        // Adopt the rewritten state and write it over the main files.
        self.buffer = std::mem::replace(&mut temp.buffer, Buffer::new(0));
        self.data_end = temp.data_end;
        self.checksum = temp.checksum;
        self.index = std::mem::take(&mut temp.index);
        self.invalids = std::mem::take(&mut temp.invalids);
        self.blob_cache.clear();
        self.value_cache.clear();
        self.need_rewrite = false;
        self.encrypted = true;
        self.backing.ensure_capacity(self.buffer.capacity())?;
        self.backing.rewrite(&self.buffer.hb, self.data_end)?;
        drop(temp);

        // Move the rewritten sidecars into place, then drop the old ones
        // and the transient workspace.
        let temp_dir = self.dir.join(&temp_name);
        if temp_dir.is_dir() {
            fs::create_dir_all(&self.blob_dir)?;
            for dir_entry in fs::read_dir(&temp_dir)? {
                let dir_entry = dir_entry?;
                fs::rename(dir_entry.path(), self.blob_dir.join(dir_entry.file_name()))?;
            }
        }
        for name in old_externals {
            let _ = fs::remove_file(self.blob_dir.join(name));
        }
        Self::clean_leftovers(&self.dir, &self.name);
        log::info!("rewrite finish, {} keys encrypted in {}", self.index.len(), self.name);
        Ok(())
    }
}

/// Flush the image and pending sidecars when the store is closed.
impl Drop for Core {
    fn drop(&mut self) {
        if self.scratch {
            return;
        }
        if let Err(error) = self.sync() {
            log::error!("failed to flush {}: {error}", self.backing.describe());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::XorCipher;
    use crate::error::Error;
    use paste::paste;
    use serde::{Deserialize, Serialize};
    use std::fs::OpenOptions;
    use test_case::test_case;

    fn open(dir: &Path, mode: Mode) -> Result<Store> {
        Options::new(dir, "db").mode(mode).open()
    }

    /// Recomputes the checksum over the payload and compares it to the
    /// incrementally maintained one.
    fn checksum_ok(store: &Store) -> bool {
        store.with_core(|core| core.buffer.fold_range(DATA_START, core.data_end) == core.checksum)
    }

    fn cipher() -> XorCipher {
        XorCipher::new(b"test key")
    }

    fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|window| window == needle)
    }

    #[test_case(Mode::NonSync)]
    #[test_case(Mode::DualFile)]
    #[test_case(Mode::SyncBlocking)]
    fn put_survives_reopen(mode: Mode) -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), mode)?;
        store.put_int("n", 42)?;
        drop(store);

        let store = open(dir.path(), mode)?;
        assert_eq!(store.get_int("n").unwrap_or(0), 42);
        Ok(())
    }

    /// Tests that exclusive locks are taken out on the image files,
    /// erroring if held, and released when the store is closed.
    #[test]
    fn lock() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        assert!(open(dir.path(), Mode::DualFile).is_err());
        drop(store);
        assert!(open(dir.path(), Mode::DualFile).is_ok());
        Ok(())
    }

    macro_rules! test_round_trip {
        ($( $name:ident: $put:ident / $get:ident => $value:expr, )*) => {
            paste! {
                $(
                    #[test]
                    fn [<round_trip_ $name>]() -> Result<()> {
                        let dir = tempfile::TempDir::with_prefix("kvlite")?;
                        let store = open(dir.path(), Mode::DualFile)?;
                        store.$put("k", $value)?;
                        assert_eq!(store.$get("k"), Some($value));
                        drop(store);

                        let store = open(dir.path(), Mode::DualFile)?;
                        assert_eq!(store.$get("k"), Some($value));
                        Ok(())
                    }
                )*
            }
        };
    }

    test_round_trip! {
        bool: put_bool / get_bool => true,
        int: put_int / get_int => -123_456,
        long: put_long / get_long => i64::MIN + 1,
        float: put_float / get_float => 1.5f32,
        double: put_double / get_double => -2.25f64,
    }

    /// Floats are stored by bit pattern, so NaN payloads survive intact.
    #[test]
    fn round_trip_nan_bits() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        store.put_float("f", f32::from_bits(0x7fc0_1234))?;
        store.put_double("d", f64::from_bits(0x7ff8_0000_0000_cafe))?;
        drop(store);

        let store = open(dir.path(), Mode::DualFile)?;
        assert_eq!(store.get_float("f").map(f32::to_bits), Some(0x7fc0_1234));
        assert_eq!(store.get_double("d").map(f64::to_bits), Some(0x7ff8_0000_0000_cafe));
        Ok(())
    }

    #[test]
    fn round_trip_string_and_array() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        store.put_string("s", "héllo wörld")?;
        store.put_string("empty", "")?;
        store.put_array("a", &[0, 1, 2, 254, 255])?;
        store.put_array("a0", &[])?;
        drop(store);

        let store = open(dir.path(), Mode::DualFile)?;
        assert_eq!(store.get_string("s").as_deref(), Some("héllo wörld"));
        assert_eq!(store.get_string("empty").as_deref(), Some(""));
        assert_eq!(store.get_array("a"), Some(vec![0, 1, 2, 254, 255]));
        assert_eq!(store.get_array("a0"), Some(vec![]));
        Ok(())
    }

    #[test]
    fn round_trip_string_set() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let set: HashSet<String> = ["red", "green", "blue"].iter().map(|s| s.to_string()).collect();
        let store = open(dir.path(), Mode::DualFile)?;
        store.put_string_set("colors", set.clone())?;
        assert_eq!(store.get_string_set("colors"), Some(set.clone()));
        drop(store);

        let store = open(dir.path(), Mode::DualFile)?;
        assert_eq!(store.get_string_set("colors"), Some(set));
        Ok(())
    }

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        age: u32,
    }

    fn profile_options(dir: &Path) -> Options {
        Options::new(dir, "db").encoder(crate::encoder::BincodeEncoder::<Profile>::new("Profile"))
    }

    #[test]
    fn round_trip_object() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let profile = Profile { name: "ada".to_string(), age: 36 };
        let store = profile_options(dir.path()).open()?;
        store.put_object("p", profile.clone(), "Profile")?;
        assert_eq!(store.get_object::<Profile>("p").as_deref(), Some(&profile));
        drop(store);

        let store = profile_options(dir.path()).open()?;
        assert_eq!(store.get_object::<Profile>("p").as_deref(), Some(&profile));
        Ok(())
    }

    #[test]
    fn put_object_without_encoder_is_rejected() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        let result = store.put_object("p", Profile { name: "ada".to_string(), age: 36 }, "Nope");
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        Ok(())
    }

    /// A record whose encoder is not registered stays on disk untouched:
    /// it is invisible until an open registers the encoder again.
    #[test]
    fn object_without_encoder_is_preserved_on_disk() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let profile = Profile { name: "ada".to_string(), age: 36 };
        let store = profile_options(dir.path()).open()?;
        store.put_object("p", profile.clone(), "Profile")?;
        store.put_int("n", 7)?;
        drop(store);

        // Without the encoder the key is absent but other keys work.
        let store = open(dir.path(), Mode::DualFile)?;
        assert!(!store.contains("p"));
        assert_eq!(store.get_object::<Profile>("p"), None);
        assert_eq!(store.get_int("n"), Some(7));
        drop(store);

        // Registering the encoder again brings the value back.
        let store = profile_options(dir.path()).open()?;
        assert_eq!(store.get_object::<Profile>("p").as_deref(), Some(&profile));
        Ok(())
    }

    #[test]
    fn empty_key_is_rejected() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        assert!(matches!(store.put_int("", 1), Err(Error::InvalidInput(_))));
        assert!(matches!(store.put_string("", "v"), Err(Error::InvalidInput(_))));
        Ok(())
    }

    #[test]
    fn oversize_key_is_rejected() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        let ok = "k".repeat(255);
        let too_long = "k".repeat(256);
        store.put_int(&ok, 1)?;
        assert_eq!(store.get_int(&ok), Some(1));
        assert!(matches!(store.put_int(&too_long, 1), Err(Error::InvalidInput(_))));
        Ok(())
    }

    /// Overwriting a string with one of a different size tombstones the
    /// old record and appends a new one.
    #[test]
    fn different_size_update_tombstones() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        store.put_string("s", "hello")?;
        // info(1) + key size(1) + key(1) + value size(2) + value(5)
        store.with_core(|core| {
            assert_eq!(core.data_end, DATA_START + 10);
            assert_eq!(core.invalids.bytes(), 0);
        });

        store.put_string("s", "hi")?;
        store.with_core(|core| {
            assert_eq!(core.data_end, DATA_START + 10 + 7);
            assert_eq!(core.invalids.bytes(), 10);
            assert_eq!(core.invalids.len(), 1);
            assert_eq!(core.buffer.hb[DATA_START] & DELETE_MASK, DELETE_MASK);
        });
        assert!(checksum_ok(&store));
        drop(store);

        let store = open(dir.path(), Mode::DualFile)?;
        assert_eq!(store.get_string("s").as_deref(), Some("hi"));
        store.with_core(|core| assert_eq!(core.invalids.bytes(), 10));
        Ok(())
    }

    /// A same-size overwrite mutates the record value in place.
    #[test]
    fn same_size_update_is_in_place() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        store.put_string("s", "aaaa")?;
        let end = store.with_core(|core| core.data_end);
        store.put_string("s", "bbbb")?;
        store.with_core(|core| {
            assert_eq!(core.data_end, end);
            assert_eq!(core.invalids.bytes(), 0);
        });
        assert!(checksum_ok(&store));
        assert_eq!(store.get_string("s").as_deref(), Some("bbbb"));
        drop(store);

        let store = open(dir.path(), Mode::DualFile)?;
        assert_eq!(store.get_string("s").as_deref(), Some("bbbb"));
        Ok(())
    }

    /// Re-putting the current value is a no-op.
    #[test]
    fn same_value_put_is_a_noop() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        store.put_int("n", 7)?;
        store.put_string("s", "value")?;
        let (end, checksum) = store.with_core(|core| (core.data_end, core.checksum));

        store.put_int("n", 7)?;
        store.put_string("s", "value")?;
        store.with_core(|core| {
            assert_eq!(core.data_end, end);
            assert_eq!(core.checksum, checksum);
            assert_eq!(core.invalids.bytes(), 0);
        });
        Ok(())
    }

    /// A put under a key holding a different type replaces it.
    #[test]
    fn put_changes_type() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        store.put_int("k", 7)?;
        store.put_string("k", "seven")?;
        assert_eq!(store.get_int("k"), None);
        assert_eq!(store.get_string("k").as_deref(), Some("seven"));
        store.with_core(|core| assert!(core.invalids.bytes() > 0));
        assert!(checksum_ok(&store));
        drop(store);

        let store = open(dir.path(), Mode::DualFile)?;
        assert_eq!(store.get_string("k").as_deref(), Some("seven"));
        Ok(())
    }

    #[test]
    fn remove_and_contains() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        store.put_int("n", 1)?;
        assert!(store.contains("n"));

        store.remove("n")?;
        assert!(!store.contains("n"));
        assert_eq!(store.get_int("n"), None);
        store.remove("n")?; // removing a missing key is fine
        drop(store);

        let store = open(dir.path(), Mode::DualFile)?;
        assert!(!store.contains("n"));
        Ok(())
    }

    #[test]
    fn checksum_tracks_every_mutation() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        store.put_int("n", 1)?;
        assert!(checksum_ok(&store));
        store.put_int("n", 2)?;
        assert!(checksum_ok(&store));
        store.put_string("s", "abc")?;
        assert!(checksum_ok(&store));
        store.put_string("s", "defg")?;
        assert!(checksum_ok(&store));
        store.put_bool("s", true)?;
        assert!(checksum_ok(&store));
        store.remove("n")?;
        assert!(checksum_ok(&store));
        store.put_array("a", &[1, 2, 3])?;
        assert!(checksum_ok(&store));
        Ok(())
    }

    /// Removing at least BASE_GC_KEYS_THRESHOLD small records triggers a
    /// collection by tombstone count.
    #[test]
    fn gc_triggers_on_tombstone_count() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        // Records of 11 bytes: info + key size + 8-byte key + boolean.
        for i in 0..100 {
            store.put_bool(&format!("flag-{i:03}"), true)?;
        }
        for i in 0..79 {
            store.remove(&format!("flag-{i:03}"))?;
        }
        store.with_core(|core| assert_eq!(core.invalids.len(), 79));

        store.remove("flag-079")?;
        store.with_core(|core| {
            assert!(core.invalids.is_empty());
            assert_eq!(core.data_end, DATA_START + 20 * 11);
        });
        assert!(checksum_ok(&store));
        for i in 80..100 {
            assert_eq!(store.get_bool(&format!("flag-{i:03}")), Some(true));
        }
        drop(store);

        let store = open(dir.path(), Mode::DualFile)?;
        for i in 80..100 {
            assert_eq!(store.get_bool(&format!("flag-{i:03}")), Some(true));
        }
        for i in 0..80 {
            assert!(!store.contains(&format!("flag-{i:03}")));
        }
        Ok(())
    }

    /// Removing most of 100 ~100-byte records collects by byte volume;
    /// the survivors and the checksum stay intact.
    #[test]
    fn gc_compacts_after_mass_removal() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        let value = "x".repeat(100);
        // Records of 111 bytes: info + key size + 7-byte key + size + value.
        for i in 0..100 {
            store.put_string(&format!("key-{i:03}"), &value)?;
        }
        store.with_core(|core| assert_eq!(core.data_end, DATA_START + 100 * 111));

        for i in 0..85 {
            store.remove(&format!("key-{i:03}"))?;
        }
        store.with_core(|core| {
            // GC ran at least once; what remains is the 15 survivors plus
            // any tombstones below the current threshold.
            assert!(core.invalids.len() < 80);
            assert_eq!(core.data_end, DATA_START + 15 * 111 + core.invalids.bytes());
        });
        assert!(checksum_ok(&store));
        for i in 85..100 {
            assert_eq!(store.get_string(&format!("key-{i:03}")).as_deref(), Some(value.as_str()));
        }
        drop(store);

        let store = open(dir.path(), Mode::DualFile)?;
        for i in 85..100 {
            assert_eq!(store.get_string(&format!("key-{i:03}")).as_deref(), Some(value.as_str()));
        }
        for i in 0..85 {
            assert!(!store.contains(&format!("key-{i:03}")));
        }
        Ok(())
    }

    /// A collection that frees enough capacity also shrinks the backing
    /// files.
    #[test]
    fn gc_truncates_excess_capacity() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        let value = "x".repeat(100);
        for i in 0..400 {
            store.put_string(&format!("key-{i:03}"), &value)?;
        }
        let grown = store.with_core(|core| core.buffer.capacity());
        assert!(grown >= 400 * 111);

        for i in 0..390 {
            store.remove(&format!("key-{i:03}"))?;
        }
        let capacity = store.with_core(|core| core.buffer.capacity());
        assert!(capacity < grown);
        for suffix in ["kva", "kvb"] {
            let len = fs::metadata(dir.path().join(format!("db.{suffix}")))?.len();
            assert_eq!(len, capacity as u64);
        }
        for i in 390..400 {
            assert_eq!(store.get_string(&format!("key-{i:03}")).as_deref(), Some(value.as_str()));
        }
        drop(store);

        let store = open(dir.path(), Mode::DualFile)?;
        for i in 390..400 {
            assert_eq!(store.get_string(&format!("key-{i:03}")).as_deref(), Some(value.as_str()));
        }
        Ok(())
    }

    /// A value at or above the internal limit spills to a sidecar file
    /// named by the record.
    #[test]
    fn large_value_spills_to_sidecar() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let value = "v".repeat(5 << 10);
        let store = Options::new(dir.path(), "db").internal_limit(4096).open()?;
        store.put_string("big", &value)?;

        let name = store.with_core(|core| {
            let entry = core.index.get("big").expect("entry");
            let var = entry.var().expect("variable entry");
            assert!(var.external);
            assert_eq!(var.len, 32);
            entry.external_name().expect("external name").to_string()
        });
        // An immediate read is served from the caches.
        assert_eq!(store.get_string("big").as_deref(), Some(value.as_str()));

        store.sync()?;
        let path = dir.path().join("db").join(&name);
        assert_eq!(fs::metadata(&path)?.len(), 5 << 10);
        drop(store);

        let store = Options::new(dir.path(), "db").internal_limit(4096).open()?;
        assert_eq!(store.get_string("big").as_deref(), Some(value.as_str()));
        Ok(())
    }

    /// Overwriting a large value writes a fresh sidecar and deletes the
    /// replaced one after it lands.
    #[test]
    fn overwriting_large_value_replaces_sidecar() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = Options::new(dir.path(), "db").internal_limit(4096).open()?;
        store.put_string("big", &"a".repeat(5 << 10))?;
        store.sync()?;
        let first = store.with_core(|core| {
            core.index.get("big").and_then(|e| e.external_name().map(str::to_string)).expect("name")
        });

        let value = "b".repeat(6 << 10);
        store.put_string("big", &value)?;
        store.sync()?;
        let second = store.with_core(|core| {
            core.index.get("big").and_then(|e| e.external_name().map(str::to_string)).expect("name")
        });
        assert_ne!(first, second);
        assert!(!dir.path().join("db").join(&first).exists());
        assert_eq!(fs::metadata(dir.path().join("db").join(&second))?.len(), 6 << 10);
        assert_eq!(store.get_string("big").as_deref(), Some(value.as_str()));

        store.remove("big")?;
        store.sync()?;
        assert!(!dir.path().join("db").join(&second).exists());
        Ok(())
    }

    /// A dangling external reference (sidecar lost) removes the key on
    /// first read.
    #[test]
    fn missing_sidecar_removes_key() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = Options::new(dir.path(), "db").internal_limit(4096).open()?;
        store.put_string("big", &"v".repeat(5 << 10))?;
        store.sync()?;
        drop(store);
        fs::remove_dir_all(dir.path().join("db"))?;

        let store = Options::new(dir.path(), "db").internal_limit(4096).open()?;
        assert!(store.contains("big"));
        assert_eq!(store.get_string("big"), None);
        assert!(!store.contains("big"));
        Ok(())
    }

    /// Truncating the primary image mid-record is repaired from the
    /// secondary without losing keys.
    #[test]
    fn corrupt_primary_recovers_from_secondary() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        store.put_int("n", 42)?;
        store.put_string("s", "hello")?;
        store.put_bool("b", true)?;
        drop(store);

        let kva = dir.path().join("db.kva");
        let file = OpenOptions::new().write(true).open(&kva)?;
        file.set_len(20)?; // mid-record
        drop(file);

        let store = open(dir.path(), Mode::DualFile)?;
        assert_eq!(store.get_int("n"), Some(42));
        assert_eq!(store.get_string("s").as_deref(), Some("hello"));
        assert_eq!(store.get_bool("b"), Some(true));
        drop(store);

        // The primary was replaced with the secondary's content.
        let a = fs::read(&kva)?;
        let b = fs::read(dir.path().join("db.kvb"))?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&a[0..4]);
        let data_end = DATA_START + (u32::from_le_bytes(word) & 0x0fff_ffff) as usize;
        assert!(data_end > DATA_START);
        assert_eq!(a[..data_end], b[..data_end]);
        Ok(())
    }

    /// When both images are corrupt the store abandons them and starts
    /// empty, but stays usable.
    #[test]
    fn corrupt_both_images_starts_empty() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        store.put_int("n", 42)?;
        drop(store);

        for suffix in ["kva", "kvb"] {
            let path = dir.path().join(format!("db.{suffix}"));
            let mut image = fs::read(&path)?;
            image[DATA_START] ^= 0xff; // breaks the checksum
            fs::write(&path, image)?;
        }

        let store = open(dir.path(), Mode::DualFile)?;
        assert!(!store.contains("n"));
        store.put_int("n", 7)?;
        assert_eq!(store.get_int("n"), Some(7));
        drop(store);

        let store = open(dir.path(), Mode::DualFile)?;
        assert_eq!(store.get_int("n"), Some(7));
        Ok(())
    }

    /// The blocking mode persists every mutation immediately, without a
    /// close or explicit sync.
    #[test]
    fn sync_blocking_commits_every_mutation() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::SyncBlocking)?;
        store.put_int("n", 42)?;

        let image = fs::read(dir.path().join("db.kvc"))?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&image[0..4]);
        let data_size = (u32::from_le_bytes(word) & 0x0fff_ffff) as usize;
        assert!(data_size > 0);
        let mut sum = [0u8; 8];
        sum.copy_from_slice(&image[4..12]);
        assert_eq!(fold(&image[DATA_START..DATA_START + data_size]), u64::from_le_bytes(sum));
        Ok(())
    }

    #[test]
    fn clear_empties_the_store() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = Options::new(dir.path(), "db").internal_limit(4096).open()?;
        store.put_int("n", 1)?;
        store.put_string("big", &"v".repeat(5 << 10))?;
        store.sync()?;

        store.clear();
        assert!(!store.contains("n"));
        assert!(!store.contains("big"));
        store.with_core(|core| {
            assert_eq!(core.data_end, DATA_START);
            assert_eq!(core.checksum, 0);
        });
        assert!(!dir.path().join("db").exists());

        store.put_int("n", 2)?;
        drop(store);
        let store = open(dir.path(), Mode::DualFile)?;
        assert_eq!(store.get_int("n"), Some(2));
        assert!(!store.contains("big"));
        Ok(())
    }

    #[test]
    fn get_all_and_put_all_round_trip() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let set: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let store = open(dir.path(), Mode::DualFile)?;
        store.put_bool("b", true)?;
        store.put_int("i", -7)?;
        store.put_long("l", 1 << 40)?;
        store.put_string("s", "text")?;
        store.put_array("a", &[9, 8, 7])?;
        store.put_string_set("set", set.clone())?;

        let all = store.get_all();
        assert_eq!(all.len(), 6);

        let copy = Options::new(dir.path(), "copy").open()?;
        copy.put_all(all)?;
        assert_eq!(copy.get_bool("b"), Some(true));
        assert_eq!(copy.get_int("i"), Some(-7));
        assert_eq!(copy.get_long("l"), Some(1 << 40));
        assert_eq!(copy.get_string("s").as_deref(), Some("text"));
        assert_eq!(copy.get_array("a"), Some(vec![9, 8, 7]));
        assert_eq!(copy.get_string_set("set"), Some(set));
        Ok(())
    }

    /// Applies a scripted sequence of puts and removes, then verifies
    /// that a reopened store reflects exactly the final state.
    #[test]
    fn reopen_reflects_final_state() -> Result<()> {
        use rand::rngs::StdRng;
        use rand::{Rng as _, SeedableRng as _};

        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = open(dir.path(), Mode::DualFile)?;
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut expect: HashMap<String, Option<String>> = HashMap::new();

        for _ in 0..500 {
            let key = format!("key-{}", rng.gen_range(0..13));
            match rng.gen_range(0..4) {
                0 => {
                    store.remove(&key)?;
                    expect.insert(key, None);
                }
                1 => {
                    let value = "v".repeat(rng.gen_range(0..200));
                    store.put_string(&key, &value)?;
                    expect.insert(key, Some(value));
                }
                _ => {
                    let value = format!("value-{}", rng.gen_range(0..1000));
                    store.put_string(&key, &value)?;
                    expect.insert(key, Some(value));
                }
            }
            assert!(checksum_ok(&store));
        }
        drop(store);

        let store = open(dir.path(), Mode::DualFile)?;
        for (key, value) in expect {
            assert_eq!(store.get_string(&key), value, "key {key}");
        }
        Ok(())
    }

    #[test]
    fn encrypted_store_round_trips() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store =
            Options::new(dir.path(), "db").cipher(cipher()).internal_limit(4096).open()?;
        store.put_int("count", 42)?;
        store.put_string("greeting", "super secret value")?;
        store.put_string("big", &"s".repeat(5 << 10))?;
        store.sync()?;
        assert_eq!(store.get_string("greeting").as_deref(), Some("super secret value"));
        drop(store);

        // Neither keys nor values appear in the image in the clear.
        let image = fs::read(dir.path().join("db.kva"))?;
        assert!(!contains_subslice(&image, b"greeting"));
        assert!(!contains_subslice(&image, b"super secret value"));

        let store =
            Options::new(dir.path(), "db").cipher(cipher()).internal_limit(4096).open()?;
        assert_eq!(store.get_int("count"), Some(42));
        assert_eq!(store.get_string("greeting").as_deref(), Some("super secret value"));
        assert_eq!(store.get_string("big").as_deref(), Some("s".repeat(5 << 10).as_str()));
        Ok(())
    }

    /// Reopening an unencrypted store with a cipher rewrites the whole
    /// log and its sidecars into ciphertext, preserving every pair.
    #[test]
    fn encryption_upgrade_rewrites_existing_store() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("kvlite")?;
        let store = Options::new(dir.path(), "db").internal_limit(4096).open()?;
        store.put_int("count", 42)?;
        store.put_string("greeting", "super secret value")?;
        store.put_string("big", &"s".repeat(5 << 10))?;
        store.sync()?;
        drop(store);

        let image = fs::read(dir.path().join("db.kva"))?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&image[0..4]);
        assert_eq!(u32::from_le_bytes(word) & ENCRYPTED_FLAG, 0);
        assert!(contains_subslice(&image, b"greeting"));

        let store =
            Options::new(dir.path(), "db").cipher(cipher()).internal_limit(4096).open()?;
        assert_eq!(store.get_int("count"), Some(42));
        assert_eq!(store.get_string("greeting").as_deref(), Some("super secret value"));
        assert_eq!(store.get_string("big").as_deref(), Some("s".repeat(5 << 10).as_str()));
        drop(store);

        let image = fs::read(dir.path().join("db.kva"))?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&image[0..4]);
        assert_eq!(u32::from_le_bytes(word) & ENCRYPTED_FLAG, ENCRYPTED_FLAG);
        assert!(!contains_subslice(&image, b"greeting"));
        assert!(!contains_subslice(&image, b"super secret value"));

        // The rewrite workspace is gone and the store reopens cleanly.
        assert!(!dir.path().join("temp_db").exists());
        assert!(!dir.path().join("temp_db.kvc").exists());
        let store =
            Options::new(dir.path(), "db").cipher(cipher()).internal_limit(4096).open()?;
        assert_eq!(store.get_string("greeting").as_deref(), Some("super secret value"));
        assert_eq!(store.get_string("big").as_deref(), Some("s".repeat(5 << 10).as_str()));
        Ok(())
    }
}
