//! Content-addressed storage for update artifacts.
//!
//! Objects live at `<root>/<hash[..prefix_length]>/<hash>`. Stores written by
//! older releases kept every object directly under `<root>/<hash>`; with
//! `correct_misplaced_files` enabled those are moved into their shard the
//! first time they are touched.
//!
//! Objects are immutable. The hash names the content and is never re-checked
//! on read.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::StorageError;
use crate::hash::{HashAlgorithm, HashProvider};

const COPY_BUF_SIZE: usize = 256 * 1024;
const ZSTD_LEVEL: i32 = 3;

fn default_true() -> bool {
    true
}

fn default_prefix_length() -> usize {
    2
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub hash: HashAlgorithm,
    #[serde(default)]
    pub compress_objects: bool,
    #[serde(default = "default_true")]
    pub correct_misplaced_files: bool,
    #[serde(default = "default_prefix_length")]
    pub prefix_length: usize,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        StoreConfig {
            root: root.into(),
            hash: HashAlgorithm::default(),
            compress_objects: false,
            correct_misplaced_files: true,
            prefix_length: default_prefix_length(),
        }
    }

    /// Read a JSON config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read store config: {}", path.display()))?;
        let config: StoreConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse store config: {}", path.display()))?;
        config.validate(config.hash.provider().hex_len())?;
        Ok(config)
    }

    pub fn validate(&self, hex_len: usize) -> anyhow::Result<()> {
        if self.prefix_length == 0 || self.prefix_length > hex_len {
            anyhow::bail!(
                "prefix_length must be between 1 and {hex_len}, got {}",
                self.prefix_length
            );
        }
        Ok(())
    }
}

/// Read handle for a stored object, decompressing if the store compresses.
pub enum ObjectReader {
    Plain(BufReader<File>),
    Compressed(zstd::Decoder<'static, BufReader<File>>),
}

impl Read for ObjectReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ObjectReader::Plain(r) => r.read(buf),
            ObjectReader::Compressed(r) => r.read(buf),
        }
    }
}

pub struct ContentStore {
    root: PathBuf,
    hasher: Arc<dyn HashProvider>,
    compress_objects: bool,
    correct_misplaced_files: bool,
    prefix_length: usize,
}

impl ContentStore {
    /// Build a store with an explicitly supplied hash provider. Does not
    /// touch the filesystem; directories are created on first write.
    pub fn new(config: &StoreConfig, hasher: Arc<dyn HashProvider>) -> anyhow::Result<Self> {
        config.validate(hasher.hex_len())?;
        Ok(ContentStore {
            root: config.root.clone(),
            hasher,
            compress_objects: config.compress_objects,
            correct_misplaced_files: config.correct_misplaced_files,
            prefix_length: config.prefix_length,
        })
    }

    /// Build a store using the provider named in `config`.
    pub fn from_config(config: &StoreConfig) -> anyhow::Result<Self> {
        Self::new(config, config.hash.provider())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hasher(&self) -> &dyn HashProvider {
        self.hasher.as_ref()
    }

    /// Sharded location of `hash`. The hash must already be validated.
    pub fn path_for(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..self.prefix_length]).join(hash)
    }

    fn legacy_path(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    fn normalize(&self, hash: &str) -> Result<String, StorageError> {
        if !self.hasher.is_valid_hex(hash) {
            return Err(StorageError::InvalidHash {
                hash: hash.to_string(),
                expected_len: self.hasher.hex_len(),
            });
        }
        Ok(hash.to_ascii_lowercase())
    }

    /// Store everything `source` yields and return its hash.
    ///
    /// Without `known_hash` the source is hashed from its start first, then
    /// rewound. Storing content that is already present is a no-op.
    pub fn put<R: Read + Seek>(
        &self,
        source: &mut R,
        known_hash: Option<&str>,
    ) -> Result<String, StorageError> {
        let hash = match known_hash {
            Some(hash) => self.normalize(hash)?,
            None => {
                let rewind_and_hash = |source: &mut R| -> io::Result<String> {
                    source.seek(SeekFrom::Start(0))?;
                    self.hasher.hash_reader(source)
                };
                rewind_and_hash(source).map_err(|e| StorageError::Io {
                    path: self.root.clone(),
                    source: e,
                })?
            }
        };

        let dest = self.path_for(&hash);
        self.correct_misplaced(&hash, &dest)?;
        if dest.exists() {
            log::debug!("Object {hash} already stored");
            return Ok(hash);
        }

        let shard = dest.parent().unwrap_or(&self.root);
        fs::create_dir_all(shard).map_err(|e| StorageError::from_io(shard, e))?;

        // Readers only ever see the final name once the content is complete.
        // The temp name is never valid hex, so listings skip it.
        let mut tmp = tempfile::Builder::new()
            .prefix(".put-")
            .tempfile_in(shard)
            .map_err(|e| StorageError::from_io(shard, e))?;

        source
            .seek(SeekFrom::Start(0))
            .map_err(|e| StorageError::from_io(&dest, e))?;
        self.write_object(tmp.as_file_mut(), source)
            .map_err(|e| StorageError::from_io(tmp.path(), e))?;

        match tmp.persist_noclobber(&dest) {
            Ok(_) => log::debug!("Stored object {hash} at {}", dest.display()),
            // Another writer published the same content first.
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                log::debug!("Object {hash} stored concurrently");
            }
            Err(e) => return Err(StorageError::from_io(&dest, e.error)),
        }
        Ok(hash)
    }

    fn write_object<R: Read>(&self, file: &mut File, source: &mut R) -> io::Result<()> {
        let writer = BufWriter::with_capacity(COPY_BUF_SIZE, file);
        if self.compress_objects {
            let mut encoder = zstd::Encoder::new(writer, ZSTD_LEVEL)?;
            io::copy(source, &mut encoder)?;
            encoder.finish()?.into_inner().map_err(|e| e.into_error())?.sync_all()
        } else {
            let mut writer = writer;
            io::copy(source, &mut writer)?;
            writer.into_inner().map_err(|e| e.into_error())?.sync_all()
        }
    }

    pub fn put_bytes(&self, data: &[u8]) -> Result<String, StorageError> {
        self.put(&mut io::Cursor::new(data), None)
    }

    pub fn put_file(&self, path: &Path) -> Result<String, StorageError> {
        let mut file = File::open(path).map_err(|e| StorageError::from_io(path, e))?;
        self.put(&mut file, None)
    }

    /// Open the object named `hash`, or `None` if it is not stored.
    pub fn get(&self, hash: &str) -> Result<Option<ObjectReader>, StorageError> {
        let hash = self.normalize(hash)?;
        let dest = self.path_for(&hash);
        self.correct_misplaced(&hash, &dest)?;

        let file = match open_if_exists(&dest)? {
            Some(file) => file,
            // A concurrent migration may be halfway through; try the old spot.
            None if self.correct_misplaced_files => match open_if_exists(&self.legacy_path(&hash))? {
                Some(file) => file,
                None => return Ok(None),
            },
            None => return Ok(None),
        };

        let reader = BufReader::with_capacity(COPY_BUF_SIZE, file);
        if self.compress_objects {
            let decoder =
                zstd::Decoder::with_buffer(reader).map_err(|e| StorageError::from_io(&dest, e))?;
            Ok(Some(ObjectReader::Compressed(decoder)))
        } else {
            Ok(Some(ObjectReader::Plain(reader)))
        }
    }

    pub fn get_bytes(&self, hash: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(mut reader) = self.get(hash)? else {
            return Ok(None);
        };
        let mut data = Vec::new();
        reader.read_to_end(&mut data).map_err(|e| StorageError::Io {
            path: self.path_for(&hash.to_ascii_lowercase()),
            source: e,
        })?;
        Ok(Some(data))
    }

    pub fn exists(&self, hash: &str) -> bool {
        let Ok(hash) = self.normalize(hash) else {
            return false;
        };
        self.path_for(&hash).is_file()
            || (self.correct_misplaced_files && self.legacy_path(&hash).is_file())
    }

    /// Remove the object named `hash` from either layout.
    ///
    /// Never fails: an unknown hash returns `false`, and I/O errors are
    /// logged and also return `false`.
    pub fn delete(&self, hash: &str) -> bool {
        let Ok(hash) = self.normalize(hash) else {
            log::warn!("Refusing to delete invalid object hash {hash:?}");
            return false;
        };

        let mut removed = false;
        for path in [self.path_for(&hash), self.legacy_path(&hash)] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::warn!("Failed to delete object {}: {e}", path.display());
                    return false;
                }
            }
        }
        if removed {
            log::debug!("Deleted object {hash}");
        }
        removed
    }

    /// Delete many objects in parallel, returning how many were removed.
    pub fn delete_many<S: AsRef<str> + Sync>(&self, hashes: &[S]) -> usize {
        hashes
            .par_iter()
            .filter(|hash| self.delete(hash.as_ref()))
            .count()
    }

    /// Move every legacy flat-layout object into its shard.
    pub fn migrate_all(&self) -> Result<usize, StorageError> {
        let mut moved = 0;
        for hash in self.legacy_hashes()? {
            let dest = self.path_for(&hash);
            if self.correct_misplaced_inner(&hash, &dest)? {
                moved += 1;
            }
        }
        if moved > 0 {
            log::info!("Migrated {moved} objects into {}", self.root.display());
        }
        Ok(moved)
    }

    /// Every stored hash, sharded and legacy, sorted and de-duplicated.
    pub fn list(&self) -> Result<Vec<String>, StorageError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut hashes = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(2) {
            let entry = entry.map_err(|e| walk_error(&self.root, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if !self.hasher.is_valid_hex(name) {
                continue;
            }
            let in_place = match entry.depth() {
                1 => true,
                _ => entry
                    .path()
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|p| p.to_str())
                    .is_some_and(|shard| name.starts_with(shard) && shard.len() == self.prefix_length),
            };
            if in_place {
                hashes.push(name.to_ascii_lowercase());
            }
        }
        hashes.sort();
        hashes.dedup();
        Ok(hashes)
    }

    fn legacy_hashes(&self) -> Result<Vec<String>, StorageError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut hashes = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| walk_error(&self.root, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if self.hasher.is_valid_hex(name) {
                    hashes.push(name.to_string());
                }
            }
        }
        Ok(hashes)
    }

    fn correct_misplaced(&self, hash: &str, dest: &Path) -> Result<(), StorageError> {
        if self.correct_misplaced_files {
            self.correct_misplaced_inner(hash, dest)?;
        }
        Ok(())
    }

    /// Returns whether a legacy file was found and dealt with.
    fn correct_misplaced_inner(&self, hash: &str, dest: &Path) -> Result<bool, StorageError> {
        let legacy = self.legacy_path(hash);
        if !legacy.is_file() {
            return Ok(false);
        }

        if dest.exists() {
            // Same hash, same content; the legacy copy is redundant.
            match fs::remove_file(&legacy) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::from_io(&legacy, e)),
            }
            return Ok(true);
        }

        let shard = dest.parent().unwrap_or(&self.root);
        fs::create_dir_all(shard).map_err(|e| StorageError::from_io(shard, e))?;
        match fs::rename(&legacy, dest) {
            Ok(()) => {
                log::info!("Moved misplaced object {hash} to {}", dest.display());
                Ok(true)
            }
            // Lost a race with another migration of the same object.
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::from_io(&legacy, e)),
        }
    }
}

fn open_if_exists(path: &Path) -> Result<Option<File>, StorageError> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::from_io(path, e)),
    }
}

fn walk_error(root: &Path, e: walkdir::Error) -> StorageError {
    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
    let source = e
        .into_io_error()
        .unwrap_or_else(|| io::Error::other("directory walk failed"));
    StorageError::from_io(path, source)
}
