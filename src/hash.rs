use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::Digest;

const READ_BUF_SIZE: usize = 256 * 1024;

/// Content hashing used for object names and integrity checks.
///
/// Implementations are stateless; a digest is a pure function of the input
/// bytes, rendered as lowercase hex.
pub trait HashProvider: Send + Sync {
    /// Short algorithm name, e.g. `"blake3"`.
    fn name(&self) -> &'static str;

    /// Length of the hex digest this provider produces.
    fn hex_len(&self) -> usize;

    /// Hash everything `reader` yields until EOF.
    fn hash_reader(&self, reader: &mut dyn Read) -> io::Result<String>;

    fn hash_bytes(&self, data: &[u8]) -> String {
        let mut cursor = data;
        // Reading from a slice cannot fail.
        self.hash_reader(&mut cursor).unwrap_or_default()
    }

    fn hash_str(&self, text: &str) -> String {
        self.hash_bytes(text.as_bytes())
    }

    /// Stream-hash a file through a 256 KB buffer.
    fn hash_file(&self, path: &Path) -> io::Result<String> {
        let file = File::open(path)?;
        let mut reader = BufReader::with_capacity(READ_BUF_SIZE, file);
        self.hash_reader(&mut reader)
    }

    /// True if `hash` has the right length and only hex digits.
    fn is_valid_hex(&self, hash: &str) -> bool {
        hash.len() == self.hex_len() && hash.bytes().all(|b| b.is_ascii_hexdigit())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Blake3Provider;

impl HashProvider for Blake3Provider {
    fn name(&self) -> &'static str {
        "blake3"
    }

    fn hex_len(&self) -> usize {
        blake3::OUT_LEN * 2
    }

    fn hash_reader(&self, reader: &mut dyn Read) -> io::Result<String> {
        let mut hasher = blake3::Hasher::new();
        io::copy(reader, &mut hasher)?;
        Ok(hasher.finalize().to_hex().to_string())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Provider;

impl HashProvider for Sha256Provider {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn hex_len(&self) -> usize {
        64
    }

    fn hash_reader(&self, reader: &mut dyn Read) -> io::Result<String> {
        let mut hasher = sha2::Sha256::new();
        io::copy(reader, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Selects a [`HashProvider`] from configuration or the command line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Blake3,
    Sha256,
}

impl HashAlgorithm {
    pub fn provider(self) -> Arc<dyn HashProvider> {
        match self {
            HashAlgorithm::Blake3 => Arc::new(Blake3Provider),
            HashAlgorithm::Sha256 => Arc::new(Sha256Provider),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_blake3_known_vector() {
        // BLAKE3 of the empty input.
        assert_eq!(
            Blake3Provider.hash_bytes(b""),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
    }

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            Sha256Provider.hash_str("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_length_matches_hex_len() {
        for algorithm in [HashAlgorithm::Blake3, HashAlgorithm::Sha256] {
            let provider = algorithm.provider();
            let digest = provider.hash_bytes(b"some content");
            assert_eq!(digest.len(), provider.hex_len(), "{}", provider.name());
            assert!(provider.is_valid_hex(&digest));
        }
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data = vec![0x5Au8; 600 * 1024];
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let provider = Blake3Provider;
        assert_eq!(
            provider.hash_file(file.path()).unwrap(),
            provider.hash_bytes(&data)
        );
    }

    #[test]
    fn test_is_valid_hex_rejects_bad_input() {
        let provider = Sha256Provider;
        assert!(!provider.is_valid_hex("abc"));
        assert!(!provider.is_valid_hex(&"g".repeat(64)));
        assert!(!provider.is_valid_hex(&"../".repeat(21)));
        assert!(provider.is_valid_hex(&"A".repeat(64)));
    }

    #[test]
    fn test_algorithm_deserializes_lowercase() {
        let algorithm: HashAlgorithm = serde_json::from_str("\"sha256\"").unwrap();
        assert_eq!(algorithm, HashAlgorithm::Sha256);
    }
}
