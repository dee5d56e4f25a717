//! bsdiff-style patch container.
//!
//! ```text
//! [0..8]    magic "BSDIFF40"
//! [8..16]   control block length   (i64 LE)
//! [16..24]  diff block length      (i64 LE)
//! [24..32]  new file length        (i64 LE)
//! [32..]    control | diff | extra (extra runs to EOF)
//! ```
//!
//! The control block is a sequence of `(add, copy, seek)` triples, each three
//! little-endian i64s. Block lengths in the header are on-disk lengths, so
//! with [`PatchVariant::Zstd`] they describe the compressed blocks.

use std::borrow::Cow;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Block, FormatError};

pub const MAGIC: &[u8; 8] = b"BSDIFF40";
pub const HEADER_LEN: usize = 32;
pub const CONTROL_TRIPLE_LEN: usize = 24;

/// Seek-only triples allowed in a compressed control block beyond two per
/// output byte.
const CONTROL_SLACK_TRIPLES: u64 = 4096;

/// How the three blocks are stored on disk.
///
/// Both layouts share the header; they differ only in whether each block is
/// wrapped in a compression stream. There is no way to tell them apart from
/// the bytes alone, so the caller always picks one.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PatchVariant {
    /// Blocks stored verbatim.
    #[default]
    Raw,
    /// Each block is an independent zstd frame.
    Zstd,
}

impl PatchVariant {
    /// Decode one block, refusing to inflate it past `limit` bytes.
    fn decode_block<'a>(
        self,
        block: Block,
        data: &'a [u8],
        limit: u64,
    ) -> Result<Cow<'a, [u8]>, FormatError> {
        match self {
            PatchVariant::Raw => Ok(Cow::Borrowed(data)),
            PatchVariant::Zstd => {
                let decompress = |e: std::io::Error| FormatError::Decompress {
                    block,
                    message: e.to_string(),
                };
                let decoder = zstd::stream::read::Decoder::new(data).map_err(decompress)?;
                let mut out = Vec::new();
                decoder
                    .take(limit.saturating_add(1))
                    .read_to_end(&mut out)
                    .map_err(decompress)?;
                if out.len() as u64 > limit {
                    return Err(FormatError::DecodedTooLarge { block, limit });
                }
                Ok(Cow::Owned(out))
            }
        }
    }

    fn encode_block(self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            PatchVariant::Raw => Ok(data.to_vec()),
            PatchVariant::Zstd => zstd::stream::encode_all(data, 19),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchHeader {
    pub control_len: i64,
    pub diff_len: i64,
    pub new_len: i64,
}

impl PatchHeader {
    /// Parse and validate the header against the full patch length.
    pub fn parse(patch: &[u8]) -> Result<Self, FormatError> {
        if patch.len() < HEADER_LEN {
            return Err(FormatError::TooShort {
                len: patch.len(),
                header: HEADER_LEN,
            });
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&patch[..8]);
        if &magic != MAGIC {
            return Err(FormatError::BadMagic { found: magic });
        }

        let header = PatchHeader {
            control_len: read_i64(&patch[8..16]),
            diff_len: read_i64(&patch[16..24]),
            new_len: read_i64(&patch[24..32]),
        };

        if header.control_len < 0 {
            return Err(FormatError::NegativeBlockSize {
                block: Block::Control,
                size: header.control_len,
            });
        }
        if header.diff_len < 0 {
            return Err(FormatError::NegativeBlockSize {
                block: Block::Diff,
                size: header.diff_len,
            });
        }
        if header.new_len < 0 {
            return Err(FormatError::NegativeOutputSize(header.new_len));
        }

        let actual = patch.len() as u64;
        let required = (HEADER_LEN as u64)
            .checked_add(header.control_len as u64)
            .and_then(|n| n.checked_add(header.diff_len as u64))
            .unwrap_or(u64::MAX);
        if required > actual {
            return Err(FormatError::SizeMismatch { required, actual });
        }

        Ok(header)
    }

    /// Largest decoded size a block may have for this header. Diff and
    /// extra bytes each land in the output at most once.
    pub fn decoded_limit(&self, block: Block) -> u64 {
        let new_len = self.new_len as u64;
        match block {
            Block::Control => new_len
                .saturating_mul(2)
                .saturating_add(CONTROL_SLACK_TRIPLES)
                .saturating_mul(CONTROL_TRIPLE_LEN as u64),
            Block::Diff | Block::Extra => new_len,
        }
    }

    /// Length of the extra block, derived from what remains after the
    /// declared blocks. Only meaningful once `parse` has succeeded.
    pub fn extra_len(&self, total_len: usize) -> usize {
        total_len - HEADER_LEN - self.control_len as usize - self.diff_len as usize
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..8].copy_from_slice(MAGIC);
        out[8..16].copy_from_slice(&self.control_len.to_le_bytes());
        out[16..24].copy_from_slice(&self.diff_len.to_le_bytes());
        out[24..32].copy_from_slice(&self.new_len.to_le_bytes());
        out
    }
}

/// A validated patch, sliced into its three (decoded) blocks.
///
/// With [`PatchVariant::Raw`] the blocks borrow from the patch buffer.
#[derive(Debug)]
pub struct PatchFile<'a> {
    pub header: PatchHeader,
    pub control: Cow<'a, [u8]>,
    pub diff: Cow<'a, [u8]>,
    pub extra: Cow<'a, [u8]>,
}

impl<'a> PatchFile<'a> {
    pub fn parse(patch: &'a [u8], variant: PatchVariant) -> Result<Self, FormatError> {
        let header = PatchHeader::parse(patch)?;

        let control_end = HEADER_LEN + header.control_len as usize;
        let diff_end = control_end + header.diff_len as usize;

        Ok(PatchFile {
            header,
            control: variant.decode_block(
                Block::Control,
                &patch[HEADER_LEN..control_end],
                header.decoded_limit(Block::Control),
            )?,
            diff: variant.decode_block(
                Block::Diff,
                &patch[control_end..diff_end],
                header.decoded_limit(Block::Diff),
            )?,
            extra: variant.decode_block(
                Block::Extra,
                &patch[diff_end..],
                header.decoded_limit(Block::Extra),
            )?,
        })
    }

    pub fn new_len(&self) -> u64 {
        self.header.new_len as u64
    }
}

/// One reconstruction step: `add` bytes of delta against the original,
/// `copy` literal bytes from the extra block, then `seek` the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTriple {
    pub add: i64,
    pub copy: i64,
    pub seek: i64,
}

impl ControlTriple {
    pub fn new(add: i64, copy: i64, seek: i64) -> Self {
        ControlTriple { add, copy, seek }
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        ControlTriple {
            add: read_i64(&bytes[0..8]),
            copy: read_i64(&bytes[8..16]),
            seek: read_i64(&bytes[16..24]),
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.add.to_le_bytes());
        out.extend_from_slice(&self.copy.to_le_bytes());
        out.extend_from_slice(&self.seek.to_le_bytes());
    }
}

/// Assembles a container from explicit instructions.
///
/// This does not compute a delta between two files; the caller supplies the
/// control triples together with the matching diff and extra bytes.
#[derive(Debug, Default)]
pub struct PatchBuilder {
    control: Vec<u8>,
    diff: Vec<u8>,
    extra: Vec<u8>,
    new_len: i64,
}

impl PatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one triple with its diff bytes (`diff.len()` is the add
    /// length) and extra bytes (`extra.len()` is the copy length).
    pub fn push(&mut self, diff: &[u8], extra: &[u8], seek: i64) -> &mut Self {
        ControlTriple::new(diff.len() as i64, extra.len() as i64, seek).write_to(&mut self.control);
        self.diff.extend_from_slice(diff);
        self.extra.extend_from_slice(extra);
        self.new_len += (diff.len() + extra.len()) as i64;
        self
    }

    /// Append a raw triple without touching the data blocks. Useful for
    /// building deliberately inconsistent patches.
    pub fn push_raw(&mut self, triple: ControlTriple) -> &mut Self {
        triple.write_to(&mut self.control);
        self
    }

    pub fn diff_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.diff.extend_from_slice(bytes);
        self
    }

    pub fn extra_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.extra.extend_from_slice(bytes);
        self
    }

    /// Override the declared output length.
    pub fn new_len(&mut self, len: i64) -> &mut Self {
        self.new_len = len;
        self
    }

    pub fn build(&self, variant: PatchVariant) -> std::io::Result<Vec<u8>> {
        let control = variant.encode_block(&self.control)?;
        let diff = variant.encode_block(&self.diff)?;
        let extra = variant.encode_block(&self.extra)?;

        let header = PatchHeader {
            control_len: control.len() as i64,
            diff_len: diff.len() as i64,
            new_len: self.new_len,
        };

        let mut patch = Vec::with_capacity(HEADER_LEN + control.len() + diff.len() + extra.len());
        patch.write_all(&header.to_bytes())?;
        patch.write_all(&control)?;
        patch.write_all(&diff)?;
        patch.write_all(&extra)?;
        Ok(patch)
    }
}

fn read_i64(bytes: &[u8]) -> i64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(control: i64, diff: i64, new_len: i64) -> Vec<u8> {
        PatchHeader {
            control_len: control,
            diff_len: diff,
            new_len,
        }
        .to_bytes()
        .to_vec()
    }

    #[test]
    fn test_too_short() {
        let err = PatchHeader::parse(&MAGIC[..]).unwrap_err();
        assert_eq!(err, FormatError::TooShort { len: 8, header: 32 });
    }

    #[test]
    fn test_bad_magic() {
        let mut patch = header_bytes(0, 0, 0);
        patch[3] ^= 0xFF;
        assert!(matches!(
            PatchHeader::parse(&patch),
            Err(FormatError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_negative_sizes() {
        assert_eq!(
            PatchHeader::parse(&header_bytes(-1, 0, 0)).unwrap_err(),
            FormatError::NegativeBlockSize {
                block: Block::Control,
                size: -1
            }
        );
        assert_eq!(
            PatchHeader::parse(&header_bytes(0, -5, 0)).unwrap_err(),
            FormatError::NegativeBlockSize {
                block: Block::Diff,
                size: -5
            }
        );
        assert_eq!(
            PatchHeader::parse(&header_bytes(0, 0, -2)).unwrap_err(),
            FormatError::NegativeOutputSize(-2)
        );
    }

    #[test]
    fn test_declared_blocks_exceed_patch() {
        let mut patch = header_bytes(24, 10, 0);
        patch.extend_from_slice(&[0u8; 30]);
        assert_eq!(
            PatchHeader::parse(&patch).unwrap_err(),
            FormatError::SizeMismatch {
                required: 66,
                actual: 62
            }
        );
    }

    #[test]
    fn test_huge_block_lengths_do_not_wrap() {
        let patch = header_bytes(i64::MAX, i64::MAX, 0);
        assert!(matches!(
            PatchHeader::parse(&patch),
            Err(FormatError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_slices_blocks_and_derives_extra() {
        let patch = PatchBuilder::new()
            .push(b"ab", b"XYZ", 0)
            .build(PatchVariant::Raw)
            .unwrap();
        let parsed = PatchFile::parse(&patch, PatchVariant::Raw).unwrap();

        assert_eq!(parsed.header.control_len, 24);
        assert_eq!(parsed.header.diff_len, 2);
        assert_eq!(parsed.new_len(), 5);
        assert_eq!(parsed.header.extra_len(patch.len()), 3);
        assert_eq!(&*parsed.diff, b"ab");
        assert_eq!(&*parsed.extra, b"XYZ");
        assert!(matches!(parsed.control, Cow::Borrowed(_)));
    }

    #[test]
    fn test_zstd_blocks_decode() {
        let patch = PatchBuilder::new()
            .push(&[1, 2, 3], b"hello", -3)
            .build(PatchVariant::Zstd)
            .unwrap();
        let parsed = PatchFile::parse(&patch, PatchVariant::Zstd).unwrap();

        assert_eq!(parsed.control.len(), CONTROL_TRIPLE_LEN);
        assert_eq!(
            ControlTriple::from_bytes(&parsed.control),
            ControlTriple::new(3, 5, -3)
        );
        assert_eq!(&*parsed.diff, &[1, 2, 3]);
        assert_eq!(&*parsed.extra, b"hello");
    }

    #[test]
    fn test_variant_mismatch_is_decompress_error() {
        let patch = PatchBuilder::new()
            .push(&[1, 2, 3], b"hello", 0)
            .build(PatchVariant::Raw)
            .unwrap();
        assert!(matches!(
            PatchFile::parse(&patch, PatchVariant::Zstd),
            Err(FormatError::Decompress {
                block: Block::Control,
                ..
            })
        ));
    }

    #[test]
    fn test_zstd_block_larger_than_output_is_rejected() {
        let patch = PatchBuilder::new()
            .push(b"", &vec![0u8; 1 << 20], 0)
            .new_len(16)
            .build(PatchVariant::Zstd)
            .unwrap();
        assert!(patch.len() < 1024);

        assert_eq!(
            PatchFile::parse(&patch, PatchVariant::Zstd).unwrap_err(),
            FormatError::DecodedTooLarge {
                block: Block::Extra,
                limit: 16
            }
        );
    }

    #[test]
    fn test_zstd_block_at_limit_is_accepted() {
        let patch = PatchBuilder::new()
            .push(b"", &[7u8; 16], 0)
            .build(PatchVariant::Zstd)
            .unwrap();

        let parsed = PatchFile::parse(&patch, PatchVariant::Zstd).unwrap();
        assert_eq!(&*parsed.extra, &[7u8; 16]);
    }
}
