use crate::error::{Block, FormatError};
use crate::patch_format::{ControlTriple, PatchFile, PatchVariant, CONTROL_TRIPLE_LEN};

const MAX_PREALLOC: usize = 64 * 1024 * 1024;

/// Sequential reader over one decoded block.
struct BlockReader<'a> {
    block: Block,
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlockReader<'a> {
    fn new(block: Block, data: &'a [u8]) -> Self {
        BlockReader { block, data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], FormatError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(FormatError::Truncated { block: self.block })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn next_triple(&mut self) -> Result<ControlTriple, FormatError> {
        self.take(CONTROL_TRIPLE_LEN).map(ControlTriple::from_bytes)
    }
}

/// Parse `patch` with the given container variant and rebuild the new file
/// from `old`.
pub fn apply_patch(old: &[u8], patch: &[u8], variant: PatchVariant) -> Result<Vec<u8>, FormatError> {
    let parsed = PatchFile::parse(patch, variant)?;
    log::debug!(
        "Applying patch: old={} bytes, control={} diff={} extra={} new={}",
        old.len(),
        parsed.control.len(),
        parsed.diff.len(),
        parsed.extra.len(),
        parsed.new_len()
    );
    apply_blocks(old, &parsed.control, &parsed.diff, &parsed.extra, parsed.new_len())
}

/// Replay control triples against `old`, producing exactly `new_len` bytes.
///
/// Trailing bytes left in any block once the output is full are ignored.
pub fn apply_blocks(
    old: &[u8],
    control: &[u8],
    diff: &[u8],
    extra: &[u8],
    new_len: u64,
) -> Result<Vec<u8>, FormatError> {
    let mut control = BlockReader::new(Block::Control, control);
    let mut diff = BlockReader::new(Block::Diff, diff);
    let mut extra = BlockReader::new(Block::Extra, extra);

    let new_size = usize::try_from(new_len).map_err(|_| FormatError::RangeOverflow {
        block: Block::Control,
        new_pos: 0,
        length: new_len as i64,
        new_len,
    })?;
    // The declared size is untrusted; grow with the data actually present.
    let mut new = Vec::with_capacity(new_size.min(MAX_PREALLOC));
    let mut old_pos = 0i64;

    while new.len() < new_size {
        let triple = control.next_triple()?;

        let add = checked_run(Block::Diff, triple.add, new.len(), new_size)?;
        let delta = diff.take(add)?;
        new.extend(delta.iter().enumerate().map(|(i, &d)| match old_byte(old, old_pos, i) {
            Some(o) => o.wrapping_add(d),
            None => d,
        }));
        old_pos = old_pos.saturating_add(add as i64);

        let copy = checked_run(Block::Extra, triple.copy, new.len(), new_size)?;
        new.extend_from_slice(extra.take(copy)?);

        old_pos = match old_pos.checked_add(triple.seek) {
            Some(pos) if pos <= old.len() as i64 => pos,
            Some(pos) => {
                return Err(FormatError::OldPositionOverflow {
                    old_pos: pos,
                    old_len: old.len() as u64,
                })
            }
            None => {
                return Err(FormatError::OldPositionOverflow {
                    old_pos: i64::MAX,
                    old_len: old.len() as u64,
                })
            }
        };
    }

    Ok(new)
}

/// Validate that a run of `length` bytes starting at `new_pos` fits.
fn checked_run(block: Block, length: i64, new_pos: usize, new_size: usize) -> Result<usize, FormatError> {
    usize::try_from(length)
        .ok()
        .filter(|&len| len <= new_size - new_pos)
        .ok_or(FormatError::RangeOverflow {
            block,
            new_pos: new_pos as u64,
            length,
            new_len: new_size as u64,
        })
}

fn old_byte(old: &[u8], old_pos: i64, offset: usize) -> Option<u8> {
    let pos = old_pos.checked_add(offset as i64)?;
    usize::try_from(pos).ok().and_then(|p| old.get(p).copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch_format::PatchBuilder;

    #[test]
    fn test_apply_add_only() {
        let old = b"Hello, World!";
        let delta: Vec<u8> = b"Hello, Rust!!"
            .iter()
            .zip(old.iter())
            .map(|(n, o)| n.wrapping_sub(*o))
            .collect();
        let patch = PatchBuilder::new()
            .push(&delta, b"", 0)
            .build(PatchVariant::Raw)
            .unwrap();

        let result = apply_patch(old, &patch, PatchVariant::Raw).unwrap();
        assert_eq!(result, b"Hello, Rust!!");
    }

    #[test]
    fn test_apply_extra_only_ignores_original() {
        let payload = b"Brand new content";
        let patch = PatchBuilder::new()
            .push(b"", payload, 0)
            .build(PatchVariant::Raw)
            .unwrap();

        assert_eq!(apply_patch(b"", &patch, PatchVariant::Raw).unwrap(), payload);
        assert_eq!(
            apply_patch(b"something unrelated", &patch, PatchVariant::Raw).unwrap(),
            payload
        );
    }

    #[test]
    fn test_apply_mixed_with_seek() {
        // Rebuild "AAAA_XXXX_CCCC" from "AAAA_BBBB_CCCC": keep the first five
        // bytes, insert "XXXX_", skip ahead over "BBBB_", keep "CCCC".
        let old = b"AAAA_BBBB_CCCC";
        let patch = PatchBuilder::new()
            .push(&[0; 5], b"XXXX_", 5)
            .push(&[0; 4], b"", 0)
            .build(PatchVariant::Raw)
            .unwrap();

        let result = apply_patch(old, &patch, PatchVariant::Raw).unwrap();
        assert_eq!(result, b"AAAA_XXXX_CCCC");
    }

    #[test]
    fn test_backward_seek_reuses_original() {
        let old = b"abc";
        let patch = PatchBuilder::new()
            .push(&[0; 3], b"", -3)
            .push(&[0; 3], b"", 0)
            .build(PatchVariant::Raw)
            .unwrap();

        assert_eq!(apply_patch(old, &patch, PatchVariant::Raw).unwrap(), b"abcabc");
    }

    #[test]
    fn test_add_past_original_uses_diff_byte() {
        let old = b"ab";
        let patch = PatchBuilder::new()
            .push(&[1, 1, b'z', b'z'], b"", -4)
            .build(PatchVariant::Raw)
            .unwrap();

        assert_eq!(apply_patch(old, &patch, PatchVariant::Raw).unwrap(), b"bczz");
    }

    #[test]
    fn test_empty_output() {
        let patch = PatchBuilder::new().build(PatchVariant::Raw).unwrap();
        assert!(apply_patch(b"old", &patch, PatchVariant::Raw).unwrap().is_empty());
    }

    #[test]
    fn test_add_overflow_rejected() {
        let patch = PatchBuilder::new()
            .push_raw(ControlTriple::new(10, 0, 0))
            .diff_bytes(&[0; 10])
            .new_len(4)
            .build(PatchVariant::Raw)
            .unwrap();

        assert_eq!(
            apply_patch(b"0123456789", &patch, PatchVariant::Raw).unwrap_err(),
            FormatError::RangeOverflow {
                block: Block::Diff,
                new_pos: 0,
                length: 10,
                new_len: 4
            }
        );
    }

    #[test]
    fn test_copy_overflow_rejected() {
        let patch = PatchBuilder::new()
            .push_raw(ControlTriple::new(2, 3, 0))
            .diff_bytes(&[0; 2])
            .extra_bytes(b"xyz")
            .new_len(4)
            .build(PatchVariant::Raw)
            .unwrap();

        assert!(matches!(
            apply_patch(b"ab", &patch, PatchVariant::Raw),
            Err(FormatError::RangeOverflow {
                block: Block::Extra,
                new_pos: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_negative_run_length_rejected() {
        let patch = PatchBuilder::new()
            .push_raw(ControlTriple::new(-1, 0, 0))
            .new_len(1)
            .build(PatchVariant::Raw)
            .unwrap();

        assert!(matches!(
            apply_patch(b"a", &patch, PatchVariant::Raw),
            Err(FormatError::RangeOverflow { length: -1, .. })
        ));
    }

    #[test]
    fn test_seek_past_original_rejected() {
        let patch = PatchBuilder::new()
            .push(&[0; 2], b"", 5)
            .push(b"", b"x", 0)
            .build(PatchVariant::Raw)
            .unwrap();

        assert_eq!(
            apply_patch(b"abcd", &patch, PatchVariant::Raw).unwrap_err(),
            FormatError::OldPositionOverflow {
                old_pos: 7,
                old_len: 4
            }
        );
    }

    #[test]
    fn test_negative_old_position_allowed() {
        let patch = PatchBuilder::new()
            .push(b"", b"", -10)
            .push(&[b'q'], b"", 0)
            .build(PatchVariant::Raw)
            .unwrap();

        assert_eq!(apply_patch(b"abc", &patch, PatchVariant::Raw).unwrap(), b"q");
    }

    #[test]
    fn test_truncated_blocks() {
        let control_short = PatchBuilder::new().new_len(3).build(PatchVariant::Raw).unwrap();
        assert_eq!(
            apply_patch(b"", &control_short, PatchVariant::Raw).unwrap_err(),
            FormatError::Truncated {
                block: Block::Control
            }
        );

        let extra_short = PatchBuilder::new()
            .push_raw(ControlTriple::new(0, 3, 0))
            .extra_bytes(b"ab")
            .new_len(3)
            .build(PatchVariant::Raw)
            .unwrap();
        assert_eq!(
            apply_patch(b"", &extra_short, PatchVariant::Raw).unwrap_err(),
            FormatError::Truncated { block: Block::Extra }
        );
    }

    #[test]
    fn test_trailing_block_bytes_ignored() {
        let patch = PatchBuilder::new()
            .push(b"", b"ok", 0)
            .push_raw(ControlTriple::new(9, 9, 9))
            .extra_bytes(b"trailing")
            .build(PatchVariant::Raw)
            .unwrap();

        assert_eq!(apply_patch(b"", &patch, PatchVariant::Raw).unwrap(), b"ok");
    }

    #[test]
    fn test_zstd_variant_round_trip() {
        let old = vec![7u8; 4096];
        let mut target = old.clone();
        target[100] = 9;
        let delta: Vec<u8> = target.iter().zip(&old).map(|(n, o)| n.wrapping_sub(*o)).collect();
        let patch = PatchBuilder::new()
            .push(&delta, b"tail", 0)
            .build(PatchVariant::Zstd)
            .unwrap();
        target.extend_from_slice(b"tail");

        assert_eq!(apply_patch(&old, &patch, PatchVariant::Zstd).unwrap(), target);
    }
}
