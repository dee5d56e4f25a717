use std::path::Path;

use crate::binary_patch;
use crate::error::ApplyError;
use crate::hash::HashProvider;
use crate::patch_format::PatchVariant;
use crate::util;

/// Expected digest of the rebuilt file, checked before it is written.
pub struct Verify<'a> {
    pub provider: &'a dyn HashProvider,
    pub expected: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub old_size: u64,
    pub patch_size: u64,
    pub new_size: u64,
    pub new_hash: Option<String>,
}

/// Apply the patch at `patch_path` to the file at `old_path`, writing the
/// result to `output_path`.
///
/// Both inputs are memory-mapped and the mappings are dropped before the
/// output is written, so `output_path` may name the original file.
pub fn apply_patch_file(
    old_path: &Path,
    patch_path: &Path,
    output_path: &Path,
    variant: PatchVariant,
    verify: Option<Verify<'_>>,
) -> Result<ApplySummary, ApplyError> {
    let (new_data, old_size, patch_size) = util::with_file_bytes(old_path, |old| {
        let (new_data, patch_size) = util::with_file_bytes(patch_path, |patch| {
            binary_patch::apply_patch(old, patch, variant).map(|new| (new, patch.len() as u64))
        })
        .map_err(|e| ApplyError::io(patch_path, e))??;
        Ok::<_, ApplyError>((new_data, old.len() as u64, patch_size))
    })
    .map_err(|e| ApplyError::io(old_path, e))??;

    let new_hash = match verify {
        Some(Verify { provider, expected }) => {
            let actual = provider.hash_bytes(&new_data);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(ApplyError::HashMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
            Some(actual)
        }
        None => None,
    };

    util::write_via_temp(output_path, &new_data).map_err(|e| ApplyError::io(output_path, e))?;

    log::info!(
        "Patched {} -> {} ({} bytes)",
        old_path.display(),
        output_path.display(),
        new_data.len()
    );

    Ok(ApplySummary {
        old_size,
        patch_size,
        new_size: new_data.len() as u64,
        new_hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FormatError;
    use crate::hash::Blake3Provider;
    use crate::patch_format::PatchBuilder;
    use std::fs;

    fn write_patch(dir: &Path, old: &[u8], new_tail: &[u8]) -> std::path::PathBuf {
        let patch = PatchBuilder::new()
            .push(&vec![0; old.len()], new_tail, 0)
            .build(PatchVariant::Raw)
            .unwrap();
        let path = dir.join("update.patch");
        fs::write(&path, patch).unwrap();
        path
    }

    #[test]
    fn test_apply_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("app.bin");
        fs::write(&old_path, b"version-1").unwrap();
        let patch_path = write_patch(dir.path(), b"version-1", b"+fix");

        let summary =
            apply_patch_file(&old_path, &patch_path, &old_path, PatchVariant::Raw, None).unwrap();

        assert_eq!(fs::read(&old_path).unwrap(), b"version-1+fix");
        assert_eq!(summary.old_size, 9);
        assert_eq!(summary.new_size, 13);
        assert!(summary.new_hash.is_none());
    }

    #[test]
    fn test_verify_hash() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("app.bin");
        let out_path = dir.path().join("app.new");
        fs::write(&old_path, b"abc").unwrap();
        let patch_path = write_patch(dir.path(), b"abc", b"def");

        let expected = Blake3Provider.hash_bytes(b"abcdef");
        let summary = apply_patch_file(
            &old_path,
            &patch_path,
            &out_path,
            PatchVariant::Raw,
            Some(Verify {
                provider: &Blake3Provider,
                expected: &expected,
            }),
        )
        .unwrap();
        assert_eq!(summary.new_hash.as_deref(), Some(expected.as_str()));

        let wrong = Blake3Provider.hash_bytes(b"something else");
        let err = apply_patch_file(
            &old_path,
            &patch_path,
            &out_path,
            PatchVariant::Raw,
            Some(Verify {
                provider: &Blake3Provider,
                expected: &wrong,
            }),
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::HashMismatch { .. }));
    }

    #[test]
    fn test_corrupt_patch_leaves_output_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let old_path = dir.path().join("app.bin");
        fs::write(&old_path, b"keep me").unwrap();
        let patch_path = dir.path().join("bad.patch");
        fs::write(&patch_path, b"NOTAPATCH").unwrap();

        let err =
            apply_patch_file(&old_path, &patch_path, &old_path, PatchVariant::Raw, None).unwrap_err();

        assert!(matches!(
            err,
            ApplyError::Format(FormatError::TooShort { .. })
        ));
        assert_eq!(fs::read(&old_path).unwrap(), b"keep me");
    }

    #[test]
    fn test_missing_original() {
        let dir = tempfile::tempdir().unwrap();
        let patch_path = write_patch(dir.path(), b"", b"x");
        let err = apply_patch_file(
            &dir.path().join("missing"),
            &patch_path,
            &dir.path().join("out"),
            PatchVariant::Raw,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::Io { .. }));
    }
}
