//! Self-update core.
//!
//! - [`patch_format`] / [`binary_patch`]: bsdiff-style patch container and
//!   the reconstruction algorithm.
//! - [`store`]: content-addressed artifact store with legacy-layout repair.
//! - [`replace`]: backup/delete/copy replacement with rollback.
//! - [`update`]: the startup-argument state machine that ties them together.

pub mod apply;
pub mod binary_patch;
pub mod error;
pub mod hash;
pub mod patch_format;
pub mod replace;
pub mod store;
pub mod update;
pub mod util;

pub use apply::{apply_patch_file, ApplySummary, Verify};
pub use binary_patch::{apply_blocks, apply_patch};
pub use error::{ApplyError, Block, FormatError, ReplaceError, StorageError};
pub use hash::{Blake3Provider, HashAlgorithm, HashProvider, Sha256Provider};
pub use patch_format::{ControlTriple, PatchBuilder, PatchFile, PatchHeader, PatchVariant, MAGIC};
pub use replace::{AtomicReplacer, ReplaceFs, ReplaceOptions, StdFs};
pub use store::{ContentStore, ObjectReader, StoreConfig};
pub use update::{ProcessRelauncher, Relauncher, UpdateCommand, UpdateCoordinator, UpdateOutcome, UpdateState};
