use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use selfpatch::{
    apply_patch_file, update, AtomicReplacer, ContentStore, HashAlgorithm, PatchVariant,
    ReplaceOptions, StoreConfig, UpdateCommand, UpdateCoordinator, Verify,
};

#[derive(Parser)]
#[command(name = "selfpatch", about = "Self-update patch applier and artifact store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild a file from an original and a bsdiff-style patch
    Apply {
        /// Path to the original file
        #[arg(long)]
        old: PathBuf,
        /// Path to the patch file
        #[arg(long, short)]
        patch: PathBuf,
        /// Where to write the rebuilt file (may equal --old)
        #[arg(long, short)]
        output: PathBuf,
        /// Container layout of the patch
        #[arg(long, value_enum, default_value_t = PatchVariant::Raw)]
        format: PatchVariant,
        /// Expected hex digest of the rebuilt file
        #[arg(long)]
        expect: Option<String>,
        /// Digest algorithm used for --expect
        #[arg(long, value_enum, default_value_t = HashAlgorithm::Blake3)]
        hash: HashAlgorithm,
    },
    /// Work with a content-addressed artifact store
    Store {
        /// JSON store config; overrides the flags below
        #[arg(long)]
        store_config: Option<PathBuf>,
        /// Store root directory
        #[arg(long)]
        root: Option<PathBuf>,
        /// Compress objects with zstd
        #[arg(long)]
        compress: bool,
        #[arg(long, value_enum, default_value_t = HashAlgorithm::Blake3)]
        hash: HashAlgorithm,
        #[command(subcommand)]
        action: StoreAction,
    },
    /// Replace <target> with <source> once <old_pid> exits
    #[command(name = update::UPDATE_ARG)]
    Update {
        old_pid: u32,
        target: PathBuf,
        source: PathBuf,
        #[arg(action = clap::ArgAction::Set, value_parser = clap::builder::BoolishValueParser::new())]
        restart: bool,
    },
    /// Clean up after a successful update
    #[command(name = update::UPDATE_FINISHED_ARG)]
    UpdateFinished { source: PathBuf },
    /// Report a failed update
    #[command(name = update::UPDATE_FAILED_ARG)]
    UpdateFailed { reason: String },
}

#[derive(Subcommand)]
enum StoreAction {
    /// Store a file and print its hash
    Put { file: PathBuf },
    /// Copy an object out to a file
    Get { hash: String, output: PathBuf },
    /// Exit with 0 if the object exists, 1 otherwise
    Exists { hash: String },
    /// Delete objects; prints how many were removed
    Delete { hashes: Vec<String> },
    /// Move legacy flat-layout objects into their shards
    Migrate,
    /// Print every stored hash
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Apply {
            old,
            patch,
            output,
            format,
            expect,
            hash,
        } => {
            log::info!("Applying {} to {}", patch.display(), old.display());

            let start = Instant::now();
            let summary = tokio::task::spawn_blocking(move || {
                let provider = hash.provider();
                let verify = expect.as_deref().map(|expected| Verify {
                    provider: provider.as_ref(),
                    expected,
                });
                apply_patch_file(&old, &patch, &output, format, verify)
            })
            .await??;
            let elapsed = start.elapsed();

            log::info!(
                "Patch applied: {} -> {} bytes using {} byte patch in {:.3}s",
                summary.old_size,
                summary.new_size,
                summary.patch_size,
                elapsed.as_secs_f64()
            );
        }
        Commands::Store {
            store_config,
            root,
            compress,
            hash,
            action,
        } => {
            let config = match (store_config, root) {
                (Some(path), _) => StoreConfig::load(&path)?,
                (None, Some(root)) => StoreConfig {
                    compress_objects: compress,
                    hash,
                    ..StoreConfig::new(root)
                },
                (None, None) => bail!("either --store-config or --root is required"),
            };
            let store = ContentStore::from_config(&config)?;
            let code = tokio::task::spawn_blocking(move || run_store_action(&store, action)).await??;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Update {
            old_pid,
            target,
            source,
            restart,
        } => {
            run_coordinator(UpdateCommand::Update {
                old_pid,
                target,
                source,
                restart,
            })
            .await?
        }
        Commands::UpdateFinished { source } => {
            run_coordinator(UpdateCommand::Finished { source }).await?
        }
        Commands::UpdateFailed { reason } => {
            run_coordinator(UpdateCommand::Failed { reason }).await?
        }
    }

    Ok(())
}

async fn run_coordinator(command: UpdateCommand) -> Result<()> {
    let outcome = tokio::task::spawn_blocking(move || {
        let mut coordinator = UpdateCoordinator::new(AtomicReplacer::new(ReplaceOptions::default()));
        coordinator.run(command)
    })
    .await
    .context("Update worker panicked")?;

    let code = outcome.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn run_store_action(store: &ContentStore, action: StoreAction) -> Result<i32> {
    match action {
        StoreAction::Put { file } => {
            let hash = store
                .put_file(&file)
                .with_context(|| format!("Failed to store {}", file.display()))?;
            println!("{hash}");
        }
        StoreAction::Get { hash, output } => {
            let Some(mut reader) = store.get(&hash)? else {
                bail!("Object not found: {hash}");
            };
            let file = File::create(&output)
                .with_context(|| format!("Failed to create {}", output.display()))?;
            let mut writer = BufWriter::new(file);
            io::copy(&mut reader, &mut writer)
                .and_then(|_| writer.flush())
                .with_context(|| format!("Failed to write {}", output.display()))?;
        }
        StoreAction::Exists { hash } => {
            if !store.exists(&hash) {
                return Ok(1);
            }
        }
        StoreAction::Delete { hashes } => {
            println!("{}", store.delete_many(&hashes));
        }
        StoreAction::Migrate => {
            let moved = store.migrate_all()?;
            log::info!("Migrated {moved} objects");
        }
        StoreAction::List => {
            for hash in store.list()? {
                println!("{hash}");
            }
        }
    }
    Ok(0)
}
