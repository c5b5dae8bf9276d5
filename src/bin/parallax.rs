use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use log::info;

use parallax::{
    run_migration, run_removal, Config, ConfigOverrides, MigrationOutcome, Operation,
    RegistriesConf, RemovalOutcome,
};

/// Migrate container images into a squashfs-backed read-only store
#[derive(Debug, Parser)]
#[clap(name = "parallax", version)]
#[clap(group(ArgGroup::new("operation").required(true).args(["migrate", "rmi"])))]
struct App {
    /// Migrate the image into the read-only store
    #[clap(long)]
    migrate: bool,
    /// Remove the image from the read-only store
    #[clap(long)]
    rmi: bool,

    /// Image reference, short names are resolved through registries.conf
    #[clap(long)]
    image: String,

    /// Graph root of the local store
    #[clap(long, alias = "podmanRoot")]
    podman_root: Option<PathBuf>,
    /// Graph root of the read-only store
    #[clap(long, alias = "roStoragePath")]
    ro_storage_path: Option<PathBuf>,
    /// Path of the mksquashfs executable
    #[clap(long, alias = "mksquashfsPath")]
    mksquashfs_path: Option<PathBuf>,
    /// Options passed to mksquashfs, split like a shell would
    #[clap(long, alias = "mksquashfsOpts", allow_hyphen_values = true)]
    mksquashfs_opts: Option<String>,
    /// Path of the rsync executable
    #[clap(long)]
    rsync_path: Option<PathBuf>,
    /// Operate on the read-only store in place instead of through a local mirror
    #[clap(long)]
    no_mirror: bool,
    /// Log level (off, error, warn, info, debug, trace)
    #[clap(long)]
    log_level: Option<String>,

    /// KEY=VALUE configuration file
    #[clap(long)]
    config: Option<PathBuf>,
}

impl App {
    fn operation(&self) -> Operation {
        // clap guarantees exactly one of the two
        if self.migrate {
            Operation::Migrate
        } else {
            Operation::Remove
        }
    }

    fn into_config(self) -> Result<Config> {
        let operation = self.operation();
        let overrides = ConfigOverrides {
            podman_root: self.podman_root,
            ro_storage_path: self.ro_storage_path,
            mksquashfs_path: self.mksquashfs_path,
            mksquashfs_opts: self.mksquashfs_opts,
            rsync_path: self.rsync_path,
            mirror: self.no_mirror.then_some(false),
            log_level: self.log_level,
        };
        let config = Config::resolve(operation, self.image, overrides, self.config.as_deref())
            .context("loading configuration")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let config = App::parse().into_config()?;

    env_logger::Builder::new()
        .filter_level(config.log_level)
        .parse_default_env()
        .target(env_logger::Target::Stdout)
        .init();

    config.validate().context("invalid configuration")?;
    let registries = RegistriesConf::load_default().context("loading registries.conf")?;

    match config.operation {
        Operation::Migrate => {
            let outcome = run_migration(&config, &registries)
                .with_context(|| format!("migrating {}", config.image))?;
            match outcome {
                MigrationOutcome::AlreadyMigrated { image_id } => {
                    info!("Image {} is already migrated ({image_id})", config.image)
                }
                MigrationOutcome::Migrated { image_id, link, .. } => {
                    info!("Migrated {} to image {image_id} (sidecar {link})", config.image)
                }
            }
        }
        Operation::Remove => {
            let outcome = run_removal(&config, &registries)
                .with_context(|| format!("removing {}", config.image))?;
            match outcome {
                RemovalOutcome::NotFound => {
                    info!("Image {} is not in the read-only store", config.image)
                }
                RemovalOutcome::Removed { image_id, .. } => {
                    info!("Removed {} ({image_id})", config.image)
                }
            }
        }
    }

    Ok(())
}
