mod config;
mod console;

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use comfy_table::Table;
use mkvm_cmd::{CommandRunner, SystemRunner};
use mkvm_env::{Environment, EnvironmentError};
use mkvm_http::{HttpClient, HttpError};
use mkvm_vm::{
    CatalogError, DEFAULT_CONNECT_TIMEOUT, DEFAULT_SOCKET, DEFAULT_URI, DistroCatalog,
    DomainComposer, DomainError, ExecutableNotFound, Executables, Hypervisor, IdentityError,
    ImageCache, LibvirtHypervisor, NameList, Paths, ProvisionCause, ProvisionFailure,
    ProvisionOptions, Provisioner, SeedBuilder, SeedError, SeedTemplate, VolumeError,
    VolumeProvisioner,
};
use nix::unistd::Uid;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use crate::config::{Config, ConfigError, DEFAULT_MEMORY_MB, DEFAULT_ZVOL_PREFIX};
pub use crate::console::ConsoleOperator;

#[derive(Parser, Debug)]
#[command(
    name = "mkvm",
    version,
    about = "Create a virtual machine on a local libvirt and ZFS host"
)]
pub struct Cli {
    /// Distro to install
    #[arg(long, default_value = "alpine-edge")]
    pub distro: String,

    /// Name of the machine, picked at random if unset
    #[arg(long)]
    pub name: Option<String>,

    /// Parent dataset for the machine's zvol
    #[arg(long = "zvol-prefix")]
    pub zvol_prefix: Option<String>,

    /// Size of the zvol in GB; 0 uses the distro's minimum
    #[arg(long = "zvol-size", default_value_t = 0)]
    pub zvol_size: u64,

    /// Guest memory in MB
    #[arg(long)]
    pub memory: Option<u64>,

    #[arg(long = "config", env = "MKVM_CONFIG")]
    pub config_path: Option<PathBuf>,

    #[arg(long = "log", default_value = "info")]
    pub log: String,

    /// Print the known distros and exit
    #[arg(long = "list-distros")]
    pub list_distros: bool,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Env(#[from] EnvironmentError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Executables(#[from] ExecutableNotFound),

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Seed(#[from] SeedError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Provision(#[from] ProvisionFailure),
}

impl AppError {
    /// What the operator should run to clean up after a failed run.
    pub fn remedy(&self) -> Option<String> {
        match self {
            AppError::Provision(failure) => failure.remedy(),
            _ => None,
        }
    }

    /// The distros to suggest when the requested one doesn't exist.
    pub fn known_distros(&self) -> Option<&[String]> {
        let not_found = match self {
            AppError::Catalog(error) => error,
            AppError::Provision(ProvisionFailure {
                cause: ProvisionCause::Catalog(error),
                ..
            }) => error,
            _ => return None,
        };
        match not_found {
            CatalogError::NotFound { known, .. } => Some(known),
            _ => None,
        }
    }
}

pub async fn get_config(cli: &Cli, env: &Environment) -> Result<Config, AppError> {
    let config = match &cli.config_path {
        Some(path) => Config::load(path, true).await?,
        None => Config::load(&env.config_file(), false).await?,
    };
    Ok(config)
}

pub async fn get_catalog(config: &Config) -> Result<DistroCatalog, AppError> {
    let catalog = match &config.catalog {
        Some(path) => DistroCatalog::load(path).await?,
        None => DistroCatalog::builtin()?,
    };
    Ok(catalog)
}

pub fn distro_table(catalog: &DistroCatalog) -> Table {
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::UTF8_FULL)
        .apply_modifier(comfy_table::modifiers::UTF8_ROUND_CORNERS)
        .set_content_arrangement(comfy_table::ContentArrangement::Dynamic)
        .set_header(vec!["name", "min size", "url"]);

    for distro in catalog.list() {
        table.add_row(vec![
            distro.name.clone(),
            format!("{} GB", distro.min_size_gb),
            distro.download_url.clone(),
        ]);
    }

    table
}

/// Storage commands need root; skip `sudo` when we already are.
fn use_sudo(config: &Config) -> bool {
    config.sudo.unwrap_or(true) && !Uid::effective().is_root()
}

pub async fn run(cli: Cli) -> Result<(), AppError> {
    let env = Environment::create()?;
    let config = get_config(&cli, &env).await?;
    let catalog = get_catalog(&config).await?;

    if cli.list_distros {
        println!("{}", distro_table(&catalog));
        return Ok(());
    }

    // Unknown distros are reported before anything else is looked up.
    catalog.resolve(&cli.distro)?;

    let executables = Executables::detect()?;
    debug!(?executables);

    let paths = Paths::new(
        config
            .cache_dir
            .clone()
            .unwrap_or_else(|| env.cache_dir().to_owned()),
    );
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let zvol_prefix = cli
        .zvol_prefix
        .as_deref()
        .or(config.zvol_prefix.as_deref())
        .unwrap_or(DEFAULT_ZVOL_PREFIX);

    let mut composer = DomainComposer::builtin()?;
    if let Some(vcpus) = config.vcpus {
        composer = composer.vcpus(vcpus);
    }
    if let Some(network) = &config.network {
        composer = composer.network(network.clone());
    }

    let provisioner = Provisioner {
        catalog,
        names: NameList::builtin()?,
        cache: ImageCache::new(paths.clone(), HttpClient::new()?)
            .verify_checksums(config.verify_checksum.unwrap_or(false)),
        seeds: SeedBuilder::new(
            SeedTemplate::builtin(),
            paths.clone(),
            &executables.iso_tool,
            runner.clone(),
        )?,
        volumes: VolumeProvisioner::new(
            runner,
            zvol_prefix,
            &executables.zfs,
            &executables.qemu_img,
        )?
        .privileged(use_sudo(&config)),
        composer,
    };

    let options = ProvisionOptions {
        name: cli.name,
        distro: cli.distro,
        requested_size_gb: cli.zvol_size,
        memory_mb: cli.memory.or(config.memory).unwrap_or(DEFAULT_MEMORY_MB),
    };

    let mut hypervisor = LibvirtHypervisor::new(
        config
            .libvirt_socket
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET)),
        config
            .connect_uri
            .clone()
            .unwrap_or_else(|| DEFAULT_URI.to_owned()),
        config.connect_timeout().unwrap_or(DEFAULT_CONNECT_TIMEOUT),
    );
    let mut operator = ConsoleOperator::stdio();

    let provisioned = provisioner
        .provision(&options, &mut OsRng, &mut hypervisor, &mut operator)
        .await?;

    info!("created {}", provisioned.domain.name);

    if let Err(err) = hypervisor.close().await {
        warn!("can't close libvirt connection: {err}");
    }

    Ok(())
}
