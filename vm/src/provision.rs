use async_trait::async_trait;
use rand::TryRngCore;
use std::fmt::{self, Display};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::cache::{CacheError, CachedImage, ImageCache};
use crate::catalog::{CatalogError, DistroCatalog, DistroRecord};
use crate::domain::{DomainComposer, DomainError, DomainParams, memory_kib};
use crate::hypervisor::{DomainHandle, Hypervisor, HypervisorError};
use crate::identity::{IdentityError, MacAddress, NameList, random_mac, random_uuid};
use crate::seed::{SeedBuilder, SeedError, SeedVolume};
use crate::volume::{StorageVolume, VolumeError, VolumeProvisioner};

/// Where a provisioning run is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Planning,
    AwaitingConfirmation,
    Acquiring,
    SeedBuilding,
    ProvisioningStorage,
    Composing,
    Creating,
    Done,
}

impl Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Planning => "planning",
            Stage::AwaitingConfirmation => "awaiting confirmation",
            Stage::Acquiring => "acquiring base image",
            Stage::SeedBuilding => "building seed image",
            Stage::ProvisioningStorage => "provisioning storage",
            Stage::Composing => "composing domain",
            Stage::Creating => "creating domain",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// What the operator asked for.
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    /// Picked from the name list when unset.
    pub name: Option<String>,
    pub distro: String,
    /// 0 means the distro's minimum.
    pub requested_size_gb: u64,
    pub memory_mb: u64,
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub vm_name: String,
    pub distro: DistroRecord,
    pub requested_size_gb: u64,
    pub memory_mb: u64,
}

impl ProvisionRequest {
    /// Never smaller than the image needs.
    pub fn effective_size_gb(&self) -> u64 {
        self.requested_size_gb.max(self.distro.min_size_gb)
    }
}

/// Everything shown to the operator before anything is changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub vm_name: String,
    pub distro: String,
    pub dataset: String,
    pub device_path: PathBuf,
    pub size_gb: u64,
    pub image_url: String,
    pub mac: MacAddress,
    pub memory_mb: u64,
}

/// The person at the keyboard.
#[async_trait]
pub trait Operator: Send {
    /// Returns once the operator accepts `plan`.
    async fn confirm(&mut self, plan: &Plan) -> std::io::Result<()>;
}

#[derive(Error, Debug)]
pub enum ProvisionCause {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    #[error("can't read confirmation: {0}")]
    Confirmation(#[source] std::io::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Seed(#[from] SeedError),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// A run that stopped at `stage`.
#[derive(Error, Debug)]
#[error("{stage} failed: {cause}")]
pub struct ProvisionFailure {
    pub stage: Stage,
    #[source]
    pub cause: ProvisionCause,
    /// Set once the volume exists; nothing removes it automatically.
    pub volume: Option<StorageVolume>,
}

impl ProvisionFailure {
    /// The command that undoes what this run left behind, if anything.
    pub fn remedy(&self) -> Option<String> {
        self.volume.as_ref().map(StorageVolume::destroy_command)
    }
}

fn failed<E: Into<ProvisionCause>>(stage: Stage) -> impl FnOnce(E) -> ProvisionFailure {
    move |cause| ProvisionFailure {
        stage,
        cause: cause.into(),
        volume: None,
    }
}

fn failed_after<E: Into<ProvisionCause>>(
    stage: Stage,
    volume: &StorageVolume,
) -> impl FnOnce(E) -> ProvisionFailure + '_ {
    move |cause| ProvisionFailure {
        stage,
        cause: cause.into(),
        volume: Some(volume.clone()),
    }
}

#[derive(Debug, Clone)]
pub struct Provisioned {
    pub domain: DomainHandle,
    pub volume: StorageVolume,
    pub seed: SeedVolume,
    pub image: CachedImage,
    pub mac: MacAddress,
    pub vm_id: Uuid,
}

/// Builds one machine, start to finish.
pub struct Provisioner {
    pub catalog: DistroCatalog,
    pub names: NameList,
    pub cache: ImageCache,
    pub seeds: SeedBuilder,
    pub volumes: VolumeProvisioner,
    pub composer: DomainComposer,
}

impl Provisioner {
    /// Nothing on the host changes until `operator` confirms the plan. After
    /// that the first error ends the run; see [`ProvisionFailure::remedy`].
    #[instrument(skip_all, fields(distro = %options.distro))]
    pub async fn provision<R, H, O>(
        &self,
        options: &ProvisionOptions,
        rng: &mut R,
        hypervisor: &mut H,
        operator: &mut O,
    ) -> Result<Provisioned, ProvisionFailure>
    where
        R: TryRngCore + ?Sized,
        H: Hypervisor + ?Sized,
        O: Operator + ?Sized,
    {
        let mut stage = Stage::Planning;
        debug!(%stage);

        let distro = self
            .catalog
            .resolve(&options.distro)
            .map_err(failed(stage))?
            .clone();

        let vm_name = match &options.name {
            Some(name) => name.clone(),
            None => self.names.random_name(rng).map_err(failed(stage))?,
        };
        self.volumes.check_name(&vm_name).map_err(failed(stage))?;
        let memory_kib = memory_kib(options.memory_mb).map_err(failed(stage))?;

        let mac = random_mac(rng).map_err(failed(stage))?;

        hypervisor.connect().await.map_err(failed(stage))?;

        let request = ProvisionRequest {
            vm_name,
            distro,
            requested_size_gb: options.requested_size_gb,
            memory_mb: options.memory_mb,
        };
        let plan = self.plan(&request, mac);

        stage = Stage::AwaitingConfirmation;
        debug!(%stage);
        operator
            .confirm(&plan)
            .await
            .map_err(|error| failed(stage)(ProvisionCause::Confirmation(error)))?;

        stage = Stage::Acquiring;
        debug!(%stage);
        let image = self
            .cache
            .ensure(&request.distro.checksum, &request.distro.download_url)
            .await
            .map_err(failed(stage))?;

        stage = Stage::SeedBuilding;
        debug!(%stage);
        let seed = self
            .seeds
            .build(&request.vm_name, &request.distro.name)
            .await
            .map_err(failed(stage))?;

        stage = Stage::ProvisioningStorage;
        debug!(%stage);
        let volume = self
            .volumes
            .create_volume(&request.vm_name, plan.size_gb)
            .await
            .map_err(failed(stage))?;
        self.volumes
            .import_image(&image.path, &volume)
            .await
            .map_err(failed_after(stage, &volume))?;

        stage = Stage::Composing;
        debug!(%stage);
        let vm_id = random_uuid(rng).map_err(failed_after(stage, &volume))?;
        let params = DomainParams::new(
            &request.vm_name,
            vm_id,
            memory_kib,
            volume.device_path.clone(),
            seed.iso_path.clone(),
            mac,
        );
        let xml = self
            .composer
            .render(&params)
            .map_err(failed_after(stage, &volume))?;

        stage = Stage::Creating;
        debug!(%stage);
        let domain = hypervisor
            .create_domain(&xml)
            .await
            .map_err(failed_after(stage, &volume))?;

        stage = Stage::Done;
        info!(%stage, "provisioned {}", domain.name);

        Ok(Provisioned {
            domain,
            volume,
            seed,
            image,
            mac,
            vm_id,
        })
    }

    pub fn plan(&self, request: &ProvisionRequest, mac: MacAddress) -> Plan {
        Plan {
            vm_name: request.vm_name.clone(),
            distro: request.distro.name.clone(),
            dataset: self.volumes.dataset(&request.vm_name),
            device_path: self.volumes.device_path(&request.vm_name),
            size_gb: request.effective_size_gb(),
            image_url: request.distro.download_url.clone(),
            mac,
            memory_mb: request.memory_mb,
        }
    }
}
