//! Provisioning a single virtual machine on a local libvirt and ZFS host.

mod cache;
mod catalog;
mod domain;
mod executables;
mod hypervisor;
mod identity;
mod paths;
mod provision;
mod seed;
#[cfg(test)]
mod testing;
mod volume;

pub use crate::cache::{CacheError, CachedImage, ImageCache};
pub use crate::catalog::{CatalogError, DistroCatalog, DistroRecord};
pub use crate::domain::{
    DEFAULT_NETWORK, DEFAULT_VCPUS, DomainComposer, DomainError, DomainParams, memory_kib,
};
pub use crate::executables::{ExecutableNotFound, Executables};
pub use crate::hypervisor::{
    DEFAULT_CONNECT_TIMEOUT, DomainHandle, Hypervisor, HypervisorError, LibvirtHypervisor,
};
pub use crate::identity::{IdentityError, MacAddress, NameList, random_mac, random_uuid};
pub use crate::paths::Paths;
pub use crate::provision::{
    Operator, Plan, ProvisionCause, ProvisionFailure, ProvisionOptions, ProvisionRequest,
    Provisioned, Provisioner, Stage,
};
pub use crate::seed::{SEED_VOLUME_LABEL, SeedBuilder, SeedError, SeedTemplate, SeedVolume};
pub use crate::volume::{StorageVolume, VolumeError, VolumeProvisioner, device_path};
pub use mkvm_libvirt::{DEFAULT_SOCKET, DEFAULT_URI};
