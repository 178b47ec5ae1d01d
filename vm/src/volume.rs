use mkvm_cmd::{Command, CommandError, CommandRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("{name:?} is not a valid volume name")]
    InvalidName { name: String },

    #[error("{namespace:?} is not a valid storage namespace")]
    InvalidNamespace { namespace: String },

    #[error("volume size must be at least 1 GB")]
    ZeroSize,

    #[error("can't create volume {dataset}: {source}")]
    VolumeCreateFailed {
        dataset: String,
        #[source]
        source: CommandError,
    },

    #[error("can't import {image} into {dataset}: {source}")]
    ImageImportFailed {
        image: PathBuf,
        dataset: String,
        #[source]
        source: CommandError,
    },
}

/// A block volume that exists on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageVolume {
    pub namespace: String,
    pub name: String,
    pub size_gb: u64,
    pub device_path: PathBuf,
}

impl StorageVolume {
    /// `<namespace>/<name>`, as the storage tooling names it.
    pub fn dataset(&self) -> String {
        dataset(&self.namespace, &self.name)
    }

    /// The command an operator runs to remove this volume by hand.
    pub fn destroy_command(&self) -> String {
        format!("zfs destroy {}", self.dataset())
    }
}

fn dataset(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Where a volume's block device shows up once created.
pub fn device_path(namespace: &str, name: &str) -> PathBuf {
    Path::new("/dev/zvol").join(namespace).join(name)
}

fn valid_component(part: &str) -> bool {
    !part.is_empty()
        && part != "."
        && part != ".."
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// Creates zvols and fills them with a base image.
pub struct VolumeProvisioner {
    runner: Arc<dyn CommandRunner>,
    namespace: String,
    privileged: bool,
    zfs: PathBuf,
    qemu_img: PathBuf,
}

impl VolumeProvisioner {
    /// `namespace` is the parent dataset, with or without a trailing `/`.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        namespace: &str,
        zfs: impl Into<PathBuf>,
        qemu_img: impl Into<PathBuf>,
    ) -> Result<Self, VolumeError> {
        let namespace = namespace.trim_end_matches('/').to_owned();
        if namespace.starts_with('/') || !namespace.split('/').all(valid_component) {
            return Err(VolumeError::InvalidNamespace { namespace });
        }
        Ok(Self {
            runner,
            namespace,
            privileged: true,
            zfs: zfs.into(),
            qemu_img: qemu_img.into(),
        })
    }

    /// Whether storage commands are wrapped in `sudo`.
    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn dataset(&self, name: &str) -> String {
        dataset(&self.namespace, name)
    }

    pub fn device_path(&self, name: &str) -> PathBuf {
        device_path(&self.namespace, name)
    }

    /// Whether `name` can become a volume directly under the namespace.
    pub fn check_name(&self, name: &str) -> Result<(), VolumeError> {
        if valid_component(name) {
            Ok(())
        } else {
            Err(VolumeError::InvalidName {
                name: name.to_owned(),
            })
        }
    }

    #[instrument(skip(self))]
    pub async fn create_volume(
        &self,
        name: &str,
        size_gb: u64,
    ) -> Result<StorageVolume, VolumeError> {
        self.check_name(name)?;
        if size_gb == 0 {
            return Err(VolumeError::ZeroSize);
        }

        let dataset = self.dataset(name);

        let mut cmd = Command::new(&self.zfs);
        cmd.arg("create")
            .arg("-V")
            .arg(format!("{size_gb}G"))
            .arg(&dataset);

        self.runner
            .run(&cmd.sudo_if(self.privileged))
            .await
            .map_err(|source| VolumeError::VolumeCreateFailed {
                dataset: dataset.clone(),
                source,
            })?;

        info!("created {size_gb}G volume {dataset}");

        Ok(StorageVolume {
            namespace: self.namespace.clone(),
            name: name.to_owned(),
            size_gb,
            device_path: self.device_path(name),
        })
    }

    /// Convert `image` to raw and write it over the start of `volume`.
    #[instrument(skip(self))]
    pub async fn import_image(
        &self,
        image: &Path,
        volume: &StorageVolume,
    ) -> Result<(), VolumeError> {
        let mut cmd = Command::new(&self.qemu_img);
        cmd.arg("convert")
            .args(["-O", "raw"])
            .arg(image)
            .arg(&volume.device_path)
            .stdout(true);

        self.runner
            .run(&cmd.sudo_if(self.privileged))
            .await
            .map_err(|source| VolumeError::ImageImportFailed {
                image: image.to_owned(),
                dataset: volume.dataset(),
                source,
            })?;

        info!("imported {} into {}", image.display(), volume.dataset());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRunner;

    fn provisioner(runner: Arc<RecordingRunner>) -> VolumeProvisioner {
        VolumeProvisioner::new(runner, "rpool/mkvm-test/", "zfs", "qemu-img").unwrap()
    }

    #[tokio::test]
    async fn creates_sized_volume_with_sudo() {
        let runner = Arc::new(RecordingRunner::default());
        let volumes = provisioner(runner.clone());

        let volume = volumes.create_volume("test1", 4).await.unwrap();

        assert_eq!(volume.dataset(), "rpool/mkvm-test/test1");
        assert_eq!(
            volume.device_path,
            Path::new("/dev/zvol/rpool/mkvm-test/test1")
        );
        assert_eq!(volume.destroy_command(), "zfs destroy rpool/mkvm-test/test1");
        assert_eq!(
            runner.command_lines(),
            ["sudo -n zfs create -V 4G rpool/mkvm-test/test1"]
        );
    }

    #[tokio::test]
    async fn unprivileged_skips_sudo() {
        let runner = Arc::new(RecordingRunner::default());
        let volumes = provisioner(runner.clone()).privileged(false);

        let volume = volumes.create_volume("test1", 4).await.unwrap();
        volumes
            .import_image(Path::new("/cache/qcow2/abc123"), &volume)
            .await
            .unwrap();

        assert_eq!(
            runner.command_lines(),
            [
                "zfs create -V 4G rpool/mkvm-test/test1",
                "qemu-img convert -O raw /cache/qcow2/abc123 /dev/zvol/rpool/mkvm-test/test1",
            ]
        );
    }

    #[tokio::test]
    async fn create_failure_carries_tool_output() {
        let runner =
            Arc::new(RecordingRunner::default().fail_on("zfs", "dataset already exists"));
        let volumes = provisioner(runner);

        let err = volumes.create_volume("test1", 4).await.unwrap_err();
        match err {
            VolumeError::VolumeCreateFailed { dataset, source } => {
                assert_eq!(dataset, "rpool/mkvm-test/test1");
                assert!(source.to_string().contains("dataset already exists"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn import_failure_names_the_volume() {
        let runner = Arc::new(RecordingRunner::default().fail_on("qemu-img", "no space left"));
        let volumes = provisioner(runner);

        let volume = volumes.create_volume("test1", 4).await.unwrap();
        let err = volumes
            .import_image(Path::new("/cache/qcow2/abc123"), &volume)
            .await
            .unwrap_err();
        assert!(matches!(err, VolumeError::ImageImportFailed { .. }));
    }

    #[tokio::test]
    async fn rejects_names_that_escape_the_namespace() {
        let runner = Arc::new(RecordingRunner::default());
        let volumes = provisioner(runner.clone());

        for bad in ["", "..", "a/b", "has space"] {
            assert!(matches!(
                volumes.create_volume(bad, 4).await,
                Err(VolumeError::InvalidName { .. })
            ));
        }
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn rejects_bad_namespaces() {
        let runner: Arc<dyn CommandRunner> = Arc::new(RecordingRunner::default());
        for bad in ["", "/rpool", "rpool//vms", "rpool/../etc"] {
            assert!(
                VolumeProvisioner::new(runner.clone(), bad, "zfs", "qemu-img").is_err(),
                "{bad}"
            );
        }
    }
}
