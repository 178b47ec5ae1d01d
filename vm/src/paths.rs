use std::path::PathBuf;

/// Layout of the on-disk cache shared by every run of the tool.
#[derive(Debug, Clone)]
pub struct Paths {
    cache_dir: PathBuf,
}

impl Paths {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn images_dir(&self) -> PathBuf {
        self.cache_dir.join("qcow2")
    }

    pub fn image_file(&self, checksum: &str) -> PathBuf {
        self.images_dir().join(checksum)
    }

    pub fn seeds_dir(&self) -> PathBuf {
        self.cache_dir.join("seed")
    }

    pub fn seed_file(&self, vm_name: &str, distro: &str) -> PathBuf {
        self.seeds_dir().join(format!("{vm_name}-{distro}.iso"))
    }
}
