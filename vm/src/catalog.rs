use mkvm_fs::{self as fs, FsError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

const BUILTIN_CATALOG: &str = include_str!("../distros.toml");

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("can't read list of distros: {0}")]
    Read(#[from] FsError),

    #[error("can't parse list of distros: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("distro {name} has a minimum size of 0 GB")]
    ZeroMinSize { name: String },

    #[error("distro {name} is listed more than once")]
    Duplicate { name: String },

    #[error("can't find distro {name}")]
    NotFound { name: String, known: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistroRecord {
    pub name: String,
    pub download_url: String,
    /// sha256 of the image; also its key in the image cache.
    #[serde(rename = "sha256")]
    pub checksum: String,
    /// Smallest disk, in GB, the image fits on.
    #[serde(rename = "min_size")]
    pub min_size_gb: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogToml {
    #[serde(default)]
    distros: Vec<DistroRecord>,
}

#[derive(Debug, Clone)]
pub struct DistroCatalog {
    distros: Vec<DistroRecord>,
}

impl DistroCatalog {
    pub fn new(distros: Vec<DistroRecord>) -> Result<Self, CatalogError> {
        for (index, distro) in distros.iter().enumerate() {
            if distro.min_size_gb == 0 {
                return Err(CatalogError::ZeroMinSize {
                    name: distro.name.clone(),
                });
            }
            if distros[..index].iter().any(|d| d.name == distro.name) {
                return Err(CatalogError::Duplicate {
                    name: distro.name.clone(),
                });
            }
        }
        Ok(Self { distros })
    }

    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_toml(BUILTIN_CATALOG)
    }

    pub fn from_toml(source: &str) -> Result<Self, CatalogError> {
        let CatalogToml { distros } = toml::from_str(source)?;
        Self::new(distros)
    }

    pub async fn load(path: &Path) -> Result<Self, CatalogError> {
        let source = fs::read_file_to_string(path).await?;
        Self::from_toml(&source)
    }

    /// All distros, in catalog order.
    pub fn list(&self) -> &[DistroRecord] {
        &self.distros
    }

    pub fn names(&self) -> Vec<String> {
        self.distros.iter().map(|d| d.name.clone()).collect()
    }

    /// Exact, case-sensitive lookup.
    pub fn resolve(&self, name: &str) -> Result<&DistroRecord, CatalogError> {
        self.distros
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| CatalogError::NotFound {
                name: name.to_owned(),
                known: self.names(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
        [[distros]]
        name = "alpine-edge"
        download_url = "http://x/alpine.qcow2"
        sha256 = "abc123"
        min_size = 4

        [[distros]]
        name = "arch"
        download_url = "http://x/arch.qcow2"
        sha256 = "def456"
        min_size = 2
    "#;

    #[test]
    fn builtin_catalog_parses() {
        let catalog = DistroCatalog::builtin().unwrap();
        assert!(!catalog.list().is_empty());
        assert!(catalog.resolve("alpine-edge").is_ok());
    }

    #[test]
    fn resolve_is_exact() {
        let catalog = DistroCatalog::from_toml(CATALOG).unwrap();
        let alpine = catalog.resolve("alpine-edge").unwrap();
        assert_eq!(alpine.checksum, "abc123");
        assert_eq!(alpine.min_size_gb, 4);

        let err = catalog.resolve("Alpine-Edge").unwrap_err();
        match err {
            CatalogError::NotFound { name, known } => {
                assert_eq!(name, "Alpine-Edge");
                assert_eq!(known, vec!["alpine-edge", "arch"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn list_keeps_catalog_order() {
        let catalog = DistroCatalog::from_toml(CATALOG).unwrap();
        assert_eq!(catalog.names(), vec!["alpine-edge", "arch"]);
    }

    #[test]
    fn zero_min_size_is_rejected() {
        let err = DistroCatalog::from_toml(
            r#"
            [[distros]]
            name = "tiny"
            download_url = "http://x/tiny.qcow2"
            sha256 = "0"
            min_size = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CatalogError::ZeroMinSize { .. }));
    }

    #[test]
    fn garbage_is_unavailable() {
        let err = DistroCatalog::from_toml("distros = 7").unwrap_err();
        assert!(matches!(err, CatalogError::Parse(_)));
    }

    #[tokio::test]
    async fn missing_file_is_unavailable() {
        let err = DistroCatalog::load(Path::new("/nonexistent/distros.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Read(_)));
    }
}
