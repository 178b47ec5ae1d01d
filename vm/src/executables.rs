use std::ffi::OsString;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Storage tools usually live in sbin, which isn't on every user's PATH.
const SBIN_DIRS: [&str; 3] = ["/usr/local/sbin", "/usr/sbin", "/sbin"];

#[derive(Error, Debug)]
#[error("can't find {} in PATH", .candidates.join(" or "))]
pub struct ExecutableNotFound {
    pub candidates: Vec<&'static str>,
}

/// External programs a provisioning run shells out to.
#[derive(Clone, Debug)]
pub struct Executables {
    pub iso_tool: PathBuf,
    pub qemu_img: PathBuf,
    pub zfs: PathBuf,
}

impl Executables {
    /// Find every required tool. `genisoimage` is preferred over `mkisofs`,
    /// which takes the same arguments.
    pub fn detect() -> Result<Self, ExecutableNotFound> {
        let search_path = search_path();
        let find = |candidates: &[&'static str]| {
            candidates
                .iter()
                .find_map(|name| which::which_in(name, Some(&search_path), "/").ok())
                .inspect(|path| debug!("found {}", path.display()))
                .ok_or_else(|| ExecutableNotFound {
                    candidates: candidates.to_vec(),
                })
        };

        Ok(Self {
            iso_tool: find(&["genisoimage", "mkisofs"])?,
            qemu_img: find(&["qemu-img"])?,
            zfs: find(&["zfs"])?,
        })
    }
}

fn search_path() -> OsString {
    let mut path = std::env::var_os("PATH").unwrap_or_default();
    for dir in SBIN_DIRS {
        if !path.is_empty() {
            path.push(":");
        }
        path.push(dir);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_path_includes_sbin() {
        let path = search_path();
        let dirs: Vec<_> = std::env::split_paths(&path).collect();
        for dir in SBIN_DIRS {
            assert!(dirs.contains(&PathBuf::from(dir)), "{dir}");
        }
    }

    #[test]
    fn not_found_lists_candidates() {
        let err = ExecutableNotFound {
            candidates: vec!["genisoimage", "mkisofs"],
        };
        assert_eq!(err.to_string(), "can't find genisoimage or mkisofs in PATH");
    }
}
