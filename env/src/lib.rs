// Inspiration: https://github.com/cubic-vm/cubic/blob/68566f79d72e2037bce1b75246d92e6da7b999e5/src/env/environment_factory.rs

use std::{
    env::{self, VarError},
    path::{Path, PathBuf},
};

use thiserror::Error;

const PROJECT_NAME: &str = "mkvm";

/// Per-user directories for the tool.
#[derive(Debug, Clone)]
pub struct Environment {
    config_dir: PathBuf,
    cache_dir: PathBuf,
}

#[derive(Error, Debug, Clone)]
pub enum EnvironmentError {
    #[error("cannot locate user directories: {0}")]
    Var(#[from] VarError),
}

impl Environment {
    pub fn new(config_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            config_dir,
            cache_dir,
        }
    }

    #[cfg(not(target_os = "macos"))]
    pub fn create() -> Result<Environment, EnvironmentError> {
        Self::from_vars(|var| env::var(var))
    }

    #[cfg(target_os = "macos")]
    pub fn create() -> Result<Environment, EnvironmentError> {
        let home_dir: PathBuf = env::var("HOME").map(From::from)?;

        Ok(Environment::new(
            home_dir
                .join("Library")
                .join("Application Support")
                .join(PROJECT_NAME),
            home_dir.join("Library").join("Caches").join(PROJECT_NAME),
        ))
    }

    #[cfg_attr(target_os = "macos", allow(dead_code))]
    fn from_vars<F>(var: F) -> Result<Environment, EnvironmentError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let config_dirs: PathBuf = var("XDG_CONFIG_HOME")
            .or_else(|_| var("HOME").map(|home| format!("{home}/.config")))
            .map(From::from)?;

        let cache_dirs: PathBuf = var("XDG_CACHE_HOME")
            .or_else(|_| var("HOME").map(|home| format!("{home}/.cache")))
            .map(From::from)?;

        Ok(Environment::new(
            config_dirs.join(PROJECT_NAME),
            cache_dirs.join(PROJECT_NAME),
        ))
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("mkvm.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, VarError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned().ok_or(VarError::NotPresent)
    }

    #[test]
    fn xdg_vars_win() {
        let env = Environment::from_vars(lookup(&[
            ("XDG_CONFIG_HOME", "/xdg/config"),
            ("XDG_CACHE_HOME", "/xdg/cache"),
            ("HOME", "/home/op"),
        ]))
        .unwrap();
        assert_eq!(env.cache_dir(), Path::new("/xdg/cache/mkvm"));
        assert_eq!(env.config_file(), Path::new("/xdg/config/mkvm/mkvm.toml"));
    }

    #[test]
    fn falls_back_to_home() {
        let env = Environment::from_vars(lookup(&[("HOME", "/home/op")])).unwrap();
        assert_eq!(env.cache_dir(), Path::new("/home/op/.cache/mkvm"));
        assert_eq!(env.config_dir(), Path::new("/home/op/.config/mkvm"));
    }

    #[test]
    fn no_home_is_an_error() {
        assert!(Environment::from_vars(lookup(&[])).is_err());
    }
}
