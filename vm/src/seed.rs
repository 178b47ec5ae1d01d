use handlebars::{Handlebars, RenderError, TemplateError};
use mkvm_cmd::{Command, CommandError, CommandRunner};
use mkvm_fs::{self as fs, FsError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::paths::Paths;

/// Volume label cloud-init's NoCloud datasource looks for.
pub const SEED_VOLUME_LABEL: &str = "cidata";

const REQUIRED_DOCUMENTS: [&str; 2] = ["meta-data", "user-data"];

#[derive(Error, Debug)]
pub enum SeedError {
    #[error("seed template is missing the {name} document")]
    MissingDocument { name: String },

    #[error("can't parse seed template {name}: {source}")]
    TemplateInvalid {
        name: String,
        #[source]
        source: Box<TemplateError>,
    },

    #[error("can't generate {name}: {source}")]
    TemplateRenderFailed {
        name: String,
        #[source]
        source: RenderError,
    },

    #[error("can't make a scratch directory: {0}")]
    TempDir(#[source] std::io::Error),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("can't package seed image: {0}")]
    PackagingFailed(#[source] CommandError),
}

/// The set of boot-configuration documents, as templates.
#[derive(Debug, Clone)]
pub struct SeedTemplate {
    documents: Vec<(String, String)>,
}

impl SeedTemplate {
    pub fn new(documents: Vec<(String, String)>) -> Result<Self, SeedError> {
        for required in REQUIRED_DOCUMENTS {
            if !documents.iter().any(|(name, _)| name == required) {
                return Err(SeedError::MissingDocument {
                    name: required.to_owned(),
                });
            }
        }
        Ok(Self { documents })
    }

    pub fn builtin() -> Self {
        Self {
            documents: vec![
                (
                    "meta-data".to_owned(),
                    include_str!("../templates/cloud-init/meta-data.hbs").to_owned(),
                ),
                (
                    "user-data".to_owned(),
                    include_str!("../templates/cloud-init/user-data.hbs").to_owned(),
                ),
            ],
        }
    }

    pub fn document_names(&self) -> impl Iterator<Item = &str> {
        self.documents.iter().map(|(name, _)| name.as_str())
    }
}

#[derive(Debug, Serialize)]
struct SeedParams<'a> {
    name: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedVolume {
    pub iso_path: PathBuf,
}

/// Renders the boot configuration for one machine and packs it into an ISO.
pub struct SeedBuilder {
    registry: Handlebars<'static>,
    template: SeedTemplate,
    paths: Paths,
    iso_tool: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl SeedBuilder {
    pub fn new(
        template: SeedTemplate,
        paths: Paths,
        iso_tool: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self, SeedError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        // YAML, not HTML.
        registry.register_escape_fn(handlebars::no_escape);

        for (name, source) in &template.documents {
            registry
                .register_template_string(name, source)
                .map_err(|source| SeedError::TemplateInvalid {
                    name: name.clone(),
                    source: Box::new(source),
                })?;
        }

        Ok(Self {
            registry,
            template,
            paths,
            iso_tool: iso_tool.into(),
            runner,
        })
    }

    /// Render every document for `vm_name`.
    pub fn render(&self, vm_name: &str) -> Result<Vec<(String, String)>, SeedError> {
        let params = SeedParams { name: vm_name };
        self.template
            .document_names()
            .map(|name| {
                self.registry
                    .render(name, &params)
                    .map(|rendered| (name.to_owned(), rendered))
                    .map_err(|source| SeedError::TemplateRenderFailed {
                        name: name.to_owned(),
                        source,
                    })
            })
            .collect()
    }

    #[instrument(skip(self))]
    pub async fn build(&self, vm_name: &str, distro: &str) -> Result<SeedVolume, SeedError> {
        let documents = self.render(vm_name)?;

        let scratch = tempfile::Builder::new()
            .prefix("mkvm")
            .tempdir()
            .map_err(SeedError::TempDir)?;

        let mut files = Vec::with_capacity(documents.len());
        for (name, contents) in &documents {
            let path = scratch.path().join(name);
            debug!("writing {}", path.display());
            fs::write_file(&path, contents.as_bytes()).await?;
            files.push(path);
        }

        fs::setup_directory_access(self.paths.seeds_dir()).await?;
        let iso_path = self.paths.seed_file(vm_name, distro);

        let mut cmd = Command::new(&self.iso_tool);
        cmd.arg("-output")
            .arg(&iso_path)
            .args(["-volid", SEED_VOLUME_LABEL])
            .arg("-joliet")
            .arg("-rock")
            .args(&files);

        self.runner
            .run(&cmd)
            .await
            .map_err(SeedError::PackagingFailed)?;

        info!("built seed image {}", iso_path.display());

        Ok(SeedVolume { iso_path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingRunner;

    fn builder(paths: Paths, runner: Arc<RecordingRunner>) -> SeedBuilder {
        SeedBuilder::new(SeedTemplate::builtin(), paths, "genisoimage", runner).unwrap()
    }

    #[test]
    fn renders_name_into_documents() {
        let runner = Arc::new(RecordingRunner::default());
        let seeds = builder(Paths::new("/cache"), runner);
        let documents = seeds.render("test1").unwrap();

        let names: Vec<_> = documents.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["meta-data", "user-data"]);
        assert!(documents[0].1.contains("instance-id: test1"));
        assert!(documents[1].1.starts_with("#cloud-config"));
        assert!(documents[1].1.contains("hostname: test1"));
    }

    #[test]
    fn missing_substitution_fails() {
        let template = SeedTemplate::new(vec![
            ("meta-data".into(), "instance-id: {{name}}\n".into()),
            ("user-data".into(), "#cloud-config\nfoo: {{nope}}\n".into()),
        ])
        .unwrap();
        let seeds = SeedBuilder::new(
            template,
            Paths::new("/cache"),
            "genisoimage",
            Arc::new(RecordingRunner::default()),
        )
        .unwrap();
        let err = seeds.render("test1").unwrap_err();
        assert!(matches!(err, SeedError::TemplateRenderFailed { ref name, .. } if name == "user-data"));
    }

    #[test]
    fn malformed_template_fails() {
        let template = SeedTemplate::new(vec![
            ("meta-data".into(), "instance-id: {{name\n".into()),
            ("user-data".into(), "#cloud-config\n".into()),
        ])
        .unwrap();
        let result = SeedBuilder::new(
            template,
            Paths::new("/cache"),
            "genisoimage",
            Arc::new(RecordingRunner::default()),
        );
        assert!(matches!(result, Err(SeedError::TemplateInvalid { .. })));
    }

    #[test]
    fn bundle_must_have_both_documents() {
        let err = SeedTemplate::new(vec![("meta-data".into(), String::new())]).unwrap_err();
        assert!(matches!(err, SeedError::MissingDocument { ref name } if name == "user-data"));
    }

    #[tokio::test]
    async fn packages_rendered_documents() {
        let cache = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let seeds = builder(Paths::new(cache.path()), runner.clone());

        let seed = seeds.build("test1", "alpine-edge").await.unwrap();

        assert_eq!(
            seed.iso_path,
            cache.path().join("seed").join("test1-alpine-edge.iso")
        );

        let commands = runner.commands();
        assert_eq!(commands.len(), 1);
        let line = commands[0].to_string();
        assert!(line.starts_with("genisoimage -output "));
        assert!(line.contains("-volid cidata -joliet -rock"));

        let captured = runner.captured_files();
        assert!(captured["meta-data"].contains("local-hostname: test1"));
        assert!(captured["user-data"].contains("hostname: test1"));
    }

    #[tokio::test]
    async fn authoring_failure_is_packaging_failed() {
        let cache = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default().fail_on("genisoimage", "bad volid"));
        let seeds = builder(Paths::new(cache.path()), runner);

        let err = seeds.build("test1", "alpine-edge").await.unwrap_err();
        assert!(matches!(err, SeedError::PackagingFailed(_)));
    }
}
