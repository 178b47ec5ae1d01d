use handlebars::{Handlebars, RenderError, TemplateError};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

use crate::identity::MacAddress;

const TEMPLATE_NAME: &str = "domain";

pub const DEFAULT_VCPUS: u32 = 2;
pub const DEFAULT_NETWORK: &str = "default";

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("can't parse domain template: {0}")]
    TemplateInvalid(#[source] Box<TemplateError>),

    #[error("can't generate domain description: {0}")]
    TemplateRenderFailed(#[source] RenderError),

    #[error("{memory_mb} MB is not a usable amount of guest memory")]
    InvalidMemory { memory_mb: u64 },
}

/// Guest memory in KiB, as the domain description wants it.
pub fn memory_kib(memory_mb: u64) -> Result<u64, DomainError> {
    match memory_mb.checked_mul(1024) {
        Some(kib) if memory_mb > 0 => Ok(kib),
        _ => Err(DomainError::InvalidMemory { memory_mb }),
    }
}

/// Everything the domain description is rendered from.
#[derive(Debug, Clone, Serialize)]
pub struct DomainParams {
    pub name: String,
    pub uuid: Uuid,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub device_path: PathBuf,
    pub seed_path: PathBuf,
    pub mac_address: String,
    pub network: String,
}

impl DomainParams {
    pub fn new(
        name: &str,
        uuid: Uuid,
        memory_kib: u64,
        device_path: PathBuf,
        seed_path: PathBuf,
        mac: MacAddress,
    ) -> Self {
        Self {
            name: name.to_owned(),
            uuid,
            memory_kib,
            vcpus: DEFAULT_VCPUS,
            device_path,
            seed_path,
            mac_address: mac.to_string(),
            network: DEFAULT_NETWORK.to_owned(),
        }
    }
}

pub struct DomainComposer {
    registry: Handlebars<'static>,
    vcpus: u32,
    network: String,
}

impl DomainComposer {
    pub fn builtin() -> Result<Self, DomainError> {
        Self::with_template(include_str!("../templates/domain.xml.hbs"))
    }

    pub fn with_template(source: &str) -> Result<Self, DomainError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry
            .register_template_string(TEMPLATE_NAME, source)
            .map_err(|error| DomainError::TemplateInvalid(Box::new(error)))?;
        Ok(Self {
            registry,
            vcpus: DEFAULT_VCPUS,
            network: DEFAULT_NETWORK.to_owned(),
        })
    }

    pub fn vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    /// The libvirt network the interface attaches to.
    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Fill in the composer's machine shape and render the XML. Values are
    /// XML-escaped.
    pub fn render(&self, params: &DomainParams) -> Result<String, DomainError> {
        let params = DomainParams {
            vcpus: self.vcpus,
            network: self.network.clone(),
            ..params.clone()
        };
        self.registry
            .render(TEMPLATE_NAME, &params)
            .map_err(DomainError::TemplateRenderFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DomainParams {
        DomainParams::new(
            "test1",
            Uuid::from_u128(0x6d6b766d_0000_4000_8000_000000000001),
            memory_kib(512).unwrap(),
            PathBuf::from("/dev/zvol/rpool/mkvm-test/test1"),
            PathBuf::from("/home/op/.cache/mkvm/seed/test1-alpine-edge.iso"),
            MacAddress::from([0x52, 0x54, 0x00, 0x0a, 0xbc, 0x01]),
        )
    }

    #[test]
    fn renders_machine_description() {
        let xml = DomainComposer::builtin().unwrap().render(&params()).unwrap();

        assert!(xml.contains("<name>test1</name>"));
        assert!(xml.contains("<uuid>6d6b766d-0000-4000-8000-000000000001</uuid>"));
        assert!(xml.contains("<memory unit='KiB'>524288</memory>"));
        assert!(xml.contains("<source dev='/dev/zvol/rpool/mkvm-test/test1'/>"));
        assert!(xml.contains(
            "<source file='/home/op/.cache/mkvm/seed/test1-alpine-edge.iso'/>"
        ));
        assert!(xml.contains("<mac address='52:54:00:0a:bc:01'/>"));
        assert!(xml.contains("<source network='default'/>"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
    }

    #[test]
    fn composer_settings_override_params() {
        let composer = DomainComposer::builtin()
            .unwrap()
            .vcpus(4)
            .network("lab");
        let xml = composer.render(&params()).unwrap();
        assert!(xml.contains("<vcpu placement='static'>4</vcpu>"));
        assert!(xml.contains("<source network='lab'/>"));
    }

    #[test]
    fn values_are_escaped() {
        let mut params = params();
        params.name = "a<b>&'c".into();
        let xml = DomainComposer::builtin().unwrap().render(&params).unwrap();
        assert!(xml.contains("<name>a&lt;b&gt;&amp;&#x27;c</name>"));
    }

    #[test]
    fn unknown_field_fails_to_render() {
        let composer = DomainComposer::with_template("<domain>{{bogus}}</domain>").unwrap();
        assert!(matches!(
            composer.render(&params()),
            Err(DomainError::TemplateRenderFailed(_))
        ));
    }

    #[test]
    fn malformed_template_is_rejected() {
        assert!(matches!(
            DomainComposer::with_template("<domain>{{name</domain>"),
            Err(DomainError::TemplateInvalid(_))
        ));
    }

    #[test]
    fn memory_must_be_positive_and_fit() {
        assert_eq!(memory_kib(1).unwrap(), 1024);
        for bad in [0, u64::MAX, (u64::MAX / 1024) + 1] {
            assert!(matches!(
                memory_kib(bad),
                Err(DomainError::InvalidMemory { memory_mb }) if memory_mb == bad
            ));
        }
    }
}
