use rand::TryRngCore;
use serde::Deserialize;
use std::fmt::{self, Display};
use thiserror::Error;
use uuid::Uuid;

const BUILTIN_NAMES: &str = include_str!("../names.toml");

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("random source unavailable: {0}")]
    EntropyUnavailable(String),

    #[error("can't parse list of names: {0}")]
    NameList(#[from] toml::de::Error),

    #[error("list of names is empty")]
    EmptyNameList,
}

fn entropy<E: Display>(error: E) -> IdentityError {
    IdentityError::EntropyUnavailable(error.to_string())
}

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_unicast(&self) -> bool {
        self.0[0] & 0x01 == 0
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// A random locally-administered unicast address, so it never collides with
/// a vendor-assigned one.
pub fn random_mac<R: TryRngCore + ?Sized>(rng: &mut R) -> Result<MacAddress, IdentityError> {
    let mut octets = [0u8; 6];
    rng.try_fill_bytes(&mut octets).map_err(entropy)?;
    octets[0] = (octets[0] | 0x02) & 0xfe;
    Ok(MacAddress(octets))
}

pub fn random_uuid<R: TryRngCore + ?Sized>(rng: &mut R) -> Result<Uuid, IdentityError> {
    let mut bytes = [0u8; 16];
    rng.try_fill_bytes(&mut bytes).map_err(entropy)?;
    Ok(uuid::Builder::from_random_bytes(bytes).into_uuid())
}

/// Word list used to name machines the operator didn't name.
#[derive(Debug, Clone, Deserialize)]
pub struct NameList {
    names: Vec<String>,
}

impl NameList {
    pub fn new(names: Vec<String>) -> Result<Self, IdentityError> {
        if names.is_empty() {
            return Err(IdentityError::EmptyNameList);
        }
        Ok(Self { names })
    }

    pub fn builtin() -> Result<Self, IdentityError> {
        let NameList { names } = toml::from_str(BUILTIN_NAMES)?;
        Self::new(names)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Uniformly pick one name.
    pub fn random_name<R: TryRngCore + ?Sized>(&self, rng: &mut R) -> Result<String, IdentityError> {
        let len = self.names.len() as u64;
        // Reject the tail of the u64 range that would bias the modulo.
        let zone = u64::MAX - (u64::MAX % len);
        loop {
            let value = rng.try_next_u64().map_err(entropy)?;
            if value < zone {
                return Ok(self.names[(value % len) as usize].clone());
            }
        }
    }
}
