use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use common::prelude::{PrifiConfig, PublicKey, Roster, RosterEntry, SecretKey};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "prifi";
pub const IDENTITY_FILE_NAME: &str = "identity.toml";
pub const GROUP_FILE_NAME: &str = "group.toml";
pub const CONFIG_FILE_NAME: &str = "prifi.toml";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("cannot locate the home directory")]
    NoHomeDirectory,
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("TOML serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("config error: {0}")]
    Config(#[from] common::config::ConfigError),
    #[error("{0} already exists")]
    AlreadyExists(PathBuf),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("secret key of node {0} does not match its public key")]
    KeyMismatch(u32),
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
}

/// The configuration directory (custom or default ~/.prifi).
pub fn prifi_dir(custom_path: Option<PathBuf>) -> Result<PathBuf, StateError> {
    if let Some(path) = custom_path {
        return Ok(path);
    }
    let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
    Ok(home.join(format!(".{}", APP_NAME)))
}

/// `explicit` if given, else `name` inside the configuration directory.
pub fn resolve(
    explicit: Option<&Path>,
    config_dir: Option<PathBuf>,
    name: &str,
) -> Result<PathBuf, StateError> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(prifi_dir(config_dir)?.join(name)),
    }
}

fn read(path: &Path) -> Result<String, StateError> {
    fs::read_to_string(path).map_err(|source| StateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StateError> {
    toml::from_str(&read(path)?).map_err(|source| StateError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_address(address: &str) -> Result<SocketAddr, StateError> {
    address
        .parse()
        .map_err(|_| StateError::InvalidAddress(address.to_string()))
}

/// A node's long-term keypair and listen address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFile {
    pub id: u32,
    pub address: String,
    /// Lowercase hex
    pub secret: String,
    pub public: PublicKey,
}

impl IdentityFile {
    pub fn generate(id: u32, address: &str) -> Result<Self, StateError> {
        parse_address(address)?;
        let key = SecretKey::generate();
        Ok(Self {
            id,
            address: address.to_string(),
            secret: key.to_hex(),
            public: key.public(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, StateError> {
        parse(path)
    }

    /// Writes the file, refusing to replace an existing one.
    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        if path.exists() {
            return Err(StateError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| StateError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, toml::to_string_pretty(self)?).map_err(|source| StateError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The secret key, checked against the stored public key.
    pub fn secret_key(&self) -> Result<SecretKey, StateError> {
        let key =
            SecretKey::from_hex(&self.secret).map_err(|e| StateError::InvalidKey(e.to_string()))?;
        if key.public() != self.public {
            return Err(StateError::KeyMismatch(self.id));
        }
        Ok(key)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, StateError> {
        parse_address(&self.address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEntry {
    pub address: String,
    pub public_key: PublicKey,
}

/// Where the relay is and who may join it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFile {
    pub relay: RelayEntry,
    #[serde(default)]
    pub trustees: Vec<RosterEntry>,
    #[serde(default)]
    pub clients: Vec<RosterEntry>,
}

impl GroupFile {
    pub fn load(path: &Path) -> Result<Self, StateError> {
        parse(path)
    }

    pub fn relay_addr(&self) -> Result<SocketAddr, StateError> {
        parse_address(&self.relay.address)
    }

    pub fn roster(&self) -> Roster {
        Roster {
            trustees: self.trustees.clone(),
            clients: self.clients.clone(),
        }
    }
}

/// Loads `path`, falling back to defaults when the file is the implicit
/// one and does not exist.
pub fn load_config(path: &Path, explicit: bool) -> Result<PrifiConfig, StateError> {
    if !explicit && !path.exists() {
        return Ok(PrifiConfig::default());
    }
    Ok(PrifiConfig::load(path)?)
}
