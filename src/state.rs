use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    domain::{DomainError, NetworkPolicy},
    net::PolicyPersistence,
};

pub const SCHEMA_VERSION: u32 = 1;
pub const STATE_FILE_NAME: &str = "policy.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("schema_version mismatch: expected {expected}, got {got}")]
    SchemaVersionMismatch { expected: u32, got: u32 },
}

/// Everything that survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedPolicies {
    pub schema_version: u32,
    #[serde(default)]
    pub restrict_background: bool,
    #[serde(default)]
    pub network_policies: Vec<NetworkPolicy>,
    /// Raw flag values keyed by UID.
    #[serde(default)]
    pub uid_policies: BTreeMap<u32, u32>,
}

impl PersistedPolicies {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            restrict_background: false,
            network_policies: Vec::new(),
            uid_policies: BTreeMap::new(),
        }
    }
}

impl Default for PersistedPolicies {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone)]
pub struct JsonPolicyStore {
    path: PathBuf,
}

impl JsonPolicyStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            path: data_dir.join(STATE_FILE_NAME),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot, writing an empty one on first start.
    pub fn load_or_init(&self) -> Result<PersistedPolicies, StoreError> {
        if !self.path.exists() {
            let state = PersistedPolicies::empty();
            self.write(&state)?;
            return Ok(state);
        }

        let bytes = fs::read(&self.path)?;
        let state: PersistedPolicies = serde_json::from_slice(&bytes)?;
        if state.schema_version != SCHEMA_VERSION {
            return Err(StoreError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                got: state.schema_version,
            });
        }
        for policy in &state.network_policies {
            policy.validate()?;
        }
        Ok(state)
    }

    pub fn write(&self, state: &PersistedPolicies) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }
}

impl PolicyPersistence for JsonPolicyStore {
    fn save(&self, state: &PersistedPolicies) -> Result<(), StoreError> {
        self.write(state)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = dir.join(format!("{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.write_all(b"\n")?;
        let _ = file.sync_all();
    }

    #[cfg(windows)]
    {
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}
