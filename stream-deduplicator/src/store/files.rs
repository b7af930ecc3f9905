//! Naming and encoding of the per-version state files.
//!
//! Layout below the backend root:
//!
//! ```text
//! state/<store_id>/<partition>/<version>.delta
//! state/<store_id>/<partition>/<version>.snapshot
//! ```
//!
//! Both kinds are `bincode` payloads compressed with `zstd`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{PartitionId, Version};

const ZSTD_LEVEL: i32 = 3;

/// One mutation recorded in a delta file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

impl DeltaOp {
    pub fn apply(self, map: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        match self {
            DeltaOp::Put { key, value } => {
                map.insert(key, value);
            }
            DeltaOp::Remove { key } => {
                map.remove(&key);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StateFileKind {
    Delta,
    Snapshot,
}

impl StateFileKind {
    fn extension(self) -> &'static str {
        match self {
            StateFileKind::Delta => "delta",
            StateFileKind::Snapshot => "snapshot",
        }
    }
}

/// A state file identified by version and kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateFile {
    pub version: Version,
    pub kind: StateFileKind,
}

impl StateFile {
    pub fn delta(version: Version) -> Self {
        Self {
            version,
            kind: StateFileKind::Delta,
        }
    }

    pub fn snapshot(version: Version) -> Self {
        Self {
            version,
            kind: StateFileKind::Snapshot,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.version, self.kind.extension())
    }

    pub fn key(&self, store_id: &str, partition: PartitionId) -> String {
        format!("{}{}", partition_prefix(store_id, partition), self.file_name())
    }

    /// Parse the last path segment of an object key. Unknown names yield `None`.
    pub fn parse(key: &str) -> Option<Self> {
        let name = key.rsplit('/').next()?;
        let (version, extension) = name.split_once('.')?;
        let version = version.parse().ok()?;
        let kind = match extension {
            "delta" => StateFileKind::Delta,
            "snapshot" => StateFileKind::Snapshot,
            _ => return None,
        };
        Some(Self { version, kind })
    }
}

pub fn partition_prefix(store_id: &str, partition: PartitionId) -> String {
    format!("state/{store_id}/{partition}/")
}

fn compress<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let encoded = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .context("Failed to encode state file")?;
    zstd::encode_all(&encoded[..], ZSTD_LEVEL).context("Failed to compress state file")
}

fn decompress<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let decoded = zstd::decode_all(bytes).context("Failed to decompress state file")?;
    let (value, _) = bincode::serde::decode_from_slice(&decoded, bincode::config::standard())
        .context("Failed to decode state file")?;
    Ok(value)
}

pub fn encode_delta(ops: &[DeltaOp]) -> Result<Vec<u8>> {
    compress(&ops)
}

pub fn decode_delta(bytes: &[u8]) -> Result<Vec<DeltaOp>> {
    decompress(bytes)
}

pub fn encode_snapshot(map: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<Vec<u8>> {
    compress(map)
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
    decompress(bytes)
}
