//! Per-context memo of search results
//!
//! Each direction keeps two maps keyed by [`ConfigFingerprint`]: the
//! workspace size computed for a problem and the algorithm that won its
//! search. Entries are written once and never replaced or evicted.
//!
//! A cache belongs to exactly one context. It has no interior locking;
//! sharing a context across threads needs external synchronization.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::conv::algorithm::{ConvBwdDataAlgorithm, ConvBwdWeightsAlgorithm, ConvFwdAlgorithm};
use crate::conv::fingerprint::ConfigFingerprint;
use crate::error::Result;

/// Workspace sizes and winning algorithms for one direction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "A: Deserialize<'de>"))]
pub struct DirectionCache<A> {
    #[serde(default)]
    workspace: BTreeMap<ConfigFingerprint, usize>,
    #[serde(default)]
    algorithms: BTreeMap<ConfigFingerprint, A>,
}

impl<A> Default for DirectionCache<A> {
    fn default() -> Self {
        Self {
            workspace: BTreeMap::new(),
            algorithms: BTreeMap::new(),
        }
    }
}

impl<A: Copy> DirectionCache<A> {
    pub fn workspace(&self, key: &ConfigFingerprint) -> Option<usize> {
        self.workspace.get(key).copied()
    }

    pub fn algorithm(&self, key: &ConfigFingerprint) -> Option<A> {
        self.algorithms.get(key).copied()
    }

    /// Record a workspace size unless one is already stored; returns the stored size
    pub(crate) fn insert_workspace(&mut self, key: ConfigFingerprint, size: usize) -> usize {
        *self.workspace.entry(key).or_insert(size)
    }

    /// Record a winner unless one is already stored; returns the stored winner
    pub(crate) fn insert_algorithm(&mut self, key: ConfigFingerprint, algorithm: A) -> A {
        *self.algorithms.entry(key).or_insert(algorithm)
    }

    /// Number of problems with a cached winner
    pub fn len(&self) -> usize {
        self.algorithms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.algorithms.is_empty() && self.workspace.is_empty()
    }

    /// Take entries from `other` for keys not present here
    fn merge(&mut self, other: Self) -> usize {
        let mut added = 0;
        for (key, size) in other.workspace {
            if let std::collections::btree_map::Entry::Vacant(slot) = self.workspace.entry(key) {
                slot.insert(size);
                added += 1;
            }
        }
        for (key, algorithm) in other.algorithms {
            if let std::collections::btree_map::Entry::Vacant(slot) = self.algorithms.entry(key) {
                slot.insert(algorithm);
                added += 1;
            }
        }
        added
    }
}

/// Find results for all three directions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindCache {
    #[serde(default)]
    pub forward: DirectionCache<ConvFwdAlgorithm>,
    #[serde(default)]
    pub backward_data: DirectionCache<ConvBwdDataAlgorithm>,
    #[serde(default)]
    pub backward_weights: DirectionCache<ConvBwdWeightsAlgorithm>,
}

impl FindCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.backward_data.is_empty() && self.backward_weights.is_empty()
    }

    /// Merge another cache in without overwriting; returns the number of entries added
    pub fn merge(&mut self, other: FindCache) -> usize {
        self.forward.merge(other.forward)
            + self.backward_data.merge(other.backward_data)
            + self.backward_weights.merge(other.backward_weights)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json()?)?;
        debug!("Saved find cache to {}", path.display());
        Ok(())
    }

    /// Read a cache from disk and merge it in; returns the number of entries added
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let loaded = Self::from_json(&fs::read_to_string(path)?)?;
        let added = self.merge(loaded);
        trace!("Loaded {} find cache entries from {}", added, path.display());
        Ok(added)
    }
}
