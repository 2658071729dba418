//! The clusters a controller can read from and write to.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Error;
use crate::error::Result;
use crate::store::ObjectStore;

/// One cluster (the master or a seed) and the store to reach it.
#[derive(Clone)]
pub struct TargetCluster {
    identity: String,
    store: Arc<dyn ObjectStore>,
}

impl TargetCluster {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            identity: store.identity().to_owned(),
            store,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

impl fmt::Debug for TargetCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetCluster").field("identity", &self.identity).finish()
    }
}

/// Which clusters of a [TargetTable] something applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    Master,
    Seed(String),
    Seeds,
}

/// The immutable set of clusters known at startup: one master and any number of seeds.
#[derive(Debug, Clone)]
pub struct TargetTable {
    master: TargetCluster,
    seeds: BTreeMap<String, TargetCluster>,
}

impl TargetTable {
    pub fn new(master: Arc<dyn ObjectStore>) -> Self {
        Self {
            master: TargetCluster::new(master),
            seeds: BTreeMap::new(),
        }
    }

    pub fn with_seed(mut self, seed: Arc<dyn ObjectStore>) -> Self {
        let seed = TargetCluster::new(seed);
        self.seeds.insert(seed.identity().to_owned(), seed);
        self
    }

    pub fn master(&self) -> &TargetCluster {
        &self.master
    }

    /// Seeds in name order.
    pub fn seeds(&self) -> impl Iterator<Item = &TargetCluster> {
        self.seeds.values()
    }

    pub fn seed(&self, name: &str) -> Result<&TargetCluster> {
        self.seeds.get(name).ok_or_else(|| Error::UnknownTarget(name.to_owned()))
    }

    /// Looks up any known cluster by identity.
    pub fn get(&self, identity: &str) -> Result<&TargetCluster> {
        if identity == self.master.identity() {
            Ok(&self.master)
        } else {
            self.seed(identity)
        }
    }

    pub fn resolve(&self, target: &TargetRef) -> Result<Vec<&TargetCluster>> {
        match target {
            TargetRef::Master => Ok(vec![&self.master]),
            TargetRef::Seed(name) => Ok(vec![self.seed(name)?]),
            TargetRef::Seeds => Ok(self.seeds().collect()),
        }
    }
}
