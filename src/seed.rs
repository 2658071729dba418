//! Access to the configuration of the seed a controller runs against.

use async_trait::async_trait;

use crate::crd::Seed;
use crate::error::Result;
use crate::store::TypedStore;
use crate::target::TargetCluster;

/// Returns the current Seed object of a seed cluster.
#[async_trait]
pub trait SeedGetter: Send + Sync {
    async fn seed(&self, target: &TargetCluster) -> Result<Seed>;
}

/// Reads the Seed named after the target from the installation namespace of that target.
#[derive(Debug, Clone)]
pub struct StoreSeedGetter {
    namespace: String,
}

impl StoreSeedGetter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl SeedGetter for StoreSeedGetter {
    async fn seed(&self, target: &TargetCluster) -> Result<Seed> {
        target
            .store()
            .get_typed::<Seed>(Some(&self.namespace), target.identity())
            .await
    }
}
