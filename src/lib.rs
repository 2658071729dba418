//! `kubermatic-sync` is a reconciliation engine for controllers that span several Kubernetes
//! clusters: one master, any number of seeds, and the user clusters hosted on them.
//!
//! A controller is a [reconciler::Context] plugged into a [controller::Controller]. The engine
//! watches the registered kinds on the registered clusters, filters changes through
//! [predicate]s, queues one work item per object and runs the reconcile state machine of
//! [reconciler] on it. Cleanup across clusters is ordered by finalizers, see [finalizer] and
//! [fanout].
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use k8s_openapi::api::core::v1::ConfigMap;
//! use kubermatic_sync::config::ControllerOptions;
//! use kubermatic_sync::controller::Controller;
//! use kubermatic_sync::error::Result;
//! use kubermatic_sync::predicate::SpecChanged;
//! use kubermatic_sync::reconciler::Action;
//! use kubermatic_sync::reconciler::Context;
//! use kubermatic_sync::store::memory::MemoryStore;
//! use kubermatic_sync::target::TargetCluster;
//! use kubermatic_sync::target::TargetRef;
//! use kubermatic_sync::target::TargetTable;
//! use kubermatic_sync::watch::WatchSpec;
//! use tokio_util::sync::CancellationToken;
//!
//! // The controller specific part: what to converge for an object and what to clean up
//! // before it may go away.
//! struct MyContext;
//!
//! #[async_trait]
//! impl Context<ConfigMap> for MyContext {
//!     fn finalizer(&self) -> Option<&str> {
//!         Some("example.com/cleanup")
//!     }
//!
//!     async fn handle_apply(&self, _object: Arc<ConfigMap>, _source: &TargetCluster) -> Result<Action> {
//!         Ok(Action::await_change())
//!     }
//!
//!     async fn handle_cleanup(&self, _object: Arc<ConfigMap>, _source: &TargetCluster) -> Result<Action> {
//!         Ok(Action::await_change())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Every cluster is reached through an object store. `KubeStore` talks to a real API
//!     // server, `MemoryStore` is the in-memory fake used in tests.
//!     let targets = Arc::new(TargetTable::new(Arc::new(MemoryStore::new("master"))));
//!     let options = ControllerOptions::default();
//!
//!     Controller::new("my-controller", targets, Arc::new(MyContext), &options)
//!         .watches(TargetRef::Master, WatchSpec::<ConfigMap>::new().with_predicate(SpecChanged))
//!         .run(CancellationToken::new())
//!         .await
//! }
//! ```
//!
//! ## Error Handling
//!
//! All operations return [error::Result]. Store outcomes are classified at the store
//! boundary: a missing object is `NotFound`, a stale write is `Conflict`. The engine treats
//! conflicts as a quiet retry and reports every other failure as a Warning event on the
//! reconciled object before retrying with exponential backoff.
//!
//! Controller implementors can return their own errors through `Error::Anyhow`.
//!

pub mod config;
pub mod controller;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod events;
pub mod fanout;
pub mod finalizer;
pub mod predicate;
pub mod queue;
pub mod reconciler;
pub mod reconciling;
pub mod seed;
pub mod store;
pub mod target;
pub mod watch;

use kube::Resource;
use kube::ResourceExt;

use crate::error::Error;
use crate::error::Result;

/// The TryResource trait is used to try to extract the name and the namespace of a resources
/// metadata and encapsulates the error handling.
pub trait TryResource {
    fn try_name(&self) -> Result<&str>;
    fn try_namespace(&self) -> Result<String>;
}

impl<R> TryResource for R
where
    R: Resource,
{
    fn try_name(&self) -> Result<&str> {
        self.meta().name.as_deref().ok_or(Error::UnnamedObject)
    }

    fn try_namespace(&self) -> Result<String> {
        self.namespace().ok_or(Error::UserInput({
            "Expected resource to be namespaced. Can't deploy to an unknown namespace.".to_owned()
        }))
    }
}
