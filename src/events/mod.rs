//! Kubernetes event emission for controllers.
//!
//! Events are observability-only and never fail reconciliation: [EmitEvent::emit] logs a
//! failed emission at `warn` and carries on.
//!
//! # Example
//! ```rust,ignore
//! use kubermatic_sync::events::{EmitEvent, EventRecorder, EventData, Reason};
//! use strum::{Display, AsRefStr};
//!
//! #[derive(Debug, Clone, Copy, Display, AsRefStr)]
//! enum PresetReason {
//!     PresetInvalidated,
//! }
//! impl Reason for PresetReason {}
//!
//! let recorder = EventRecorder::new(master.store().clone(), "preset-controller");
//! recorder
//!     .emit(&preset, EventData::normal(PresetReason::PresetInvalidated, "Clusters were notified"))
//!     .await;
//! ```

pub mod types;

mod recorder;

pub use recorder::EventRecorder;
pub use types::EventData;
pub use types::EngineReason;
pub use types::EventType;
pub use types::Reason;

use async_trait::async_trait;

use crate::error::Result;
use crate::store::Object;

/// Trait for emitting Kubernetes events
#[async_trait]
pub trait EmitEvent<R>: Send + Sync
where
    R: Reason,
{
    /// Try to emit a Kubernetes event, returning any errors
    ///
    /// Use this when you need explicit error handling. For most cases,
    /// prefer `emit()` which logs errors without failing reconciliation.
    async fn try_emit<K: Object>(&self, object: &K, event: EventData<R>) -> Result<()>;

    /// Emit a Kubernetes event, logging but not propagating errors
    ///
    /// Events are observability only and should not fail reconciliation.
    /// This is the primary API for emitting events in reconciliation loops.
    async fn emit<K: Object>(&self, object: &K, event: EventData<R>) {
        let reason = event.reason.to_owned();
        if let Err(e) = self.try_emit(object, event).await {
            tracing::warn!(
                error = %e,
                reason = %reason,
                "Failed to emit event"
            );
        }
    }
}
