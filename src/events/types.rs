use std::fmt::Debug;
use std::fmt::Display;
use strum::AsRefStr;
use strum::Display as StrumDisplay;

use crate::error::Error;

/// Type of Kubernetes event
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, AsRefStr)]
pub enum EventType {
    Normal,
    /// Reconcile failures surfaced to whoever looks at the object
    Warning,
}

/// Domain-specific event reasons, CamelCase by Kubernetes convention.
///
/// Derive `Debug, Clone, Copy, Display, AsRefStr` (strum) on an enum and implement this
/// marker trait for it.
pub trait Reason: Debug + Display + AsRef<str> + Clone + Send + Sync + 'static {}

/// Reasons the engine itself reports under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, AsRefStr)]
pub enum EngineReason {
    ReconcilingError,
}

impl Reason for EngineReason {}

/// A Kubernetes event, generic over the reason type
#[derive(Debug)]
pub struct EventData<R: Reason> {
    pub type_: EventType,
    pub reason: R,
    pub message: String,
    pub action: Option<String>,
}

impl<R: Reason> EventData<R> {
    pub fn normal(reason: R, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Normal,
            reason,
            message: message.into(),
            action: None,
        }
    }

    pub fn warning(reason: R, message: impl Into<String>) -> Self {
        Self {
            type_: EventType::Warning,
            reason,
            message: message.into(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

impl EventData<EngineReason> {
    /// The Warning raised on an object whose reconcile failed.
    pub fn reconcile_failed(error: &Error) -> Self {
        Self::warning(EngineReason::ReconcilingError, error.to_string()).with_action("Reconcile")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconcile_failed_is_a_warning_with_the_error() {
        // Given: A failed reconcile
        let error = Error::Forbidden("seeds are read-only".to_string());

        // When: Building its event
        let event = EventData::reconcile_failed(&error);

        // Then: It is a Warning carrying the error message
        assert_eq!(event.type_, EventType::Warning);
        assert_eq!(event.reason.as_ref(), "ReconcilingError");
        assert_eq!(event.message, "Forbidden: seeds are read-only");
        assert_eq!(event.action.as_deref(), Some("Reconcile"));
    }

    #[test]
    fn test_normal_event_has_no_action() {
        let event = EventData::normal(EngineReason::ReconcilingError, String::from("ok"));

        assert_eq!(event.type_, EventType::Normal);
        assert_eq!(event.action, None);
        assert_eq!(event.type_.to_string(), "Normal");
    }
}
