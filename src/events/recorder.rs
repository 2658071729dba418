use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::core::v1::EventSource;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;

use crate::error::Result;
use crate::events::types::EventData;
use crate::events::types::Reason;
use crate::events::EmitEvent;
use crate::store::Object;
use crate::store::ObjectStore;
use crate::store::TypedStore;
use crate::TryResource;

/// Events about cluster-scoped objects are recorded here.
const CLUSTER_SCOPED_EVENT_NAMESPACE: &str = "default";

/// Implementation of EmitEvent that creates Kubernetes Event resources next to the object
pub struct EventRecorder {
    store: Arc<dyn ObjectStore>,
    component: Cow<'static, str>,
}

impl EventRecorder {
    /// Create a new EventRecorder
    ///
    /// # Arguments
    /// * `store` - Store of the cluster the reported objects live in
    /// * `component` - Component name that will appear in events (e.g., "preset-controller")
    pub fn new(store: Arc<dyn ObjectStore>, component: impl Into<Cow<'static, str>>) -> Self {
        Self {
            store,
            component: component.into(),
        }
    }
}

#[async_trait]
impl<R> EmitEvent<R> for EventRecorder
where
    R: Reason,
{
    #[tracing::instrument(
        skip(self, object),
        fields(
            cluster = %self.store.identity(),
            object_kind = %K::kind(&()),
            object_name = %object.try_name().unwrap_or_default(),
            event_type = %event.type_,
            event_reason = %event.reason,
        )
    )]
    async fn try_emit<K: Object>(&self, object: &K, event: EventData<R>) -> Result<()> {
        let namespace = object
            .namespace()
            .unwrap_or_else(|| CLUSTER_SCOPED_EVENT_NAMESPACE.to_owned());
        let name = object.try_name()?;

        let now = Utc::now();
        let event_name = format!("{name}.{now}", now = now.timestamp_nanos_opt().unwrap_or_default());

        let k8s_event = Event {
            metadata: ObjectMeta {
                name: Some(event_name),
                namespace: Some(namespace),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some(K::api_version(&()).to_string()),
                kind: Some(K::kind(&()).to_string()),
                name: Some(name.to_owned()),
                namespace: object.namespace(),
                uid: object.meta().uid.to_owned(),
                resource_version: object.meta().resource_version.to_owned(),
                ..Default::default()
            },
            reason: Some(event.reason.to_string()),
            message: Some(event.message),
            type_: Some(event.type_.to_string()),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            count: Some(1),
            source: Some(EventSource {
                component: Some(self.component.to_string()),
                ..Default::default()
            }),
            reporting_component: Some(self.component.to_string()),
            action: event.action,
            ..Default::default()
        };

        self.store.create_typed(&k8s_event).await?;

        Ok(())
    }
}
