//! Grants the user groups of every master Project access to the project and to the
//! resources it owns, on master and on every seed.
//!
//! A project has one group per [GroupRole], named `<role>-<project>`. Each kind of project
//! resource has one ClusterRole per role, `kubermatic:<resource>:<role>`, shared by all
//! projects; the project's group is added as a subject to the binding of the same name. On
//! master every group additionally gets a role and binding scoped to the project object
//! itself. Roles that would grant no verbs are not created.
//!
//! Cleanup takes the project's groups out of the shared bindings, deletes the project-scoped
//! roles and deletes the project's clusters from every seed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1 as rbac;
use kube::api::ObjectMeta;
use serde_json::json;
use strum::Display;
use strum::EnumIter;
use strum::IntoEnumIterator;

use crate::config::ControllerOptions;
use crate::controller::Controller;
use crate::crd::Cluster;
use crate::crd::Project;
use crate::crd::ProjectPhase;
use crate::crd::PROJECT_ID_LABEL;
use crate::error::Result;
use crate::fanout;
use crate::fanout::Destination;
use crate::fanout::Destinations;
use crate::fanout::FanOut;
use crate::predicate::SpecChanged;
use crate::predicate::WorkerName;
use crate::reconciler::Action;
use crate::reconciler::Context;
use crate::reconciling;
use crate::reconciling::managed_labels;
use crate::store::LabelSelector;
use crate::store::ObjectStore;
use crate::store::TypedStore;
use crate::target::TargetCluster;
use crate::target::TargetRef;
use crate::target::TargetTable;
use crate::watch::WatchSpec;
use crate::TryResource;

pub const CONTROLLER_NAME: &str = "project-rbac-synchronizer";
pub const CLEANUP_FINALIZER: &str = "kubermatic.io/controller-manager-rbac-cleanup";
/// Label on generated roles naming the group role they grant.
pub const ROLE_LABEL: &str = "authz.k8c.io/role";

const NAME_PREFIX: &str = "kubermatic";
const KUBERMATIC_API_GROUP: &str = "kubermatic.k8c.io";
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// The roles a project member can have. Each one is backed by a group per project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum GroupRole {
    Owners,
    Editors,
    Viewers,
    ProjectManagers,
}

impl GroupRole {
    /// The group holding this role in `project`.
    pub fn group(self, project: &str) -> String {
        format!("{self}-{project}")
    }
}

/// Which clusters a project resource lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Master,
    Seeds,
}

/// A kind of resource owned by projects.
#[derive(Debug, Clone, Copy)]
pub struct ProjectResource {
    pub kind: &'static str,
    pub plural: &'static str,
    pub placement: Placement,
}

pub const PROJECT_RESOURCES: &[ProjectResource] = &[
    ProjectResource {
        kind: "Cluster",
        plural: "clusters",
        placement: Placement::Seeds,
    },
    ProjectResource {
        kind: "UserSSHKey",
        plural: "usersshkeys",
        placement: Placement::Master,
    },
    ProjectResource {
        kind: "UserProjectBinding",
        plural: "userprojectbindings",
        placement: Placement::Master,
    },
    ProjectResource {
        kind: "ExternalCluster",
        plural: "externalclusters",
        placement: Placement::Master,
    },
];

const ALL_NAMED_VERBS: &[&str] = &["get", "update", "patch", "delete"];

/// Verbs `role` has on the collection of `kind`, i.e. what it may create.
pub fn collection_verbs(role: GroupRole, kind: &str) -> &'static [&'static str] {
    match (kind, role) {
        ("UserProjectBinding" | "User", GroupRole::Owners | GroupRole::ProjectManagers) => &["create"],
        ("UserProjectBinding" | "User", _) => &[],
        (_, GroupRole::Owners | GroupRole::Editors) => &["create"],
        (_, GroupRole::Viewers | GroupRole::ProjectManagers) => &[],
    }
}

/// Verbs `role` has on a single named object of `kind`.
pub fn named_verbs(role: GroupRole, kind: &str) -> &'static [&'static str] {
    if kind == "ResourceQuota" {
        return &["get"];
    }

    match role {
        GroupRole::Owners => ALL_NAMED_VERBS,
        GroupRole::Editors => match kind {
            "Project" => &["get", "update", "patch"],
            "UserProjectBinding" | "GroupProjectBinding" | "User" => &[],
            _ => ALL_NAMED_VERBS,
        },
        GroupRole::Viewers => match kind {
            "UserProjectBinding" | "GroupProjectBinding" | "User" => &[],
            _ => &["get"],
        },
        GroupRole::ProjectManagers => match kind {
            "Cluster" | "ExternalCluster" | "ClusterTemplateInstance" => &[],
            _ => ALL_NAMED_VERBS,
        },
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

fn role_labels(role: GroupRole) -> BTreeMap<String, String> {
    let mut labels = managed_labels(CONTROLLER_NAME);
    labels.insert(ROLE_LABEL.to_owned(), role.to_string());
    labels
}

fn cluster_role(name: String, role: GroupRole, rule: rbac::PolicyRule) -> rbac::ClusterRole {
    rbac::ClusterRole {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(role_labels(role)),
            ..Default::default()
        },
        rules: Some(vec![rule]),
        ..Default::default()
    }
}

fn group_subject(group: String) -> rbac::Subject {
    rbac::Subject {
        api_group: Some(RBAC_API_GROUP.to_owned()),
        kind: "Group".to_owned(),
        name: group,
        namespace: None,
    }
}

/// A binding of the ClusterRole named like the binding to `group`.
fn cluster_role_binding(name: String, role: GroupRole, group: String) -> rbac::ClusterRoleBinding {
    rbac::ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            labels: Some(role_labels(role)),
            ..Default::default()
        },
        role_ref: rbac::RoleRef {
            api_group: RBAC_API_GROUP.to_owned(),
            kind: "ClusterRole".to_owned(),
            name,
        },
        subjects: Some(vec![group_subject(group)]),
    }
}

/// Name of the shared role granting `role` on the collection of `resource`.
pub fn resource_role_name(resource: &ProjectResource, role: GroupRole) -> String {
    format!("{NAME_PREFIX}:{}:{role}", resource.plural)
}

/// The shared role for `resource` and `role`, or `None` when it would grant nothing.
pub fn resource_role(resource: &ProjectResource, role: GroupRole) -> Option<rbac::ClusterRole> {
    let verbs = collection_verbs(role, resource.kind);
    if verbs.is_empty() {
        return None;
    }

    Some(cluster_role(
        resource_role_name(resource, role),
        role,
        rbac::PolicyRule {
            api_groups: Some(vec![KUBERMATIC_API_GROUP.to_owned()]),
            resources: Some(vec![resource.plural.to_owned()]),
            verbs: strings(verbs),
            ..Default::default()
        },
    ))
}

/// Name of the role granting `role` on the project object `project` itself.
pub fn project_role_name(project: &str, role: GroupRole) -> String {
    format!("{NAME_PREFIX}:project-{project}:{}", role.group(project))
}

fn project_role(project: &str, role: GroupRole) -> Option<rbac::ClusterRole> {
    let verbs = named_verbs(role, "Project");
    if verbs.is_empty() {
        return None;
    }

    Some(cluster_role(
        project_role_name(project, role),
        role,
        rbac::PolicyRule {
            api_groups: Some(vec![KUBERMATIC_API_GROUP.to_owned()]),
            resources: Some(vec!["projects".to_owned()]),
            resource_names: Some(vec![project.to_owned()]),
            verbs: strings(verbs),
            ..Default::default()
        },
    ))
}

async fn ensure_role(store: &dyn ObjectStore, desired: &rbac::ClusterRole) -> Result<()> {
    reconciling::converge(store, desired, |existing: &mut rbac::ClusterRole, desired| {
        reconciling::merge_metadata(&mut existing.metadata, &desired.metadata);
        existing.rules = desired.rules.clone();
    })
    .await?;
    Ok(())
}

/// Makes the binding exist with at least the subjects of `desired`. Subjects added by other
/// projects are kept.
async fn ensure_binding(store: &dyn ObjectStore, desired: &rbac::ClusterRoleBinding) -> Result<()> {
    reconciling::converge(store, desired, |existing: &mut rbac::ClusterRoleBinding, desired| {
        reconciling::merge_metadata(&mut existing.metadata, &desired.metadata);
        let subjects = existing.subjects.get_or_insert_with(Vec::new);
        for subject in desired.subjects.iter().flatten() {
            if !subjects.contains(subject) {
                subjects.push(subject.clone());
            }
        }
    })
    .await?;
    Ok(())
}

/// Takes `group` out of the subjects of the binding named `name`, if there is one.
async fn remove_subject(store: &dyn ObjectStore, name: &str, group: &str) -> Result<()> {
    let Some(existing) = store.get_opt::<rbac::ClusterRoleBinding>(None, name).await? else {
        return Ok(());
    };

    let mut modified = existing.clone();
    if let Some(subjects) = modified.subjects.as_mut() {
        subjects.retain(|subject| !(subject.kind == "Group" && subject.name == group));
    }
    if modified == existing {
        return Ok(());
    }

    match store.patch_typed(&modified, &existing).await {
        Ok(_) => Ok(()),
        Err(error) if error.is_not_found() => Ok(()),
        Err(error) => Err(error),
    }
}

pub struct ProjectRbac {
    targets: Arc<TargetTable>,
    dependency_requeue: Duration,
}

impl ProjectRbac {
    pub fn new(targets: Arc<TargetTable>, dependency_requeue: Duration) -> Self {
        Self {
            targets,
            dependency_requeue,
        }
    }

    fn placement(&self, destination: &Destination) -> Placement {
        if destination.key() == self.targets.master().identity() {
            Placement::Master
        } else {
            Placement::Seeds
        }
    }

    fn resources(placement: Placement) -> impl Iterator<Item = &'static ProjectResource> {
        PROJECT_RESOURCES
            .iter()
            .filter(move |resource| resource.placement == placement)
    }
}

#[async_trait]
impl FanOut<Project> for ProjectRbac {
    async fn destinations(&self, _project: &Project, _source: &TargetCluster) -> Result<Destinations> {
        Ok(Destinations {
            ready: std::iter::once(self.targets.master())
                .chain(self.targets.seeds())
                .map(Destination::cluster)
                .collect(),
            ..Default::default()
        })
    }

    fn resolve(&self, key: &str, _source: &TargetCluster) -> Option<Destination> {
        self.targets.get(key).ok().map(Destination::cluster)
    }

    async fn converge(&self, project: &Project, destination: &Destination) -> Result<()> {
        let id = project.try_name()?;
        let store = destination.store();
        let placement = self.placement(destination);

        for role in GroupRole::iter() {
            if placement == Placement::Master {
                if let Some(desired) = project_role(id, role) {
                    ensure_role(store, &desired).await?;
                    let name = project_role_name(id, role);
                    ensure_binding(store, &cluster_role_binding(name, role, role.group(id))).await?;
                }
            }

            for resource in Self::resources(placement) {
                let Some(desired) = resource_role(resource, role) else {
                    continue;
                };
                ensure_role(store, &desired).await?;
                let name = resource_role_name(resource, role);
                ensure_binding(store, &cluster_role_binding(name, role, role.group(id))).await?;
            }
        }

        Ok(())
    }

    async fn remove(&self, project: &Project, destination: &Destination) -> Result<()> {
        let id = project.try_name()?;
        let store = destination.store();
        let placement = self.placement(destination);

        for role in GroupRole::iter() {
            for resource in Self::resources(placement) {
                remove_subject(store, &resource_role_name(resource, role), &role.group(id)).await?;
            }

            if placement == Placement::Master {
                let name = project_role_name(id, role);
                reconciling::delete_if_exists::<rbac::ClusterRoleBinding, _>(store, None, &name).await?;
                reconciling::delete_if_exists::<rbac::ClusterRole, _>(store, None, &name).await?;
            }
        }

        if placement == Placement::Seeds {
            let selector = LabelSelector::everything().eq(PROJECT_ID_LABEL, id);
            for cluster in store.list_typed::<Cluster>(None, &selector).await? {
                let name = cluster.try_name()?;
                if reconciling::delete_if_exists::<Cluster, _>(store, None, name).await? {
                    tracing::info!(cluster = %name, seed = %destination.key(), "Deleted cluster of removed project");
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Context<Project> for ProjectRbac {
    fn finalizer(&self) -> Option<&str> {
        Some(CLEANUP_FINALIZER)
    }

    fn partitioned(&self) -> bool {
        true
    }

    async fn handle_apply(&self, project: Arc<Project>, source: &TargetCluster) -> Result<Action> {
        let action = fanout::apply(self, project.as_ref(), source, self.dependency_requeue).await?;

        if project.phase() == ProjectPhase::Inactive {
            source
                .store()
                .patch_status_typed(project.as_ref(), &json!({ "phase": ProjectPhase::Active }))
                .await?;
            tracing::info!("Project activated");
        }

        Ok(action)
    }

    async fn handle_cleanup(&self, project: Arc<Project>, source: &TargetCluster) -> Result<Action> {
        fanout::remove_all(self, project.as_ref(), source).await
    }
}

pub fn controller(targets: Arc<TargetTable>, options: &ControllerOptions) -> Controller<Project, ProjectRbac> {
    let context = ProjectRbac::new(Arc::clone(&targets), options.dependency_requeue);

    Controller::new(CONTROLLER_NAME, targets, Arc::new(context), options).watches(
        TargetRef::Master,
        WatchSpec::<Project>::new()
            .with_predicate(WorkerName::new(options.worker_name.clone()))
            .with_predicate(SpecChanged),
    )
}
