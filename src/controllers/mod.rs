//! The controllers shipped with `kubermatic-sync`.

pub mod audit_logging;
pub mod constraint;
pub mod preset;
pub mod project_rbac;
pub mod resource_quota;
pub mod usersshkey;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ControllerOptions;
use crate::error::Result;
use crate::target::TargetTable;

/// Runs every controller against `targets` until `token` is cancelled or one of them fails
/// to start.
pub async fn run_all(targets: Arc<TargetTable>, options: &ControllerOptions, token: CancellationToken) -> Result<()> {
    let result = tokio::try_join!(
        audit_logging::controller(Arc::clone(&targets), options).run(token.clone()),
        preset::controller(Arc::clone(&targets), options).run(token.clone()),
        resource_quota::controller(Arc::clone(&targets), options).run(token.clone()),
        constraint::controller(Arc::clone(&targets), options).run(token.clone()),
        usersshkey::controller(Arc::clone(&targets), options).run(token.clone()),
        project_rbac::controller(Arc::clone(&targets), options).run(token.clone()),
    );

    if result.is_err() {
        token.cancel();
    }
    result.map(|_| ())
}
