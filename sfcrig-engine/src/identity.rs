//! Tenant and user provisioning for multi-tenant scenarios.

use tracing::info;

use sfcrig_shared::errors::ProvisionResult;
use sfcrig_shared::model::{Project, User};
use sfcrig_shared::resource::{Operation, ResourceKind};

use crate::client::records::{ProjectRequest, UserRequest};
use crate::client::{Remote, decode, encode};
use crate::registry::ResourceRegistry;

/// Role given to scenario users when none is requested
pub const DEFAULT_ROLE: &str = "member";

#[derive(Clone)]
pub struct IdentityManager {
    remote: Remote,
    registry: ResourceRegistry,
}

impl IdentityManager {
    pub fn new(remote: Remote, registry: ResourceRegistry) -> Self {
        Self { remote, registry }
    }

    pub async fn create_project(&self, name: &str, domain: &str) -> ProvisionResult<Project> {
        let request = ProjectRequest {
            name: name.to_string(),
            domain: domain.to_string(),
        };
        let body = encode(Operation::Create, ResourceKind::Project, &request)?;
        let record = self
            .remote
            .call(
                Operation::Create,
                ResourceKind::Project,
                name,
                self.remote.identity().create_project(body),
            )
            .await?;
        let project: Project = decode(Operation::Create, ResourceKind::Project, record)?;
        self.registry.register_id(ResourceKind::Project, &project.id)?;
        info!("Created project {} ({}) in domain {}", project.name, project.id, domain);
        Ok(project)
    }

    /// Create a user holding `role` on `project`
    pub async fn create_user(
        &self,
        name: &str,
        password: Option<&str>,
        project: &Project,
        domain: &str,
        role: &str,
    ) -> ProvisionResult<User> {
        self.registry.require(ResourceKind::Project, &project.id)?;
        let request = UserRequest {
            name: name.to_string(),
            password: password.map(str::to_string),
            project_id: project.id.clone(),
            domain: domain.to_string(),
            role: role.to_string(),
        };
        let body = encode(Operation::Create, ResourceKind::User, &request)?;
        let record = self
            .remote
            .call(
                Operation::Create,
                ResourceKind::User,
                name,
                self.remote.identity().create_user(body),
            )
            .await?;
        let user: User = decode(Operation::Create, ResourceKind::User, record)?;
        self.registry.register_id(ResourceKind::User, &user.id)?;
        info!("Created user {} ({}) as {} on project {}", user.name, user.id, role, project.id);
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::Simulator;
    use sfcrig_shared::errors::ProvisionError;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_project_then_user() {
        let sim = Arc::new(Simulator::new());
        let remote = Remote::new(sim.clone(), sim.clone(), sim.clone(), Duration::from_secs(1));
        let identity = IdentityManager::new(remote, ResourceRegistry::new());

        let project = identity.create_project("tenant-a", "default").await.unwrap();
        let user = identity
            .create_user("tenant-a-admin", Some("secret"), &project, "default", DEFAULT_ROLE)
            .await
            .unwrap();
        assert_eq!(user.project_id, project.id);
        assert_eq!(sim.live_count(), 2);

        let err = identity.create_project("tenant-a", "default").await.unwrap_err();
        assert!(matches!(err, ProvisionError::RemoteOperationFailed { .. }));
    }
}
