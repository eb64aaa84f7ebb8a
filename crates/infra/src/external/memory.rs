//! In-process deployment platform for tests and local development.
//!
//! Every template deploy creates a project with a `production` environment and
//! a `web` and a `worker` service. Failures can be injected per operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::platform::{
    DeploymentPlatform, NamedResource, PlatformError, ProjectTopology, ServiceTarget,
    TemplateDeployment, WorkflowStatus,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PlatformOperation {
    DeployTemplate,
    WorkflowStatus,
    ProjectTopology,
    RenameProject,
    UpsertVariables,
    ServiceDomains,
    CreateServiceDomain,
    DeployService,
}

#[derive(Debug, Default)]
struct Project {
    name: String,
    topology: ProjectTopology,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    projects: BTreeMap<String, Project>,
    variables: HashMap<String, BTreeMap<String, String>>,
    domains: HashMap<String, Vec<String>>,
    deploys: HashMap<String, u32>,
    /// Remaining injected failures per operation.
    failures: HashMap<PlatformOperation, u32>,
    /// `workflow_status` answers `Running` this many times before `Complete`.
    workflow_delay: u32,
    workflow_polls: HashMap<String, u32>,
    /// Added before every variable write so concurrent callers overlap.
    variable_latency: Duration,
}

#[derive(Debug, Default)]
pub struct InMemoryPlatform {
    state: Mutex<State>,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `times` calls of `operation` fail.
    pub fn fail_next(&self, operation: PlatformOperation, times: u32) {
        self.state().failures.insert(operation, times);
    }

    /// Report template workflows as running for `polls` status checks.
    pub fn set_workflow_delay(&self, polls: u32) {
        self.state().workflow_delay = polls;
    }

    pub fn set_variable_latency(&self, latency: Duration) {
        self.state().variable_latency = latency;
    }

    pub fn project_count(&self) -> usize {
        self.state().projects.len()
    }

    pub fn project_name(&self, project_id: &str) -> Option<String> {
        self.state().projects.get(project_id).map(|p| p.name.clone())
    }

    pub fn variables(&self, service_id: &str) -> BTreeMap<String, String> {
        self.state().variables.get(service_id).cloned().unwrap_or_default()
    }

    pub fn deploy_count(&self, service_id: &str) -> u32 {
        self.state().deploys.get(service_id).copied().unwrap_or_default()
    }

    fn check(&self, state: &mut State, operation: PlatformOperation) -> Result<(), PlatformError> {
        match state.failures.get_mut(&operation) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(PlatformError::Api {
                    status: 503,
                    body: format!("{operation:?} temporarily unavailable"),
                })
            }
            _ => Ok(()),
        }
    }

    fn known_service(state: &State, target: ServiceTarget<'_>) -> Result<(), PlatformError> {
        let found = state.projects.get(target.project_id).is_some_and(|p| {
            p.topology.services.iter().any(|s| s.id == target.service_id)
                && p.topology.environments.iter().any(|e| e.id == target.environment_id)
        });
        if found {
            Ok(())
        } else {
            Err(PlatformError::GraphQl(format!("service {} not found", target.service_id)))
        }
    }
}

#[async_trait]
impl DeploymentPlatform for InMemoryPlatform {
    async fn deploy_template(&self, project_name: &str) -> Result<TemplateDeployment, PlatformError> {
        let mut state = self.state();
        self.check(&mut state, PlatformOperation::DeployTemplate)?;

        state.next_id += 1;
        let n = state.next_id;
        let project_id = format!("proj_{n}");
        let resource = |id: String, name: &str| NamedResource {
            id,
            name: name.to_string(),
        };
        state.projects.insert(
            project_id.clone(),
            Project {
                name: project_name.to_string(),
                topology: ProjectTopology {
                    environments: vec![resource(format!("env_{n}"), "production")],
                    services: vec![
                        resource(format!("svc_{n}_web"), "web"),
                        resource(format!("svc_{n}_worker"), "worker"),
                    ],
                },
            },
        );
        Ok(TemplateDeployment {
            project_id,
            workflow_id: Some(format!("wf_{n}")),
        })
    }

    async fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus, PlatformError> {
        let mut state = self.state();
        self.check(&mut state, PlatformOperation::WorkflowStatus)?;

        let delay = state.workflow_delay;
        let polls = state.workflow_polls.entry(workflow_id.to_string()).or_default();
        *polls += 1;
        Ok(if *polls > delay {
            WorkflowStatus::Complete
        } else {
            WorkflowStatus::Running
        })
    }

    async fn project_topology(&self, project_id: &str) -> Result<ProjectTopology, PlatformError> {
        let mut state = self.state();
        self.check(&mut state, PlatformOperation::ProjectTopology)?;
        state
            .projects
            .get(project_id)
            .map(|p| p.topology.clone())
            .ok_or_else(|| PlatformError::GraphQl(format!("project {project_id} not found")))
    }

    async fn rename_project(&self, project_id: &str, name: &str) -> Result<(), PlatformError> {
        let mut state = self.state();
        self.check(&mut state, PlatformOperation::RenameProject)?;
        let project = state
            .projects
            .get_mut(project_id)
            .ok_or_else(|| PlatformError::GraphQl(format!("project {project_id} not found")))?;
        project.name = name.to_string();
        Ok(())
    }

    async fn upsert_variables(
        &self,
        target: ServiceTarget<'_>,
        variables: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError> {
        let latency = self.state().variable_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state();
        self.check(&mut state, PlatformOperation::UpsertVariables)?;
        Self::known_service(&state, target)?;
        state
            .variables
            .entry(target.service_id.to_string())
            .or_default()
            .extend(variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn service_domains(&self, target: ServiceTarget<'_>) -> Result<Vec<String>, PlatformError> {
        let mut state = self.state();
        self.check(&mut state, PlatformOperation::ServiceDomains)?;
        Self::known_service(&state, target)?;
        Ok(state.domains.get(target.service_id).cloned().unwrap_or_default())
    }

    async fn create_service_domain(&self, target: ServiceTarget<'_>) -> Result<String, PlatformError> {
        let mut state = self.state();
        self.check(&mut state, PlatformOperation::CreateServiceDomain)?;
        Self::known_service(&state, target)?;
        let domain = format!("{}.up.railway.app", target.service_id.replace('_', "-"));
        state
            .domains
            .entry(target.service_id.to_string())
            .or_default()
            .push(domain.clone());
        Ok(domain)
    }

    async fn deploy_service(&self, target: ServiceTarget<'_>) -> Result<(), PlatformError> {
        let mut state = self.state();
        self.check(&mut state, PlatformOperation::DeployService)?;
        Self::known_service(&state, target)?;
        *state.deploys.entry(target.service_id.to_string()).or_default() += 1;
        Ok(())
    }
}
