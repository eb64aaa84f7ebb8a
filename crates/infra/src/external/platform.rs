//! Deployment platform adapter (Railway GraphQL API).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("platform request failed: {0}")]
    Http(String),

    #[error("platform returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("platform rejected the request: {0}")]
    GraphQl(String),

    #[error("unexpected platform response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateDeployment {
    pub project_id: String,
    /// Present when the platform provisions the template asynchronously.
    pub workflow_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    Running,
    Complete,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NamedResource {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectTopology {
    pub environments: Vec<NamedResource>,
    pub services: Vec<NamedResource>,
}

impl ProjectTopology {
    pub fn is_ready(&self) -> bool {
        !self.environments.is_empty() && !self.services.is_empty()
    }

    /// `production` by name, else the first environment.
    pub fn primary_environment(&self) -> Option<&NamedResource> {
        self.environments
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case("production"))
            .or_else(|| self.environments.first())
    }

    /// First service whose name contains `needle`, case-insensitively.
    pub fn service_matching(&self, needle: &str) -> Option<&NamedResource> {
        let needle = needle.to_ascii_lowercase();
        self.services
            .iter()
            .find(|s| s.name.to_ascii_lowercase().contains(&needle))
    }
}

/// One service instance inside one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTarget<'a> {
    pub project_id: &'a str,
    pub environment_id: &'a str,
    pub service_id: &'a str,
}

#[async_trait]
pub trait DeploymentPlatform: Send + Sync {
    async fn deploy_template(&self, project_name: &str) -> Result<TemplateDeployment, PlatformError>;

    async fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus, PlatformError>;

    async fn project_topology(&self, project_id: &str) -> Result<ProjectTopology, PlatformError>;

    async fn rename_project(&self, project_id: &str, name: &str) -> Result<(), PlatformError>;

    async fn upsert_variables(
        &self,
        target: ServiceTarget<'_>,
        variables: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError>;

    /// Public domains already attached to the service.
    async fn service_domains(&self, target: ServiceTarget<'_>) -> Result<Vec<String>, PlatformError>;

    async fn create_service_domain(&self, target: ServiceTarget<'_>) -> Result<String, PlatformError>;

    /// Trigger a fresh deployment of the service.
    async fn deploy_service(&self, target: ServiceTarget<'_>) -> Result<(), PlatformError>;
}

#[derive(Clone)]
pub struct RailwayConfig {
    pub api_url: String,
    pub api_token: String,
    pub template_id: String,
    pub team_id: Option<String>,
}

impl std::fmt::Debug for RailwayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RailwayConfig")
            .field("api_url", &self.api_url)
            .field("template_id", &self.template_id)
            .field("team_id", &self.team_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct RailwayClient {
    http: reqwest::Client,
    cfg: RailwayConfig,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Edges<T> {
    edges: Vec<Node<T>>,
}

#[derive(Debug, Deserialize)]
struct Node<T> {
    node: T,
}

impl<T> Edges<T> {
    fn into_nodes(self) -> Vec<T> {
        self.edges.into_iter().map(|e| e.node).collect()
    }
}

/// Pull `data.<field>` out of a GraphQL envelope.
fn decode_field<T: DeserializeOwned>(envelope: Value, field: &str) -> Result<T, PlatformError> {
    let response: GraphQlResponse = serde_json::from_value(envelope)
        .map_err(|e| PlatformError::InvalidResponse(e.to_string()))?;
    if !response.errors.is_empty() {
        let messages: Vec<_> = response.errors.into_iter().map(|e| e.message).collect();
        return Err(PlatformError::GraphQl(messages.join("; ")));
    }
    let value = response
        .data
        .and_then(|data| match data {
            Value::Object(mut fields) => fields.remove(field),
            _ => None,
        })
        .ok_or_else(|| PlatformError::InvalidResponse(format!("missing `{field}` in response")))?;
    serde_json::from_value(value).map_err(|e| PlatformError::InvalidResponse(format!("{field}: {e}")))
}

impl RailwayClient {
    pub fn new(cfg: RailwayConfig, http: reqwest::Client) -> Self {
        Self { http, cfg }
    }

    pub fn with_timeouts(
        cfg: RailwayConfig,
        connect_timeout: Duration,
        timeout: Duration,
    ) -> Result<Self, PlatformError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self::new(cfg, http))
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        field: &str,
        query: &str,
        variables: Value,
    ) -> Result<T, PlatformError> {
        let response = self
            .http
            .post(&self.cfg.api_url)
            .bearer_auth(&self.cfg.api_token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PlatformError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let envelope: Value = response
            .json()
            .await
            .map_err(|e| PlatformError::InvalidResponse(e.to_string()))?;
        debug!(operation = field, "platform call succeeded");
        decode_field(envelope, field)
    }
}

#[async_trait]
impl DeploymentPlatform for RailwayClient {
    #[instrument(skip(self), err)]
    async fn deploy_template(&self, project_name: &str) -> Result<TemplateDeployment, PlatformError> {
        #[derive(Deserialize)]
        struct Template {
            #[serde(rename = "serializedConfig")]
            serialized_config: Value,
        }
        #[derive(Deserialize)]
        struct Deployed {
            #[serde(rename = "projectId")]
            project_id: String,
            #[serde(rename = "workflowId")]
            workflow_id: Option<String>,
        }

        let template: Template = self
            .execute(
                "template",
                "query template($id: String!) { template(id: $id) { serializedConfig } }",
                json!({ "id": self.cfg.template_id }),
            )
            .await?;

        let deployed: Deployed = self
            .execute(
                "templateDeployV2",
                "mutation templateDeployV2($input: TemplateDeployV2Input!) { \
                     templateDeployV2(input: $input) { projectId workflowId } }",
                json!({
                    "input": {
                        "templateId": self.cfg.template_id,
                        "serializedConfig": template.serialized_config,
                        "projectName": project_name,
                        "teamId": self.cfg.team_id,
                    }
                }),
            )
            .await?;

        Ok(TemplateDeployment {
            project_id: deployed.project_id,
            workflow_id: deployed.workflow_id.filter(|w| !w.is_empty()),
        })
    }

    #[instrument(skip(self), err)]
    async fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatus, PlatformError> {
        #[derive(Deserialize)]
        struct Status {
            status: String,
            error: Option<String>,
        }

        let status: Status = self
            .execute(
                "workflowStatus",
                "query workflowStatus($workflowId: String!) { \
                     workflowStatus(workflowId: $workflowId) { status error } }",
                json!({ "workflowId": workflow_id }),
            )
            .await?;

        Ok(match status.status.to_ascii_lowercase().as_str() {
            "complete" => WorkflowStatus::Complete,
            "error" | "failed" => WorkflowStatus::Failed(
                status.error.unwrap_or_else(|| "template workflow failed".to_string()),
            ),
            _ => WorkflowStatus::Running,
        })
    }

    #[instrument(skip(self), err)]
    async fn project_topology(&self, project_id: &str) -> Result<ProjectTopology, PlatformError> {
        #[derive(Deserialize)]
        struct Project {
            environments: Edges<NamedResource>,
            services: Edges<NamedResource>,
        }

        let project: Project = self
            .execute(
                "project",
                "query project($id: String!) { project(id: $id) { \
                     environments { edges { node { id name } } } \
                     services { edges { node { id name } } } } }",
                json!({ "id": project_id }),
            )
            .await?;

        Ok(ProjectTopology {
            environments: project.environments.into_nodes(),
            services: project.services.into_nodes(),
        })
    }

    #[instrument(skip(self), err)]
    async fn rename_project(&self, project_id: &str, name: &str) -> Result<(), PlatformError> {
        let _: Value = self
            .execute(
                "projectUpdate",
                "mutation projectUpdate($id: String!, $input: ProjectUpdateInput!) { \
                     projectUpdate(id: $id, input: $input) { id } }",
                json!({ "id": project_id, "input": { "name": name } }),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self, variables), fields(count = variables.len()), err)]
    async fn upsert_variables(
        &self,
        target: ServiceTarget<'_>,
        variables: &BTreeMap<String, String>,
    ) -> Result<(), PlatformError> {
        let _: Value = self
            .execute(
                "variableCollectionUpsert",
                "mutation variableCollectionUpsert($input: VariableCollectionUpsertInput!) { \
                     variableCollectionUpsert(input: $input) }",
                json!({
                    "input": {
                        "projectId": target.project_id,
                        "environmentId": target.environment_id,
                        "serviceId": target.service_id,
                        "variables": variables,
                    }
                }),
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn service_domains(&self, target: ServiceTarget<'_>) -> Result<Vec<String>, PlatformError> {
        #[derive(Deserialize)]
        struct Domain {
            domain: String,
        }
        #[derive(Deserialize)]
        struct Domains {
            #[serde(rename = "customDomains", default)]
            custom_domains: Vec<Domain>,
            #[serde(rename = "serviceDomains", default)]
            service_domains: Vec<Domain>,
        }

        let domains: Domains = self
            .execute(
                "domains",
                "query domains($projectId: String!, $environmentId: String!, $serviceId: String!) { \
                     domains(projectId: $projectId, environmentId: $environmentId, serviceId: $serviceId) { \
                         customDomains { domain } serviceDomains { domain } } }",
                json!({
                    "projectId": target.project_id,
                    "environmentId": target.environment_id,
                    "serviceId": target.service_id,
                }),
            )
            .await?;

        Ok(domains
            .custom_domains
            .into_iter()
            .chain(domains.service_domains)
            .map(|d| d.domain)
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn create_service_domain(&self, target: ServiceTarget<'_>) -> Result<String, PlatformError> {
        #[derive(Deserialize)]
        struct Created {
            domain: String,
        }

        let created: Created = self
            .execute(
                "serviceDomainCreate",
                "mutation serviceDomainCreate($input: ServiceDomainCreateInput!) { \
                     serviceDomainCreate(input: $input) { domain } }",
                json!({
                    "input": {
                        "environmentId": target.environment_id,
                        "serviceId": target.service_id,
                    }
                }),
            )
            .await?;
        Ok(created.domain)
    }

    #[instrument(skip(self), err)]
    async fn deploy_service(&self, target: ServiceTarget<'_>) -> Result<(), PlatformError> {
        let _: Value = self
            .execute(
                "serviceInstanceRedeploy",
                "mutation serviceInstanceRedeploy($environmentId: String!, $serviceId: String!) { \
                     serviceInstanceRedeploy(environmentId: $environmentId, serviceId: $serviceId) }",
                json!({
                    "environmentId": target.environment_id,
                    "serviceId": target.service_id,
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(id: &str, name: &str) -> NamedResource {
        NamedResource {
            id: id.into(),
            name: name.into(),
        }
    }

    #[test]
    fn decodes_data_field() {
        let env = json!({ "data": { "templateDeployV2": { "projectId": "p1", "workflowId": "w1" } } });
        let v: Value = decode_field(env, "templateDeployV2").unwrap();
        assert_eq!(v["projectId"], "p1");
    }

    #[test]
    fn graphql_errors_win_over_data() {
        let env = json!({ "data": null, "errors": [{ "message": "Not Authorized" }, { "message": "again" }] });
        let err = decode_field::<Value>(env, "project").unwrap_err();
        assert_eq!(err, PlatformError::GraphQl("Not Authorized; again".into()));
    }

    #[test]
    fn missing_field_is_invalid_response() {
        let err = decode_field::<Value>(json!({ "data": {} }), "project").unwrap_err();
        assert!(matches!(err, PlatformError::InvalidResponse(_)));
    }

    #[test]
    fn edges_flatten_to_nodes() {
        let edges: Edges<NamedResource> = serde_json::from_value(json!({
            "edges": [{ "node": { "id": "s1", "name": "web" } }, { "node": { "id": "s2", "name": "worker" } }]
        }))
        .unwrap();
        assert_eq!(edges.into_nodes(), vec![resource("s1", "web"), resource("s2", "worker")]);
    }

    #[test]
    fn topology_prefers_production_and_matches_by_substring() {
        let topo = ProjectTopology {
            environments: vec![resource("e1", "staging"), resource("e2", "Production")],
            services: vec![resource("s1", "ats-Web"), resource("s2", "ats-worker")],
        };
        assert!(topo.is_ready());
        assert_eq!(topo.primary_environment().unwrap().id, "e2");
        assert_eq!(topo.service_matching("web").unwrap().id, "s1");
        assert_eq!(topo.service_matching("WORKER").unwrap().id, "s2");
        assert!(topo.service_matching("db").is_none());
    }

    #[test]
    fn first_environment_is_the_fallback() {
        let topo = ProjectTopology {
            environments: vec![resource("e1", "main")],
            services: vec![],
        };
        assert!(!topo.is_ready());
        assert_eq!(topo.primary_environment().unwrap().id, "e1");
    }
}
