//! Scheduling context.
//!
//! Carries the transient inputs of one scheduling pass: who approved it, the
//! environment scopes collected on the way down the config tree, trigger-time
//! overrides, the agents known for run-on-all fan-out and the elastic profiles.

use gantry_core::config::ApprovalType;
use gantry_core::ids::AgentId;
use gantry_core::plan::{ElasticProfile, EnvironmentVariables};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An agent as seen by the scheduler when fanning out run-on-all jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSummary {
    pub uuid: AgentId,
    pub hostname: String,
    pub resources: Vec<String>,
}

impl AgentSummary {
    pub fn new<I, S>(uuid: AgentId, hostname: impl Into<String>, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            uuid,
            hostname: hostname.into(),
            resources: resources.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether this agent has every resource in `required` (case insensitive).
    pub fn satisfies(&self, required: &[String]) -> bool {
        required
            .iter()
            .all(|r| self.resources.iter().any(|have| have.eq_ignore_ascii_case(r)))
    }
}

type ResolveFn = dyn Fn(&str) -> Option<ElasticProfile> + Send + Sync;

/// Looks up elastic profiles by id.
#[derive(Clone)]
pub struct ElasticProfileResolver {
    resolve: Arc<ResolveFn>,
}

impl ElasticProfileResolver {
    pub fn new<F>(resolve: F) -> Self
    where
        F: Fn(&str) -> Option<ElasticProfile> + Send + Sync + 'static,
    {
        Self {
            resolve: Arc::new(resolve),
        }
    }

    /// Resolver that knows no profiles.
    pub fn none() -> Self {
        Self::new(|_| None)
    }

    pub fn from_profiles(profiles: Vec<ElasticProfile>) -> Self {
        let by_id: HashMap<String, ElasticProfile> =
            profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self::new(move |id| by_id.get(id).cloned())
    }

    pub fn resolve(&self, id: &str) -> Option<ElasticProfile> {
        (self.resolve)(id)
    }
}

impl Default for ElasticProfileResolver {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for ElasticProfileResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElasticProfileResolver").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulingContext {
    approver: String,
    approval_type: Option<ApprovalType>,
    scoped_variables: EnvironmentVariables,
    overrides: EnvironmentVariables,
    agents: Vec<AgentSummary>,
    elastic_profiles: ElasticProfileResolver,
    rerun: bool,
}

impl SchedulingContext {
    pub fn new(approver: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
            approval_type: None,
            scoped_variables: EnvironmentVariables::new(),
            overrides: EnvironmentVariables::new(),
            agents: Vec::new(),
            elastic_profiles: ElasticProfileResolver::none(),
            rerun: false,
        }
    }

    pub fn with_agents(mut self, agents: Vec<AgentSummary>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_elastic_profiles(mut self, resolver: ElasticProfileResolver) -> Self {
        self.elastic_profiles = resolver;
        self
    }

    /// Layer trigger-time overrides on top of any already present.
    pub fn with_overrides(mut self, variables: &EnvironmentVariables) -> Self {
        self.overrides.merge(variables);
        self
    }

    /// Record how the stage was approved, instead of the configured approval type.
    pub fn with_approval_type(mut self, approval_type: ApprovalType) -> Self {
        self.approval_type = Some(approval_type);
        self
    }

    /// A context with `variables` as the innermost scope; later scopes win.
    pub fn override_environment_variables(&self, variables: &EnvironmentVariables) -> Self {
        let mut context = self.clone();
        context.scoped_variables.merge(variables);
        context
    }

    /// A context whose generated jobs are marked as reruns.
    pub fn permit_rerun(&self) -> Self {
        let mut context = self.clone();
        context.rerun = true;
        context
    }

    pub fn approver(&self) -> &str {
        &self.approver
    }

    pub fn approval_type(&self) -> Option<ApprovalType> {
        self.approval_type
    }

    pub fn scoped_variables(&self) -> &EnvironmentVariables {
        &self.scoped_variables
    }

    pub fn overrides(&self) -> &EnvironmentVariables {
        &self.overrides
    }

    pub fn agents(&self) -> &[AgentSummary] {
        &self.agents
    }

    pub fn is_rerun(&self) -> bool {
        self.rerun
    }

    pub fn elastic_profile(&self, id: &str) -> Option<ElasticProfile> {
        self.elastic_profiles.resolve(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_later_scope_wins() {
        let mut pipeline = EnvironmentVariables::new();
        pipeline.add_plain("TARGET", "pipeline");
        pipeline.add_plain("ONLY_PIPELINE", "yes");
        let mut stage = EnvironmentVariables::new();
        stage.add_plain("TARGET", "stage");

        let context = SchedulingContext::new("changes")
            .override_environment_variables(&pipeline)
            .override_environment_variables(&stage);

        assert_eq!(context.scoped_variables().value_of("TARGET"), Some("stage"));
        assert_eq!(context.scoped_variables().value_of("ONLY_PIPELINE"), Some("yes"));
    }

    #[test]
    fn test_override_does_not_touch_original() {
        let base = SchedulingContext::new("changes");
        let mut vars = EnvironmentVariables::new();
        vars.add_plain("A", "1");
        let scoped = base.override_environment_variables(&vars);

        assert!(base.scoped_variables().is_empty());
        assert_eq!(scoped.scoped_variables().len(), 1);
        assert!(!scoped.is_rerun());
        assert!(scoped.permit_rerun().is_rerun());
    }

    #[test]
    fn test_elastic_profiles_resolve_by_id() {
        let context = SchedulingContext::new("changes").with_elastic_profiles(
            ElasticProfileResolver::from_profiles(vec![ElasticProfile::new("docker", "cd.docker")]),
        );
        assert_eq!(context.elastic_profile("docker").unwrap().plugin_id, "cd.docker");
        assert!(context.elastic_profile("k8s").is_none());
    }

    #[test]
    fn test_agent_resource_matching_ignores_case() {
        let agent = AgentSummary::new(AgentId::new(), "box", ["Linux", "Firefox"]);
        assert!(agent.satisfies(&["linux".to_string()]));
        assert!(agent.satisfies(&[]));
        assert!(!agent.satisfies(&["windows".to_string()]));
    }
}
