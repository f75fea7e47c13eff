//! Job plans and the environment variables they carry.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mask shown in place of secure values.
pub const SECURE_MASK: &str = "********";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub secure: bool,
}

impl EnvironmentVariable {
    pub fn plain(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            secure: false,
        }
    }

    pub fn secure(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            secure: true,
        }
    }

    pub fn display_value(&self) -> &str {
        if self.secure { SECURE_MASK } else { &self.value }
    }
}

/// Ordered set of environment variables keyed by name.
///
/// Re-adding a name replaces its value but keeps the position where the
/// name was first inserted, so merges are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentVariables(IndexMap<String, EnvironmentVariable>);

impl EnvironmentVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, variable: EnvironmentVariable) {
        self.0.insert(variable.name.clone(), variable);
    }

    pub fn add_plain(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.add(EnvironmentVariable::plain(name, value));
    }

    pub fn add_secure(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.add(EnvironmentVariable::secure(name, value));
    }

    /// Layer `other` on top of `self`; `other` wins on name collisions.
    pub fn merge(&mut self, other: &EnvironmentVariables) {
        for variable in other.iter() {
            self.add(variable.clone());
        }
    }

    pub fn get(&self, name: &str) -> Option<&EnvironmentVariable> {
        self.0.get(name)
    }

    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(|v| v.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnvironmentVariable> {
        self.0.values()
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Values of all secure variables, used for console masking.
    pub fn secure_values(&self) -> Vec<&str> {
        self.iter()
            .filter(|v| v.secure && !v.value.is_empty())
            .map(|v| v.value.as_str())
            .collect()
    }
}

impl FromIterator<EnvironmentVariable> for EnvironmentVariables {
    fn from_iter<I: IntoIterator<Item = EnvironmentVariable>>(iter: I) -> Self {
        let mut vars = Self::new();
        for variable in iter {
            vars.add(variable);
        }
        vars
    }
}

/// Elastic agent profile a job may require.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticProfile {
    pub id: String,
    pub plugin_id: String,
    #[serde(default)]
    pub cluster_profile_id: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Variables injected into every job that uses this profile.
    #[serde(default)]
    pub environment_variables: EnvironmentVariables,
}

impl ElasticProfile {
    pub fn new(id: impl Into<String>, plugin_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            plugin_id: plugin_id.into(),
            cluster_profile_id: None,
            properties: BTreeMap::new(),
            environment_variables: EnvironmentVariables::new(),
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_variables.add_plain(name, value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Build,
    Test,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPlan {
    pub kind: ArtifactKind,
    pub src: String,
    #[serde(default)]
    pub dest: String,
}

/// Immutable snapshot of everything an agent needs to run one job instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPlan {
    pub job_name: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub artifact_plans: Vec<ArtifactPlan>,
    #[serde(default)]
    pub variables: EnvironmentVariables,
    #[serde(default)]
    pub elastic_profile: Option<ElasticProfile>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
}

impl JobPlan {
    pub fn requires_elastic_agent(&self) -> bool {
        self.elastic_profile.is_some()
    }

    /// Copy of this plan with `variables` layered on top, used for fan-out instances.
    pub fn with_additional_variables(&self, variables: &EnvironmentVariables) -> Self {
        let mut plan = self.clone();
        plan.variables.merge(variables);
        plan
    }

    pub fn renamed(&self, job_name: impl Into<String>) -> Self {
        let mut plan = self.clone();
        plan.job_name = job_name.into();
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_override_keeps_first_position() {
        let mut vars = EnvironmentVariables::new();
        vars.add_plain("A", "1");
        vars.add_plain("B", "2");

        let mut overrides = EnvironmentVariables::new();
        overrides.add_plain("C", "3");
        overrides.add_plain("A", "10");
        vars.merge(&overrides);

        assert_eq!(vars.names(), vec!["A", "B", "C"]);
        assert_eq!(vars.value_of("A"), Some("10"));
    }

    #[test]
    fn test_secure_values_are_masked() {
        let mut vars = EnvironmentVariables::new();
        vars.add_secure("TOKEN", "s3cr3t");
        vars.add_plain("MODE", "fast");

        assert_eq!(vars.get("TOKEN").unwrap().display_value(), SECURE_MASK);
        assert_eq!(vars.get("MODE").unwrap().display_value(), "fast");
        assert_eq!(vars.secure_values(), vec!["s3cr3t"]);
    }

    #[test]
    fn test_environment_serializes_as_map() {
        let mut vars = EnvironmentVariables::new();
        vars.add_plain("A", "1");
        let json = serde_json::to_value(&vars).unwrap();
        assert_eq!(json["A"]["value"], "1");

        let back: EnvironmentVariables = serde_json::from_value(json).unwrap();
        assert_eq!(back, vars);
    }
}
