//! Material configuration, resolved revisions and build causes.

use crate::error::{Error, Result};
use crate::ids::StageCounter;
use crate::plan::EnvironmentVariables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScmKind {
    Git,
    Hg,
    Svn,
    P4,
    Tfs,
}

impl ScmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScmKind::Git => "git",
            ScmKind::Hg => "hg",
            ScmKind::Svn => "svn",
            ScmKind::P4 => "p4",
            ScmKind::Tfs => "tfs",
        }
    }
}

/// A configured material of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MaterialConfig {
    Scm {
        kind: ScmKind,
        url: String,
        #[serde(default)]
        branch: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        dest: Option<String>,
    },
    Dependency {
        pipeline_name: String,
        stage_name: String,
        #[serde(default)]
        name: Option<String>,
    },
}

impl MaterialConfig {
    pub fn git(url: impl Into<String>) -> Self {
        MaterialConfig::Scm {
            kind: ScmKind::Git,
            url: url.into(),
            branch: None,
            name: None,
            dest: None,
        }
    }

    pub fn dependency(pipeline_name: impl Into<String>, stage_name: impl Into<String>) -> Self {
        MaterialConfig::Dependency {
            pipeline_name: pipeline_name.into(),
            stage_name: stage_name.into(),
            name: None,
        }
    }

    /// Type key used to look up updaters and retry policies.
    pub fn material_type(&self) -> &'static str {
        match self {
            MaterialConfig::Scm { kind, .. } => kind.as_str(),
            MaterialConfig::Dependency { .. } => "dependency",
        }
    }

    /// Display name; explicit name wins, otherwise the url or upstream pipeline.
    pub fn name(&self) -> &str {
        match self {
            MaterialConfig::Scm { name: Some(n), .. }
            | MaterialConfig::Dependency { name: Some(n), .. } => n,
            MaterialConfig::Scm { url, .. } => url,
            MaterialConfig::Dependency { pipeline_name, .. } => pipeline_name,
        }
    }

    pub fn is_dependency(&self) -> bool {
        matches!(self, MaterialConfig::Dependency { .. })
    }

    pub fn dest(&self) -> Option<&str> {
        match self {
            MaterialConfig::Scm { dest, .. } => dest.as_deref(),
            MaterialConfig::Dependency { .. } => None,
        }
    }

    /// Stable identity of the material, independent of its display name.
    pub fn fingerprint(&self) -> String {
        let basis = match self {
            MaterialConfig::Scm {
                kind, url, branch, ..
            } => format!(
                "type={}<|>url={}<|>branch={}",
                kind.as_str(),
                url,
                branch.as_deref().unwrap_or("")
            ),
            MaterialConfig::Dependency {
                pipeline_name,
                stage_name,
                ..
            } => format!(
                "type=dependency<|>pipeline={}<|>stage={}",
                pipeline_name.to_lowercase(),
                stage_name.to_lowercase()
            ),
        };
        hex::encode(Sha256::digest(basis.as_bytes()))
    }
}

/// Revision of an upstream pipeline's stage run, e.g. `up/5/up-stage/3` labelled `up-5`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyMaterialRevision {
    pub pipeline_name: String,
    pub pipeline_counter: u32,
    pub pipeline_label: String,
    pub stage_name: String,
    pub stage_counter: u32,
}

impl DependencyMaterialRevision {
    pub fn new(
        pipeline_name: impl Into<String>,
        pipeline_counter: u32,
        pipeline_label: impl Into<String>,
        stage_name: impl Into<String>,
        stage_counter: u32,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            pipeline_counter,
            pipeline_label: pipeline_label.into(),
            stage_name: stage_name.into(),
            stage_counter,
        }
    }

    /// Parse `pipeline/counter/stage/stageCounter`.
    pub fn parse(revision: &str, label: impl Into<String>) -> Result<Self> {
        let parts: Vec<&str> = revision.split('/').collect();
        let [pipeline, counter, stage, stage_counter] = parts.as_slice() else {
            return Err(Error::InvalidDependencyRevision(revision.to_string()));
        };
        let invalid = || Error::InvalidDependencyRevision(revision.to_string());
        let pipeline_counter = counter.parse().map_err(|_| invalid())?;
        let stage_counter = match StageCounter::parse(stage_counter) {
            Some(StageCounter::Run(n)) => n,
            _ => return Err(invalid()),
        };
        Ok(Self::new(
            *pipeline,
            pipeline_counter,
            label,
            *stage,
            stage_counter,
        ))
    }

    pub fn revision(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.pipeline_name, self.pipeline_counter, self.stage_name, self.stage_counter
        )
    }
}

impl fmt::Display for DependencyMaterialRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.revision())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Revision {
    Scm {
        revision: String,
        #[serde(default)]
        modified_at: Option<DateTime<Utc>>,
    },
    Dependency(DependencyMaterialRevision),
}

impl Revision {
    pub fn scm(revision: impl Into<String>) -> Self {
        Revision::Scm {
            revision: revision.into(),
            modified_at: None,
        }
    }

    /// The revision string used in labels and checkouts.
    pub fn as_revision_string(&self) -> String {
        match self {
            Revision::Scm { revision, .. } => revision.clone(),
            Revision::Dependency(dep) => dep.revision(),
        }
    }

    /// Short form rendered into pipeline labels.
    pub fn label_value(&self) -> String {
        match self {
            Revision::Scm { revision, .. } => revision.clone(),
            Revision::Dependency(dep) => dep.pipeline_label.clone(),
        }
    }
}

/// A material together with the revision a pipeline run builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialRevision {
    pub material: MaterialConfig,
    pub revision: Revision,
    #[serde(default)]
    pub changed: bool,
}

impl MaterialRevision {
    pub fn new(material: MaterialConfig, revision: Revision) -> Self {
        Self {
            material,
            revision,
            changed: true,
        }
    }

    pub fn dependency(revision: DependencyMaterialRevision) -> Self {
        let material =
            MaterialConfig::dependency(revision.pipeline_name.clone(), revision.stage_name.clone());
        Self::new(material, Revision::Dependency(revision))
    }

    pub fn fingerprint(&self) -> String {
        self.material.fingerprint()
    }
}

/// The resolved material revisions and approval info that justify a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCause {
    pub revisions: Vec<MaterialRevision>,
    pub approver: String,
    #[serde(default)]
    pub trigger_message: String,
    #[serde(default)]
    pub variables: EnvironmentVariables,
    #[serde(default)]
    pub forced: bool,
}

impl BuildCause {
    pub fn new(revisions: Vec<MaterialRevision>, approver: impl Into<String>) -> Self {
        let approver = approver.into();
        Self {
            trigger_message: format!("triggered by {}", approver),
            revisions,
            approver,
            variables: EnvironmentVariables::new(),
            forced: false,
        }
    }

    pub fn with_variables(mut self, variables: EnvironmentVariables) -> Self {
        self.variables = variables;
        self
    }

    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    /// Fingerprints of the causing revisions, sorted.
    pub fn fingerprints(&self) -> Vec<String> {
        let mut fingerprints: Vec<String> =
            self.revisions.iter().map(MaterialRevision::fingerprint).collect();
        fingerprints.sort();
        fingerprints
    }

    pub fn revision_for_fingerprint(&self, fingerprint: &str) -> Option<&MaterialRevision> {
        self.revisions.iter().find(|r| r.fingerprint() == fingerprint)
    }

    /// Revision of the upstream pipeline named `pipeline_name`, if it is a dependency.
    pub fn dependency_revision_for(&self, pipeline_name: &str) -> Option<&DependencyMaterialRevision> {
        self.revisions.iter().find_map(|r| match &r.revision {
            Revision::Dependency(dep) if dep.pipeline_name.eq_ignore_ascii_case(pipeline_name) => {
                Some(dep)
            }
            _ => None,
        })
    }

    /// Revision of a material looked up by its display name (case insensitive).
    pub fn revision_for_material_named(&self, name: &str) -> Option<&MaterialRevision> {
        self.revisions
            .iter()
            .find(|r| r.material.name().eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_ignores_display_name() {
        let plain = MaterialConfig::git("https://example.com/repo.git");
        let named = MaterialConfig::Scm {
            kind: ScmKind::Git,
            url: "https://example.com/repo.git".to_string(),
            branch: None,
            name: Some("repo".to_string()),
            dest: None,
        };
        assert_eq!(plain.fingerprint(), named.fingerprint());
        assert_ne!(
            plain.fingerprint(),
            MaterialConfig::git("https://example.com/other.git").fingerprint()
        );
    }

    #[test]
    fn test_parse_dependency_revision() {
        let rev = DependencyMaterialRevision::parse("down/1/down-stage/2", "down-1").unwrap();
        assert_eq!(rev.pipeline_name, "down");
        assert_eq!(rev.pipeline_counter, 1);
        assert_eq!(rev.pipeline_label, "down-1");
        assert_eq!(rev.stage_name, "down-stage");
        assert_eq!(rev.stage_counter, 2);
        assert_eq!(rev.revision(), "down/1/down-stage/2");
    }

    #[test]
    fn test_parse_rejects_malformed_revision() {
        assert!(DependencyMaterialRevision::parse("down/1/down-stage", "l").is_err());
        assert!(DependencyMaterialRevision::parse("down/x/down-stage/1", "l").is_err());
        assert!(DependencyMaterialRevision::parse("down/1/down-stage/latest", "l").is_err());
    }

    #[test]
    fn test_dependency_lookup_is_case_insensitive() {
        let cause = BuildCause::new(
            vec![MaterialRevision::dependency(DependencyMaterialRevision::new(
                "Upstream", 4, "up-4", "dist", 1,
            ))],
            "changes",
        );
        let dep = cause.dependency_revision_for("upstream").unwrap();
        assert_eq!(dep.pipeline_counter, 4);
        assert!(cause.dependency_revision_for("other").is_none());
    }
}
