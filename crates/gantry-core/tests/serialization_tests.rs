//! Wire-shape tests for gantry-core types that cross the server/agent boundary.

use chrono::Utc;
use gantry_core::config::*;
use gantry_core::ids::*;
use gantry_core::instance::*;
use gantry_core::material::*;
use gantry_core::plan::*;

#[test]
fn test_pipeline_config_from_json_applies_defaults() {
    let json = serde_json::json!({
        "name": "cruise",
        "materials": [
            { "type": "scm", "kind": "git", "url": "https://example.com/cruise.git" },
            { "type": "dependency", "pipeline_name": "up", "stage_name": "dist" }
        ],
        "stages": [
            {
                "name": "dev",
                "jobs": [
                    {
                        "name": "unit",
                        "resources": ["linux"],
                        "tasks": [
                            { "kind": "exec", "command": "make", "args": ["test"] },
                            {
                                "kind": "fetch",
                                "pipeline": "up",
                                "stage": "dist",
                                "job": "package",
                                "source": { "src_file": "app.tar.gz" }
                            }
                        ]
                    }
                ]
            }
        ]
    });

    let config: PipelineConfig = serde_json::from_value(json).expect("deserialize");
    assert_eq!(config.label_template, "${COUNT}");
    assert!(config.depends_on("UP"));

    let stage = config.find_stage("dev").expect("stage");
    assert!(stage.fetch_materials);
    assert_eq!(stage.approval_type, ApprovalType::Success);

    let job = stage.find_job("unit").expect("job");
    assert_eq!(job.tasks[0].kind(), TaskKind::Exec);
    assert_eq!(job.tasks[1].kind(), TaskKind::Fetch);
    assert_eq!(job.tasks[1].run_if.effective(), RunIfConfig::Passed);
}

#[test]
fn test_job_instance_uses_snake_case_states() {
    let plan = JobPlan {
        job_name: "unit".to_string(),
        resources: vec!["linux".to_string()],
        artifact_plans: vec![],
        variables: EnvironmentVariables::new(),
        elastic_profile: None,
        timeout_minutes: Some(30),
    };
    let mut job = JobInstance::scheduled("unit", "unit", plan, Utc::now());
    job.assign(AgentId::new(), Utc::now());

    let json = serde_json::to_value(&job).expect("serialize");
    assert_eq!(json["state"], "assigned");
    assert_eq!(json["result"], "unknown");

    let parsed: JobInstance = serde_json::from_value(json).expect("deserialize");
    assert_eq!(parsed, job);
}

#[test]
fn test_latest_stage_counter_serializes_as_sentinel() {
    let id = JobIdentifier::of("cruise", 3, "3", "ft", StageCounter::Latest, "linux");
    let json = serde_json::to_value(&id).expect("serialize");
    assert_eq!(json["stage"]["stage_counter"], "latest");

    let parsed: JobIdentifier = serde_json::from_value(json).expect("deserialize");
    assert_eq!(parsed.build_locator(), "cruise/3/ft/latest/linux");
}

#[test]
fn test_build_cause_carries_dependency_revision() {
    let cause = BuildCause::new(
        vec![MaterialRevision::dependency(
            DependencyMaterialRevision::parse("up/4/dist/1", "up-4").expect("parse"),
        )],
        "changes",
    );
    let json = serde_json::to_string(&cause).expect("serialize");
    let parsed: BuildCause = serde_json::from_str(&json).expect("deserialize");

    let dep = parsed.dependency_revision_for("up").expect("dependency");
    assert_eq!(dep.pipeline_label, "up-4");
    assert_eq!(parsed.fingerprints(), cause.fingerprints());
}
