//! Console upload from a running session to the server.

use gantry_agent::{BufferedConsole, BuildCommand, CancellationToken};
use gantry_core::instance::JobResult;
use gantry_tests::{AgentHarness, AssignmentFixture, RecordingUploader};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_final_flush_is_retried_before_completion() {
    let harness = AgentHarness::new();
    let uploader = Arc::new(RecordingUploader::failing(1));
    let job = AssignmentFixture::job("cruise", 1, "compile");
    let console = Arc::new(BufferedConsole::new(job.clone(), uploader.clone(), 1000));
    let session = harness.session(job, console.clone(), CancellationToken::new());

    let result = session.build(&BuildCommand::echo(["important-line"])).await.unwrap();

    assert_eq!(result, JobResult::Passed);
    assert_eq!(uploader.lines(), vec!["important-line"]);
    assert_eq!(console.pending(), 0);
    assert_eq!(harness.remote.reports(), vec!["completed:Passed"]);
}

#[tokio::test]
async fn test_console_outage_does_not_fail_the_job() {
    let harness = AgentHarness::new();
    let uploader = Arc::new(RecordingUploader::failing(100));
    let job = AssignmentFixture::job("cruise", 1, "compile");
    let console = Arc::new(BufferedConsole::new(job.clone(), uploader.clone(), 1000));
    let session = harness.session(job, console.clone(), CancellationToken::new());

    let result = session.build(&BuildCommand::echo(["lost-line"])).await.unwrap();

    assert_eq!(result, JobResult::Passed);
    assert!(uploader.lines().is_empty());
    assert_eq!(console.pending(), 1);
    assert_eq!(harness.remote.reports(), vec!["completed:Passed"]);
}

#[tokio::test]
async fn test_exec_output_is_uploaded_while_process_runs() {
    let harness = AgentHarness::new();
    let job = AssignmentFixture::job("cruise", 1, "compile");
    let console = Arc::new(BufferedConsole::new(job.clone(), harness.uploader.clone(), 5));
    let session = Arc::new(harness.session(job, console, CancellationToken::new()));
    let command = BuildCommand::exec(
        "sh",
        ["-c", "for i in 1 2 3 4 5 6 7 8 9 10 11 12; do echo line$i; done; sleep 3"],
    );

    let running = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.build(&command).await })
    };
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let uploaded = harness.uploader.lines().iter().filter(|l| l.starts_with("line")).count();
    assert_eq!(uploaded, 12);
    assert!(!running.is_finished());

    let result = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("build did not finish")
        .unwrap()
        .unwrap();
    assert_eq!(result, JobResult::Passed);
    assert_eq!(harness.uploader.lines().iter().filter(|l| l.starts_with("line")).count(), 12);
}
