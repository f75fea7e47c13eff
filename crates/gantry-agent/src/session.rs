//! Build session: walks a [`BuildCommand`] tree for one job.
//!
//! Commands run strictly in order. Each node is gated by its run-if against
//! the result accumulated so far; a failing node turns the result to Failed
//! and later Passed-gated siblings are skipped. Cancellation is checked at
//! node boundaries and awaited inside long running commands. A node that was
//! running when cancellation arrived runs its on-cancel handler once.

use crate::cancel::CancellationToken;
use crate::command::{BuildCommand, CommandKind, parse_state};
use crate::console::{ConsoleSink, ConsoleTag, TaggedLine};
use crate::download::{ArtifactDownload, ArtifactDownloader, ArtifactHandler, HttpFetcher, Integrity};
use crate::error::{DownloadError, RemoteError};
use crate::remote::{AgentIdentity, BuildRepositoryRemote, PropertyPublisher};
use crate::retry::{RetryPolicies, attempt_failed_message};
use crate::updater::MaterialUpdaterRegistry;
use futures::future::{BoxFuture, FutureExt};
use gantry_core::ids::JobIdentifier;
use gantry_core::instance::{JobResult, JobState};
use gantry_core::label::TOKEN;
use gantry_core::material::MaterialRevision;
use gantry_core::plan::{EnvironmentVariable, EnvironmentVariables, SECURE_MASK};
use parking_lot::Mutex;
use regex::{Captures, Regex};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_SECRET_SUBSTITUTION: &str = "******";
const CONSOLE_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Building,
    Completing,
    Completed(JobResult),
    Cancelled,
}

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionServices {
    pub remote: Arc<dyn BuildRepositoryRemote>,
    pub console: Arc<dyn ConsoleSink>,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub properties: Arc<dyn PropertyPublisher>,
    pub updaters: MaterialUpdaterRegistry,
    pub retry: RetryPolicies,
}

struct Secret {
    value: String,
    substitution: String,
}

pub struct BuildSession {
    job: JobIdentifier,
    agent: AgentIdentity,
    working_dir: PathBuf,
    services: SessionServices,
    downloader: ArtifactDownloader,
    cancel: CancellationToken,
    env: Mutex<EnvironmentVariables>,
    secrets: Mutex<Vec<Secret>>,
    captures: Mutex<Vec<Vec<String>>>,
    /// Depth of on-cancel handlers currently running.
    cancel_handlers: AtomicUsize,
    result: Mutex<JobResult>,
    state: Mutex<SessionState>,
}

impl BuildSession {
    pub fn new(
        job: JobIdentifier,
        agent: AgentIdentity,
        working_dir: PathBuf,
        base_url: Url,
        services: SessionServices,
        cancel: CancellationToken,
    ) -> Self {
        let downloader = ArtifactDownloader::new(services.fetcher.clone(), base_url);
        Self {
            job,
            agent,
            working_dir,
            services,
            downloader,
            cancel,
            env: Mutex::new(EnvironmentVariables::new()),
            secrets: Mutex::new(Vec::new()),
            captures: Mutex::new(Vec::new()),
            cancel_handlers: AtomicUsize::new(0),
            result: Mutex::new(JobResult::Passed),
            state: Mutex::new(SessionState::Idle),
        }
    }

    pub fn job(&self) -> &JobIdentifier {
        &self.job
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn environment(&self) -> EnvironmentVariables {
        self.env.lock().clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `command` to the end and report the job completed.
    pub async fn build(&self, command: &BuildCommand) -> Result<JobResult, RemoteError> {
        info!(job = %self.job, "Build started");
        self.execute(command, false, false).await;

        let result = if self.cancel.is_cancelled() {
            self.set_state(SessionState::Cancelled);
            JobResult::Cancelled
        } else {
            let result = self.current_result();
            self.set_state(SessionState::Completed(result));
            result
        };

        self.flush_remaining_console().await;
        self.services
            .remote
            .report_completed(&self.agent, &self.job, result)
            .await?;

        info!(job = %self.job, result = %result, "Build finished");
        Ok(result)
    }

    fn execute<'a>(&'a self, command: &'a BuildCommand, in_handler: bool, forced: bool) -> BoxFuture<'a, ()> {
        async move {
            if !forced {
                if self.cancel.is_cancelled() && !in_handler {
                    debug!(job = %self.job, command = %command.name, "Skipped, build cancelled");
                    return;
                }
                if !command.run_if.matches(self.current_result()) {
                    debug!(job = %self.job, command = %command.name, run_if = ?command.run_if, "Skipped by run-if");
                    return;
                }
            }

            if let Some(test) = &command.test
                && !self.evaluate_guard(test, in_handler).await
            {
                debug!(job = %self.job, command = %command.name, "Skipped by test guard");
                return;
            }

            let cancelled_before = self.cancel.is_cancelled();
            let passed = self.dispatch(command, in_handler).await;
            if !passed && !self.cancel.is_cancelled() {
                warn!(job = %self.job, command = %command.name, "Command failed");
                self.set_result(JobResult::Failed);
            }

            if !cancelled_before
                && self.cancel.is_cancelled()
                && let Some(handler) = &command.on_cancel
            {
                info!(job = %self.job, command = %command.name, "Running on-cancel handler");
                self.cancel_handlers.fetch_add(1, Ordering::SeqCst);
                self.execute(handler, true, true).await;
                self.cancel_handlers.fetch_sub(1, Ordering::SeqCst);
            }

            if self.services.console.should_flush() {
                self.flush_console().await;
            }
        }
        .boxed()
    }

    async fn dispatch(&self, command: &BuildCommand, in_handler: bool) -> bool {
        match command.name {
            CommandKind::Compose => {
                for child in &command.sub_commands {
                    self.execute(child, in_handler, false).await;
                }
                true
            }
            CommandKind::Echo => {
                let tag = match command.arg_str("tag") {
                    Some("task") => ConsoleTag::Task,
                    _ => ConsoleTag::Notice,
                };
                for line in command.arg_list("lines") {
                    let line = self.substitute(line);
                    self.console(tag, line);
                }
                true
            }
            CommandKind::Exec => self.exec(command, in_handler).await,
            CommandKind::Export => self.export(command),
            CommandKind::Secret => {
                let value = command.arg_str("value").unwrap_or_default().to_string();
                let substitution = command
                    .arg_str("substitution")
                    .unwrap_or(DEFAULT_SECRET_SUBSTITUTION)
                    .to_string();
                self.register_secret(value, substitution);
                true
            }
            CommandKind::Fail => {
                let message = command.arg_str("message").unwrap_or_default();
                self.console(ConsoleTag::Err, message);
                false
            }
            CommandKind::Mkdirs => {
                let path = self.resolve(command.arg_str("path").unwrap_or_default());
                match tokio::fs::create_dir_all(&path).await {
                    Ok(()) => true,
                    Err(e) => {
                        self.notice(format!("[gantry] Could not create directory {}: {}", path.display(), e));
                        false
                    }
                }
            }
            CommandKind::Cleandir => self.cleandir(command).await,
            CommandKind::Test => self.test(command, in_handler).await,
            CommandKind::ReportCurrentStatus => self.report_current_status(command).await,
            CommandKind::ReportCompleting => self.report_completing().await,
            CommandKind::DownloadFile => self.download(command, ArtifactHandler::File).await,
            CommandKind::DownloadDir => self.download(command, ArtifactHandler::Dir).await,
            CommandKind::GenerateProperty => self.generate_property(command).await,
            CommandKind::UpdateMaterial => self.update_material(command).await,
        }
    }

    /// Run a guard in capture mode; neither its output nor its failure count.
    async fn evaluate_guard(&self, test: &BuildCommand, in_handler: bool) -> bool {
        let before = self.current_result();
        self.captures.lock().push(Vec::new());
        let passed = self.dispatch(test, in_handler).await;
        self.captures.lock().pop();
        self.set_result(before);
        passed
    }

    async fn exec(&self, command: &BuildCommand, in_handler: bool) -> bool {
        let Some(program) = command.arg_str("command") else {
            self.notice("[gantry] No command given to exec");
            return false;
        };
        let args = command.arg_list("args");

        let dir = match &command.working_directory {
            Some(dir) => self.resolve(dir),
            None => self.working_dir.clone(),
        };
        if !dir.is_dir() {
            self.notice(format!("Working directory \"{}\" is not a directory!", dir.display()));
            return false;
        }

        let env: Vec<(String, String)> = self
            .env
            .lock()
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect();

        let spawned = Command::new(program)
            .args(args)
            .current_dir(&dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.notice(format!(
                    "[gantry] Error happened while attempting to execute '{} {}'. \
                     Please make sure [{}] can be executed on this agent.",
                    program,
                    args.join(" "),
                    program
                ));
                self.notice(format!("[gantry] [debug information] {}", e));
                return false;
            }
        };

        let (tx, mut rx) = mpsc::channel::<TaggedLine>(256);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, ConsoleTag::Out, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, ConsoleTag::Err, tx.clone())));
        }
        drop(tx);

        let mut flush_tick = tokio::time::interval(CONSOLE_FLUSH_INTERVAL);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let status = loop {
            tokio::select! {
                Some(line) = rx.recv() => {
                    self.emit(line);
                    if self.services.console.should_flush() {
                        self.flush_console().await;
                    }
                }
                _ = flush_tick.tick() => self.flush_console().await,
                status = child.wait() => break Some(status),
                _ = self.cancel.cancelled(), if !in_handler => {
                    info!(job = %self.job, program, "Killing process on cancellation");
                    if let Err(e) = child.kill().await {
                        warn!(job = %self.job, error = %e, "Failed to kill process");
                    }
                    break None;
                }
            }
        };

        if status.is_some() {
            while let Some(line) = rx.recv().await {
                self.emit(line);
            }
            for reader in readers {
                let _ = reader.await;
            }
        } else {
            // Killed processes may leave children holding the pipes open.
            for reader in &readers {
                reader.abort();
            }
            while let Ok(line) = rx.try_recv() {
                self.emit(line);
            }
        }

        match status {
            Some(Ok(status)) => {
                debug!(job = %self.job, program, code = ?status.code(), "Process exited");
                status.success()
            }
            Some(Err(e)) => {
                self.notice(format!("[gantry] Failed to wait for '{}': {}", program, e));
                false
            }
            None => false,
        }
    }

    fn export(&self, command: &BuildCommand) -> bool {
        let Some(name) = command.arg_str("name") else {
            self.notice("[gantry] No variable name given to export");
            return false;
        };
        let secure = command.arg_bool("secure");

        let Some(value) = command.arg_str("value") else {
            let current = self
                .env
                .lock()
                .get(name)
                .map(|v| v.display_value().to_string())
                .or_else(|| std::env::var(name).ok());
            match current {
                Some(value) => self.notice(format!(
                    "[gantry] setting environment variable '{}' to value '{}'",
                    name, value
                )),
                None => self.notice(format!("[gantry] environment variable '{}' is not set", name)),
            }
            return true;
        };

        let existing = self.env.lock().contains(name) || std::env::var_os(name).is_some();
        let display = if secure { SECURE_MASK } else { value };
        if existing {
            self.notice(format!(
                "[gantry] overriding environment variable '{}' with value '{}'",
                name, display
            ));
        } else {
            self.notice(format!(
                "[gantry] setting environment variable '{}' to value '{}'",
                name, display
            ));
        }

        let variable = if secure {
            self.register_secret(value.to_string(), SECURE_MASK.to_string());
            EnvironmentVariable::secure(name, value)
        } else {
            EnvironmentVariable::plain(name, value)
        };
        self.env.lock().add(variable);
        true
    }

    async fn cleandir(&self, command: &BuildCommand) -> bool {
        let path = self.resolve(command.arg_str("path").unwrap_or_default());
        let allowed: Vec<String> = command
            .arg_list("allowed")
            .iter()
            .map(|p| p.replace('\\', "/").trim_matches('/').to_string())
            .collect();

        let target = path.clone();
        let cleaned = tokio::task::spawn_blocking(move || clean_dir(&target, "", &allowed))
            .await
            .map_err(std::io::Error::other)
            .and_then(|r| r);
        match cleaned {
            Ok(()) => true,
            Err(e) => {
                self.notice(format!("[gantry] Could not clean directory {}: {}", path.display(), e));
                false
            }
        }
    }

    async fn test(&self, command: &BuildCommand, in_handler: bool) -> bool {
        let flag = command.arg_str("flag").unwrap_or_default();
        let left = command.arg_str("left").unwrap_or_default();

        match flag {
            "-d" => self.resolve(left).is_dir(),
            "-nd" => !self.resolve(left).is_dir(),
            "-f" => self.resolve(left).is_file(),
            "-nf" => !self.resolve(left).is_file(),
            "-eq" | "-neq" => {
                let Some(sub) = command.sub_commands.first() else {
                    self.notice(format!("[gantry] test {} needs a command to compare against", flag));
                    return false;
                };
                let output = self.capture_output(sub, in_handler).await;
                let equal = output.trim() == left.trim();
                if flag == "-eq" { equal } else { !equal }
            }
            other => {
                self.notice(format!("[gantry] Unknown test flag '{}'", other));
                false
            }
        }
    }

    async fn capture_output(&self, command: &BuildCommand, in_handler: bool) -> String {
        let before = self.current_result();
        self.captures.lock().push(Vec::new());
        self.execute(command, in_handler, true).await;
        let lines = self.captures.lock().pop().unwrap_or_default();
        self.set_result(before);
        lines.join("\n")
    }

    async fn report_current_status(&self, command: &BuildCommand) -> bool {
        let Some(state) = command.arg_str("status").and_then(parse_state) else {
            self.notice("[gantry] Unknown job status to report");
            return false;
        };
        match state {
            JobState::Preparing => self.set_state(SessionState::Preparing),
            JobState::Building => self.set_state(SessionState::Building),
            JobState::Completing => self.set_state(SessionState::Completing),
            _ => {}
        }

        match self
            .services
            .remote
            .report_current_status(&self.agent, &self.job, state)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(job = %self.job, state = %state, error = %e, "Failed to report status");
                self.notice(format!("[gantry] Failed to report job status {}: {}", state, e));
                false
            }
        }
    }

    async fn report_completing(&self) -> bool {
        self.set_state(SessionState::Completing);
        let result = if self.cancel.is_cancelled() {
            JobResult::Cancelled
        } else {
            self.current_result()
        };

        match self
            .services
            .remote
            .report_completing(&self.agent, &self.job, result)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(job = %self.job, error = %e, "Failed to report completing");
                self.notice(format!("[gantry] Failed to report job completing: {}", e));
                false
            }
        }
    }

    async fn download(&self, command: &BuildCommand, handler: ArtifactHandler) -> bool {
        let url = command.arg_str("url").unwrap_or_default().to_string();
        let dest = self.resolve(command.arg_str("dest").unwrap_or_default());
        let request = ArtifactDownload {
            url: url.clone(),
            dest: dest.clone(),
            handler,
            checksum_url: command.arg_str("checksum_url").map(str::to_string),
            checksum_path: command.arg_str("checksum_path").map(str::to_string),
        };

        match self.downloader.download(&request).await {
            Ok(outcome) => {
                if outcome.checksum_file_missing {
                    self.notice(
                        "[WARN] The md5checksum property file was not found on the server. \
                         Hence, Gantry can not verify the integrity of the artifacts.",
                    );
                }
                let how = match outcome.integrity {
                    Integrity::Verified => "after verifying",
                    Integrity::Unverified => "without verifying",
                };
                self.notice(format!(
                    "Saved artifact to [{}] {} the integrity of its contents.",
                    dest.display(),
                    how
                ));
                true
            }
            Err(DownloadError::Integrity { path }) => {
                self.notice(format!(
                    "[gantry] Verification of the integrity of the artifact [{}] failed. \
                     The artifact file on the server may have changed since its original upload.",
                    path
                ));
                false
            }
            Err(e @ (DownloadError::Io(_) | DownloadError::Archive(_))) => {
                warn!(job = %self.job, dest = %dest.display(), error = %e, "Failed to save artifact");
                self.notice(format!("[gantry] Failed to save artifact to [{}]: {}", dest.display(), e));
                false
            }
            Err(e) => {
                let shown = self
                    .downloader
                    .resolve(&url)
                    .map(|u| u.to_string())
                    .unwrap_or(url);
                self.notice(format!("[gantry] Could not fetch artifact {}. Error was: {}", shown, e));
                false
            }
        }
    }

    async fn generate_property(&self, command: &BuildCommand) -> bool {
        let name = command.arg_str("name").unwrap_or_default();
        let src = command.arg_str("src").unwrap_or_default();

        let value = match self.read_property(src, command.arg_str("pattern")).await {
            Ok(value) => value,
            Err((message, cause)) => {
                let message = format!("Failed to create property {}. {}", name, message);
                self.notice(format!("[gantry] {}", message));
                if let Err(e) = self
                    .services
                    .properties
                    .report_error_message(&self.job, &message, &cause)
                    .await
                {
                    warn!(job = %self.job, error = %e, "Failed to report property error");
                }
                return true;
            }
        };

        match self
            .services
            .properties
            .set_property(&self.job, name, &value)
            .await
        {
            Ok(()) => self.notice(format!("[gantry] Property {} = {} created.", name, value)),
            Err(e) => {
                warn!(job = %self.job, property = name, error = %e, "Failed to publish property");
                self.notice(format!("[gantry] Failed to publish property {}: {}", name, e));
            }
        }
        true
    }

    async fn read_property(&self, src: &str, pattern: Option<&str>) -> Result<String, (String, String)> {
        let contents = tokio::fs::read_to_string(self.resolve(src))
            .await
            .map_err(|e| (format!("File {} was not found.", src), e.to_string()))?;

        let Some(pattern) = pattern else {
            return Ok(contents.trim().to_string());
        };
        let regex = Regex::new(pattern)
            .map_err(|e| (format!("Illegal pattern {}.", pattern), e.to_string()))?;
        let captures = regex.captures(&contents).ok_or_else(|| {
            (
                format!("Nothing matched pattern {} in file {}.", pattern, src),
                String::new(),
            )
        })?;
        let matched = captures.get(1).or_else(|| captures.get(0));
        Ok(matched.map(|m| m.as_str().to_string()).unwrap_or_default())
    }

    async fn update_material(&self, command: &BuildCommand) -> bool {
        let revision: MaterialRevision = match serde_json::from_str(command.arg_str("material").unwrap_or_default()) {
            Ok(revision) => revision,
            Err(e) => {
                self.notice(format!("[gantry] Invalid material to update: {}", e));
                return false;
            }
        };
        let material_type = revision.material.material_type();
        let material = revision.material.name().to_string();

        let updater = match self.services.updaters.get(material_type) {
            Ok(updater) => updater,
            Err(e) => {
                self.notice(format!("[gantry] {}", e));
                return false;
            }
        };
        let dest = self.resolve(command.arg_str("dest").unwrap_or_default());

        self.notice(format!(
            "[gantry] Start updating {} at revision {} to {}",
            material,
            revision.revision.as_revision_string(),
            dest.display()
        ));

        let policy = self.services.retry.policy_for(material_type);
        let outcome = policy
            .run(
                &self.cancel,
                |_| updater.update(&revision, &dest),
                |attempt, attempts, e| {
                    self.notice(attempt_failed_message(&material, attempt, attempts, e));
                },
            )
            .await;

        match outcome {
            Ok(()) => {
                self.notice(format!("[gantry] Done updating {}", material));
                true
            }
            Err(e) => {
                self.notice(e.to_string());
                false
            }
        }
    }

    async fn flush_console(&self) {
        if let Err(e) = self.services.console.flush().await {
            debug!(job = %self.job, error = %e, "Console flush failed, lines kept for the next flush");
        }
    }

    /// Last console upload of the build; nothing flushes after it, so it is retried.
    async fn flush_remaining_console(&self) {
        let policy = self.services.retry.default_policy();
        let flushed = policy
            .run(
                &CancellationToken::new(),
                |_| self.services.console.flush(),
                |attempt, attempts, e| {
                    debug!(job = %self.job, attempt, attempts, error = %e, "Final console flush failed");
                },
            )
            .await;
        if let Err(e) = flushed {
            warn!(job = %self.job, error = %e, "Giving up on uploading the remaining console output");
        }
    }

    fn current_result(&self) -> JobResult {
        *self.result.lock()
    }

    fn set_result(&self, result: JobResult) {
        *self.result.lock() = result;
    }

    fn set_state(&self, state: SessionState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            info!(job = %self.job, from = ?previous, to = ?state, "Session state changed");
        }
    }

    fn register_secret(&self, value: String, substitution: String) {
        if value.is_empty() {
            return;
        }
        self.secrets.lock().push(Secret { value, substitution });
    }

    /// `${NAME}` references to session variables; unknown names are left as is.
    fn substitute(&self, text: &str) -> String {
        let env = self.env.lock();
        TOKEN
            .replace_all(text, |caps: &Captures<'_>| {
                env.value_of(&caps[1]).unwrap_or(&caps[0]).to_string()
            })
            .into_owned()
    }

    fn mask(&self, line: &str) -> String {
        self.secrets
            .lock()
            .iter()
            .fold(line.to_string(), |line, secret| line.replace(&secret.value, &secret.substitution))
    }

    fn notice(&self, line: impl Into<String>) {
        self.console(ConsoleTag::Notice, line);
    }

    fn console(&self, tag: ConsoleTag, line: impl Into<String>) {
        self.emit(TaggedLine::new(tag, line));
    }

    fn emit(&self, line: TaggedLine) {
        let tag = if self.cancel_handlers.load(Ordering::SeqCst) > 0 {
            ConsoleTag::Cancel
        } else {
            line.tag
        };
        let masked = TaggedLine::new(tag, self.mask(&line.line));
        if let Some(capture) = self.captures.lock().last_mut() {
            capture.push(masked.line);
            return;
        }
        self.services.console.write(masked);
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }
}

async fn forward_lines<R>(reader: R, tag: ConsoleTag, tx: mpsc::Sender<TaggedLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(TaggedLine::new(tag, line)).await.is_err() {
            break;
        }
    }
}

/// Remove everything under `dir` except the `allowed` relative paths and
/// the directories leading to them.
fn clean_dir(dir: &Path, prefix: &str, allowed: &[String]) -> std::io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };

        if allowed.iter().any(|a| a == &relative) {
            continue;
        }
        let path = entry.path();
        let leads_to_allowed = allowed
            .iter()
            .any(|a| a.starts_with(&format!("{}/", relative)));
        if path.is_dir() {
            if leads_to_allowed {
                clean_dir(&path, &relative, allowed)?;
            } else {
                std::fs::remove_dir_all(&path)?;
            }
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::InMemoryConsole;
    use crate::error::MaterialUpdateError;
    use crate::retry::RetryPolicy;
    use crate::updater::MaterialUpdater;
    use crate::remote::AgentInstruction;
    use async_trait::async_trait;
    use gantry_core::config::RunIfConfig;
    use gantry_core::ids::{AgentId, StageCounter};
    use gantry_core::material::{MaterialConfig, Revision};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingRemote {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BuildRepositoryRemote for RecordingRemote {
        async fn report_current_status(&self, _: &AgentIdentity, _: &JobIdentifier, state: JobState) -> Result<(), RemoteError> {
            self.calls.lock().push(format!("status:{}", state));
            Ok(())
        }

        async fn report_completing(&self, _: &AgentIdentity, _: &JobIdentifier, result: JobResult) -> Result<(), RemoteError> {
            self.calls.lock().push(format!("completing:{}", result));
            Ok(())
        }

        async fn report_completed(&self, _: &AgentIdentity, _: &JobIdentifier, result: JobResult) -> Result<(), RemoteError> {
            self.calls.lock().push(format!("completed:{}", result));
            Ok(())
        }

        async fn ping(&self, _: &AgentIdentity) -> Result<AgentInstruction, RemoteError> {
            Ok(AgentInstruction::default())
        }
    }

    #[derive(Default)]
    struct RecordingProperties {
        properties: Mutex<Vec<(String, String)>>,
        errors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PropertyPublisher for RecordingProperties {
        async fn set_property(&self, _: &JobIdentifier, name: &str, value: &str) -> Result<(), RemoteError> {
            self.properties.lock().push((name.to_string(), value.to_string()));
            Ok(())
        }

        async fn report_error_message(&self, _: &JobIdentifier, message: &str, _: &str) -> Result<(), RemoteError> {
            self.errors.lock().push(message.to_string());
            Ok(())
        }
    }

    struct NoFetch;

    #[async_trait]
    impl HttpFetcher for NoFetch {
        async fn fetch(&self, url: &Url) -> Result<Vec<u8>, DownloadError> {
            Err(DownloadError::Request {
                url: url.to_string(),
                message: "connection refused".into(),
            })
        }
    }

    struct ServeBytes(Vec<u8>);

    #[async_trait]
    impl HttpFetcher for ServeBytes {
        async fn fetch(&self, _: &Url) -> Result<Vec<u8>, DownloadError> {
            Ok(self.0.clone())
        }
    }

    struct FlakyUpdater {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl MaterialUpdater for FlakyUpdater {
        async fn update(&self, _: &MaterialRevision, _: &Path) -> Result<(), MaterialUpdateError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(MaterialUpdateError::Failed(format!("fatal: unable to access repository (try {})", call)))
            } else {
                Ok(())
            }
        }
    }

    struct Harness {
        session: BuildSession,
        console: Arc<InMemoryConsole>,
        remote: Arc<RecordingRemote>,
        properties: Arc<RecordingProperties>,
        _dir: tempfile::TempDir,
    }

    fn harness(updaters: MaterialUpdaterRegistry) -> Harness {
        harness_with_fetcher(updaters, Arc::new(NoFetch))
    }

    fn harness_with_fetcher(updaters: MaterialUpdaterRegistry, fetcher: Arc<dyn HttpFetcher>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let console = Arc::new(InMemoryConsole::new());
        let remote = Arc::new(RecordingRemote::default());
        let properties = Arc::new(RecordingProperties::default());
        let services = SessionServices {
            remote: remote.clone(),
            console: console.clone(),
            fetcher,
            properties: properties.clone(),
            updaters,
            retry: RetryPolicies::new(RetryPolicy::new(3, Duration::from_millis(1))),
        };
        let session = BuildSession::new(
            JobIdentifier::of("cruise", 1, "1", "dev", StageCounter::Run(1), "unit"),
            AgentIdentity::new(AgentId::new(), "builder-1"),
            dir.path().to_path_buf(),
            Url::parse("http://localhost:8153/gantry/").unwrap(),
            services,
            CancellationToken::new(),
        );
        Harness {
            session,
            console,
            remote,
            properties,
            _dir: dir,
        }
    }

    fn sh(script: &str) -> BuildCommand {
        BuildCommand::exec("sh", ["-c", script])
    }

    #[tokio::test]
    async fn test_failure_skips_passed_siblings() {
        let h = harness(MaterialUpdaterRegistry::new());
        let command = BuildCommand::compose(vec![
            BuildCommand::echo(["one"]),
            BuildCommand::fail("boom"),
            BuildCommand::echo(["two"]),
            BuildCommand::echo(["on failure"]).with_run_if(RunIfConfig::Failed),
            BuildCommand::echo(["always"]).with_run_if(RunIfConfig::Any),
        ]);

        let result = h.session.build(&command).await.unwrap();

        assert_eq!(result, JobResult::Failed);
        assert_eq!(h.console.output(), "one\nboom\non failure\nalways");
        assert_eq!(h.session.state(), SessionState::Completed(JobResult::Failed));
        assert_eq!(*h.remote.calls.lock(), vec!["completed:Failed".to_string()]);
    }

    #[tokio::test]
    async fn test_exec_streams_output_and_env() {
        let h = harness(MaterialUpdaterRegistry::new());
        let command = BuildCommand::compose(vec![
            BuildCommand::export("GREETING", Some("hello".into()), false),
            sh("echo $GREETING; echo oops >&2"),
        ]);

        let result = h.session.build(&command).await.unwrap();

        assert_eq!(result, JobResult::Passed);
        let lines = h.console.lines();
        assert!(lines.contains(&TaggedLine::new(ConsoleTag::Out, "hello")));
        assert!(lines.contains(&TaggedLine::new(ConsoleTag::Err, "oops")));
    }

    #[tokio::test]
    async fn test_exec_failures() {
        let h = harness(MaterialUpdaterRegistry::new());
        let command = BuildCommand::compose(vec![
            sh("exit 3"),
            sh("true").with_working_directory("missing").with_run_if(RunIfConfig::Any),
        ]);

        let result = h.session.build(&command).await.unwrap();

        assert_eq!(result, JobResult::Failed);
        assert!(h.console.contains("missing\" is not a directory!"));
    }

    #[tokio::test]
    async fn test_export_messages_and_masking() {
        let h = harness(MaterialUpdaterRegistry::new());
        let command = BuildCommand::compose(vec![
            BuildCommand::export("GANTRY_TEST_VAR", Some("first".into()), false),
            BuildCommand::export("GANTRY_TEST_VAR", Some("second".into()), false),
            BuildCommand::export("GANTRY_TEST_TOKEN", Some("s3cr3t".into()), true),
            BuildCommand::echo(["token is ${GANTRY_TEST_TOKEN}, var is ${GANTRY_TEST_VAR}, ${UNKNOWN}"]),
        ]);

        h.session.build(&command).await.unwrap();

        let output = h.console.output();
        assert!(output.contains("[gantry] setting environment variable 'GANTRY_TEST_VAR' to value 'first'"));
        assert!(output.contains("[gantry] overriding environment variable 'GANTRY_TEST_VAR' with value 'second'"));
        assert!(output.contains("[gantry] setting environment variable 'GANTRY_TEST_TOKEN' to value '********'"));
        assert!(output.contains("token is ********, var is second, ${UNKNOWN}"));
        assert!(!output.contains("s3cr3t"));
        assert_eq!(h.session.environment().value_of("GANTRY_TEST_TOKEN"), Some("s3cr3t"));
    }

    #[tokio::test]
    async fn test_secret_substitution() {
        let h = harness(MaterialUpdaterRegistry::new());
        let command = BuildCommand::compose(vec![
            BuildCommand::secret("hunter2", None),
            BuildCommand::secret("swordfish", Some("[fish]".into())),
            sh("echo hunter2 swordfish"),
        ]);

        h.session.build(&command).await.unwrap();
        assert!(h.console.contains("****** [fish]"));
    }

    #[tokio::test]
    async fn test_on_cancel_runs_only_when_cancelled() {
        let h = harness(MaterialUpdaterRegistry::new());
        let command = BuildCommand::compose(vec![sh("true"), BuildCommand::echo(["after"])])
            .with_on_cancel(BuildCommand::echo(["cleanup"]));

        let result = h.session.build(&command).await.unwrap();
        assert_eq!(result, JobResult::Passed);
        assert!(!h.console.contains("cleanup"));

        let h = harness(MaterialUpdaterRegistry::new());
        let command = BuildCommand::compose(vec![sh("sleep 30"), BuildCommand::echo(["after"])])
            .with_on_cancel(BuildCommand::echo(["cleanup"]));
        let token = h.session.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(10), h.session.build(&command))
            .await
            .expect("cancelled build should finish")
            .unwrap();

        assert_eq!(result, JobResult::Cancelled);
        assert_eq!(h.console.count_containing("cleanup"), 1);
        assert!(!h.console.contains("after"));
        assert_eq!(h.session.state(), SessionState::Cancelled);

        let cleanup = h.console.lines().into_iter().find(|l| l.line == "cleanup").unwrap();
        assert_eq!(cleanup.tag, ConsoleTag::Cancel);
    }

    #[tokio::test]
    async fn test_task_banner_is_tagged() {
        let h = harness(MaterialUpdaterRegistry::new());
        let command = BuildCommand::compose(vec![BuildCommand::task_banner("make test"), sh("echo done")]);

        h.session.build(&command).await.unwrap();

        let tags: Vec<(ConsoleTag, String)> = h.console.lines().into_iter().map(|l| (l.tag, l.line)).collect();
        assert_eq!(
            tags,
            vec![
                (ConsoleTag::Task, "[gantry] Task: make test".to_string()),
                (ConsoleTag::Out, "done".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_guards_and_output_tests() {
        let h = harness(MaterialUpdaterRegistry::new());
        let command = BuildCommand::compose(vec![
            BuildCommand::mkdirs("out/reports"),
            BuildCommand::echo(["has reports"]).with_test(BuildCommand::test("-d", "out/reports")),
            BuildCommand::echo(["no file"]).with_test(BuildCommand::test("-f", "out/missing.txt")),
            BuildCommand::echo(["matched"]).with_test(BuildCommand::test_output("-eq", "hi", sh("echo hi"))),
            BuildCommand::echo(["guard failures do not count"]).with_test(sh("exit 1")),
        ]);

        let result = h.session.build(&command).await.unwrap();

        assert_eq!(result, JobResult::Passed);
        assert_eq!(h.console.output(), "has reports\nmatched");
    }

    #[tokio::test]
    async fn test_cleandir_keeps_allowed_paths() {
        let h = harness(MaterialUpdaterRegistry::new());
        let root = h.session.working_dir.clone();
        std::fs::create_dir_all(root.join("ws/keep/deep")).unwrap();
        std::fs::create_dir_all(root.join("ws/drop")).unwrap();
        std::fs::write(root.join("ws/keep/deep/a.txt"), "a").unwrap();
        std::fs::write(root.join("ws/keep/b.txt"), "b").unwrap();
        std::fs::write(root.join("ws/c.txt"), "c").unwrap();

        let result = h
            .session
            .build(&BuildCommand::cleandir("ws", vec!["keep/deep".into()]))
            .await
            .unwrap();

        assert_eq!(result, JobResult::Passed);
        assert!(root.join("ws/keep/deep/a.txt").exists());
        assert!(!root.join("ws/keep/b.txt").exists());
        assert!(!root.join("ws/drop").exists());
        assert!(!root.join("ws/c.txt").exists());
    }

    #[tokio::test]
    async fn test_status_reports() {
        let h = harness(MaterialUpdaterRegistry::new());
        let command = BuildCommand::compose(vec![
            BuildCommand::report_current_status(JobState::Building),
            BuildCommand::report_completing().with_run_if(RunIfConfig::Any),
        ]);

        h.session.build(&command).await.unwrap();
        assert_eq!(
            *h.remote.calls.lock(),
            vec!["status:Building".to_string(), "completing:Passed".to_string(), "completed:Passed".to_string()]
        );
    }

    #[tokio::test]
    async fn test_generate_property() {
        let h = harness(MaterialUpdaterRegistry::new());
        std::fs::write(h.session.working_dir.join("coverage.txt"), "Total coverage: 87%\n").unwrap();
        let command = BuildCommand::compose(vec![
            BuildCommand::generate_property("coverage", "coverage.txt", Some(r"coverage: (\d+)%".into())),
            BuildCommand::generate_property("missing", "nope.txt", None),
        ]);

        let result = h.session.build(&command).await.unwrap();

        assert_eq!(result, JobResult::Passed);
        assert_eq!(*h.properties.properties.lock(), vec![("coverage".to_string(), "87".to_string())]);
        assert_eq!(
            *h.properties.errors.lock(),
            vec!["Failed to create property missing. File nope.txt was not found.".to_string()]
        );
    }

    #[tokio::test]
    async fn test_download_failure_is_a_failed_command() {
        let h = harness(MaterialUpdaterRegistry::new());
        let command = BuildCommand::compose(vec![
            BuildCommand::download_file(crate::command::Download {
                url: "files/up/1/dist/1/unit/app.jar".into(),
                dest: "pipelines/cruise/app.jar".into(),
                checksum_url: None,
                checksum_path: None,
            }),
            BuildCommand::echo(["still here"]).with_run_if(RunIfConfig::Any),
        ]);

        let result = h.session.build(&command).await.unwrap();

        assert_eq!(result, JobResult::Failed);
        assert!(h.console.contains(
            "[gantry] Could not fetch artifact http://localhost:8153/gantry/files/up/1/dist/1/unit/app.jar. Error was:"
        ));
        assert!(h.console.contains("still here"));
    }

    #[tokio::test]
    async fn test_unwritable_download_destination_is_a_failed_command() {
        let h = harness_with_fetcher(MaterialUpdaterRegistry::new(), Arc::new(ServeBytes(b"jar".to_vec())));
        std::fs::write(h._dir.path().join("blocker"), b"not a directory").unwrap();
        let command = BuildCommand::compose(vec![
            BuildCommand::download_file(crate::command::Download {
                url: "files/up/1/dist/1/unit/app.jar".into(),
                dest: "blocker/app.jar".into(),
                checksum_url: None,
                checksum_path: None,
            }),
            BuildCommand::echo(["still here"]).with_run_if(RunIfConfig::Any),
        ]);

        let result = h.session.build(&command).await.unwrap();

        assert_eq!(result, JobResult::Failed);
        assert!(h.console.contains("[gantry] Failed to save artifact to ["));
        assert!(!h.console.contains("Could not fetch artifact"));
        assert!(h.console.contains("still here"));
        assert_eq!(h.remote.calls.lock().last().map(String::as_str), Some("completed:Failed"));
    }

    fn git_revision() -> String {
        let revision = MaterialRevision::new(MaterialConfig::git("https://example.com/repo.git"), Revision::scm("abc123"));
        serde_json::to_string(&revision).unwrap()
    }

    #[tokio::test]
    async fn test_update_material_retries_then_passes() {
        let updater = Arc::new(FlakyUpdater {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let h = harness(MaterialUpdaterRegistry::new().with("git", updater.clone()));

        let result = h
            .session
            .build(&BuildCommand::update_material(git_revision(), "pipelines/cruise"))
            .await
            .unwrap();

        assert_eq!(result, JobResult::Passed);
        assert_eq!(updater.calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.console.count_containing("[gantry] Material update of"), 2);
    }

    #[tokio::test]
    async fn test_update_material_gives_up_with_final_cause() {
        let updater = Arc::new(FlakyUpdater {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let h = harness(MaterialUpdaterRegistry::new().with("git", updater));

        let result = h
            .session
            .build(&BuildCommand::update_material(git_revision(), "pipelines/cruise"))
            .await
            .unwrap();

        assert_eq!(result, JobResult::Failed);
        assert!(h.console.output().lines().any(|l| l == "fatal: unable to access repository (try 3)"));
    }
}
