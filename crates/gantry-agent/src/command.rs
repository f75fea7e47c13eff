//! Build command tree executed by the agent.
//!
//! A [`BuildCommand`] is an immutable node: a kind, string keyed arguments,
//! ordered children and the conditions under which it runs.

use gantry_core::config::RunIfConfig;
use gantry_core::instance::JobState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Compose,
    Echo,
    Exec,
    Export,
    Secret,
    Fail,
    Mkdirs,
    Cleandir,
    Test,
    ReportCurrentStatus,
    ReportCompleting,
    DownloadFile,
    DownloadDir,
    GenerateProperty,
    UpdateMaterial,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandArg {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

impl From<&str> for CommandArg {
    fn from(s: &str) -> Self {
        CommandArg::Str(s.to_string())
    }
}

impl From<String> for CommandArg {
    fn from(s: String) -> Self {
        CommandArg::Str(s)
    }
}

impl From<bool> for CommandArg {
    fn from(b: bool) -> Self {
        CommandArg::Bool(b)
    }
}

impl From<i64> for CommandArg {
    fn from(n: i64) -> Self {
        CommandArg::Int(n)
    }
}

impl From<Vec<String>> for CommandArg {
    fn from(list: Vec<String>) -> Self {
        CommandArg::List(list)
    }
}

fn default_run_if() -> RunIfConfig {
    RunIfConfig::Passed
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCommand {
    pub name: CommandKind,
    #[serde(default)]
    pub args: BTreeMap<String, CommandArg>,
    #[serde(default)]
    pub sub_commands: Vec<BuildCommand>,
    #[serde(default = "default_run_if")]
    pub run_if: RunIfConfig,
    #[serde(default)]
    pub on_cancel: Option<Box<BuildCommand>>,
    /// Guard evaluated before the command; the command is skipped when it fails.
    #[serde(default)]
    pub test: Option<Box<BuildCommand>>,
    #[serde(default)]
    pub working_directory: Option<String>,
}

impl BuildCommand {
    pub fn new(name: CommandKind) -> Self {
        Self {
            name,
            args: BTreeMap::new(),
            sub_commands: Vec::new(),
            run_if: RunIfConfig::Passed,
            on_cancel: None,
            test: None,
            working_directory: None,
        }
    }

    pub fn with_arg(mut self, name: &str, value: impl Into<CommandArg>) -> Self {
        self.args.insert(name.to_string(), value.into());
        self
    }

    pub fn with_run_if(mut self, run_if: RunIfConfig) -> Self {
        self.run_if = run_if;
        self
    }

    pub fn with_on_cancel(mut self, on_cancel: BuildCommand) -> Self {
        self.on_cancel = Some(Box::new(on_cancel));
        self
    }

    pub fn with_test(mut self, test: BuildCommand) -> Self {
        self.test = Some(Box::new(test));
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn compose(commands: Vec<BuildCommand>) -> Self {
        let mut cmd = Self::new(CommandKind::Compose);
        cmd.sub_commands = commands;
        cmd
    }

    pub fn echo<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CommandKind::Echo).with_arg("lines", lines.into_iter().map(Into::into).collect::<Vec<String>>())
    }

    /// `[gantry] Task: ...` line, tagged as a task banner in the console.
    pub fn task_banner(description: &str) -> Self {
        Self::echo([format!("[gantry] Task: {}", description)]).with_arg("tag", "task")
    }

    pub fn exec<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CommandKind::Exec)
            .with_arg("command", command.into())
            .with_arg("args", args.into_iter().map(Into::into).collect::<Vec<String>>())
    }

    /// Export `name`; without a value the current value is only displayed.
    pub fn export(name: impl Into<String>, value: Option<String>, secure: bool) -> Self {
        let mut cmd = Self::new(CommandKind::Export)
            .with_arg("name", name.into())
            .with_arg("secure", secure);
        if let Some(value) = value {
            cmd = cmd.with_arg("value", value);
        }
        cmd
    }

    pub fn secret(value: impl Into<String>, substitution: Option<String>) -> Self {
        let mut cmd = Self::new(CommandKind::Secret).with_arg("value", value.into());
        if let Some(substitution) = substitution {
            cmd = cmd.with_arg("substitution", substitution);
        }
        cmd
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(CommandKind::Fail).with_arg("message", message.into())
    }

    pub fn mkdirs(path: impl Into<String>) -> Self {
        Self::new(CommandKind::Mkdirs).with_arg("path", path.into())
    }

    /// Empty `path`, keeping the listed relative paths.
    pub fn cleandir(path: impl Into<String>, allowed: Vec<String>) -> Self {
        Self::new(CommandKind::Cleandir)
            .with_arg("path", path.into())
            .with_arg("allowed", allowed)
    }

    /// File test: `flag` is one of `-d`, `-nd`, `-f`, `-nf`.
    pub fn test(flag: &str, path: impl Into<String>) -> Self {
        Self::new(CommandKind::Test)
            .with_arg("flag", flag)
            .with_arg("left", path.into())
    }

    /// Output test: `flag` is `-eq` or `-neq`, compared against the output of `command`.
    pub fn test_output(flag: &str, expected: impl Into<String>, command: BuildCommand) -> Self {
        let mut cmd = Self::new(CommandKind::Test)
            .with_arg("flag", flag)
            .with_arg("left", expected.into());
        cmd.sub_commands = vec![command];
        cmd
    }

    pub fn report_current_status(state: JobState) -> Self {
        Self::new(CommandKind::ReportCurrentStatus).with_arg("status", state_name(state))
    }

    pub fn report_completing() -> Self {
        Self::new(CommandKind::ReportCompleting)
    }

    pub fn download_file(download: Download) -> Self {
        download.into_command(CommandKind::DownloadFile)
    }

    pub fn download_dir(download: Download) -> Self {
        download.into_command(CommandKind::DownloadDir)
    }

    /// Publish a property read from `src`, optionally through a regex capture.
    pub fn generate_property(name: impl Into<String>, src: impl Into<String>, pattern: Option<String>) -> Self {
        let mut cmd = Self::new(CommandKind::GenerateProperty)
            .with_arg("name", name.into())
            .with_arg("src", src.into());
        if let Some(pattern) = pattern {
            cmd = cmd.with_arg("pattern", pattern);
        }
        cmd
    }

    /// `material` is the JSON encoded material revision to check out into `dest`.
    pub fn update_material(material: String, dest: impl Into<String>) -> Self {
        Self::new(CommandKind::UpdateMaterial)
            .with_arg("material", material)
            .with_arg("dest", dest.into())
    }

    pub fn arg_str(&self, name: &str) -> Option<&str> {
        match self.args.get(name) {
            Some(CommandArg::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn arg_bool(&self, name: &str) -> bool {
        matches!(self.args.get(name), Some(CommandArg::Bool(true)))
    }

    pub fn arg_int(&self, name: &str) -> Option<i64> {
        match self.args.get(name) {
            Some(CommandArg::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn arg_list(&self, name: &str) -> &[String] {
        match self.args.get(name) {
            Some(CommandArg::List(list)) => list,
            _ => &[],
        }
    }
}

/// Arguments of a download command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    /// Artifact URL, relative to the server base URL.
    pub url: String,
    /// Where to save, relative to the build working directory.
    pub dest: String,
    pub checksum_url: Option<String>,
    /// Key of the artifact in the checksum file.
    pub checksum_path: Option<String>,
}

impl Download {
    fn into_command(self, kind: CommandKind) -> BuildCommand {
        let mut cmd = BuildCommand::new(kind)
            .with_arg("url", self.url)
            .with_arg("dest", self.dest);
        if let Some(url) = self.checksum_url {
            cmd = cmd.with_arg("checksum_url", url);
        }
        if let Some(path) = self.checksum_path {
            cmd = cmd.with_arg("checksum_path", path);
        }
        cmd
    }
}

pub(crate) fn state_name(state: JobState) -> &'static str {
    match state {
        JobState::Scheduled => "scheduled",
        JobState::Assigned => "assigned",
        JobState::Preparing => "preparing",
        JobState::Building => "building",
        JobState::Completing => "completing",
        JobState::Completed => "completed",
    }
}

pub(crate) fn parse_state(name: &str) -> Option<JobState> {
    [
        JobState::Scheduled,
        JobState::Assigned,
        JobState::Preparing,
        JobState::Building,
        JobState::Completing,
        JobState::Completed,
    ]
    .into_iter()
    .find(|s| state_name(*s).eq_ignore_ascii_case(name))
}
