//! dbt CLI client
//!
//! Runs dbt as a subprocess with `--log-format json` and parses its
//! line-delimited JSON log events as they are written.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;
use serde_json::Value;

use assetforge_core::DbtConfig;

use crate::multi_asset::DbtInvocation;

/// Structured dbt log event (`--log-format json`)
#[derive(Debug, Clone, PartialEq)]
pub struct DbtCliEvent {
    /// Event name, e.g. `NodeFinished`
    pub name: String,
    /// Log level (`info`, `warn`, `error`, `debug`)
    pub level: String,
    /// Human readable message
    pub message: String,
    /// unique_id of the node the event is about, if any
    pub unique_id: Option<String>,
    /// Node status (`success`, `error`, `skipped`, ...), if any
    pub node_status: Option<String>,
    /// The full decoded event
    pub raw: Value,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(default)]
    info: RawInfo,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize, Default)]
struct RawInfo {
    #[serde(default)]
    name: String,
    #[serde(default)]
    level: String,
    #[serde(default)]
    msg: String,
}

/// One line of dbt output
#[derive(Debug, Clone, PartialEq)]
pub enum DbtCliLine {
    Event(DbtCliEvent),
    Raw(String),
}

/// Parse one stdout line; anything that is not a dbt JSON event is kept raw
pub fn parse_event_line(line: &str) -> DbtCliLine {
    let Ok(raw) = serde_json::from_str::<Value>(line) else {
        return DbtCliLine::Raw(line.to_string());
    };
    let Ok(event) = serde_json::from_value::<RawEvent>(raw.clone()) else {
        return DbtCliLine::Raw(line.to_string());
    };
    if event.info.name.is_empty() {
        return DbtCliLine::Raw(line.to_string());
    }

    let node_info = event.data.get("node_info");
    let node_field = |field: &str| {
        node_info
            .and_then(|info| info.get(field))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    DbtCliLine::Event(DbtCliEvent {
        name: event.info.name,
        level: event.info.level,
        message: event.info.msg,
        unique_id: node_field("unique_id"),
        node_status: node_field("node_status"),
        raw,
    })
}

/// Everything a dbt run wrote to stdout, plus its exit code
#[derive(Debug, Clone, Default)]
pub struct DbtCliOutput {
    pub lines: Vec<DbtCliLine>,
    pub exit_code: Option<i32>,
}

impl DbtCliOutput {
    /// Structured events only
    pub fn events(&self) -> impl Iterator<Item = &DbtCliEvent> {
        self.lines.iter().filter_map(|line| match line {
            DbtCliLine::Event(event) => Some(event),
            DbtCliLine::Raw(_) => None,
        })
    }

    /// unique_ids of nodes that finished successfully
    pub fn materialized_unique_ids(&self) -> Vec<String> {
        self.events()
            .filter(|event| event.name == "NodeFinished")
            .filter(|event| event.node_status.as_deref() == Some("success"))
            .filter_map(|event| event.unique_id.clone())
            .collect()
    }

    /// Message of the last error-level event
    pub fn last_error(&self) -> Option<String> {
        self.events()
            .filter(|event| event.level == "error")
            .last()
            .map(|event| event.message.clone())
    }
}

/// dbt CLI errors
#[derive(Debug, thiserror::Error)]
pub enum DbtCliError {
    #[error("Failed to start {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read dbt output: {0}")]
    Io(#[from] std::io::Error),

    #[error("dbt exited with status {exit_code:?}: {}", .last_error.as_deref().unwrap_or("no error event"))]
    Failed {
        exit_code: Option<i32>,
        last_error: Option<String>,
        output: DbtCliOutput,
    },
}

/// Client for the dbt command-line tool
#[derive(Debug, Clone)]
pub struct DbtCliClient {
    executable: String,
    executable_args: Vec<String>,
    project_dir: Option<PathBuf>,
    profiles_dir: Option<PathBuf>,
    target: Option<String>,
}

impl DbtCliClient {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            executable_args: Vec::new(),
            project_dir: None,
            profiles_dir: None,
            target: None,
        }
    }

    /// Build from the `[dbt]` config section; relative dirs resolve against `project_root`
    pub fn from_config(config: &DbtConfig, project_root: &Path) -> Self {
        let resolve = |dir: &PathBuf| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                project_root.join(dir)
            }
        };

        Self {
            executable: config.executable.clone(),
            executable_args: config.executable_args.clone(),
            project_dir: config.project_dir.as_ref().map(resolve),
            profiles_dir: config.profiles_dir.as_ref().map(resolve),
            target: config.target.clone(),
        }
    }

    /// Arguments placed between the executable and dbt's own flags
    /// (e.g. `uv` + `["run", "dbt"]`)
    pub fn with_executable_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.executable_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    pub fn with_profiles_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profiles_dir = Some(dir.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Full argv for an invocation, executable first
    pub fn command_line(&self, invocation: &DbtInvocation) -> Vec<String> {
        let mut argv = vec![self.executable.clone()];
        argv.extend(self.executable_args.iter().cloned());
        argv.push("--log-format".to_string());
        argv.push("json".to_string());

        let mut args = invocation.args().into_iter();
        if let Some(command) = args.next() {
            argv.push(command);
        }
        if let Some(dir) = &self.project_dir {
            argv.push("--project-dir".to_string());
            argv.push(dir.display().to_string());
        }
        if let Some(dir) = &self.profiles_dir {
            argv.push("--profiles-dir".to_string());
            argv.push(dir.display().to_string());
        }
        if let Some(target) = &self.target {
            argv.push("--target".to_string());
            argv.push(target.clone());
        }
        argv.extend(args);
        argv
    }

    /// Run dbt and collect its output
    pub fn stream_json(&self, invocation: &DbtInvocation) -> Result<DbtCliOutput, DbtCliError> {
        self.stream_json_with(invocation, |_| {})
    }

    /// Run dbt, calling `on_line` for every stdout line as it arrives
    pub fn stream_json_with<F>(
        &self,
        invocation: &DbtInvocation,
        mut on_line: F,
    ) -> Result<DbtCliOutput, DbtCliError>
    where
        F: FnMut(&DbtCliLine),
    {
        let argv = self.command_line(invocation);
        tracing::info!(command = %argv.join(" "), "Running dbt");

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| DbtCliError::Spawn {
                executable: self.executable.clone(),
                source,
            })?;

        let mut output = DbtCliOutput::default();

        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }

                let parsed = parse_event_line(&line);
                match &parsed {
                    DbtCliLine::Event(event) if event.level == "error" => {
                        tracing::error!(event = %event.name, "{}", event.message)
                    }
                    DbtCliLine::Event(event) => {
                        tracing::debug!(event = %event.name, "{}", event.message)
                    }
                    DbtCliLine::Raw(raw) => tracing::debug!("{}", raw),
                }
                on_line(&parsed);
                output.lines.push(parsed);
            }
        }

        let status = child.wait()?;
        output.exit_code = status.code();

        if !status.success() {
            return Err(DbtCliError::Failed {
                exit_code: output.exit_code,
                last_error: output.last_error(),
                output,
            });
        }

        Ok(output)
    }
}

impl Default for DbtCliClient {
    fn default() -> Self {
        Self::new("dbt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn invocation() -> DbtInvocation {
        DbtInvocation {
            command: "run".to_string(),
            select: vec!["jaffle_shop.marts.orders".to_string()],
            exclude: None,
        }
    }

    #[test]
    fn command_line_places_flags_after_command() {
        let client = DbtCliClient::new("dbt")
            .with_project_dir("/repo/dbt_project")
            .with_profiles_dir("/repo/dbt_project/config")
            .with_target("prod");

        assert_eq!(
            client.command_line(&invocation()),
            vec![
                "dbt",
                "--log-format",
                "json",
                "run",
                "--project-dir",
                "/repo/dbt_project",
                "--profiles-dir",
                "/repo/dbt_project/config",
                "--target",
                "prod",
                "--select",
                "jaffle_shop.marts.orders",
            ]
        );
    }

    #[test]
    fn executable_args_come_first() {
        let client = DbtCliClient::new("uv").with_executable_args(["run", "dbt"]);
        let argv = client.command_line(&invocation());
        assert_eq!(&argv[..5], &["uv", "run", "dbt", "--log-format", "json"]);
    }

    #[test]
    fn from_config_resolves_relative_dirs() {
        let mut config = DbtConfig::default();
        config.project_dir = Some(PathBuf::from("dbt_project"));
        config.target = Some("dev".to_string());

        let client = DbtCliClient::from_config(&config, Path::new("/repo"));
        let argv = client.command_line(&invocation());
        assert!(argv.contains(&"/repo/dbt_project".to_string()));
        assert!(argv.contains(&"dev".to_string()));
    }

    #[test]
    fn parses_node_finished_event() {
        let line = r#"{"info": {"name": "NodeFinished", "level": "info", "msg": "Finished running node model.jaffle_shop.orders"}, "data": {"node_info": {"unique_id": "model.jaffle_shop.orders", "node_status": "success"}}}"#;

        match parse_event_line(line) {
            DbtCliLine::Event(event) => {
                assert_eq!(event.name, "NodeFinished");
                assert_eq!(event.level, "info");
                assert_eq!(event.unique_id.as_deref(), Some("model.jaffle_shop.orders"));
                assert_eq!(event.node_status.as_deref(), Some("success"));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn non_json_lines_are_kept_raw() {
        assert_eq!(
            parse_event_line("Running with dbt=1.5.0"),
            DbtCliLine::Raw("Running with dbt=1.5.0".to_string())
        );
        assert_eq!(parse_event_line("[1, 2]"), DbtCliLine::Raw("[1, 2]".to_string()));
        assert_eq!(parse_event_line("{}"), DbtCliLine::Raw("{}".to_string()));
    }

    #[test]
    fn output_summaries() {
        let output = DbtCliOutput {
            lines: vec![
                parse_event_line(r#"{"info": {"name": "NodeFinished", "level": "info", "msg": "ok"}, "data": {"node_info": {"unique_id": "model.a.x", "node_status": "success"}}}"#),
                parse_event_line(r#"{"info": {"name": "NodeFinished", "level": "error", "msg": "boom"}, "data": {"node_info": {"unique_id": "model.a.y", "node_status": "error"}}}"#),
                parse_event_line("plain text"),
            ],
            exit_code: Some(1),
        };

        assert_eq!(output.events().count(), 2);
        assert_eq!(output.materialized_unique_ids(), vec!["model.a.x".to_string()]);
        assert_eq!(output.last_error().as_deref(), Some("boom"));
    }
}
