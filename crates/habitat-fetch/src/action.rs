//! The action fetcher: runs a user-declared command sequence instead of
//! acquiring files. Actions are never considered up to date.

use crate::{FetchError, Fetcher};
use async_trait::async_trait;
use habitat_types::{ActionSpec, CommandSpec, SyncOptions};
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub struct ActionFetcher {
    name: String,
    target_dir: PathBuf,
    spec: ActionSpec,
}

impl ActionFetcher {
    pub fn new(name: impl Into<String>, target_dir: impl Into<PathBuf>, spec: ActionSpec) -> Self {
        Self {
            name: name.into(),
            target_dir: target_dir.into(),
            spec,
        }
    }
}

#[async_trait]
impl Fetcher for ActionFetcher {
    async fn fetch(
        &self,
        root_dir: &Path,
        _options: &SyncOptions,
    ) -> Result<Vec<PathBuf>, FetchError> {
        info!("run action {}", self.name);
        let cwd = match &self.spec.cwd {
            Some(dir) => root_dir.join(dir),
            None => root_dir.to_path_buf(),
        };

        for command in &self.spec.commands {
            let display_str = display_command(command);
            info!("run command {} in path {}", display_str, cwd.display());

            let mut cmd = match command {
                CommandSpec::Shell(line) => {
                    let mut cmd = shell_command();
                    cmd.arg(line);
                    cmd
                }
                CommandSpec::Argv(argv) => {
                    let Some((program, args)) = argv.split_first() else {
                        return Err(FetchError::Command {
                            command: display_str,
                            status: "empty argv".to_string(),
                            cwd: cwd.clone(),
                        });
                    };
                    let mut cmd = tokio::process::Command::new(program);
                    cmd.args(args);
                    cmd
                }
            };
            let output = cmd
                .kill_on_drop(true)
                .envs(&self.spec.env)
                .current_dir(&cwd)
                .output()
                .await
                .map_err(|e| FetchError::Command {
                    command: display_str.clone(),
                    status: e.to_string(),
                    cwd: cwd.clone(),
                })?;

            if !output.status.success() {
                error!(
                    "a command has failed recently, original output:\n{}{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr),
                );
                return Err(FetchError::Command {
                    command: display_str,
                    status: output.status.to_string(),
                    cwd: self.target_dir.clone(),
                });
            }
        }

        // Actions materialize nothing a local mirror could replicate.
        Ok(Vec::new())
    }
}

fn display_command(command: &CommandSpec) -> String {
    match command {
        CommandSpec::Shell(line) => line.clone(),
        CommandSpec::Argv(argv) => argv.join(" "),
    }
}

fn shell_command() -> tokio::process::Command {
    #[cfg(unix)]
    {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c");
        cmd
    }
    #[cfg(windows)]
    {
        let mut cmd = tokio::process::Command::new("cmd");
        cmd.arg("/C");
        cmd
    }
}
