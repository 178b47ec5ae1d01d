use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::fmt::{self, Display};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command as BaseCommand;
use tracing::info;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn command: {command}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },

    #[error("command failed ({status}): {command}\n{output}")]
    Failure {
        command: String,
        status: String,
        output: String,
    },
}

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            ..Default::default()
        }
    }

    pub fn failure(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            code: Some(code),
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn combined_output(&self) -> String {
        let mut combined = String::from_utf8_lossy(&self.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&self.stderr));
        combined
    }

    fn describe_status(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_owned(),
        }
    }
}

/// A description of an external program invocation.
///
/// Building a command has no side effects; it only runs when handed to a
/// [`CommandRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    stdout: bool,
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let program = self.program.to_string_lossy();
        let args = self
            .args
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if args.is_empty() {
            write!(f, "{program}",)
        } else {
            write!(f, "{program} {args}",)
        }
    }
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            stdout: false,
        }
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// Pass the child's stdout through to ours instead of capturing it.
    pub fn stdout(&mut self, stdout: bool) -> &mut Command {
        self.stdout = stdout;
        self
    }

    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> impl Iterator<Item = &OsStr> {
        self.args.iter().map(OsString::as_os_str)
    }

    /// Wrap this command in a non-interactive `sudo`.
    pub fn sudo(self) -> Self {
        let mut privileged_cmd = Command::new("sudo");

        privileged_cmd
            .arg("-n") // non-interactive
            .arg(&self.program)
            .args(&self.args)
            .stdout(self.stdout);

        privileged_cmd
    }

    /// Wrap in `sudo` only when `privileged` is set.
    pub fn sudo_if(self, privileged: bool) -> Self {
        if privileged { self.sudo() } else { self }
    }

    fn to_base(&self) -> BaseCommand {
        let mut cmd = BaseCommand::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(if self.stdout {
                Stdio::inherit()
            } else {
                Stdio::piped()
            })
            .stderr(Stdio::piped());
        cmd
    }
}

/// Capability to execute external programs.
///
/// Provisioning steps only ever talk to the outside world through this trait,
/// so tests can substitute a recording fake.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and return the exit status and output, whatever the status.
    async fn output(&self, command: &Command) -> Result<CommandOutput, CommandError>;

    /// Run to completion, treating a non-zero exit as an error.
    async fn run(&self, command: &Command) -> Result<CommandOutput, CommandError> {
        let output = self.output(command).await?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(CommandError::Failure {
                command: command.to_string(),
                status: output.describe_status(),
                output: output.combined_output(),
            })
        }
    }
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, command: &Command) -> Result<CommandOutput, CommandError> {
        info!("running command: {command}");

        let output = command
            .to_base()
            .output()
            .await
            .map_err(|error| CommandError::Spawn {
                command: command.to_string(),
                error,
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}
