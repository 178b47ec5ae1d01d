//! Fakes for the outside world.

use async_trait::async_trait;
use mkvm_cmd::{Command, CommandError, CommandOutput, CommandRunner};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::hypervisor::{DomainHandle, Hypervisor, HypervisorError};
use crate::provision::{Operator, Plan};

/// Records commands instead of running them. Files named on a command line
/// are read at call time, since they may be temporary.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<Command>>,
    files: Mutex<HashMap<String, String>>,
    failures: Vec<(String, String)>,
}

impl RecordingRunner {
    /// Make every invocation of `program` exit 1 with `stderr`.
    pub fn fail_on(mut self, program: &str, stderr: &str) -> Self {
        self.failures.push((program.to_owned(), stderr.to_owned()));
        self
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.commands().iter().map(ToString::to_string).collect()
    }

    /// Contents of files passed as arguments, by file name.
    pub fn captured_files(&self) -> HashMap<String, String> {
        self.files.lock().unwrap().clone()
    }
}

/// The program actually being run, looking through `sudo -n`.
fn effective_program(command: &Command) -> String {
    let program = command.get_program().to_string_lossy().into_owned();
    let program = if program == "sudo" {
        command
            .get_args()
            .find(|arg| arg.to_str() != Some("-n"))
            .map(|arg| arg.to_string_lossy().into_owned())
            .unwrap_or(program)
    } else {
        program
    };
    Path::new(&program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or(program)
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn output(&self, command: &Command) -> Result<CommandOutput, CommandError> {
        self.commands.lock().unwrap().push(command.clone());

        for arg in command.get_args() {
            let path = Path::new(arg);
            if path.is_file() {
                let contents = std::fs::read(path).unwrap();
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                self.files
                    .lock()
                    .unwrap()
                    .insert(name, String::from_utf8_lossy(&contents).into_owned());
            }
        }

        let program = effective_program(command);
        let failure = self.failures.iter().find(|(p, _)| *p == program);
        Ok(match failure {
            Some((_, stderr)) => CommandOutput::failure(1, stderr.as_bytes()),
            None => CommandOutput::success(),
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeHypervisor {
    pub connected: bool,
    pub refuse_connect: bool,
    pub create_error: Option<String>,
    pub created: Vec<String>,
}

impl FakeHypervisor {
    pub fn failing_create(message: &str) -> Self {
        Self {
            create_error: Some(message.to_owned()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn connect(&mut self) -> Result<(), HypervisorError> {
        if self.refuse_connect {
            return Err(HypervisorError::AuthorizationDenied {
                message: "access denied by policy".to_owned(),
            });
        }
        self.connected = true;
        Ok(())
    }

    async fn create_domain(&mut self, xml: &str) -> Result<DomainHandle, HypervisorError> {
        if !self.connected {
            return Err(HypervisorError::NotConnected);
        }
        if let Some(message) = &self.create_error {
            return Err(HypervisorError::CreateError {
                message: message.clone(),
            });
        }
        self.created.push(xml.to_owned());
        let name = xml
            .split("<name>")
            .nth(1)
            .and_then(|rest| rest.split("</name>").next())
            .unwrap_or_default()
            .to_owned();
        Ok(DomainHandle { name, id: 1 })
    }
}

/// Accepts every plan, remembering what it was shown.
#[derive(Debug, Default)]
pub struct AutoConfirm {
    pub plans: Vec<Plan>,
}

#[async_trait]
impl Operator for AutoConfirm {
    async fn confirm(&mut self, plan: &Plan) -> std::io::Result<()> {
        self.plans.push(plan.clone());
        Ok(())
    }
}
