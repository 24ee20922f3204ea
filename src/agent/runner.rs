//! Launching and supervising job processes on the agent host.
//!
//! Payload blobs (function arguments, results, exceptions) stay opaque:
//! they move between the agent and user code through files under the
//! working folder's io directory, and for grid workers through
//! length-prefixed frames on the child's stdin/stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::deployment::{
    ResolvedCode, ResolvedInterpreter, CONTAINER_CODE_MOUNT_PREFIX, CONTAINER_IO_MOUNT,
};
use crate::error::{GridError, Result};
use crate::proto;
use crate::proto::process_state::ProcessStateEnum;

/// Environment variable naming the file holding a command job's context
/// variables blob.
pub const CONTEXT_VARIABLES_ENV: &str = "GRIDLET_CONTEXT_VARIABLES";

/// Serializes an agent-side failure as an opaque (type, message, traceback)
/// triple, mirroring how user-code exceptions travel.
pub fn serialize_failure(type_name: &str, message: &str) -> Vec<u8> {
    serde_json::to_vec(&[type_name, message, ""]).unwrap_or_default()
}

/// Host-side paths for blob exchange with one job's child process.
#[derive(Debug, Clone)]
pub struct JobIo {
    io_folder: PathBuf,
    pub function_path: PathBuf,
    pub arguments_path: PathBuf,
    pub result_path: PathBuf,
    pub exception_path: PathBuf,
    pub context_path: PathBuf,
}

impl JobIo {
    pub fn new(working_folder: &Path, job_id: &str) -> Self {
        let io_folder = working_folder.join("io");
        Self {
            function_path: io_folder.join(format!("{job_id}.function")),
            arguments_path: io_folder.join(format!("{job_id}.arguments")),
            result_path: io_folder.join(format!("{job_id}.result")),
            exception_path: io_folder.join(format!("{job_id}.exception")),
            context_path: io_folder.join(format!("{job_id}.context")),
            io_folder,
        }
    }

    /// The same path as seen from inside a container, where the io folder
    /// is mounted at a fixed location.
    fn containerized(&self, path: &Path) -> String {
        match path.file_name() {
            Some(name) => format!("{}/{}", CONTAINER_IO_MOUNT, name.to_string_lossy()),
            None => CONTAINER_IO_MOUNT.to_string(),
        }
    }
}

/// What to execute for a job, after deployments are resolved.
pub enum JobPayload<'a> {
    Command(&'a proto::PyCommandJob),
    Function(&'a proto::PyFunctionJob),
    /// A grid worker child: tasks stream over stdin/stdout frames.
    GridWorker(&'a proto::PyGridJob),
}

pub struct Launched {
    pub child: Child,
    pub pid: i32,
    pub container_id: String,
    pub log_file_name: String,
}

impl Launched {
    pub fn running_state(&self) -> proto::ProcessState {
        proto::ProcessState {
            state: ProcessStateEnum::Running as i32,
            pid: self.pid,
            container_id: self.container_id.clone(),
            log_file_name: self.log_file_name.clone(),
            ..Default::default()
        }
    }
}

/// The argv for our function-runner convention: the interpreter deployment
/// is expected to be a runtime entrypoint that understands these flags.
fn function_runner_args(
    mode: &str,
    function: Option<&proto::py_function_job::Function>,
    io: &JobIo,
    in_container: bool,
) -> Result<Vec<String>> {
    let path_arg = |path: &PathBuf| -> String {
        if in_container {
            io.containerized(path)
        } else {
            path.to_string_lossy().to_string()
        }
    };
    let mut args = vec![mode.to_string()];
    match function {
        Some(proto::py_function_job::Function::QualifiedFunctionName(name)) => {
            args.push("--function-name".to_string());
            args.push(format!("{}.{}", name.module_name, name.function_name));
        }
        Some(proto::py_function_job::Function::PickledFunction(_)) => {
            args.push("--function-pickle".to_string());
            args.push(path_arg(&io.function_path));
        }
        None => {
            return Err(GridError::InvalidJob(
                "function job has no function".to_string(),
            ));
        }
    }
    args.push("--result".to_string());
    args.push(path_arg(&io.result_path));
    args.push("--exception".to_string());
    args.push(path_arg(&io.exception_path));
    Ok(args)
}

/// PyGridJob carries the same function oneof as PyFunctionJob but as a
/// distinct message; normalize for function_runner_args.
fn grid_function(grid: &proto::PyGridJob) -> Option<proto::py_function_job::Function> {
    match &grid.function {
        Some(proto::py_grid_job::Function::QualifiedFunctionName(name)) => Some(
            proto::py_function_job::Function::QualifiedFunctionName(name.clone()),
        ),
        Some(proto::py_grid_job::Function::PickledFunction(bytes)) => Some(
            proto::py_function_job::Function::PickledFunction(bytes.clone()),
        ),
        None => None,
    }
}

pub struct LaunchSpec {
    pub working_folder: PathBuf,
    pub job: proto::Job,
    pub code: Option<ResolvedCode>,
    pub interpreter: ResolvedInterpreter,
}

impl LaunchSpec {
    /// Results must be readable by the submitting client, which may be on
    /// an older runtime.
    fn push_pickle_protocol(&self, args: &mut Vec<String>) {
        if self.job.result_highest_pickle_protocol > 0 {
            args.push("--result-pickle-protocol".to_string());
            args.push(self.job.result_highest_pickle_protocol.to_string());
        }
    }

    fn log_file(&self) -> PathBuf {
        let name = if self.job.job_friendly_name.is_empty() {
            self.job.job_id.clone()
        } else {
            format!("{}.{}", self.job.job_friendly_name, self.job.job_id)
        };
        self.working_folder.join("job_logs").join(format!("{name}.log"))
    }

    /// Writes payload blobs to the io folder and returns the argv to run.
    async fn prepare(&self, payload: &JobPayload<'_>, io: &JobIo, in_container: bool) -> Result<Vec<String>> {
        tokio::fs::create_dir_all(&io.io_folder).await?;
        match payload {
            JobPayload::Command(command) => {
                if command.command_line.is_empty() {
                    return Err(GridError::InvalidJob("empty command line".to_string()));
                }
                if !command.pickled_context_variables.is_empty() {
                    tokio::fs::write(&io.context_path, &command.pickled_context_variables)
                        .await?;
                }
                Ok(command.command_line.clone())
            }
            JobPayload::Function(function) => {
                if let Some(proto::py_function_job::Function::PickledFunction(bytes)) =
                    &function.function
                {
                    tokio::fs::write(&io.function_path, bytes).await?;
                }
                tokio::fs::write(&io.arguments_path, &function.pickled_function_arguments)
                    .await?;
                let mut args =
                    function_runner_args("run-function", function.function.as_ref(), io, in_container)?;
                args.push("--arguments".to_string());
                args.push(if in_container {
                    io.containerized(&io.arguments_path)
                } else {
                    io.arguments_path.to_string_lossy().to_string()
                });
                self.push_pickle_protocol(&mut args);
                Ok(args)
            }
            JobPayload::GridWorker(grid) => {
                let function = grid_function(grid);
                if let Some(proto::py_function_job::Function::PickledFunction(bytes)) = &function {
                    tokio::fs::write(&io.function_path, bytes).await?;
                }
                let mut args = function_runner_args("run-tasks", function.as_ref(), io, in_container)?;
                self.push_pickle_protocol(&mut args);
                Ok(args)
            }
        }
    }

    /// Launches the job. For grid workers stdin/stdout are piped for the
    /// task frame protocol; everything else logs stdout to the log file.
    pub async fn launch(&self, payload: JobPayload<'_>) -> Result<(Launched, JobIo)> {
        let io = JobIo::new(&self.working_folder, &self.job.job_id);
        let grid = matches!(payload, JobPayload::GridWorker(_));
        let command_payload = matches!(payload, JobPayload::Command(_));

        let log_path = self.log_file();
        tokio::fs::create_dir_all(
            log_path
                .parent()
                .ok_or_else(|| GridError::Internal("log path has no parent".to_string()))?,
        )
        .await?;
        let log_file = std::fs::File::create(&log_path)?;
        let log_file_name = log_path.to_string_lossy().to_string();

        let mut cidfile = None;
        let mut command = match &self.interpreter {
            ResolvedInterpreter::Local(interpreter_path) => {
                let argv = self.prepare(&payload, &io, false).await?;
                let (program, args) = if command_payload {
                    // Command jobs run the user's argv directly.
                    (argv[0].clone(), argv[1..].to_vec())
                } else {
                    (
                        interpreter_path.to_string_lossy().to_string(),
                        argv,
                    )
                };
                let mut command = Command::new(program);
                command.args(args);
                if let Some(code) = &self.code {
                    if let Some(working_directory) = &code.working_directory {
                        command.current_dir(working_directory);
                    }
                    if !code.code_paths.is_empty() {
                        let paths = std::env::join_paths(&code.code_paths)
                            .map_err(|e| GridError::Deployment(e.to_string()))?;
                        command.env("PYTHONPATH", paths);
                    }
                }
                command
            }
            ResolvedInterpreter::Container { image } => {
                let argv = self.prepare(&payload, &io, true).await?;
                let cid_path = self
                    .working_folder
                    .join("io")
                    .join(format!("{}.cid", self.job.job_id));
                let _ = tokio::fs::remove_file(&cid_path).await;
                let mut command = Command::new("docker");
                command.args(["run", "--rm"]);
                if grid {
                    command.arg("--interactive");
                }
                command.arg(format!("--cidfile={}", cid_path.display()));
                command.arg("--mount").arg(format!(
                    "type=bind,source={},target={}",
                    io.io_folder.display(),
                    CONTAINER_IO_MOUNT
                ));
                let mut search_paths = Vec::new();
                if let Some(code) = &self.code {
                    for (index, path) in code.code_paths.iter().enumerate() {
                        let target = format!("{CONTAINER_CODE_MOUNT_PREFIX}{index}");
                        command.arg("--mount").arg(format!(
                            "type=bind,source={},target={target},readonly",
                            path.display()
                        ));
                        search_paths.push(target);
                    }
                    if !search_paths.is_empty() {
                        command.arg("--workdir").arg(&search_paths[0]);
                        command
                            .arg("-e")
                            .arg(format!("PYTHONPATH={}", search_paths.join(":")));
                    }
                }
                for (name, value) in &self.job.environment_variables {
                    command.arg("-e").arg(format!("{name}={value}"));
                }
                if command_payload && io.context_path.exists() {
                    command.arg("-e").arg(format!(
                        "{CONTEXT_VARIABLES_ENV}={}",
                        io.containerized(&io.context_path)
                    ));
                }
                command.arg(image);
                command.args(&argv);
                cidfile = Some(cid_path);
                command
            }
        };

        if matches!(self.interpreter, ResolvedInterpreter::Local(_)) {
            for (name, value) in &self.job.environment_variables {
                command.env(name, value);
            }
            if command_payload && io.context_path.exists() {
                command.env(CONTEXT_VARIABLES_ENV, &io.context_path);
            }
        }

        command.stderr(Stdio::from(log_file.try_clone()?));
        if grid {
            command.stdin(Stdio::piped());
            command.stdout(Stdio::piped());
        } else {
            command.stdout(Stdio::from(log_file));
        }

        let child = command.spawn().map_err(|e| {
            GridError::Deployment(format!("failed to launch {}: {e}", self.job.job_id))
        })?;
        let pid = child.id().map(|pid| pid as i32).unwrap_or(0);

        let container_id = match cidfile {
            Some(path) => read_container_id(&path).await,
            None => String::new(),
        };

        tracing::info!(
            job_id = %self.job.job_id,
            pid,
            container_id = %container_id,
            log_file = %log_file_name,
            "Job launched"
        );
        Ok((
            Launched {
                child,
                pid,
                container_id,
                log_file_name,
            },
            io,
        ))
    }
}

/// The cidfile appears shortly after `docker run` starts; don't wait long.
async fn read_container_id(path: &Path) -> String {
    for _ in 0..10 {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            let id = contents.trim().to_string();
            if !id.is_empty() {
                return id;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    String::new()
}

/// Waits for a non-grid job's child and classifies the outcome.
pub async fn finish_simple_job(launched: Launched, io: &JobIo) -> proto::ProcessState {
    let Launched {
        mut child,
        pid,
        container_id,
        log_file_name,
    } = launched;

    let base = |state: ProcessStateEnum, return_code: i32, pickled_result: Vec<u8>| {
        proto::ProcessState {
            state: state as i32,
            pid,
            container_id: container_id.clone(),
            log_file_name: log_file_name.clone(),
            pickled_result,
            return_code,
        }
    };

    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(error = %e, "Could not wait for job process");
            return base(
                ProcessStateEnum::ErrorGettingState,
                0,
                serialize_failure("io", &e.to_string()),
            );
        }
    };

    if status.success() {
        let pickled_result = tokio::fs::read(&io.result_path).await.unwrap_or_default();
        return base(ProcessStateEnum::Succeeded, 0, pickled_result);
    }

    let return_code = status.code().unwrap_or(-1);
    match tokio::fs::read(&io.exception_path).await {
        Ok(exception) if !exception.is_empty() => {
            base(ProcessStateEnum::PythonException, return_code, exception)
        }
        _ => base(ProcessStateEnum::NonZeroReturnCode, return_code, Vec::new()),
    }
}

// --- the grid worker frame protocol ---
//
// One argument frame in per task; one status byte (0 = result,
// 1 = exception) plus one payload frame out. Frames are u32 little-endian
// length prefixes. Closing stdin tells the child to exit.

pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Vec<u8>> {
    let mut length = [0u8; 4];
    reader.read_exact(&mut length).await?;
    let mut payload = vec![0u8; u32::from_le_bytes(length) as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub enum TaskOutcome {
    Result(Vec<u8>),
    Exception(Vec<u8>),
}

/// A launched grid worker child plus the pipes the task protocol runs over.
pub struct GridWorkerChild {
    pub launched: Launched,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl GridWorkerChild {
    pub fn new(mut launched: Launched) -> Result<Self> {
        let stdin = launched
            .child
            .stdin
            .take()
            .ok_or_else(|| GridError::Internal("grid worker child has no stdin".to_string()))?;
        let stdout = launched
            .child
            .stdout
            .take()
            .ok_or_else(|| GridError::Internal("grid worker child has no stdout".to_string()))?;
        Ok(Self {
            launched,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Sends one task's argument blob and reads back the outcome.
    pub async fn run_task(&mut self, arguments: &[u8]) -> Result<TaskOutcome> {
        write_frame(&mut self.stdin, arguments).await?;
        let mut status = [0u8; 1];
        self.stdout.read_exact(&mut status).await?;
        let payload = read_frame(&mut self.stdout).await?;
        match status[0] {
            0 => Ok(TaskOutcome::Result(payload)),
            1 => Ok(TaskOutcome::Exception(payload)),
            other => Err(GridError::Internal(format!(
                "grid worker child sent unknown status byte {other}"
            ))),
        }
    }

    /// Closes the task stream and waits for a clean exit.
    pub async fn finish(self) -> proto::ProcessState {
        let GridWorkerChild {
            mut launched,
            stdin,
            stdout: _,
        } = self;
        drop(stdin);
        let pid = launched.pid;
        let container_id = launched.container_id.clone();
        let log_file_name = launched.log_file_name.clone();
        let state = match launched.child.wait().await {
            Ok(status) if status.success() => ProcessStateEnum::Succeeded,
            Ok(status) => {
                return proto::ProcessState {
                    state: ProcessStateEnum::NonZeroReturnCode as i32,
                    pid,
                    container_id,
                    log_file_name,
                    return_code: status.code().unwrap_or(-1),
                    ..Default::default()
                }
            }
            Err(_) => ProcessStateEnum::ErrorGettingState,
        };
        proto::ProcessState {
            state: state as i32,
            pid,
            container_id,
            log_file_name,
            ..Default::default()
        }
    }

    /// Kills the child after a protocol failure and classifies its exit.
    pub async fn fail(mut self) -> proto::ProcessState {
        let _ = self.launched.child.start_kill();
        let status = self.launched.child.wait().await;
        proto::ProcessState {
            state: ProcessStateEnum::NonZeroReturnCode as i32,
            pid: self.launched.pid,
            container_id: self.launched.container_id.clone(),
            log_file_name: self.launched.log_file_name.clone(),
            return_code: status.ok().and_then(|s| s.code()).unwrap_or(-1),
            ..Default::default()
        }
    }
}
