//! Code and interpreter deployment plumbing: git checkouts, container
//! pulls, and the credential handoff both need. Used by the agent at
//! dispatch time and by the coordinator to pin git branches to commits at
//! submission.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::credentials::username_password;
use crate::error::{GridError, Result};
use crate::proto;
use crate::proto::credentials::Type;

/// Where code paths appear inside a container when a code deployment
/// accompanies a container interpreter.
pub const CONTAINER_CODE_MOUNT_PREFIX: &str = "/meadowgrid/code";
/// Where the blob-exchange directory appears inside a container.
pub const CONTAINER_IO_MOUNT: &str = "/meadowgrid/io";

/// Resolved code deployment: where to run and what joins the interpreter
/// search path.
#[derive(Debug, Clone, Default)]
pub struct ResolvedCode {
    /// The working directory for the child; the first code path.
    pub working_directory: Option<PathBuf>,
    pub code_paths: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum ResolvedInterpreter {
    /// An interpreter path meaningful on the agent host.
    Local(PathBuf),
    /// A container image, already pulled when pulling was needed.
    Container { image: String },
}

fn short_hash(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

async fn run_git(
    args: &[&str],
    cwd: Option<&Path>,
    credentials: Option<&proto::Credentials>,
) -> Result<String> {
    let mut command = Command::new("git");
    command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    if let Some(credentials) = credentials {
        if credentials.credentials_type() == Type::SshKey {
            let key_file = credentials_key_file(credentials).await?;
            command.env(
                "GIT_SSH_COMMAND",
                format!("ssh -i {} -o IdentitiesOnly=yes", key_file.display()),
            );
        }
    }
    let output = command
        .output()
        .await
        .map_err(|e| GridError::Deployment(format!("cannot run git: {e}")))?;
    if !output.status.success() {
        return Err(GridError::Deployment(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or(""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// SSH keys arrive as bytes; git needs a file with owner-only permissions.
async fn credentials_key_file(credentials: &proto::Credentials) -> Result<PathBuf> {
    let dir = std::env::temp_dir().join("gridlet-keys");
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(short_hash(&String::from_utf8_lossy(
        &credentials.credentials,
    )));
    tokio::fs::write(&path, &credentials.credentials).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(path)
}

/// Embeds username/password credentials into an https clone URL.
fn authenticated_url(repo_url: &str, credentials: Option<&proto::Credentials>) -> Result<String> {
    let Some(credentials) = credentials else {
        return Ok(repo_url.to_string());
    };
    if credentials.credentials_type() != Type::UsernamePassword {
        return Ok(repo_url.to_string());
    }
    let Some(rest) = repo_url.strip_prefix("https://") else {
        return Ok(repo_url.to_string());
    };
    let (username, password) = username_password(credentials)?;
    Ok(format!("https://{username}:{password}@{rest}"))
}

/// Resolves a branch to the commit it currently points at, so that the
/// stored job is deterministic to rerun.
pub async fn resolve_git_branch(
    repo_url: &str,
    branch: &str,
    credentials: Option<&proto::Credentials>,
) -> Result<String> {
    let url = authenticated_url(repo_url, credentials)?;
    let output = run_git(
        &["ls-remote", &url, &format!("refs/heads/{branch}")],
        None,
        credentials,
    )
    .await?;
    output
        .split_whitespace()
        .next()
        .filter(|commit| !commit.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            GridError::Deployment(format!("branch {branch} not found in {repo_url}"))
        })
}

/// Fetches the repo into a shared cache under the working folder and checks
/// the commit out into a per-commit local copy.
pub async fn fetch_git_commit(
    working_folder: &Path,
    repo_url: &str,
    commit: &str,
    path_in_repo: &str,
    credentials: Option<&proto::Credentials>,
) -> Result<ResolvedCode> {
    let url = authenticated_url(repo_url, credentials)?;
    let cache = working_folder.join("git_repos").join(short_hash(repo_url));
    if cache.join(".git").exists() {
        run_git(&["fetch", "origin"], Some(&cache), credentials).await?;
    } else {
        tokio::fs::create_dir_all(&cache).await?;
        run_git(
            &["clone", &url, &cache.to_string_lossy()],
            None,
            credentials,
        )
        .await?;
    }

    let local_copy = working_folder
        .join("local_copies")
        .join(format!("{}-{commit}", short_hash(repo_url)));
    if !local_copy.join(".git").exists() {
        tokio::fs::create_dir_all(&local_copy).await?;
        run_git(
            &[
                "clone",
                "--no-checkout",
                &cache.to_string_lossy(),
                &local_copy.to_string_lossy(),
            ],
            None,
            credentials,
        )
        .await?;
        run_git(&["checkout", commit], Some(&local_copy), credentials).await?;
    }

    let code_root = if path_in_repo.is_empty() {
        local_copy
    } else {
        local_copy.join(path_in_repo)
    };
    Ok(ResolvedCode {
        working_directory: Some(code_root.clone()),
        code_paths: vec![code_root],
    })
}

/// Resolves a code deployment on the agent host. Branch deployments can
/// still arrive here when the coordinator could not reach the repo at
/// submission; they are pinned to a commit now.
pub async fn resolve_code(
    working_folder: &Path,
    code_deployment: &proto::job::CodeDeployment,
    credentials: Option<&proto::Credentials>,
) -> Result<ResolvedCode> {
    use proto::job::CodeDeployment;
    match code_deployment {
        CodeDeployment::ServerAvailableFolder(folder) => {
            let code_paths: Vec<PathBuf> =
                folder.code_paths.iter().map(PathBuf::from).collect();
            Ok(ResolvedCode {
                working_directory: code_paths.first().cloned(),
                code_paths,
            })
        }
        CodeDeployment::GitRepoCommit(repo) => {
            fetch_git_commit(
                working_folder,
                &repo.repo_url,
                &repo.commit,
                &repo.path_in_repo,
                credentials,
            )
            .await
        }
        CodeDeployment::GitRepoBranch(repo) => {
            let commit = resolve_git_branch(&repo.repo_url, &repo.branch, credentials).await?;
            fetch_git_commit(
                working_folder,
                &repo.repo_url,
                &commit,
                &repo.path_in_repo,
                credentials,
            )
            .await
        }
    }
}

async fn run_docker(args: &[String]) -> Result<String> {
    let output = Command::new("docker")
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| GridError::Deployment(format!("cannot run docker: {e}")))?;
    if !output.status.success() {
        return Err(GridError::Deployment(format!(
            "docker {} failed: {}",
            args.first().map(String::as_str).unwrap_or(""),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

async fn docker_login(registry: &str, credentials: &proto::Credentials) -> Result<()> {
    let (username, password) = username_password(credentials)?;
    let mut child = Command::new("docker")
        .args(["login", registry, "--username", username.as_str(), "--password-stdin"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| GridError::Deployment(format!("cannot run docker login: {e}")))?;
    if let Some(stdin) = child.stdin.as_mut() {
        use tokio::io::AsyncWriteExt;
        stdin.write_all(password.as_bytes()).await?;
    }
    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(GridError::Deployment(format!(
            "docker login to {registry} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

async fn pull_image(image: &str, credentials: Option<&proto::Credentials>) -> Result<String> {
    if let Some(credentials) = credentials {
        let registry = crate::credentials::docker_registry_url(image);
        docker_login(registry, credentials).await?;
    }
    run_docker(&["pull".to_string(), image.to_string()]).await?;
    Ok(image.to_string())
}

/// Resolves an interpreter deployment, pulling container images as needed.
pub async fn resolve_interpreter(
    interpreter_deployment: &proto::job::InterpreterDeployment,
    credentials: Option<&proto::Credentials>,
) -> Result<ResolvedInterpreter> {
    use proto::job::InterpreterDeployment;
    match interpreter_deployment {
        InterpreterDeployment::ServerAvailableInterpreter(interpreter) => Ok(
            ResolvedInterpreter::Local(PathBuf::from(&interpreter.interpreter_path)),
        ),
        InterpreterDeployment::ContainerAtDigest(container) => {
            let image = format!("{}@{}", container.repository, container.digest);
            Ok(ResolvedInterpreter::Container {
                image: pull_image(&image, credentials).await?,
            })
        }
        InterpreterDeployment::ContainerAtTag(container) => {
            let image = format!("{}:{}", container.repository, container.tag);
            Ok(ResolvedInterpreter::Container {
                image: pull_image(&image, credentials).await?,
            })
        }
        InterpreterDeployment::ServerAvailableContainer(container) => {
            Ok(ResolvedInterpreter::Container {
                image: container.image_name.clone(),
            })
        }
    }
}
