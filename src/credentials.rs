//! Credentials managed on behalf of jobs.
//!
//! Clients register a credential *source* for a (service, URL prefix) pair;
//! at dispatch time the coordinator resolves the source to actual credential
//! bytes and passes them to the agent alongside the job. Sources are a
//! closed sum: a named secret in an external secret manager, or a file on
//! the coordinator host.

use tokio::process::Command;

use crate::error::{GridError, Result};
use crate::proto;
use crate::proto::add_credentials_request::Source;
use crate::proto::credentials::{Service, Type};

pub const DEFAULT_DOCKER_REGISTRY: &str = "registry-1.docker.io";

#[derive(Debug, Clone)]
struct StoredCredential {
    service: Service,
    url_prefix: String,
    source: Source,
}

/// Effectively immutable after writes; lookups never block on resolution.
#[derive(Debug, Default)]
pub struct CredentialStore {
    entries: Vec<StoredCredential>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, service: Service, url_prefix: String, source: Source) {
        tracing::info!(?service, url = %url_prefix, "Credentials added");
        self.entries.push(StoredCredential {
            service,
            url_prefix,
            source,
        });
    }

    /// The most specific (longest) URL-prefix match for the service; ties go
    /// to the earliest insertion.
    pub fn find(&self, service: Service, url: &str) -> Option<&Source> {
        self.entries
            .iter()
            .filter(|e| e.service == service && url.starts_with(&e.url_prefix))
            // max_by_key returns the last maximum; reverse the index so the
            // earliest insertion wins ties.
            .enumerate()
            .max_by_key(|(index, e)| (e.url_prefix.len(), usize::MAX - index))
            .map(|(_, e)| &e.source)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolves a source to actual credential bytes. USERNAME_PASSWORD material
/// is the username on the first line and the password on the second;
/// SSH_KEY material is the private key itself.
pub async fn resolve_source(source: &Source) -> Result<proto::Credentials> {
    match source {
        Source::ServerAvailableFile(file) => {
            let credentials = tokio::fs::read(&file.path).await.map_err(|e| {
                GridError::Credentials(format!("cannot read credentials file {}: {e}", file.path))
            })?;
            Ok(proto::Credentials {
                credentials_type: file.credentials_type,
                credentials,
            })
        }
        Source::AwsSecret(secret) => {
            let credentials = fetch_secret(&secret.secret_name).await?;
            Ok(proto::Credentials {
                credentials_type: secret.credentials_type,
                credentials,
            })
        }
    }
}

/// Fetches a secret by name from the external secret manager CLI. Secrets
/// holding a JSON object with username/password (or private_key) fields are
/// converted to the line-oriented credential material; anything else is
/// passed through as raw bytes.
async fn fetch_secret(secret_name: &str) -> Result<Vec<u8>> {
    let output = Command::new("aws")
        .args([
            "secretsmanager",
            "get-secret-value",
            "--secret-id",
            secret_name,
            "--query",
            "SecretString",
            "--output",
            "text",
        ])
        .output()
        .await
        .map_err(|e| GridError::Credentials(format!("cannot run secret manager CLI: {e}")))?;
    if !output.status.success() {
        return Err(GridError::Credentials(format!(
            "secret manager lookup for {secret_name} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let text = text.trim_end_matches('\n');
    Ok(secret_material(text).into_bytes())
}

fn secret_material(secret_string: &str) -> String {
    if let Ok(serde_json::Value::Object(fields)) = serde_json::from_str(secret_string) {
        if let (Some(username), Some(password)) = (
            fields.get("username").and_then(|v| v.as_str()),
            fields.get("password").and_then(|v| v.as_str()),
        ) {
            return format!("{username}\n{password}");
        }
        if let Some(key) = fields.get("private_key").and_then(|v| v.as_str()) {
            return key.to_string();
        }
    }
    secret_string.to_string()
}

/// Splits USERNAME_PASSWORD credential material into its two lines.
pub fn username_password(credentials: &proto::Credentials) -> Result<(String, String)> {
    if credentials.credentials_type() != Type::UsernamePassword {
        return Err(GridError::Credentials(
            "expected username/password credentials".to_string(),
        ));
    }
    let text = String::from_utf8_lossy(&credentials.credentials);
    let mut lines = text.lines();
    match (lines.next(), lines.next()) {
        (Some(username), Some(password)) => Ok((username.to_string(), password.to_string())),
        _ => Err(GridError::Credentials(
            "username/password credentials need two lines".to_string(),
        )),
    }
}

/// The registry a docker repository name pulls from, for credential lookup.
pub fn docker_registry_url(repository: &str) -> &str {
    match repository.split_once('/') {
        // A first component with a dot or colon is a registry host.
        Some((host, _)) if host.contains('.') || host.contains(':') => host,
        _ => DEFAULT_DOCKER_REGISTRY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_registry_defaults_to_docker_hub() {
        assert_eq!(docker_registry_url("library/python"), DEFAULT_DOCKER_REGISTRY);
        assert_eq!(docker_registry_url("python"), DEFAULT_DOCKER_REGISTRY);
        assert_eq!(
            docker_registry_url("ghcr.io/owner/image"),
            "ghcr.io"
        );
        assert_eq!(
            docker_registry_url("localhost:5000/image"),
            "localhost:5000"
        );
    }

    #[test]
    fn secret_material_parses_json_shapes() {
        assert_eq!(
            secret_material(r#"{"username": "u", "password": "p"}"#),
            "u\np"
        );
        assert_eq!(
            secret_material(r#"{"private_key": "KEY"}"#),
            "KEY"
        );
        assert_eq!(secret_material("raw"), "raw");
    }
}
