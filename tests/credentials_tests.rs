use std::io::Write;

use gridlet::credentials::{resolve_source, username_password, CredentialStore};
use gridlet::proto;
use gridlet::proto::add_credentials_request::Source;
use gridlet::proto::credentials::{Service, Type};
use gridlet::proto::{AwsSecret, ServerAvailableFile};

fn file_source(path: &str, credentials_type: Type) -> Source {
    Source::ServerAvailableFile(ServerAvailableFile {
        credentials_type: credentials_type as i32,
        path: path.to_string(),
    })
}

#[test]
fn most_specific_url_prefix_wins() {
    let mut store = CredentialStore::new();
    store.add(
        Service::Git,
        "git@github.com".to_string(),
        file_source("/tmp/broad", Type::SshKey),
    );
    store.add(
        Service::Git,
        "git@github.com:acme".to_string(),
        file_source("/tmp/narrow", Type::SshKey),
    );

    let found = store
        .find(Service::Git, "git@github.com:acme/repo.git")
        .unwrap();
    match found {
        Source::ServerAvailableFile(file) => assert_eq!(file.path, "/tmp/narrow"),
        _ => panic!("expected the file source"),
    }

    // URLs outside the narrow prefix still get the broad match.
    let found = store
        .find(Service::Git, "git@github.com:other/repo.git")
        .unwrap();
    match found {
        Source::ServerAvailableFile(file) => assert_eq!(file.path, "/tmp/broad"),
        _ => panic!("expected the file source"),
    }
}

#[test]
fn equal_length_prefixes_tie_break_by_insertion_order() {
    let mut store = CredentialStore::new();
    store.add(
        Service::Docker,
        "registry-1.docker.io".to_string(),
        file_source("/tmp/first", Type::UsernamePassword),
    );
    store.add(
        Service::Docker,
        "registry-1.docker.io".to_string(),
        file_source("/tmp/second", Type::UsernamePassword),
    );

    match store.find(Service::Docker, "registry-1.docker.io").unwrap() {
        Source::ServerAvailableFile(file) => assert_eq!(file.path, "/tmp/first"),
        _ => panic!("expected the file source"),
    }
}

#[test]
fn lookups_are_service_scoped() {
    let mut store = CredentialStore::new();
    store.add(
        Service::Git,
        "github.com".to_string(),
        file_source("/tmp/git", Type::SshKey),
    );
    assert!(store.find(Service::Docker, "github.com").is_none());
    assert!(store.find(Service::Git, "github.com/acme").is_some());
}

#[test]
fn no_match_for_unrelated_urls() {
    let mut store = CredentialStore::new();
    store.add(
        Service::Git,
        "git@github.com".to_string(),
        file_source("/tmp/key", Type::SshKey),
    );
    assert!(store.find(Service::Git, "git@gitlab.com:x.git").is_none());
}

#[tokio::test]
async fn file_sources_resolve_to_their_contents() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "someuser").unwrap();
    writeln!(file, "somepassword").unwrap();

    let source = file_source(
        file.path().to_str().unwrap(),
        Type::UsernamePassword,
    );
    let credentials = resolve_source(&source).await.unwrap();
    assert_eq!(credentials.credentials_type(), Type::UsernamePassword);

    let (username, password) = username_password(&credentials).unwrap();
    assert_eq!(username, "someuser");
    assert_eq!(password, "somepassword");
}

#[tokio::test]
async fn missing_credential_files_are_an_error() {
    let source = file_source("/nonexistent/credentials.txt", Type::SshKey);
    assert!(resolve_source(&source).await.is_err());
}

#[test]
fn username_password_requires_the_right_type_and_shape() {
    let ssh = proto::Credentials {
        credentials_type: Type::SshKey as i32,
        credentials: b"KEY".to_vec(),
    };
    assert!(username_password(&ssh).is_err());

    let one_line = proto::Credentials {
        credentials_type: Type::UsernamePassword as i32,
        credentials: b"only-user".to_vec(),
    };
    assert!(username_password(&one_line).is_err());
}

#[test]
fn secret_manager_sources_carry_their_type() {
    // Resolution shells out; here we only check the source round-trips
    // through the store.
    let mut store = CredentialStore::new();
    store.add(
        Service::Docker,
        "registry-1.docker.io".to_string(),
        Source::AwsSecret(AwsSecret {
            credentials_type: Type::UsernamePassword as i32,
            secret_name: "dockerhub".to_string(),
        }),
    );
    match store
        .find(Service::Docker, "registry-1.docker.io/acme/image")
        .unwrap()
    {
        Source::AwsSecret(secret) => assert_eq!(secret.secret_name, "dockerhub"),
        _ => panic!("expected the secret source"),
    }
}
