mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{metadata, zip_bytes};
use repo_courier::contract::{
    BlobSource, CommitInfo, FileMode, HostError, MockRepositoryHost, NewRepository, RemoteFile,
    RemoteTree, RepositoryHost, RepositoryMetadata, TreeCommit, Visibility,
};
use repo_courier::describe::Mode;
use repo_courier::session::{Command, PendingAction};
use repo_courier::synchronise::{git_blob_id, SyncOutcome};
use repo_courier::{ArchivePayload, Coordinator, OperatorId, PipelineError, PipelineOptions, Response};
use tokio::sync::Notify;

const OWNER: &str = "owner-42";

fn owner() -> OperatorId {
    OperatorId::new(OWNER)
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn coordinator(host: MockRepositoryHost) -> Coordinator<MockRepositoryHost> {
    Coordinator::new(owner(), host, PipelineOptions::default())
}

fn python_archive() -> ArchivePayload {
    ArchivePayload::new(
        Some("flask-demo.zip".to_string()),
        zip_bytes(&[
            ("main.py", b"print('hello')\n"),
            ("requirements.txt", b"flask\n"),
            ("utils.py", b"def helper():\n    return 1\n"),
        ]),
    )
}

fn readme_of(commit: &TreeCommit) -> Option<String> {
    commit.entries.iter().find(|e| e.path == "README.md").and_then(|e| match &e.source {
        BlobSource::Upload(bytes) => String::from_utf8(bytes.clone()).ok(),
        BlobSource::Existing(_) => None,
    })
}

#[tokio::test]
async fn foreign_operator_is_rejected_before_anything_else() {
    // No expectations: any remote call would panic.
    let coordinator = coordinator(MockRepositoryHost::new());
    let intruder = OperatorId::new("intruder");

    let err = coordinator
        .submit_command(&intruder, "/delete", &args(&["demo"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unauthorized");

    let err = coordinator
        .submit_command(&intruder, "/no_such_command", &[])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unauthorized");

    let err = coordinator
        .submit_artifact(&intruder, python_archive())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        PipelineError::Unauthorized {
            operator: "intruder".to_string()
        }
    );
}

#[tokio::test]
async fn unsolicited_archive_is_out_of_order() {
    let coordinator = coordinator(MockRepositoryHost::new());
    let err = coordinator
        .submit_artifact(&owner(), python_archive())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "out_of_order");
}

#[tokio::test]
async fn template_upload_of_python_project_creates_repository() {
    let mut host = MockRepositoryHost::new();
    host.expect_get_repository()
        .withf(|name| name == "flask-demo")
        .times(1)
        .returning(|_| Ok(None));
    host.expect_create_repository()
        .withf(|req: &NewRepository| req.visibility == Visibility::Public)
        .times(1)
        .returning(|req| Ok(metadata(&req.name, req.visibility)));
    host.expect_push_tree()
        .withf(|name, commit: &TreeCommit| {
            name == "flask-demo"
                && commit.entries.len() == 4
                && readme_of(commit).is_some_and(|readme| {
                    readme.contains("Python") && readme.contains("pip install -r requirements.txt")
                })
        })
        .times(1)
        .returning(|_, _| {
            Ok(CommitInfo {
                id: "c1".into(),
                url: None,
            })
        });
    let coordinator = coordinator(host);

    let awaiting = coordinator
        .submit_command(&owner(), "/upload", &args(&["template", "flask-demo"]))
        .await
        .unwrap();
    assert_eq!(
        awaiting,
        Response::AwaitingArchive {
            mode: Mode::Template,
            action: PendingAction::Create {
                name: Some("flask-demo".to_string())
            },
            expires_in: Duration::from_secs(600),
        }
    );
    assert!(coordinator.is_awaiting_archive().await);

    let response = coordinator
        .submit_artifact(&owner(), python_archive())
        .await
        .unwrap();
    let Response::Published(report) = response else {
        panic!("expected a publish report, got {response:?}");
    };
    assert_eq!(report.outcome, SyncOutcome::Created);
    assert_eq!(report.url, "https://github.com/octo/flask-demo");
    assert_eq!(report.visibility, Visibility::Public);
    assert_eq!(report.file_count, 4);
    assert!(report.document_synthesized);
    assert!(report.stack.starts_with("Python"));
    assert_eq!(coordinator.published(), 1);
    assert!(!coordinator.is_awaiting_archive().await);

    // The session is consumed by the run.
    let err = coordinator
        .submit_artifact(&owner(), python_archive())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "out_of_order");
}

#[tokio::test]
async fn upload_without_name_uses_archive_file_name() {
    let mut host = MockRepositoryHost::new();
    host.expect_get_repository()
        .withf(|name| name == "my-project")
        .returning(|_| Ok(None));
    host.expect_create_repository()
        .withf(|req: &NewRepository| req.name == "my-project")
        .returning(|req| Ok(metadata(&req.name, req.visibility)));
    host.expect_push_tree().returning(|_, _| {
        Ok(CommitInfo {
            id: "c1".into(),
            url: None,
        })
    });
    let coordinator = coordinator(host);

    coordinator.submit_command(&owner(), "upload", &[]).await.unwrap();
    let payload = ArchivePayload::new(
        Some("downloads/my-project.ZIP".to_string()),
        zip_bytes(&[("index.html", b"<h1>hi</h1>")]),
    );
    let response = coordinator.submit_artifact(&owner(), payload).await.unwrap();
    assert!(response.to_string().starts_with("Created my-project (public)"));
}

#[tokio::test]
async fn archive_name_that_is_not_a_valid_repository_name_is_rejected() {
    let coordinator = coordinator(MockRepositoryHost::new());
    coordinator.submit_command(&owner(), "/upload", &[]).await.unwrap();
    let payload = ArchivePayload::new(
        Some("my project!.zip".to_string()),
        zip_bytes(&[("a.txt", b"a")]),
    );
    let err = coordinator.submit_artifact(&owner(), payload).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_name");
}

#[tokio::test]
async fn update_keeps_existing_readme_and_removes_stale_files() {
    let kept = "# Flask demo\n\nWritten by hand.\n";

    let mut host = MockRepositoryHost::new();
    host.expect_get_repository()
        .returning(|name| Ok(Some(metadata(name, Visibility::Private))));
    host.expect_list_contents().returning(|_, _| {
        Ok(RemoteTree {
            head: Some("c0".into()),
            files: vec![
                RemoteFile {
                    path: "main.py".into(),
                    blob_id: git_blob_id(b"print('old')\n"),
                    mode: FileMode::Regular,
                },
                RemoteFile {
                    path: "legacy.py".into(),
                    blob_id: git_blob_id(b"x"),
                    mode: FileMode::Regular,
                },
            ],
        })
    });
    host.expect_push_tree()
        .withf(move |_, commit: &TreeCommit| {
            let paths: Vec<&str> = commit.entries.iter().map(|e| e.path.as_str()).collect();
            commit.parent.as_deref() == Some("c0")
                && paths == vec!["README.md", "main.py"]
                && readme_of(commit).as_deref() == Some(kept)
        })
        .times(1)
        .returning(|_, _| {
            Ok(CommitInfo {
                id: "c1".into(),
                url: None,
            })
        });
    host.expect_create_repository().never();
    let coordinator = coordinator(host);

    let awaiting = coordinator
        .submit_command(&owner(), "/upd_repo", &args(&["flask-demo"]))
        .await
        .unwrap();
    assert!(matches!(
        awaiting,
        Response::AwaitingArchive {
            mode: Mode::Normal,
            action: PendingAction::Update { .. },
            ..
        }
    ));

    let payload = ArchivePayload::new(
        None,
        zip_bytes(&[("README.md", kept.as_bytes()), ("main.py", b"print('new')\n")]),
    );
    let response = coordinator.submit_artifact(&owner(), payload).await.unwrap();
    let Response::Published(report) = response else {
        panic!("expected a publish report, got {response:?}");
    };
    assert_eq!(report.outcome, SyncOutcome::Updated);
    assert!(!report.document_synthesized);
    let diff = report.diff.expect("update reports its diff");
    assert_eq!(diff.added, vec!["README.md"]);
    assert_eq!(diff.modified, vec!["main.py"]);
    assert_eq!(diff.deleted, vec!["legacy.py"]);
    assert_eq!(coordinator.published(), 0);
}

#[tokio::test]
async fn update_of_missing_repository_fails_without_opening_a_session() {
    let mut host = MockRepositoryHost::new();
    host.expect_get_repository().returning(|_| Ok(None));
    let coordinator = coordinator(host);

    let err = coordinator
        .submit_command(&owner(), "/update_repo", &args(&["ghost"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert!(!coordinator.is_awaiting_archive().await);
}

#[tokio::test]
async fn new_command_replaces_pending_session() {
    let mut host = MockRepositoryHost::new();
    host.expect_get_repository().returning(|_| Ok(None));
    let coordinator = coordinator(host);

    coordinator
        .submit_command(&owner(), "/upload", &args(&["first"]))
        .await
        .unwrap();
    let err = coordinator
        .submit_command(&owner(), "/inspect", &args(&["other"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");

    let err = coordinator
        .submit_artifact(&owner(), python_archive())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "out_of_order");
}

#[tokio::test]
async fn usage_error_leaves_pending_session_in_place() {
    let coordinator = coordinator(MockRepositoryHost::new());
    coordinator.submit_command(&owner(), "/upload", &[]).await.unwrap();

    let err = coordinator
        .submit_command(&owner(), "/delete", &[])
        .await
        .unwrap_err();
    assert_eq!(err, PipelineError::Usage("usage: /delete <name>".to_string()));
    assert!(coordinator.is_awaiting_archive().await);
}

#[tokio::test(start_paused = true)]
async fn archive_after_expiry_is_out_of_order() {
    let coordinator = coordinator(MockRepositoryHost::new());
    coordinator.submit_command(&owner(), "/upload", &[]).await.unwrap();

    tokio::time::advance(Duration::from_secs(601)).await;
    assert!(!coordinator.is_awaiting_archive().await);

    let err = coordinator
        .submit_artifact(&owner(), python_archive())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        PipelineError::OutOfOrder("the pending session expired; send the command again".to_string())
    );
}

#[tokio::test]
async fn cancel_reports_whether_a_session_was_pending() {
    let coordinator = coordinator(MockRepositoryHost::new());
    coordinator.submit_command(&owner(), "/upload", &[]).await.unwrap();

    let first = coordinator.submit_command(&owner(), "/cancel", &[]).await.unwrap();
    assert_eq!(first, Response::Cancelled { had_pending: true });
    let second = coordinator.submit_command(&owner(), "/cancel", &[]).await.unwrap();
    assert_eq!(second, Response::Cancelled { had_pending: false });
}

#[tokio::test]
async fn delete_of_nonexistent_repository_is_not_found() {
    let mut host = MockRepositoryHost::new();
    host.expect_get_repository().returning(|_| Ok(None));
    host.expect_delete_repository().never();
    let coordinator = coordinator(host);

    let err = coordinator
        .submit_command(&owner(), "/del", &args(&["nonexistent"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert!(err.to_string().contains("nonexistent"));
}

#[tokio::test]
async fn visibility_commands_are_idempotent() {
    let mut host = MockRepositoryHost::new();
    host.expect_get_repository()
        .returning(|name| Ok(Some(metadata(name, Visibility::Private))));
    host.expect_set_visibility().never();
    let coordinator = coordinator(host);

    let response = coordinator
        .submit_command(&owner(), "/priv", &args(&["demo"]))
        .await
        .unwrap();
    assert_eq!(response.to_string(), "demo is already private");
}

#[tokio::test]
async fn corrupt_archive_is_reported_without_remote_changes() {
    let mut host = MockRepositoryHost::new();
    host.expect_create_repository().never();
    host.expect_push_tree().never();
    let coordinator = coordinator(host);

    coordinator
        .submit_command(&owner(), "/upload", &args(&["demo"]))
        .await
        .unwrap();
    let nested = ArchivePayload::new(
        None,
        zip_bytes(&[("demo/", b""), ("demo/main.py", b"print(1)")]),
    );
    let err = coordinator.submit_artifact(&owner(), nested).await.unwrap_err();
    assert_eq!(err.kind(), "archive");
    assert!(
        err.to_string().starts_with("archive rejected (wrong_structure): "),
        "got: {err}"
    );
}

#[tokio::test]
async fn command_arriving_during_extraction_cancels_the_run() {
    let mut host = MockRepositoryHost::new();
    host.expect_get_repository().never();
    host.expect_create_repository().never();
    host.expect_push_tree().never();
    let coordinator = coordinator(host);
    let operator = owner();

    let demo_args = args(&["demo"]);
    coordinator
        .submit_command(&operator, "/upload", &demo_args)
        .await
        .unwrap();

    // The archive takes the session first; /help lands while extraction runs off-thread.
    let (artifact, help) = tokio::join!(
        coordinator.submit_artifact(&operator, python_archive()),
        coordinator.submit_command(&operator, "/help", &[]),
    );

    assert_eq!(artifact.unwrap_err(), PipelineError::Cancelled);
    assert!(matches!(help.unwrap(), Response::Help(_)));
    assert!(!coordinator.is_awaiting_archive().await);
    assert_eq!(coordinator.published(), 0);
}

#[tokio::test]
async fn invalid_repository_name_is_rejected_at_parse_time() {
    let coordinator = coordinator(MockRepositoryHost::new());
    let err = coordinator
        .submit_command(&owner(), "/upload", &args(&["bad name?"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_name");
}

#[test]
fn update_accepts_template_in_either_position() {
    let expected = Command::Update {
        mode: Mode::Template,
        name: "demo".to_string(),
    };
    assert_eq!(
        Command::parse("/update_repo", &args(&["demo", "template"])).unwrap(),
        expected
    );
    assert_eq!(
        Command::parse("UPD_REPO", &args(&["template", "demo"])).unwrap(),
        expected
    );
    assert!(Command::parse("/update_repo", &args(&["template"])).is_err());
    assert_eq!(Command::parse("/start", &[]).unwrap(), Command::Help);
}

#[tokio::test]
async fn info_reports_overview_and_published_count() {
    let mut host = MockRepositoryHost::new();
    host.expect_list_repositories().returning(|| {
        let mut repo = metadata("alpha", Visibility::Public);
        repo.stars = 3;
        repo.description = Some("first".into());
        Ok(vec![repo, metadata("beta", Visibility::Private)])
    });
    let coordinator = coordinator(host);

    let response = coordinator.submit_command(&owner(), "/info", &[]).await.unwrap();
    let text = response.to_string();
    assert!(text.contains("Repositories: 2"));
    assert!(text.contains("Published by this process: 0"));
    assert!(text.contains("- alpha (3 stars): first"));
}

/// Holds every repository lookup until released.
struct GatedHost {
    gate: Arc<Notify>,
}

#[async_trait]
impl RepositoryHost for GatedHost {
    async fn get_repository(&self, name: &str) -> Result<Option<RepositoryMetadata>, HostError> {
        self.gate.notified().await;
        Ok(Some(metadata(name, Visibility::Public)))
    }
    async fn create_repository(&self, _req: NewRepository) -> Result<RepositoryMetadata, HostError> {
        unreachable!("not used")
    }
    async fn list_contents(&self, _name: &str, _branch: &str) -> Result<RemoteTree, HostError> {
        unreachable!("not used")
    }
    async fn push_tree(&self, _name: &str, _commit: TreeCommit) -> Result<CommitInfo, HostError> {
        unreachable!("not used")
    }
    async fn set_visibility(
        &self,
        _name: &str,
        _visibility: Visibility,
    ) -> Result<RepositoryMetadata, HostError> {
        unreachable!("not used")
    }
    async fn delete_repository(&self, _name: &str) -> Result<(), HostError> {
        unreachable!("not used")
    }
    async fn list_repositories(&self) -> Result<Vec<RepositoryMetadata>, HostError> {
        unreachable!("not used")
    }
}

#[tokio::test]
async fn command_arriving_during_a_lookup_cancels_the_older_one() {
    let gate = Arc::new(Notify::new());
    let coordinator = Coordinator::new(
        owner(),
        GatedHost { gate: gate.clone() },
        PipelineOptions::default(),
    );
    let operator = owner();

    let demo_args = args(&["demo"]);
    let update = coordinator.submit_command(&operator, "/update_repo", &demo_args);
    let cancel = async {
        let response = coordinator.submit_command(&operator, "/cancel", &[]).await;
        gate.notify_one();
        response
    };
    let (update, cancel) = tokio::join!(update, cancel);

    assert_eq!(update.unwrap_err(), PipelineError::Cancelled);
    assert_eq!(cancel.unwrap(), Response::Cancelled { had_pending: false });
    assert!(!coordinator.is_awaiting_archive().await);
}
