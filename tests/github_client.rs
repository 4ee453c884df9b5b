use std::time::Duration;

use mockito::{Matcher, Server, ServerGuard};
use repo_courier::contract::{
    BlobSource, FileMode, HostError, NewRepository, RepositoryHost, TreeCommit, TreeEntry,
    Visibility,
};
use repo_courier::github::GitHubClient;
use serde_json::json;

const TOKEN: &str = "ghp_test_token";

fn repo_json(name: &str, private: bool) -> String {
    json!({
        "name": name,
        "html_url": format!("https://github.com/octo/{name}"),
        "private": private,
        "default_branch": "main",
        "description": "Published with repo-courier",
        "language": "Python",
        "stargazers_count": 7,
        "forks_count": 2,
        "watchers_count": 7,
        "size": 12,
        "updated_at": "2024-05-01T10:00:00Z"
    })
    .to_string()
}

async fn server_with_login() -> (ServerGuard, mockito::Mock) {
    let mut server = Server::new_async().await;
    let login = server
        .mock("GET", "/user")
        .match_header("authorization", format!("Bearer {TOKEN}").as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"login":"octo"}"#)
        .expect(1)
        .create_async()
        .await;
    (server, login)
}

fn client(server: &ServerGuard) -> GitHubClient {
    GitHubClient::new(server.url(), TOKEN, Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn metadata_is_mapped_and_login_fetched_once() {
    let (mut server, login) = server_with_login().await;
    let repo = server
        .mock("GET", "/repos/octo/demo")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(repo_json("demo", true))
        .expect(2)
        .create_async()
        .await;
    let github = client(&server);

    let meta = github.get_repository("demo").await.unwrap().expect("exists");
    assert_eq!(meta.url, "https://github.com/octo/demo");
    assert_eq!(meta.visibility, Visibility::Private);
    assert_eq!(meta.stars, 7);
    assert_eq!(meta.size_kb, 12);
    assert_eq!(meta.language.as_deref(), Some("Python"));
    github.get_repository("demo").await.unwrap();

    login.assert_async().await;
    repo.assert_async().await;
}

#[tokio::test]
async fn missing_repository_is_none() {
    let (mut server, _login) = server_with_login().await;
    server
        .mock("GET", "/repos/octo/ghost")
        .with_status(404)
        .with_body(r#"{"message":"Not Found"}"#)
        .create_async()
        .await;

    assert_eq!(client(&server).get_repository("ghost").await.unwrap(), None);
}

#[tokio::test]
async fn rejected_token_is_bad_credentials() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/user")
        .with_status(401)
        .with_body(r#"{"message":"Bad credentials"}"#)
        .create_async()
        .await;

    let err = client(&server).login().await.unwrap_err();
    assert_eq!(err, HostError::BadCredentials("Bad credentials".to_string()));
}

#[tokio::test]
async fn create_sends_visibility_and_maps_name_clash() {
    let (mut server, _login) = server_with_login().await;
    let created = server
        .mock("POST", "/user/repos")
        .match_body(Matcher::PartialJson(
            json!({"name": "fresh", "private": false, "auto_init": true}),
        ))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(repo_json("fresh", false))
        .create_async()
        .await;
    server
        .mock("POST", "/user/repos")
        .match_body(Matcher::PartialJson(json!({"name": "taken"})))
        .with_status(422)
        .with_body(r#"{"message":"Repository creation failed."}"#)
        .create_async()
        .await;
    let github = client(&server);

    let meta = github
        .create_repository(NewRepository {
            name: "fresh".into(),
            description: "Published with repo-courier".into(),
            visibility: Visibility::Public,
        })
        .await
        .unwrap();
    assert_eq!(meta.name, "fresh");
    created.assert_async().await;

    let err = github
        .create_repository(NewRepository {
            name: "taken".into(),
            description: String::new(),
            visibility: Visibility::Private,
        })
        .await
        .unwrap_err();
    assert_eq!(err, HostError::AlreadyExists("taken".to_string()));
}

#[tokio::test]
async fn delete_distinguishes_scope_from_success() {
    let (mut server, _login) = server_with_login().await;
    server
        .mock("DELETE", "/repos/octo/locked")
        .with_status(403)
        .with_body(r#"{"message":"Must have admin rights to Repository."}"#)
        .create_async()
        .await;
    let deleted = server
        .mock("DELETE", "/repos/octo/gone")
        .with_status(204)
        .create_async()
        .await;
    let github = client(&server);

    let err = github.delete_repository("locked").await.unwrap_err();
    assert!(matches!(err, HostError::InsufficientScope(_)), "got {err:?}");
    github.delete_repository("gone").await.unwrap();
    deleted.assert_async().await;
}

#[tokio::test]
async fn exhausted_rate_limit_is_not_a_scope_error() {
    let (mut server, _login) = server_with_login().await;
    server
        .mock("DELETE", "/repos/octo/busy")
        .with_status(403)
        .with_header("x-ratelimit-remaining", "0")
        .with_body(r#"{"message":"API rate limit exceeded for user ID 1."}"#)
        .create_async()
        .await;

    let err = client(&server).delete_repository("busy").await.unwrap_err();
    assert_eq!(
        err,
        HostError::Api {
            status: 403,
            message: "API rate limit exceeded for user ID 1.".to_string(),
        }
    );
}

#[tokio::test]
async fn empty_repository_lists_no_files() {
    let (mut server, _login) = server_with_login().await;
    server
        .mock("GET", "/repos/octo/empty/git/ref/heads/main")
        .with_status(409)
        .with_body(r#"{"message":"Git Repository is empty."}"#)
        .create_async()
        .await;

    let tree = client(&server).list_contents("empty", "main").await.unwrap();
    assert_eq!(tree.head, None);
    assert!(tree.files.is_empty());
}

#[tokio::test]
async fn listing_keeps_only_blobs() {
    let (mut server, _login) = server_with_login().await;
    server
        .mock("GET", "/repos/octo/demo/git/ref/heads/main")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"ref":"refs/heads/main","object":{"sha":"head1","type":"commit"}}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/repos/octo/demo/git/trees/head1?recursive=1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "sha": "tree1",
                "truncated": false,
                "tree": [
                    {"path": "src", "type": "tree", "sha": "t-src", "mode": "040000"},
                    {"path": "src/main.py", "type": "blob", "sha": "b-main", "mode": "100644"},
                    {"path": "README.md", "type": "blob", "sha": "b-readme", "mode": "100644"},
                    {"path": "run.sh", "type": "blob", "sha": "b-run", "mode": "100755"}
                ]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let tree = client(&server).list_contents("demo", "main").await.unwrap();
    assert_eq!(tree.head.as_deref(), Some("head1"));
    let paths: Vec<&str> = tree.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["src/main.py", "README.md", "run.sh"]);
    assert_eq!(tree.files[0].blob_id, "b-main");
    assert_eq!(tree.files[0].mode, FileMode::Regular);
    assert_eq!(tree.files[2].mode, FileMode::Executable);
}

#[tokio::test]
async fn root_commit_push_uploads_blobs_and_force_moves_branch() {
    let (mut server, _login) = server_with_login().await;
    let blob = server
        .mock("POST", "/repos/octo/demo/git/blobs")
        .match_body(Matcher::PartialJson(
            json!({"content": "aGVsbG8K", "encoding": "base64"}),
        ))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"sha":"blob-new"}"#)
        .expect(1)
        .create_async()
        .await;
    let tree = server
        .mock("POST", "/repos/octo/demo/git/trees")
        .match_body(Matcher::PartialJson(json!({
            "tree": [
                {"path": "README.md", "mode": "100644", "type": "blob", "sha": "blob-kept"},
                {"path": "hello.txt", "mode": "100644", "type": "blob", "sha": "blob-new"},
                {"path": "run.sh", "mode": "100755", "type": "blob", "sha": "blob-run"}
            ]
        })))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"sha":"tree-1"}"#)
        .create_async()
        .await;
    let commit = server
        .mock("POST", "/repos/octo/demo/git/commits")
        .match_body(Matcher::PartialJson(
            json!({"message": "Initial commit", "tree": "tree-1", "parents": []}),
        ))
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(r#"{"sha":"commit-1","html_url":"https://github.com/octo/demo/commit/commit-1"}"#)
        .create_async()
        .await;
    let moved = server
        .mock("PATCH", "/repos/octo/demo/git/refs/heads/main")
        .match_body(Matcher::PartialJson(json!({"sha": "commit-1", "force": true})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"ref":"refs/heads/main","object":{"sha":"commit-1"}}"#)
        .create_async()
        .await;

    let info = client(&server)
        .push_tree(
            "demo",
            TreeCommit {
                branch: "main".into(),
                message: "Initial commit".into(),
                parent: None,
                entries: vec![
                    TreeEntry {
                        path: "README.md".into(),
                        source: BlobSource::Existing("blob-kept".into()),
                        mode: FileMode::Regular,
                    },
                    TreeEntry {
                        path: "hello.txt".into(),
                        source: BlobSource::Upload(b"hello\n".to_vec()),
                        mode: FileMode::Regular,
                    },
                    TreeEntry {
                        path: "run.sh".into(),
                        source: BlobSource::Existing("blob-run".into()),
                        mode: FileMode::Executable,
                    },
                ],
            },
        )
        .await
        .unwrap();

    assert_eq!(info.id, "commit-1");
    assert_eq!(
        info.url.as_deref(),
        Some("https://github.com/octo/demo/commit/commit-1")
    );
    blob.assert_async().await;
    tree.assert_async().await;
    commit.assert_async().await;
    moved.assert_async().await;
}

#[tokio::test]
async fn visibility_change_patches_private_flag() {
    let (mut server, _login) = server_with_login().await;
    server
        .mock("PATCH", "/repos/octo/demo")
        .match_body(Matcher::Json(json!({"private": true})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(repo_json("demo", true))
        .create_async()
        .await;

    let meta = client(&server)
        .set_visibility("demo", Visibility::Private)
        .await
        .unwrap();
    assert_eq!(meta.visibility, Visibility::Private);
}

#[tokio::test]
async fn repositories_are_listed_most_recent_first() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/user/repos")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("sort".into(), "updated".into()),
            Matcher::UrlEncoded("page".into(), "1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!("[{},{}]", repo_json("newest", false), repo_json("older", true)))
        .create_async()
        .await;

    let repos = client(&server).list_repositories().await.unwrap();
    let names: Vec<&str> = repos.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["newest", "older"]);
    assert_eq!(repos[1].visibility, Visibility::Private);
}
