//! Exercises `GitHubGateway` against an in-process fake of the GitHub REST
//! endpoints it uses.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use base64::Engine;
use chat_tree_sync::chat::ChatSession;
use chat_tree_sync::config::GitHubConfig;
use chat_tree_sync::gateway::GatewayError;
use chat_tree_sync::{GitHubGateway, NodeKind, RepositoryGateway};
use serde_json::{json, Value};

const TOKEN: &str = "test-token";
const BRANCHES: &[&str] = &["main", "feature/x"];

struct StoredFile {
    content: String,
    sha: String,
}

#[derive(Debug, Clone)]
struct PutRecord {
    path: String,
    message: String,
    sha: Option<String>,
    branch: Option<String>,
    content: String,
}

#[derive(Default)]
struct FakeRepo {
    files: BTreeMap<String, StoredFile>,
    puts: Vec<PutRecord>,
    tree_failures: u32,
    /// PUTs that are applied and then answered with a 502 anyway.
    lost_put_replies: u32,
    broken_paths: HashSet<String>,
    next_sha: u32,
}

impl FakeRepo {
    fn seed(&mut self, path: &str, content: &str) {
        self.next_sha += 1;
        self.files.insert(
            path.to_string(),
            StoredFile {
                content: base64::engine::general_purpose::STANDARD.encode(content),
                sha: format!("sha{}", self.next_sha),
            },
        );
    }
}

type Shared = Arc<Mutex<FakeRepo>>;
type Reply = (StatusCode, Json<Value>);

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("token {}", TOKEN))
}

fn message(status: StatusCode, text: &str) -> Reply {
    (status, Json(json!({ "message": text })))
}

async fn get_tree(
    State(repo): State<Shared>,
    headers: HeaderMap,
    Path((_owner, _repo, branch)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Reply {
    if !authorized(&headers) {
        return message(StatusCode::UNAUTHORIZED, "Bad credentials");
    }
    let mut repo = repo.lock().unwrap();
    if repo.tree_failures > 0 {
        repo.tree_failures -= 1;
        return message(StatusCode::BAD_GATEWAY, "Server Error");
    }
    if !BRANCHES.contains(&branch.as_str()) || query.get("recursive").map(String::as_str) != Some("1") {
        return message(StatusCode::NOT_FOUND, "Not Found");
    }

    let mut entries = Vec::new();
    let mut dirs = BTreeSet::new();
    for path in repo.files.keys() {
        let segments: Vec<&str> = path.split('/').collect();
        for depth in 1..segments.len() {
            let dir = segments[..depth].join("/");
            if dirs.insert(dir.clone()) {
                entries.push(json!({"path": dir, "type": "tree", "sha": "d"}));
            }
        }
        entries.push(json!({"path": path, "type": "blob", "sha": "f"}));
    }
    (
        StatusCode::OK,
        Json(json!({"sha": "head", "tree": entries, "truncated": false})),
    )
}

async fn get_contents(
    State(repo): State<Shared>,
    headers: HeaderMap,
    Path((_owner, _repo, path)): Path<(String, String, String)>,
) -> Reply {
    if !authorized(&headers) {
        return message(StatusCode::UNAUTHORIZED, "Bad credentials");
    }
    let repo = repo.lock().unwrap();
    if repo.broken_paths.contains(&path) {
        return message(StatusCode::INTERNAL_SERVER_ERROR, "Server Error");
    }
    match repo.files.get(&path) {
        Some(file) => (
            StatusCode::OK,
            Json(json!({
                "type": "file",
                "path": path,
                "sha": file.sha,
                "encoding": "base64",
                "content": file.content,
            })),
        ),
        None => message(StatusCode::NOT_FOUND, "Not Found"),
    }
}

async fn put_contents(
    State(repo): State<Shared>,
    headers: HeaderMap,
    Path((_owner, _repo, path)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Reply {
    if !authorized(&headers) {
        return message(StatusCode::UNAUTHORIZED, "Bad credentials");
    }
    let mut repo = repo.lock().unwrap();
    let given = body.get("sha").and_then(Value::as_str).map(str::to_string);
    let current = repo.files.get(&path).map(|f| f.sha.clone());
    match (&current, &given) {
        (Some(_), None) => {
            return message(StatusCode::UNPROCESSABLE_ENTITY, "\"sha\" wasn't supplied.")
        }
        (Some(cur), Some(sha)) if cur != sha => {
            return message(StatusCode::CONFLICT, "sha does not match")
        }
        _ => {}
    }

    let content = body["content"].as_str().unwrap_or_default().to_string();
    repo.puts.push(PutRecord {
        path: path.clone(),
        message: body["message"].as_str().unwrap_or_default().to_string(),
        sha: given,
        branch: body["branch"].as_str().map(str::to_string),
        content: content.clone(),
    });
    repo.next_sha += 1;
    let sha = format!("sha{}", repo.next_sha);
    repo.files.insert(path.clone(), StoredFile { content, sha });

    if repo.lost_put_replies > 0 {
        repo.lost_put_replies -= 1;
        return message(StatusCode::BAD_GATEWAY, "Server Error");
    }

    let status = if current.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(json!({"content": {"path": path}})))
}

async fn start_fake(repo: Shared) -> SocketAddr {
    let app = Router::new()
        .route("/repos/{owner}/{repo}/git/trees/{*branch}", get(get_tree))
        .route(
            "/repos/{owner}/{repo}/contents/{*path}",
            get(get_contents).put(put_contents),
        )
        .with_state(repo);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn config(addr: SocketAddr) -> GitHubConfig {
    GitHubConfig {
        owner: "octo".into(),
        repo: "site".into(),
        token: Some(TOKEN.into()),
        api_url: format!("http://{}", addr),
        timeout_secs: 5,
        retry_backoff_ms: 1,
        ..GitHubConfig::default()
    }
}

async fn setup(seed: &[(&str, &str)]) -> (GitHubGateway, Shared) {
    let repo: Shared = Arc::default();
    {
        let mut guard = repo.lock().unwrap();
        for (path, content) in seed {
            guard.seed(path, content);
        }
    }
    let addr = start_fake(repo.clone()).await;
    (GitHubGateway::new(&config(addr)).unwrap(), repo)
}

fn decode(content: &str) -> String {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(content)
        .unwrap();
    String::from_utf8(bytes).unwrap()
}

#[tokio::test]
async fn test_fetch_tree_rebuilds_hierarchy() {
    let (gateway, _) = setup(&[("src/index.js", "a"), ("src/lib/math.js", "b"), ("README.md", "c")]).await;

    let tree = gateway.fetch_tree().await.unwrap();
    assert_eq!(tree.find("src/lib").unwrap().kind(), NodeKind::Directory);
    assert!(tree.find("src/lib/math.js").unwrap().is_file());
    assert!(tree.find("README.md").unwrap().is_file());
    // The listing carries no bodies.
    assert_eq!(tree.find("src/index.js").unwrap().content(), Some(""));
    assert_eq!(tree.files().len(), 3);
}

#[tokio::test]
async fn test_fetch_tree_retries_transient_failures() {
    let (gateway, repo) = setup(&[("a.txt", "a")]).await;

    repo.lock().unwrap().tree_failures = 2;
    assert!(gateway.fetch_tree().await.is_some());

    repo.lock().unwrap().tree_failures = 3;
    assert!(gateway.fetch_tree().await.is_none());
}

#[tokio::test]
async fn test_fetch_tree_unknown_branch() {
    let repo: Shared = Arc::default();
    let addr = start_fake(repo).await;
    let gateway = GitHubGateway::new(&GitHubConfig {
        branch: "release".into(),
        ..config(addr)
    })
    .unwrap();
    assert_eq!(gateway.branch(), "release");
    assert!(gateway.fetch_tree().await.is_none());
}

#[tokio::test]
async fn test_path_exists() {
    let (gateway, repo) = setup(&[("src/util.js", "x"), ("docs/my file.md", "y")]).await;

    assert!(gateway.path_exists("src/util.js").await);
    assert!(gateway.path_exists("docs/my file.md").await);
    assert!(!gateway.path_exists("src/missing.js").await);

    repo.lock().unwrap().broken_paths.insert("src/util.js".into());
    assert!(!gateway.path_exists("src/util.js").await);
}

#[tokio::test]
async fn test_write_file_creates_then_updates() {
    let (gateway, repo) = setup(&[]).await;

    gateway.write_file("src/new.js", "let a = 1;").await.unwrap();
    gateway.write_file("src/new.js", "let a = 2;").await.unwrap();

    let repo = repo.lock().unwrap();
    let puts = repo.puts.clone();
    assert_eq!(puts.len(), 2);

    assert_eq!(puts[0].path, "src/new.js");
    assert_eq!(puts[0].message, "Update file src/new.js");
    assert_eq!(puts[0].sha, None);
    assert_eq!(puts[0].branch.as_deref(), Some("main"));
    assert_eq!(decode(&puts[0].content), "let a = 1;");

    assert_eq!(puts[1].sha.as_deref(), Some("sha1"));
    assert_eq!(decode(&puts[1].content), "let a = 2;");
    assert_eq!(decode(&repo.files["src/new.js"].content), "let a = 2;");
}

#[tokio::test]
async fn test_write_file_retry_after_applied_put() {
    let (gateway, repo) = setup(&[("a.txt", "old")]).await;
    repo.lock().unwrap().lost_put_replies = 1;

    gateway.write_file("a.txt", "new").await.unwrap();

    let repo = repo.lock().unwrap();
    assert_eq!(repo.puts.len(), 2);
    assert_eq!(repo.puts[0].sha.as_deref(), Some("sha1"));
    // The retry carries the sha produced by the first, already applied PUT.
    assert_eq!(repo.puts[1].sha.as_deref(), Some("sha2"));
    assert_eq!(decode(&repo.files["a.txt"].content), "new");
}

#[tokio::test]
async fn test_create_retry_after_applied_put() {
    let (gateway, repo) = setup(&[]).await;
    repo.lock().unwrap().lost_put_replies = 1;

    gateway.write_file("docs/new.md", "# new").await.unwrap();

    let repo = repo.lock().unwrap();
    assert_eq!(repo.puts.len(), 2);
    assert_eq!(repo.puts[0].sha, None);
    assert_eq!(repo.puts[1].sha.as_deref(), Some("sha1"));
    assert_eq!(decode(&repo.files["docs/new.md"].content), "# new");
}

#[tokio::test]
async fn test_branch_with_slash() {
    let repo: Shared = Arc::default();
    repo.lock().unwrap().seed("src/a.js", "a");
    let addr = start_fake(repo.clone()).await;
    let gateway = GitHubGateway::new(&GitHubConfig {
        branch: "feature/x".into(),
        ..config(addr)
    })
    .unwrap();

    let tree = gateway.fetch_tree().await.unwrap();
    assert!(tree.find("src/a.js").unwrap().is_file());

    gateway.write_file("src/a.js", "b").await.unwrap();
    let puts = repo.lock().unwrap().puts.clone();
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].branch.as_deref(), Some("feature/x"));
    assert_eq!(puts[0].sha.as_deref(), Some("sha1"));
}

#[tokio::test]
async fn test_write_file_rejected() {
    let repo: Shared = Arc::default();
    let addr = start_fake(repo.clone()).await;
    let gateway = GitHubGateway::new(&GitHubConfig {
        token: Some("wrong".into()),
        ..config(addr)
    })
    .unwrap();

    let err = gateway.write_file("a.txt", "x").await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Status { status, .. } if status == StatusCode::UNAUTHORIZED
    ));
    assert!(repo.lock().unwrap().puts.is_empty());
    assert!(gateway.fetch_tree().await.is_none());
    assert!(!gateway.path_exists("a.txt").await);
}

#[tokio::test]
async fn test_chat_session_against_fake_github() {
    let (gateway, repo) = setup(&[("src/util.js", "old"), ("README.md", "# site")]).await;
    let mut chat = ChatSession::new(Some(Arc::new(gateway)));

    // No local tree: the listing is fetched, then the existing file updated.
    let reply = chat
        .send("Fichier: src/util.js\nexport const add = (a, b) => a + b;\nResumer: adds numbers")
        .await
        .unwrap();
    assert!(reply.content.contains("adds numbers"));
    assert!(chat.tree().unwrap().find("README.md").is_some());

    // Unknown file: created remotely without a revision marker.
    chat.send("Fichier: src/lib/sub.js\nexport const sub = (a, b) => a - b;\nResumer: subtracts")
        .await
        .unwrap();

    let repo = repo.lock().unwrap();
    let puts = repo.puts.clone();
    assert_eq!(puts.len(), 2);
    assert_eq!(puts[0].path, "src/util.js");
    assert!(puts[0].sha.is_some());
    assert_eq!(decode(&puts[0].content), "export const add = (a, b) => a + b;");
    assert_eq!(puts[1].path, "src/lib/sub.js");
    assert!(puts[1].sha.is_none());
    assert_eq!(
        chat.tree().unwrap().find("src/lib/sub.js").unwrap().summary(),
        Some("subtracts")
    );
}
