use std::path::{Path, PathBuf};
use std::sync::Arc;

use backup_daemon::{build_router, AppState, BackupDaemon, EvictionPolicies};
use backup_daemon_executor::{CommandTemplates, Executor};
use backup_daemon_storage::{SqliteJobStore, VaultRepository, VaultSettings};
use serde_json::{json, Value};

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    root: PathBuf,
    _tmp: tempfile::TempDir,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }
}

fn executor() -> Executor {
    Executor::new(
        CommandTemplates {
            backup: "sh -c 'echo dumping; echo data > {{.data_folder}}/dump.tar'".into(),
            restore: "sh -c 'echo restoring {{.data_folder}}'".into(),
            evict: "true {{.data_folder}}".into(),
            db_list: "sh -c 'echo db1; echo db2'".into(),
        },
        vec!["clean".into(), "storageName".into(), "blob_path".into()],
        "--dbs",
        "--dbmap",
    )
}

async fn start_server(full_policy: &str) -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("storage");
    std::fs::create_dir_all(&root).unwrap();
    let vaults = VaultRepository::new(VaultSettings {
        root: root.clone(),
        external_root: tmp.path().join("external"),
        namespace: "default".into(),
        allow_prefix: false,
        skip_lock_check: false,
    })
    .unwrap();
    let jobs = SqliteJobStore::new(tmp.path().join("database.db")).unwrap();
    let daemon = BackupDaemon::new(
        vaults,
        Arc::new(jobs),
        Arc::new(executor()),
        None,
        EvictionPolicies {
            full: full_policy.into(),
            granular: "5".into(),
        },
    )
    .with_scratch_root(tmp.path().join("scratch"));

    let app = build_router(AppState { daemon });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        root,
        _tmp: tmp,
        _handle: handle,
    }
}

fn make_vault(root: &Path, name: &str) {
    std::fs::create_dir_all(root.join(name)).unwrap();
}

#[tokio::test]
async fn health_and_unknown_routes() {
    let server = start_server("5").await;
    let (status, body) = server.get("/health").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"message": "OK"}));

    let (status, body) = server.get("/nope").await;
    assert_eq!(status, 404);
    assert_eq!(body["message"], "Page not found");
}

#[tokio::test]
async fn backup_then_restore() {
    let server = start_server("5").await;
    let resp = server
        .client
        .post(server.url("/backup"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    let backup_id = body["backup_id"].as_str().unwrap().to_string();

    let folder = server.root.join(&backup_id);
    assert!(folder.join("dump.tar").is_file());
    assert!(folder.join(".console").is_file());
    assert!(folder.join(".metrics").is_file());

    let (status, job) = server.get(&format!("/jobstatus/{backup_id}")).await;
    assert_eq!(status, 200);
    assert_eq!(job["status"], "Successful");
    assert_eq!(job["type"], "backup");
    assert_eq!(job["vault"], backup_id.as_str());

    let (status, body) = server
        .post(
            "/restore",
            json!({"vault": backup_id, "dbs": ["db1"], "changeDbNames": {"db1": "db1_copy"}}),
        )
        .await;
    assert_eq!(status, 200);
    let task_id = body["task_id"].as_str().unwrap().to_string();

    let (status, job) = server.get(&format!("/jobstatus/{task_id}")).await;
    assert_eq!(status, 200);
    assert_eq!(job["type"], "restore");
    assert_eq!(job["databases"], json!(["db1_copy"]));
    assert!(folder.join("restore_logs").join(format!("{task_id}.log")).is_file());

    let archive = server
        .client
        .get(server.url(&format!("/backup/{backup_id}/archive/dump.tar")))
        .send()
        .await
        .unwrap();
    assert_eq!(archive.status().as_u16(), 200);
    assert_eq!(archive.text().await.unwrap(), "data\n");
}

#[tokio::test]
async fn restore_rejections() {
    let server = start_server("5").await;
    make_vault(&server.root, "20240101T000000");

    let (status, body) = server.post("/restore", json!({"dbs": ["db1"]})).await;
    assert_eq!(status, 404);
    assert!(body["message"].as_str().unwrap().contains("wrong JSON"));

    let (status, body) = server
        .post("/restore", json!({"vault": "20240101T000000", "dbs": ["ghost"]}))
        .await;
    assert_eq!(status, 400);
    assert!(body["message"].as_str().unwrap().contains("ghost"));

    let (status, _) = server
        .post("/restore", json!({"vault": "20991231T000000"}))
        .await;
    assert_eq!(status, 404);

    let (status, _) = server.post("/restore", json!({"ts": "soon"})).await;
    assert_eq!(status, 400);

    let (status, body) = server.get("/jobstatus/unknown-task").await;
    assert_eq!(status, 404);
    assert!(body["message"].as_str().unwrap().contains("unknown-task"));
}

#[tokio::test]
async fn incremental_routes_mark_jobs() {
    let server = start_server("5").await;
    make_vault(&server.root, "20200101T000000");

    let (status, body) = server.post("/incremental/backup", json!({})).await;
    assert_eq!(status, 200);
    let backup_id = body["backup_id"].as_str().unwrap().to_string();

    let (status, job) = server.get(&format!("/incremental/jobstatus/{backup_id}")).await;
    assert_eq!(status, 200);
    assert_eq!(job["type"], "incremental backup");

    let vars = std::fs::read_to_string(server.root.join(&backup_id).join(".custom_vars")).unwrap();
    let vars: Value = serde_json::from_str(&vars).unwrap();
    assert_eq!(vars["start_ts"], "1577836800000");
}

#[tokio::test]
async fn eviction_routes() {
    let server = start_server("1").await;
    for name in ["20240101T000000", "20240102T000000"] {
        make_vault(&server.root, name);
    }
    std::fs::write(server.root.join("20240102T000000/.lock"), b"").unwrap();

    let (status, _) = server.post("/evict/20240102T000000", json!({})).await;
    assert_eq!(status, 409);
    let (status, _) = server.post("/evict/20991231T000000", json!({})).await;
    assert_eq!(status, 404);

    std::fs::remove_file(server.root.join("20240102T000000/.lock")).unwrap();
    let (status, body) = server.post("/evict", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "OK");
    assert!(!server.root.join("20240101T000000").exists());
    assert!(server.root.join("20240102T000000").exists());

    let (status, _) = server.post("/evict/20240102T000000", json!({})).await;
    assert_eq!(status, 200);
    assert!(!server.root.join("20240102T000000").exists());
}

#[tokio::test]
async fn api_v1_lifecycle() {
    let server = start_server("5").await;

    let (status, body) = server.post("/api/v1/backup", json!({"storageName": "s1"})).await;
    assert_eq!(status, 400);
    assert!(body["message"].as_str().unwrap().contains("blobPath"));

    let (status, body) = server
        .post(
            "/api/v1/backup",
            json!({"storageName": "s1", "blobPath": "/tenant/", "databases": ["db1"]}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["blobPath"], "tenant");
    assert_eq!(body["databases"], json!([{"databaseName": "db1", "status": "completed"}]));
    let backup_id = body["backupId"].as_str().unwrap().to_string();

    let (status, body) = server.get(&format!("/api/v1/backup/{backup_id}")).await;
    assert_eq!(status, 200);
    assert_eq!(body["storageName"], "s1");

    let (status, _) = server
        .post(
            &format!("/api/v1/restore/{backup_id}"),
            json!({"blobPath": "tenant", "databases": [{"previousDatabaseName": "db1", "databaseName": ""}]}),
        )
        .await;
    assert_eq!(status, 400);

    let (status, body) = server
        .post(
            &format!("/api/v1/restore/{backup_id}"),
            json!({
                "storageName": "s1",
                "blobPath": "tenant",
                "databases": [{"previousDatabaseName": "db1", "databaseName": "db1_new"}]
            }),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "completed");
    let restore_id = body["restoreId"].as_str().unwrap().to_string();

    let (status, body) = server.get(&format!("/api/v1/restore/{restore_id}")).await;
    assert_eq!(status, 200);
    assert_eq!(body["databases"][0]["databaseName"], "db1_new");

    let (status, body) = server.get(&format!("/api/v1/restore/{backup_id}")).await;
    assert_eq!(status, 404);
    assert!(body["message"].as_str().unwrap().contains("not a restore task"));

    let resp = server
        .client
        .delete(server.url(&format!("/api/v1/backup/{backup_id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = server
        .client
        .delete(server.url(&format!("/api/v1/backup/{backup_id}?blobPath=tenant")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["backupId"], backup_id.as_str());

    let (status, _) = server.get(&format!("/api/v1/backup/{backup_id}")).await;
    assert_eq!(status, 404);
}
