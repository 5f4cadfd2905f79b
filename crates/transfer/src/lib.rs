//! Directory-tree transfers between local vaults and an object store bucket.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{ObjectMeta, ObjectStore, PutPayload, WriteMultipart};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

mod error;
mod s3;

pub use error::TransferError;
pub use s3::S3Settings;

/// Concurrent uploads per folder.
pub const WORKER_COUNT: usize = 3;
/// Chunks buffered between a file reader and its upload.
const CONDUIT_DEPTH: usize = 8;
const READ_CHUNK_SIZE: usize = 8 * 1024 * 1024;
const UPLOAD_PART_SIZE: usize = 8 * 1024 * 1024;
const MAX_IN_FLIGHT_PARTS: usize = 4;
const DOWNLOAD_PART_SIZE: u64 = 64 * 1024 * 1024;
const VISIBILITY_POLL: Duration = Duration::from_millis(500);
const VISIBILITY_CEILING: Duration = Duration::from_secs(60);
pub const DEFAULT_PRESIGN_EXPIRATION_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct ObjectTransfer {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    bucket: String,
    workers: usize,
}

impl ObjectTransfer {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            signer: None,
            bucket: bucket.into(),
            workers: WORKER_COUNT,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn can_presign(&self) -> bool {
        self.signer.is_some()
    }

    /// Uploads every regular file under `local_dir`. With a prefix the keys
    /// are `<prefix>/<relative path>`, otherwise the local path itself.
    pub async fn upload_folder(&self, local_dir: &Path, prefix: Option<&str>) -> Result<(), TransferError> {
        self.upload_folder_with_cancel(local_dir, prefix, CancellationToken::new())
            .await
    }

    /// Like [`upload_folder`](Self::upload_folder), stopping early once `cancel` fires.
    /// The first walker or worker error cancels the rest and is returned.
    pub async fn upload_folder_with_cancel(
        &self,
        local_dir: &Path,
        prefix: Option<&str>,
        cancel: CancellationToken,
    ) -> Result<(), TransferError> {
        let base = local_dir.to_path_buf();
        let prefix = prefix
            .map(|prefix| prefix.trim_matches('/').to_string())
            .filter(|prefix| !prefix.is_empty());
        let scope = cancel.child_token();
        let (tx, rx) = mpsc::channel::<PathBuf>(self.workers);
        let rx = Arc::new(Mutex::new(rx));
        let mut tasks: JoinSet<Result<(), TransferError>> = JoinSet::new();

        let walk_scope = scope.clone();
        let walk_base = base.clone();
        tasks.spawn_blocking(move || walk_files(&walk_base, &tx, &walk_scope));

        for _ in 0..self.workers {
            let this = self.clone();
            let rx = Arc::clone(&rx);
            let scope = scope.clone();
            let base = base.clone();
            let prefix = prefix.clone();
            tasks.spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = scope.cancelled() => return Err(TransferError::Cancelled),
                        next = async { rx.lock().await.recv().await } => next,
                    };
                    let Some(file) = next else {
                        return Ok(());
                    };
                    let key = object_key(&base, &file, prefix.as_deref())?;
                    this.upload_file(&file, &key, &scope).await?;
                }
            });
        }
        drop(rx);

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(TransferError::from).and_then(|result| result);
            if let Err(err) = outcome {
                if first_error.is_none() {
                    scope.cancel();
                    first_error = Some(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!(folder = %base.display(), bucket = %self.bucket, "folder uploaded");
                Ok(())
            }
        }
    }

    async fn upload_file(&self, source: &Path, key: &str, scope: &CancellationToken) -> Result<(), TransferError> {
        debug!(file = %source.display(), key, "uploading");
        let location = ObjectPath::from(key);
        let size = tokio::fs::metadata(source)
            .await
            .map_err(|source_err| TransferError::Io {
                context: "failed to stat",
                path: source.to_path_buf(),
                source: source_err,
            })?
            .len();
        if size < UPLOAD_PART_SIZE as u64 {
            return self.put_small_file(source, &location, key, scope).await;
        }

        let (tx, mut chunks) = mpsc::channel(CONDUIT_DEPTH);
        let reader = tokio::spawn(pump_file(source.to_path_buf(), tx));

        let upload = self
            .store
            .put_multipart(&location)
            .await
            .map_err(|err| self.upload_error(key, err))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, UPLOAD_PART_SIZE);

        loop {
            let chunk = tokio::select! {
                _ = scope.cancelled() => {
                    reader.abort();
                    let _ = writer.abort().await;
                    return Err(TransferError::Cancelled);
                }
                chunk = chunks.recv() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    if let Err(err) = writer.wait_for_capacity(MAX_IN_FLIGHT_PARTS).await {
                        reader.abort();
                        let _ = writer.abort().await;
                        return Err(self.upload_error(key, err));
                    }
                    writer.write(&bytes);
                }
                Some(Err(source_err)) => {
                    let _ = writer.abort().await;
                    return Err(TransferError::Io {
                        context: "failed to read",
                        path: source.to_path_buf(),
                        source: source_err,
                    });
                }
                None => break,
            }
        }

        writer.finish().await.map_err(|err| self.upload_error(key, err))?;
        self.wait_until_visible(&location, key).await
    }

    /// Files below one part go up in a single request.
    async fn put_small_file(
        &self,
        source: &Path,
        location: &ObjectPath,
        key: &str,
        scope: &CancellationToken,
    ) -> Result<(), TransferError> {
        let data = tokio::fs::read(source)
            .await
            .map_err(|source_err| TransferError::Io {
                context: "failed to read",
                path: source.to_path_buf(),
                source: source_err,
            })?;
        tokio::select! {
            _ = scope.cancelled() => return Err(TransferError::Cancelled),
            put = self.store.put(location, PutPayload::from(data)) => {
                put.map_err(|err| self.upload_error(key, err))?;
            }
        }
        self.wait_until_visible(location, key).await
    }

    fn upload_error(&self, key: &str, err: object_store::Error) -> TransferError {
        if err.to_string().contains("EntityTooLarge") {
            TransferError::TooLarge {
                bucket: self.bucket.clone(),
                key: key.to_string(),
            }
        } else {
            TransferError::Upload {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                source: err,
            }
        }
    }

    async fn wait_until_visible(&self, location: &ObjectPath, key: &str) -> Result<(), TransferError> {
        let poll = async {
            loop {
                match self.store.head(location).await {
                    Ok(_) => return Ok(()),
                    Err(object_store::Error::NotFound { .. }) => tokio::time::sleep(VISIBILITY_POLL).await,
                    Err(err) => return Err(self.upload_error(key, err)),
                }
            }
        };
        tokio::time::timeout(VISIBILITY_CEILING, poll)
            .await
            .map_err(|_| TransferError::NotVisible {
                bucket: self.bucket.clone(),
                key: key.to_string(),
            })?
    }

    /// Downloads every object under `remote_prefix` into `local_dir` and
    /// returns how many were written. An empty `local_dir` restores each key
    /// to its absolute path.
    pub async fn download_folder(&self, remote_prefix: &str, local_dir: &Path) -> Result<usize, TransferError> {
        let prefix = remote_prefix.trim_matches('/');
        let objects = self.list_objects(prefix).await?;
        info!(prefix, count = objects.len(), bucket = %self.bucket, "downloading folder");

        let mut downloaded = 0;
        for meta in objects {
            let key = meta.location.to_string();
            if key.starts_with('/') {
                continue;
            }
            let target = if local_dir.as_os_str().is_empty() {
                Path::new("/").join(&key)
            } else {
                local_dir.join(relative_key(prefix, &key)?)
            };
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| TransferError::Io {
                        context: "failed to create",
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
            self.download_object(&meta, &target).await?;
            downloaded += 1;
        }
        Ok(downloaded)
    }

    async fn download_object(&self, meta: &ObjectMeta, target: &Path) -> Result<(), TransferError> {
        let io_error = |source| TransferError::Io {
            context: "failed to write",
            path: target.to_path_buf(),
            source,
        };
        let mut file = File::create(target).await.map_err(io_error)?;
        let mut offset = 0;
        while offset < meta.size {
            let end = (offset + DOWNLOAD_PART_SIZE).min(meta.size);
            let part = self
                .store
                .get_range(&meta.location, offset..end)
                .await
                .map_err(|source| TransferError::Download {
                    bucket: self.bucket.clone(),
                    key: meta.location.to_string(),
                    source,
                })?;
            file.write_all(&part).await.map_err(io_error)?;
            offset = end;
        }
        file.flush().await.map_err(io_error)?;
        Ok(())
    }

    /// Keys of every object under `prefix`.
    pub async fn list_files(&self, prefix: &str) -> Result<Vec<String>, TransferError> {
        let objects = self.list_objects(prefix.trim_matches('/')).await?;
        Ok(objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectMeta>, TransferError> {
        let location = ObjectPath::from(prefix);
        let scope = (!prefix.is_empty()).then_some(&location);
        self.store
            .list(scope)
            .try_collect()
            .await
            .map_err(|source| TransferError::List {
                bucket: self.bucket.clone(),
                prefix: prefix.to_string(),
                source,
            })
    }

    /// Deletes everything under a non-empty prefix.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize, TransferError> {
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            return Err(TransferError::EmptyPrefix);
        }
        let location = ObjectPath::from(prefix);
        let listed = self
            .store
            .list(Some(&location))
            .map_ok(|meta| meta.location)
            .boxed();
        let deleted: Vec<ObjectPath> = self
            .store
            .delete_stream(listed)
            .try_collect()
            .await
            .map_err(|source| TransferError::Delete {
                bucket: self.bucket.clone(),
                prefix: prefix.to_string(),
                source,
            })?;
        info!(prefix, count = deleted.len(), bucket = %self.bucket, "deleted objects");
        Ok(deleted.len())
    }

    /// Presigned GET url, valid for `expiration_secs` or an hour when zero.
    pub async fn presigned_url(&self, key: &str, expiration_secs: u64) -> Result<String, TransferError> {
        let signer = self.signer.as_ref().ok_or(TransferError::SigningUnsupported)?;
        let expiration = if expiration_secs == 0 {
            DEFAULT_PRESIGN_EXPIRATION_SECS
        } else {
            expiration_secs
        };
        let url = signer
            .signed_url(
                http::Method::GET,
                &ObjectPath::from(key),
                Duration::from_secs(expiration),
            )
            .await
            .map_err(|source| TransferError::Sign {
                key: key.to_string(),
                source,
            })?;
        Ok(url.to_string())
    }
}

/// Feeds regular files under `base` to the workers.
fn walk_files(base: &Path, tx: &mpsc::Sender<PathBuf>, scope: &CancellationToken) -> Result<(), TransferError> {
    for entry in WalkDir::new(base) {
        if scope.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let entry = entry.map_err(|source| TransferError::Walk {
            path: base.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if tx.blocking_send(entry.into_path()).is_err() {
            // every worker has stopped; the error that stopped them wins
            return Ok(());
        }
    }
    Ok(())
}

async fn pump_file(path: PathBuf, tx: mpsc::Sender<io::Result<Bytes>>) {
    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            return;
        }
    };
    loop {
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
        match file.read_buf(&mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                if tx.send(Ok(buf.freeze())).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}

fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn object_key(base: &Path, file: &Path, prefix: Option<&str>) -> Result<String, TransferError> {
    match prefix {
        None => Ok(slash_path(file)),
        Some(prefix) => {
            let relative = file
                .strip_prefix(base)
                .map_err(|_| TransferError::RelativePath {
                    key: file.display().to_string(),
                    prefix: base.display().to_string(),
                })?;
            Ok(format!("{prefix}/{}", slash_path(relative)))
        }
    }
}

fn relative_key<'a>(prefix: &str, key: &'a str) -> Result<&'a str, TransferError> {
    if prefix.is_empty() {
        return Ok(key);
    }
    key.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| TransferError::RelativePath {
            key: key.to_string(),
            prefix: prefix.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use object_store::local::LocalFileSystem;
    use object_store::memory::InMemory;
    use url::Url;

    use super::*;

    #[derive(Debug)]
    struct FakeSigner;

    #[async_trait::async_trait]
    impl Signer for FakeSigner {
        async fn signed_url(
            &self,
            method: http::Method,
            path: &ObjectPath,
            expires_in: Duration,
        ) -> object_store::Result<Url> {
            Ok(Url::parse(&format!(
                "https://bucket.test/{path}?method={method}&expires={}",
                expires_in.as_secs()
            ))
            .unwrap())
        }
    }

    fn tree(root: &Path, files: usize) {
        for i in 0..files {
            let dir = root.join(format!("part{}", i % 3));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("file{i}.dump")), format!("payload {i}")).unwrap();
        }
    }

    fn memory() -> (Arc<InMemory>, ObjectTransfer) {
        let store = Arc::new(InMemory::new());
        let transfer = ObjectTransfer::new(store.clone(), "backups").with_signer(Arc::new(FakeSigner));
        (store, transfer)
    }

    #[tokio::test]
    async fn uploads_each_file_once_under_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        tree(tmp.path(), 10);
        let (_store, transfer) = memory();

        transfer.upload_folder(tmp.path(), Some("/tenant/b1/")).await.unwrap();
        let mut keys = transfer.list_files("tenant/b1").await.unwrap();
        keys.sort();
        assert_eq!(keys.len(), 10);
        assert!(keys.contains(&"tenant/b1/part0/file0.dump".to_string()));

        transfer.upload_folder(tmp.path(), Some("tenant/b1")).await.unwrap();
        let mut again = transfer.list_files("tenant/b1").await.unwrap();
        again.sort();
        assert_eq!(keys, again);
    }

    #[tokio::test]
    async fn unprefixed_upload_mirrors_local_path() {
        let tmp = tempfile::tempdir().unwrap();
        let vault = tmp.path().join("20240101T000000");
        tree(&vault, 2);
        let (_store, transfer) = memory();

        transfer.upload_folder(&vault, None).await.unwrap();
        let expected = slash_path(&vault.join("part0/file0.dump"));
        assert!(transfer.list_files("").await.unwrap().contains(&expected));

        fs::remove_dir_all(&vault).unwrap();
        transfer.download_folder(&slash_path(&vault), Path::new("")).await.unwrap();
        assert_eq!(
            fs::read_to_string(vault.join("part1/file1.dump")).unwrap(),
            "payload 1"
        );
    }

    #[tokio::test]
    async fn round_trips_through_scratch_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src");
        tree(&source, 4);
        fs::write(source.join("big.tar"), vec![7u8; 3 * 1024 * 1024]).unwrap();
        let (_store, transfer) = memory();
        transfer.upload_folder(&source, Some("blob/v1")).await.unwrap();

        let scratch = tmp.path().join("scratch");
        transfer.download_folder("/blob/v1/", &scratch).await.unwrap();
        assert_eq!(fs::read(scratch.join("big.tar")).unwrap().len(), 3 * 1024 * 1024);
        assert_eq!(
            fs::read_to_string(scratch.join("part0/file3.dump")).unwrap(),
            "payload 3"
        );
    }

    #[tokio::test]
    async fn empty_small_and_multipart_files_keep_their_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join(".lock"), b"").unwrap();
        fs::write(source.join("small.tar"), b"tiny").unwrap();
        let large = vec![3u8; UPLOAD_PART_SIZE + 17];
        fs::write(source.join("large.tar"), &large).unwrap();
        let (store, transfer) = memory();

        transfer.upload_folder(&source, Some("v")).await.unwrap();

        let read = |key: &'static str| {
            let store = store.clone();
            async move {
                store
                    .get(&ObjectPath::from(key))
                    .await
                    .unwrap()
                    .bytes()
                    .await
                    .unwrap()
            }
        };
        assert!(read("v/.lock").await.is_empty());
        assert_eq!(read("v/small.tar").await.as_ref(), b"tiny");
        assert_eq!(read("v/large.tar").await.len(), large.len());

        let scratch = tmp.path().join("scratch");
        assert_eq!(transfer.download_folder("v", &scratch).await.unwrap(), 3);
        assert_eq!(transfer.download_folder("missing", &scratch).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn first_failure_aborts_upload() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("src");
        tree(&source, 10);

        let bucket = tmp.path().join("bucket");
        // a non-empty directory where one object should land makes its commit fail
        let blocker = bucket.join("p/part1/file4.dump");
        fs::create_dir_all(&blocker).unwrap();
        fs::write(blocker.join("occupied"), b"x").unwrap();
        let store = Arc::new(LocalFileSystem::new_with_prefix(&bucket).unwrap());
        let transfer = ObjectTransfer::new(store, "local");

        let err = transfer.upload_folder(&source, Some("p")).await.unwrap_err();
        assert!(
            matches!(&err, TransferError::Upload { key, .. } if key == "p/part1/file4.dump"),
            "unexpected error {err}"
        );
    }

    #[tokio::test]
    async fn cancelled_scope_stops_upload() {
        let tmp = tempfile::tempdir().unwrap();
        tree(tmp.path(), 5);
        let (_store, transfer) = memory();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = transfer
            .upload_folder_with_cancel(tmp.path(), Some("x"), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }

    #[tokio::test]
    async fn delete_prefix_removes_only_that_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        tree(tmp.path(), 3);
        let (_store, transfer) = memory();
        transfer.upload_folder(tmp.path(), Some("a/1")).await.unwrap();
        transfer.upload_folder(tmp.path(), Some("a/2")).await.unwrap();

        assert!(matches!(
            transfer.delete_prefix("/").await,
            Err(TransferError::EmptyPrefix)
        ));
        assert_eq!(transfer.delete_prefix("a/1").await.unwrap(), 3);
        assert!(transfer.list_files("a/1").await.unwrap().is_empty());
        assert_eq!(transfer.list_files("a/2").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn presigns_with_default_expiration() {
        let (_store, transfer) = memory();
        let url = transfer.presigned_url("blob/v1/dump.tar", 0).await.unwrap();
        assert_eq!(
            url,
            "https://bucket.test/blob/v1/dump.tar?method=GET&expires=3600"
        );
        let url = transfer.presigned_url("x.zip", 60).await.unwrap();
        assert!(url.ends_with("expires=60"));

        let unsigned = ObjectTransfer::new(Arc::new(InMemory::new()), "b");
        assert!(matches!(
            unsigned.presigned_url("x.zip", 0).await,
            Err(TransferError::SigningUnsupported)
        ));
    }

    #[test]
    fn relative_keys() {
        assert_eq!(relative_key("blob/v1", "blob/v1/a/b.tar").unwrap(), "a/b.tar");
        assert_eq!(relative_key("", "a/b.tar").unwrap(), "a/b.tar");
        assert!(relative_key("blob/v1", "blob/v10/a").is_err());
        assert_eq!(
            object_key(Path::new("/d"), Path::new("/d/x/y.tar"), Some("p")).unwrap(),
            "p/x/y.tar"
        );
        assert_eq!(object_key(Path::new("/d"), Path::new("/d/x/y.tar"), None).unwrap(), "d/x/y.tar");
    }
}
