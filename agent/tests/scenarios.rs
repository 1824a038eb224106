use async_trait::async_trait;
use futures::stream::BoxStream;
use md5::{Digest, Md5};
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};
use secstor_agent::{AgentConfig, SecondaryStorage};
use secstor_core::{
    Answer, AnswerPayload, Command, CopyCommand, DataObject, DataStore, DataStoreRole,
    DeleteCommand, HypervisorType, NfsStore, S3Store, SwiftStore,
};
use secstor_image::{CREATE_TEMPLATE_SCRIPT, CREATE_VOLUME_SCRIPT, XEN_SNAPSHOT_SCRIPT};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

/// Counts single and multipart uploads on top of an in-memory store.
#[derive(Debug, Default)]
struct CountingStore {
    inner: InMemory,
    single: AtomicUsize,
    multipart: AtomicUsize,
}

impl std::fmt::Display for CountingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CountingStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn put_opts(
        &self,
        location: &ObjectPath,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.single.fetch_add(1, Ordering::SeqCst);
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &ObjectPath,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.multipart.fetch_add(1, Ordering::SeqCst);
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &ObjectPath,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &ObjectPath) -> object_store::Result<()> {
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&ObjectPath>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&ObjectPath>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &ObjectPath, to: &ObjectPath) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(
        &self,
        from: &ObjectPath,
        to: &ObjectPath,
    ) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

struct Node {
    root: TempDir,
    tools: TempDir,
    storage: SecondaryStorage,
}

impl Node {
    fn new() -> Self {
        Self::with_s3(None)
    }

    fn with_s3(client: Option<Arc<dyn ObjectStore>>) -> Self {
        let root = TempDir::new().unwrap();
        let tools = TempDir::new().unwrap();
        for name in [CREATE_TEMPLATE_SCRIPT, CREATE_VOLUME_SCRIPT, XEN_SNAPSHOT_SCRIPT] {
            write_script(&tools.path().join(name), "#!/bin/sh\nexit 0\n");
        }
        write_fake_swift(tools.path());

        let config = AgentConfig {
            mount_root: root.path().to_path_buf(),
            in_system_vm: false,
            scripts_dir: tools.path().to_path_buf(),
            swift_cli: tools.path().join("swift"),
            object_store_timeout_secs: 10,
            ..AgentConfig::default()
        };
        let mut storage = SecondaryStorage::new(config).unwrap();
        if let Some(client) = client {
            storage = storage.with_s3_client(client);
        }
        Self {
            root,
            tools,
            storage,
        }
    }

    fn swift_log(&self) -> String {
        std::fs::read_to_string(self.tools.path().join("swift.log")).unwrap_or_default()
    }
}

/// Records its arguments and treats every object as present.
fn write_fake_swift(dir: &Path) {
    let body = format!(
        "#!/bin/sh\necho \"$@\" >> {}\n",
        dir.join("swift.log").display()
    );
    write_script(&dir.join("swift"), &body);
}

fn nfs(role: DataStoreRole) -> DataStore {
    DataStore::Nfs(NfsStore {
        url: "nfs://10.1.1.10/export/secondary".to_string(),
        role,
    })
}

fn images_bucket(max_single_upload_bytes: Option<i64>) -> DataStore {
    DataStore::S3(S3Store {
        bucket: "images".to_string(),
        access_key: "ak".to_string(),
        secret_key: "sk".to_string(),
        endpoint: Some("s3.local:9000".to_string()),
        region: None,
        https: false,
        max_single_upload_bytes,
        role: DataStoreRole::Image,
    })
}

fn qcow2_image(virtual_size: u64, len: usize) -> Vec<u8> {
    let mut image = vec![0u8; len];
    image[..4].copy_from_slice(b"QFI\xfb");
    image[24..32].copy_from_slice(&virtual_size.to_be_bytes());
    image
}

fn snapshot_to_template() -> CopyCommand {
    CopyCommand {
        src: DataObject::snapshot(HypervisorType::Kvm, None).with_path("snap/123/abc"),
        src_store: nfs(DataStoreRole::Image),
        dest: DataObject::template()
            .with_id(201)
            .with_name("centos-custom")
            .with_path("template/tmpl/2/201"),
        dest_store: nfs(DataStoreRole::Image),
        wait_seconds: 0,
    }
}

fn copied(answer: &Answer) -> &DataObject {
    assert!(answer.result, "copy failed: {:?}", answer.details);
    answer.new_data().unwrap()
}

#[tokio::test]
async fn test_kvm_snapshot_becomes_template() {
    let node = Node::new();
    let snap_dir = node.root.path().join("snap/123");
    std::fs::create_dir_all(&snap_dir).unwrap();
    std::fs::write(snap_dir.join("abc"), qcow2_image(10 << 30, 4096)).unwrap();

    let answer = node
        .storage
        .execute(Command::Copy(snapshot_to_template()))
        .await;
    let template = copied(&answer);

    assert_eq!(template.path_str(), "template/tmpl/2/201/abc.qcow2");
    assert_eq!(template.size, Some(10 << 30));
    assert_eq!(template.physical_size, Some(4096));

    let dir = node.root.path().join("template/tmpl/2/201");
    assert!(dir.join("abc.qcow2").is_file());
    let sidecar = std::fs::read_to_string(dir.join("template.properties")).unwrap();
    let lines: Vec<&str> = sidecar.lines().collect();
    assert!(lines.contains(&"uniquename=centos-custom"));
    assert!(lines.contains(&"filename=abc.qcow2"));
    assert!(lines.contains(&"size=4096"));
}

#[tokio::test]
async fn test_template_pushed_to_s3_in_parts() {
    let store = Arc::new(CountingStore::default());
    let node = Node::with_s3(Some(store.clone()));
    let snap_dir = node.root.path().join("snap/123");
    std::fs::create_dir_all(&snap_dir).unwrap();
    std::fs::write(snap_dir.join("abc"), qcow2_image(10 << 30, 4096)).unwrap();

    let answer = node
        .storage
        .execute(Command::Copy(snapshot_to_template()))
        .await;
    let template = copied(&answer).clone();

    let push = CopyCommand {
        src: template,
        src_store: nfs(DataStoreRole::ImageCache),
        dest: DataObject::template()
            .with_id(201)
            .with_path("template/tmpl/2/201"),
        dest_store: images_bucket(Some(1024)),
        wait_seconds: 0,
    };

    let answer = node.storage.execute(Command::Copy(push)).await;
    let pushed = copied(&answer);

    assert_eq!(pushed.path_str(), "template/tmpl/2/201/abc.qcow2");
    assert_eq!(pushed.size, Some(10 << 30));
    assert_eq!(store.multipart.load(Ordering::SeqCst), 1);
    assert_eq!(store.single.load(Ordering::SeqCst), 0);

    let object = store
        .get(&ObjectPath::from("template/tmpl/2/201/abc.qcow2"))
        .await
        .unwrap();
    assert_eq!(object.meta.size, 4096);
}

#[tokio::test]
async fn test_template_pushed_to_s3_then_deleted() {
    let store = Arc::new(CountingStore::default());
    let node = Node::with_s3(Some(store.clone()));
    let snap_dir = node.root.path().join("snap/123");
    std::fs::create_dir_all(&snap_dir).unwrap();
    std::fs::write(snap_dir.join("abc"), qcow2_image(10 << 30, 4096)).unwrap();

    let mut cmd = snapshot_to_template();
    cmd.dest_store = images_bucket(None);
    let answer = node.storage.execute(Command::Copy(cmd)).await;
    let pushed = copied(&answer).clone();
    let location = ObjectPath::from(pushed.path_str());
    assert!(store.head(&location).await.is_ok());

    let answer = node
        .storage
        .execute(Command::Delete(DeleteCommand {
            data: pushed,
            store: images_bucket(None),
        }))
        .await;

    assert!(answer.result, "delete failed: {:?}", answer.details);
    assert!(store.head(&location).await.is_err());
}

#[tokio::test]
async fn test_swift_volume_delete_removes_one_object() {
    let node = Node::new();

    let answer = node
        .storage
        .execute(Command::Delete(DeleteCommand {
            data: DataObject::volume().with_id(42).with_path("vol.raw"),
            store: DataStore::Swift(SwiftStore {
                url: "http://swift.local:8080/auth/v1.0".to_string(),
                account: "acct".to_string(),
                user_name: "admin".to_string(),
                key: "secret".to_string(),
                role: DataStoreRole::Image,
            }),
        }))
        .await;

    assert!(answer.result, "delete failed: {:?}", answer.details);
    let details = answer.details.unwrap();
    assert!(details.starts_with("Deleted volume"));
    assert!(details.ends_with("from swift"));

    let log = node.swift_log();
    let calls: Vec<&str> = log.lines().collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0],
        "-A http://swift.local:8080/auth/v1.0 -U acct:admin -K secret delete V-42 vol.raw"
    );
}

#[tokio::test]
async fn test_checksum_matches_reference_digest() {
    let node = Node::new();
    let dir = node.root.path().join("template/tmpl/2/201");
    std::fs::create_dir_all(&dir).unwrap();
    let bytes: Vec<u8> = (0..3 * 1024 * 1024 + 17).map(|i| (i % 253) as u8).collect();
    std::fs::write(dir.join("abc.qcow2"), &bytes).unwrap();

    let answer = node
        .storage
        .execute(Command::ComputeChecksum {
            store: nfs(DataStoreRole::Image),
            template_path: "template/tmpl/2/201/abc.qcow2".to_string(),
        })
        .await;

    let expected = hex::encode(Md5::digest(&bytes));
    match answer.payload {
        Some(AnswerPayload::Checksum { md5 }) => assert_eq!(md5, expected),
        other => panic!("unexpected payload {:?}", other),
    }
}
