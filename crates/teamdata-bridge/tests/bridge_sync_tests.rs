mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{adler32, FakeTeamServer, COLLECTION_ID};
use teamdata_bridge::{
    BridgedWorkingDirectory, ImportDirectoryFactory, LockRegistry, ResourceBridgeClient,
    TeamServerSelector, WorkerSettings, POINTER_FILENAME,
};
use teamdata_core::{
    BackupLocator, CollectionStrategy, DashboardStrategy, ImportDirectory, LockFailure,
    ResourceCollection, SyncError, TeamDataStrategy, WorkingDirectory,
};
use teamdata_local::archive::now_ms;
use teamdata_local::{FileResourceCollection, WorkingDirectoryOptions};
use tempfile::TempDir;

const T0: i64 = 1_600_000_000_000;

fn quiet_worker() -> WorkerSettings {
    WorkerSettings {
        tick: Duration::from_secs(3600),
        ..WorkerSettings::default()
    }
}

fn client_for(
    server: &FakeTeamServer,
    dir: &TempDir,
    strategy: Arc<dyn CollectionStrategy>,
) -> (Arc<FileResourceCollection>, ResourceBridgeClient) {
    let collection = Arc::new(FileResourceCollection::new(dir.path(), strategy.clone()));
    let client =
        ResourceBridgeClient::new(collection.clone(), &server.url, strategy.sync_down_only())
            .unwrap();
    (collection, client)
}

fn bridged(
    server: &FakeTeamServer,
    parent: &TempDir,
    registry: Option<Arc<LockRegistry>>,
) -> Arc<BridgedWorkingDirectory> {
    BridgedWorkingDirectory::new(
        &server.url,
        None,
        Arc::new(DashboardStrategy),
        &WorkingDirectoryOptions::new(parent.path()),
        quiet_worker(),
        registry,
    )
    .unwrap()
}

async fn read(collection: &FileResourceCollection, name: &str) -> Option<Vec<u8>> {
    collection.read_resource(name).await.unwrap()
}

// =============================================================================
// Sync client
// =============================================================================

#[tokio::test]
async fn test_sync_down_mirrors_server_collection() {
    let server = FakeTeamServer::start().await;
    server.put("state", b"a=1", T0);
    server.put("0.dat", b"[task]", T0 + 1000);
    server.put("cms/page.xml", b"<page/>", T0 + 2000);

    let dir = TempDir::new().unwrap();
    let (collection, client) = client_for(&server, &dir, Arc::new(DashboardStrategy));

    assert!(client.sync_down(None).await.unwrap());
    assert_eq!(read(&collection, "state").await.unwrap(), b"a=1");
    assert_eq!(read(&collection, "cms/page.xml").await.unwrap(), b"<page/>");
    assert_eq!(collection.last_modified("0.dat").await.unwrap(), T0 + 1000);
    assert_eq!(client.server_version().as_deref(), Some(common::SERVER_VERSION));

    // listing hashes now agree, so nothing beyond the hash is requested
    let lists = server.count("list");
    assert!(!client.sync_down(None).await.unwrap());
    assert_eq!(server.count("list"), lists);
}

#[tokio::test]
async fn test_sync_down_applies_server_changes() {
    let server = FakeTeamServer::start().await;
    server.put("state", b"a=1", T0);
    server.put("old.dat", b"x", T0);

    let dir = TempDir::new().unwrap();
    let (collection, client) = client_for(&server, &dir, Arc::new(DashboardStrategy));
    client.sync_down(None).await.unwrap();

    server.put("state", b"a=2", T0 + 5000);
    server.state.lock().unwrap().files.remove("old.dat");
    server.put("new.dat", b"y", T0 + 6000);

    assert!(client.sync_down(None).await.unwrap());
    assert_eq!(read(&collection, "state").await.unwrap(), b"a=2");
    assert!(read(&collection, "old.dat").await.is_none());
    assert_eq!(read(&collection, "new.dat").await.unwrap(), b"y");
    assert!(!client.sync_down(None).await.unwrap());
}

#[tokio::test]
async fn test_default_excluded_files_are_not_synced_down() {
    let server = FakeTeamServer::start().await;
    server.put("state", b"a=1", T0);
    server.put("log.txt", b"server log", T0);

    let dir = TempDir::new().unwrap();
    let (collection, client) = client_for(&server, &dir, Arc::new(DashboardStrategy));
    client.sync_down(None).await.unwrap();

    assert!(read(&collection, "state").await.is_some());
    assert!(read(&collection, "log.txt").await.is_none());
}

#[tokio::test]
async fn test_sync_up_pushes_local_edits() {
    let server = FakeTeamServer::start().await;
    server.put("state", b"a=1", T0);
    server.put("gone.dat", b"x", T0);

    let dir = TempDir::new().unwrap();
    let (collection, client) = client_for(&server, &dir, Arc::new(DashboardStrategy));
    client.sync_down(None).await.unwrap();

    collection.write_resource("state", b"a=2", None).await.unwrap();
    collection.write_resource("added.dat", b"new", None).await.unwrap();
    collection.delete_resource("gone.dat").await.unwrap();

    client.acquire_lock("alice").await.unwrap();
    assert!(client.sync_up(None).await.unwrap());

    assert_eq!(server.file("state").unwrap(), b"a=2");
    assert_eq!(server.file("added.dat").unwrap(), b"new");
    assert!(server.file("gone.dat").is_none());
    assert!(!client.sync_up(None).await.unwrap());

    client.release_lock().await;
    assert!(server.lock_owner().is_none());
}

#[tokio::test]
async fn test_uploaded_data_round_trips_to_empty_copy() {
    let server = FakeTeamServer::start().await;

    let writer_dir = TempDir::new().unwrap();
    let (writer, writer_client) = client_for(&server, &writer_dir, Arc::new(DashboardStrategy));
    writer.write_resource("state", b"a=1\nb=2", None).await.unwrap();
    writer
        .write_resource("cms/nested/page.xml", b"<page/>", None)
        .await
        .unwrap();
    writer_client.acquire_lock("alice").await.unwrap();
    writer_client.sync_up(None).await.unwrap();
    writer_client.release_lock().await;

    let reader_dir = TempDir::new().unwrap();
    let (reader, reader_client) = client_for(&server, &reader_dir, Arc::new(DashboardStrategy));
    assert!(reader_client.sync_down(None).await.unwrap());

    for name in ["state", "cms/nested/page.xml"] {
        assert_eq!(read(&reader, name).await, read(&writer, name).await);
        assert_eq!(
            reader.checksum(name).await.unwrap(),
            writer.checksum(name).await.unwrap()
        );
    }
}

#[tokio::test]
async fn test_sync_up_restores_sync_down_only_files() {
    let server = FakeTeamServer::start().await;
    server.put("projDump.xml", b"<dump v='1'/>", T0);
    server.put("bob-data.pdash", b"bob's data", T0);

    let dir = TempDir::new().unwrap();
    let (collection, client) = client_for(&server, &dir, Arc::new(TeamDataStrategy));
    client.sync_down(None).await.unwrap();

    collection
        .write_resource("projDump.xml", b"<dump v='2'/>", None)
        .await
        .unwrap();
    collection
        .write_resource("bob-data.pdash", b"tampered", None)
        .await
        .unwrap();
    collection
        .write_resource("carol-data.pdash", b"stray", None)
        .await
        .unwrap();

    client.acquire_lock("alice").await.unwrap();
    assert!(client.sync_up(None).await.unwrap());

    assert_eq!(server.file("projDump.xml").unwrap(), b"<dump v='2'/>");
    assert_eq!(server.file("bob-data.pdash").unwrap(), b"bob's data");
    assert!(server.file("carol-data.pdash").is_none());
    assert_eq!(read(&collection, "bob-data.pdash").await.unwrap(), b"bob's data");
    assert!(read(&collection, "carol-data.pdash").await.is_none());
}

#[tokio::test]
async fn test_competing_lock_reports_holder() {
    let server = FakeTeamServer::start().await;
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let (_, alice) = client_for(&server, &dir_a, Arc::new(DashboardStrategy));
    let (_, bob) = client_for(&server, &dir_b, Arc::new(DashboardStrategy));
    alice.set_extra_lock_data(Some("dataset-a".to_string())).await;
    bob.set_extra_lock_data(Some("dataset-b".to_string())).await;

    alice.acquire_lock("alice").await.unwrap();
    alice.ping_lock().await.unwrap();

    let err = bob.acquire_lock("bob").await.unwrap_err();
    assert_eq!(
        err.lock_failure(),
        Some(&LockFailure::AlreadyLocked {
            holder: Some("alice".to_string())
        })
    );
    assert!(bob.lock_owner().await.is_none());

    alice.release_lock().await;
    bob.acquire_lock("bob").await.unwrap();
    assert_eq!(server.lock_owner().as_deref(), Some("bob"));

    let err = alice.acquire_lock("alice").await.unwrap_err();
    assert!(matches!(
        err.lock_failure(),
        Some(LockFailure::AlreadyLocked { .. })
    ));
}

#[tokio::test]
async fn test_single_file_operations() {
    let server = FakeTeamServer::start().await;

    let checksum = ResourceBridgeClient::upload_single_file(&server.url, "notes.txt", b"hi".to_vec())
        .await
        .unwrap();
    assert_eq!(checksum, Some(adler32(b"hi")));
    assert_eq!(server.file("notes.txt").unwrap(), b"hi");

    ResourceBridgeClient::delete_single_file(&server.url, "notes.txt")
        .await
        .unwrap();
    assert!(server.names().is_empty());

    let id = ResourceBridgeClient::create_new_collection(
        &format!("{}/new", server.base_url),
        "team",
        Some("team42"),
    )
    .await
    .unwrap();
    assert_eq!(id, "team42");
}

// =============================================================================
// Bridged working directory
// =============================================================================

#[tokio::test]
async fn test_prepare_edit_and_flush() {
    let server = FakeTeamServer::start().await;
    server.put("state", b"a=1", T0);

    let parent = TempDir::new().unwrap();
    let wd = bridged(&server, &parent, None);

    // preparing needs the process lock
    assert!(wd.prepare().await.is_err());

    wd.acquire_process_lock(None, None).await.unwrap();
    wd.prepare().await.unwrap();
    assert_eq!(
        std::fs::read(wd.directory().join("state")).unwrap(),
        b"a=1"
    );

    // flushing needs the write lock
    assert!(matches!(
        wd.flush_data().await,
        Err(SyncError::Lock(LockFailure::NotLocked))
    ));

    wd.acquire_write_lock(None, "alice").await.unwrap();
    assert!(wd.is_write_locked().await);
    assert_eq!(server.lock_owner().as_deref(), Some("alice"));
    wd.assert_write_lock().await.unwrap();

    std::fs::write(wd.directory().join("state"), b"a=2").unwrap();
    std::fs::write(wd.directory().join("1.dat"), b"[tasks]").unwrap();
    assert!(wd.flush_data().await.unwrap());
    assert_eq!(server.file("state").unwrap(), b"a=2");
    assert_eq!(server.file("1.dat").unwrap(), b"[tasks]");
    assert!(!wd.flush_data().await.unwrap());

    let synced_at = wd
        .metadata(teamdata_bridge::SYNC_TIMESTAMP_KEY)
        .await
        .unwrap();
    assert!(synced_at.is_some());

    wd.release_locks().await;
    assert!(server.lock_owner().is_none());
    assert!(!wd.is_write_locked().await);

    // lock, metadata and backup files never reach the server
    assert_eq!(server.names(), vec!["1.dat", "state"]);
}

#[tokio::test]
async fn test_write_lock_excludes_other_working_directories() {
    let server = FakeTeamServer::start().await;
    let parent_a = TempDir::new().unwrap();
    let parent_b = TempDir::new().unwrap();
    let first = bridged(&server, &parent_a, None);
    let second = bridged(&server, &parent_b, None);

    first.acquire_write_lock(None, "alice").await.unwrap();
    let err = second.acquire_write_lock(None, "bob").await.unwrap_err();
    assert!(matches!(
        err.lock_failure(),
        Some(LockFailure::AlreadyLocked { holder: Some(holder) }) if holder == "alice"
    ));
    assert!(!second.is_write_locked().await);

    first.release_locks().await;
    second.acquire_write_lock(None, "bob").await.unwrap();
    assert_eq!(server.lock_owner().as_deref(), Some("bob"));
    second.release_locks().await;
}

#[tokio::test]
async fn test_update_is_refused_while_write_locked() {
    let server = FakeTeamServer::start().await;
    server.put("state", b"a=1", T0);

    let parent = TempDir::new().unwrap();
    let wd = bridged(&server, &parent, None);
    wd.acquire_process_lock(None, None).await.unwrap();
    wd.prepare().await.unwrap();
    wd.acquire_write_lock(None, "alice").await.unwrap();

    assert!(matches!(
        wd.update().await,
        Err(SyncError::InvalidState(_))
    ));

    wd.set_allow_update_when_locked(true);
    server.put("state", b"a=3", now_ms() + 60_000);
    wd.update().await.unwrap();
    assert_eq!(
        std::fs::read(wd.directory().join("state")).unwrap(),
        b"a=3"
    );
    wd.release_locks().await;
}

#[tokio::test]
async fn test_update_requires_process_lock() {
    let server = FakeTeamServer::start().await;
    server.put("state", b"a=1", T0);

    let parent = TempDir::new().unwrap();
    let wd = bridged(&server, &parent, None);
    assert!(matches!(
        wd.update().await,
        Err(SyncError::InvalidState(_))
    ));
    assert_eq!(server.count("download"), 0);

    wd.acquire_process_lock(None, None).await.unwrap();
    wd.update().await.unwrap();
    assert_eq!(
        std::fs::read(wd.directory().join("state")).unwrap(),
        b"a=1"
    );
    wd.release_locks().await;
}

#[tokio::test]
async fn test_prepare_keeps_local_edits_made_after_last_flush() {
    let server = FakeTeamServer::start().await;
    server.put("state", b"a=1", T0);
    server.put("0.dat", b"v1", T0);

    let parent = TempDir::new().unwrap();
    let wd = bridged(&server, &parent, None);
    wd.acquire_process_lock(None, None).await.unwrap();
    wd.prepare().await.unwrap();
    wd.acquire_write_lock(None, "alice").await.unwrap();
    wd.flush_data().await.unwrap();
    wd.release_locks().await;

    // an unflushed local edit, and a newer edit made by someone else
    std::fs::write(wd.directory().join("state"), b"a=local").unwrap();
    server.put("0.dat", b"v2", now_ms() + 60_000);

    wd.acquire_process_lock(None, None).await.unwrap();
    wd.prepare().await.unwrap();
    assert_eq!(
        std::fs::read(wd.directory().join("state")).unwrap(),
        b"a=local"
    );
    assert_eq!(std::fs::read(wd.directory().join("0.dat")).unwrap(), b"v2");
    assert_eq!(server.file("state").unwrap(), b"a=1");
    wd.release_locks().await;
}

#[tokio::test]
async fn test_backup_goes_to_server_while_locked() {
    let server = FakeTeamServer::start().await;
    server.put("state", b"a=1", T0);

    let parent = TempDir::new().unwrap();
    let wd = bridged(&server, &parent, None);
    wd.acquire_process_lock(None, None).await.unwrap();
    wd.prepare().await.unwrap();

    match wd.do_backup("manual").await.unwrap() {
        BackupLocator::File(path) => assert!(path.exists()),
        other => panic!("expected a local backup, got {:?}", other),
    }

    wd.acquire_write_lock(None, "alice").await.unwrap();
    match wd.do_backup("manual").await.unwrap() {
        BackupLocator::Url(url) => {
            assert!(url.starts_with(&server.url));
            assert!(url.contains("action=getBackup"));
        }
        other => panic!("expected a server backup, got {:?}", other),
    }
    assert_eq!(server.backups(), vec!["manual"]);
    wd.release_locks().await;
}

#[tokio::test]
async fn test_registry_releases_held_write_locks() {
    let server = FakeTeamServer::start().await;
    let registry = Arc::new(LockRegistry::new());
    let parent = TempDir::new().unwrap();
    let wd = bridged(&server, &parent, Some(registry.clone()));

    wd.acquire_write_lock(None, "alice").await.unwrap();
    assert_eq!(registry.len(), 1);

    registry.release_all().await;
    assert!(registry.is_empty());
    assert!(server.lock_owner().is_none());
    assert!(!wd.is_write_locked().await);
}

// =============================================================================
// Import directories
// =============================================================================

#[tokio::test]
async fn test_import_follows_pointer_file_to_server() {
    let server = FakeTeamServer::start().await;
    server.put("projDump.xml", b"<dump/>", T0);

    let temp_dir = TempDir::new().unwrap();
    let team_dir = temp_dir.path().join("team");
    std::fs::create_dir(&team_dir).unwrap();
    std::fs::write(
        team_dir.join(POINTER_FILENAME),
        format!(r#"<teamServer><instance url="{}"/></teamServer>"#, server.url),
    )
    .unwrap();

    let selector = Arc::new(TeamServerSelector::new(None).unwrap());
    let factory = ImportDirectoryFactory::new(
        selector,
        Arc::new(TeamDataStrategy),
        temp_dir.path().join("cache"),
    )
    .with_home_dir(None);

    let location = team_dir.to_string_lossy().to_string();
    let import = factory.get(&[location.as_str()]).await.unwrap();
    assert_eq!(import.remote_location(), Some(server.url.clone()));
    assert_eq!(
        std::fs::read(import.directory().join("projDump.xml")).unwrap(),
        b"<dump/>"
    );
}

#[tokio::test]
async fn test_import_of_missing_directory_uses_default_server() {
    let server = FakeTeamServer::start().await;
    server.put("projDump.xml", b"<dump/>", T0);

    let temp_dir = TempDir::new().unwrap();
    let selector = Arc::new(TeamServerSelector::new(Some(server.base_url.clone())).unwrap());
    let factory = ImportDirectoryFactory::new(
        selector,
        Arc::new(TeamDataStrategy),
        temp_dir.path().join("cache"),
    );

    // a directory that only exists on the server, named like the collection
    let missing = temp_dir.path().join(COLLECTION_ID);
    let location = missing.to_string_lossy().to_string();
    let import = factory.get(&[location.as_str()]).await.unwrap();
    assert_eq!(import.remote_location(), Some(server.url.clone()));
    assert!(import.directory().join("projDump.xml").exists());
}
