// ABOUTME: Tests for RoomDirectory: lazy creation, idempotence and exactly-once creation under races.
// ABOUTME: Uses MockTransport and on-disk SQLite room stores in temp directories.

use roombridge_core::backoff::BackoffConfig;
use roombridge_core::testing::MockTransport;
use roombridge_core::{BridgeError, RoomDirectory, RoomStore, RoomVisibility, WorkingDirectory};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const ADMIN: &str = "@alice:mock.local";

fn workdir(tmp: &TempDir, name: &str) -> WorkingDirectory {
    let path = tmp.path().join("work").join(name);
    std::fs::create_dir_all(&path).unwrap();
    WorkingDirectory::new(path).unwrap()
}

fn directory(tmp: &TempDir, transport: &Arc<MockTransport>) -> RoomDirectory<MockTransport> {
    let store = RoomStore::open(&tmp.path().join("state")).unwrap();
    RoomDirectory::new(Arc::clone(transport), store, ADMIN)
        .with_lease(Duration::from_secs(60), Duration::from_millis(10))
}

#[tokio::test]
async fn test_distinct_directories_get_distinct_rooms() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(MockTransport::new("@bot:mock.local"));
    let rooms = directory(&tmp, &transport);

    let a = rooms.resolve(&workdir(&tmp, "a")).await.unwrap();
    let b = rooms.resolve(&workdir(&tmp, "b")).await.unwrap();
    assert_ne!(a, b);
    assert_eq!(transport.create_calls(), 2);
}

#[tokio::test]
async fn test_sequential_resolve_creates_once() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(MockTransport::new("@bot:mock.local"));
    let rooms = directory(&tmp, &transport);
    let proj = workdir(&tmp, "proj");

    let first = rooms.resolve(&proj).await.unwrap();
    let second = rooms.resolve(&proj).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(transport.create_calls(), 1);
}

#[tokio::test]
async fn test_concurrent_resolve_in_process_creates_once() {
    let tmp = TempDir::new().unwrap();
    let transport =
        Arc::new(MockTransport::new("@bot:mock.local").with_create_delay(Duration::from_millis(50)));
    let rooms = directory(&tmp, &transport);
    let proj = workdir(&tmp, "proj");

    let (a, b, c) = tokio::join!(rooms.resolve(&proj), rooms.resolve(&proj), rooms.resolve(&proj));
    let a = a.unwrap();
    assert_eq!(a, b.unwrap());
    assert_eq!(a, c.unwrap());
    assert_eq!(transport.create_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_resolve_across_stores_creates_once() {
    // Two directories with their own connections stand in for two processes
    let tmp = TempDir::new().unwrap();
    let transport =
        Arc::new(MockTransport::new("@bot:mock.local").with_create_delay(Duration::from_millis(100)));
    let first = directory(&tmp, &transport);
    let second = directory(&tmp, &transport);
    let proj = workdir(&tmp, "proj");

    let (a, b) = tokio::join!(first.resolve(&proj), second.resolve(&proj));
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(transport.create_calls(), 1);
}

#[tokio::test]
async fn test_mapping_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(MockTransport::new("@bot:mock.local"));
    let proj = workdir(&tmp, "proj");

    let room = directory(&tmp, &transport).resolve(&proj).await.unwrap();
    let again = directory(&tmp, &transport).resolve(&proj).await.unwrap();
    assert_eq!(room, again);
    assert_eq!(transport.create_calls(), 1);
}

#[tokio::test]
async fn test_creation_failure_is_fatal_and_not_persisted() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(MockTransport::new("@bot:mock.local"));
    let rooms = directory(&tmp, &transport);
    let proj = workdir(&tmp, "proj");

    transport.fail_next_creates(1);
    match rooms.resolve(&proj).await {
        Err(BridgeError::Transport(msg)) => assert!(msg.contains("Failed to create room")),
        other => panic!("expected transport error, got {:?}", other),
    }
    assert_eq!(transport.create_calls(), 1);

    // Nothing was recorded, and the claim was released for the next try
    let room = rooms.resolve(&proj).await.unwrap();
    assert_eq!(transport.create_calls(), 2);
    assert!(room.starts_with("!room2"));
}

#[tokio::test]
async fn test_bounded_create_attempts() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(MockTransport::new("@bot:mock.local"));
    let rooms = directory(&tmp, &transport).with_create_attempts(3, BackoffConfig::immediate());
    let proj = workdir(&tmp, "proj");

    transport.fail_next_creates(2);
    assert!(rooms.resolve(&proj).await.is_ok());
    assert_eq!(transport.create_calls(), 3);

    let other = workdir(&tmp, "other");
    transport.fail_next_creates(5);
    assert!(rooms.resolve(&other).await.is_err());
    assert_eq!(transport.create_calls(), 6);
}

#[tokio::test]
async fn test_room_named_after_directory_and_admin_invited() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(MockTransport::new("@bot:mock.local"));
    let rooms = directory(&tmp, &transport).with_room_prefix("Agent");
    let proj = workdir(&tmp, "my-proj");

    let room = rooms.resolve(&proj).await.unwrap();
    let spec = &transport.rooms()[0];
    assert_eq!(spec.name, "Agent [my-proj]");
    assert!(spec.topic.contains(proj.as_key()));
    assert_eq!(spec.visibility, RoomVisibility::Private);
    assert_eq!(transport.invites(), vec![(room, ADMIN.to_string())]);
}

#[tokio::test]
async fn test_invite_failure_is_not_fatal() {
    let tmp = TempDir::new().unwrap();
    let transport = Arc::new(MockTransport::new("@bot:mock.local").with_failing_invites());
    let rooms = directory(&tmp, &transport);

    assert!(rooms.resolve(&workdir(&tmp, "proj")).await.is_ok());
}
