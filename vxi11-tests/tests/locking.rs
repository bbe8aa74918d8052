use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use vxi11_protocol::{
    CoreRequest, CoreResponse, CreateLinkParams, ErrorCode, GenericParams, OperationFlags,
    WriteParams,
};
use vxi11_server::server::{DestroyCause, ServerEvent};
use vxi11_tests::*;

fn error(response: CoreResponse) -> ErrorCode {
    response.error()
}

#[tokio::test]
async fn lock_excludes_other_links() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let alice = server.connect(None);
    let bob = server.connect(None);
    let a = open_link(&alice, 1).await;
    let b = open_link(&bob, 2).await;

    assert_eq!(error(alice.call(lock(a, false, 0)).await), ErrorCode::NoError);
    assert_eq!(server.lock_owner().map(|link| link.get()), Some(a));
    // Locking again from the owner is fine
    assert_eq!(error(alice.call(lock(a, false, 0)).await), ErrorCode::NoError);

    assert_eq!(
        error(bob.call(lock(b, false, 0)).await),
        ErrorCode::DeviceLockedByAnotherLink
    );
    assert_eq!(
        error(bob.call(write(b, &b"x"[..], OperationFlags::END)).await),
        ErrorCode::DeviceLockedByAnotherLink
    );
    assert_eq!(
        error(bob.call(CoreRequest::DeviceTrigger(generic(b))).await),
        ErrorCode::DeviceLockedByAnotherLink
    );
    // Unlock is not subject to the lock, but only the owner holds one
    assert_eq!(
        error(bob.call(unlock(b)).await),
        ErrorCode::NoLockHeldByThisLink
    );
    // The owner itself is unaffected
    assert_eq!(
        error(alice.call(write(a, &b"x"[..], OperationFlags::END)).await),
        ErrorCode::NoError
    );

    assert_eq!(error(alice.call(unlock(a)).await), ErrorCode::NoError);
    assert_eq!(error(alice.call(unlock(a)).await), ErrorCode::NoLockHeldByThisLink);
    assert_eq!(server.lock_owner(), None);
    assert_eq!(
        error(bob.call(write(b, &b"x"[..], OperationFlags::END)).await),
        ErrorCode::NoError
    );
}

#[tokio::test]
async fn waiting_for_lock_times_out() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let alice = server.connect(None);
    let bob = server.connect(None);
    let a = open_link(&alice, 1).await;
    let b = open_link(&bob, 2).await;
    alice.call(lock(a, false, 0)).await;

    let start = Instant::now();
    assert_eq!(
        error(bob.call(lock(b, true, 100)).await),
        ErrorCode::DeviceLockedByAnotherLink
    );
    assert!(start.elapsed() >= Duration::from_millis(100));

    let start = Instant::now();
    let response = bob
        .call(CoreRequest::DeviceClear(GenericParams {
            flags: OperationFlags::WAIT_LOCK,
            lock_timeout: 100,
            ..generic(b)
        }))
        .await;
    assert_eq!(error(response), ErrorCode::DeviceLockedByAnotherLink);
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiting_link_proceeds_once_lock_is_released() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let alice = server.connect(None);
    let bob = server.connect(None);
    let a = open_link(&alice, 1).await;
    let b = open_link(&bob, 2).await;
    alice.call(lock(a, false, 0)).await;

    let waiter = tokio::spawn(async move {
        let start = Instant::now();
        let response = bob.call(lock(b, true, 5000)).await;
        (response, start.elapsed(), bob)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(error(alice.call(unlock(a)).await), ErrorCode::NoError);

    let (response, elapsed, _bob) = waiter.await.unwrap();
    assert_eq!(error(response), ErrorCode::NoError);
    assert!(elapsed < Duration::from_secs(4));
    assert_eq!(server.lock_owner().map(|link| link.get()), Some(b));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiting_write_proceeds_once_lock_is_released() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let alice = server.connect(None);
    let bob = server.connect(None);
    let a = open_link(&alice, 1).await;
    let b = open_link(&bob, 2).await;
    alice.call(lock(a, false, 0)).await;

    let writer = tokio::spawn(async move {
        let start = Instant::now();
        let response = bob
            .call(CoreRequest::DeviceWrite(WriteParams {
                link_id: b,
                io_timeout: IO_TIMEOUT,
                lock_timeout: 5000,
                flags: OperationFlags::WAIT_LOCK | OperationFlags::END,
                data: Bytes::from_static(b"hello"),
            }))
            .await;
        (expect_write(response), start.elapsed(), bob)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(error(alice.call(unlock(a)).await), ErrorCode::NoError);

    let (response, elapsed, _bob) = writer.await.unwrap();
    assert_eq!(response.error, ErrorCode::NoError);
    assert_eq!(response.size, 5);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(4));
    // Waiting for the lock does not take it
    assert_eq!(server.lock_owner(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_connection_releases_lock() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let mut events = server.subscribe();
    let alice = server.connect(None);
    let bob = server.connect(None);
    let a = open_link(&alice, 1).await;
    let b = open_link(&bob, 2).await;
    alice.call(lock(a, false, 0)).await;

    let waiter = tokio::spawn(async move {
        let response = bob.call(lock(b, true, 5000)).await;
        (response, bob)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(alice);

    let (response, _bob) = waiter.await.unwrap();
    assert_eq!(error(response), ErrorCode::NoError);
    assert_eq!(server.lock_owner().map(|link| link.get()), Some(b));
    assert_eq!(server.link_count(), 1);

    let destroyed = loop {
        match events.recv().await.unwrap() {
            ServerEvent::LinkDestroyed { link, cause } => break (link.get(), cause),
            _ => continue,
        }
    };
    assert_eq!(destroyed, (a, DestroyCause::ConnectionLost));
}

#[tokio::test]
async fn destroying_owner_link_releases_lock() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let session = server.connect(None);
    let a = open_link(&session, 1).await;
    let b = open_link(&session, 2).await;
    session.call(lock(a, false, 0)).await;
    session.call(destroy(a)).await;
    assert_eq!(server.lock_owner(), None);
    assert_eq!(error(session.call(lock(b, false, 0)).await), ErrorCode::NoError);
}

#[tokio::test]
async fn create_link_can_lock_the_device() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let session = server.connect(None);
    let locked = |client_id| {
        CoreRequest::CreateLink(CreateLinkParams {
            client_id,
            lock_device: true,
            lock_timeout: 100,
            device: "inst0".to_string(),
        })
    };

    let first = match session.call(locked(1)).await {
        CoreResponse::CreateLink(response) => response,
        other => panic!("unexpected response: {:?}", other),
    };
    assert_eq!(first.error, ErrorCode::NoError);
    assert_eq!(server.lock_owner().map(|link| link.get()), Some(first.link_id));

    let start = Instant::now();
    let second = match session.call(locked(2)).await {
        CoreResponse::CreateLink(response) => response,
        other => panic!("unexpected response: {:?}", other),
    };
    assert_eq!(second.error, ErrorCode::DeviceLockedByAnotherLink);
    assert_eq!(second.link_id, 0);
    assert!(start.elapsed() >= Duration::from_millis(100));
    // The failed link is rolled back
    assert_eq!(server.link_count(), 1);
}
