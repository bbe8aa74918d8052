use std::collections::HashSet;

use vxi11_protocol::{CoreResponse, ErrorCode};
use vxi11_server::{
    LinkPolicy,
    loopback::Loopback,
    server::{Builder, DestroyCause, ServerEvent},
};
use vxi11_tests::*;

#[tokio::test]
async fn create_link_reports_server_parameters() {
    init_logging();
    let server = Builder::new()
        .max_receive_size(2048)
        .build(Loopback::default(), RecordingTransport::default());
    let session = server.connect(None);
    let response = create_link(&session, 1, "inst0").await;
    assert_eq!(response.error, ErrorCode::NoError);
    assert_ne!(response.link_id, 0);
    assert_eq!(response.abort_port, ABORT_PORT);
    assert_eq!(response.max_receive_size, 2048);
    assert_eq!(server.link_count(), 1);
    assert!(server.remote_enabled());

    let links = server.links();
    assert_eq!(links[0].id.get(), response.link_id);
    assert_eq!(links[0].client_id, 1);
    assert_eq!(links[0].device.to_string(), "inst0");
    assert_eq!(links[0].session, session.id());
}

#[tokio::test]
async fn max_receive_size_has_a_floor() {
    let server = Builder::new()
        .max_receive_size(16)
        .build(Loopback::default(), RecordingTransport::default());
    assert_eq!(server.config().max_receive_size, 1024);
}

#[tokio::test]
async fn single_device_refuses_second_link() {
    init_logging();
    let server = Builder::new().build(Loopback::default(), RecordingTransport::default());
    let first = server.connect(None);
    let second = server.connect(None);
    open_link(&first, 1).await;
    let response = create_link(&second, 2, "inst0").await;
    assert_eq!(response.error, ErrorCode::ChannelAlreadyEstablished);
    assert_eq!(response.link_id, 0);
    assert_eq!(response.abort_port, ABORT_PORT);
}

#[tokio::test]
async fn busy_single_device_is_reported_before_name_checks() {
    init_logging();
    let server = Builder::new().build(Loopback::default(), RecordingTransport::default());
    let first = server.connect(None);
    let second = server.connect(None);
    open_link(&first, 1).await;
    for device in ["bogus0", "gpib0,5"] {
        let response = create_link(&second, 2, device).await;
        assert_eq!(response.error, ErrorCode::ChannelAlreadyEstablished);
    }
    assert_eq!(server.link_count(), 1);
}

#[tokio::test]
async fn link_ids_are_unique_among_active_links() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let session = server.connect(None);
    let mut ids = HashSet::new();
    for client_id in 0..8 {
        assert!(ids.insert(open_link(&session, client_id).await));
    }
    let response = create_link(&session, 9, "inst0").await;
    assert_eq!(response.error, ErrorCode::OutOfResources);

    // A freed slot can be reused, but never with an id still in use
    let freed = *ids.iter().next().unwrap();
    assert_eq!(session.call(destroy(freed)).await.error(), ErrorCode::NoError);
    ids.remove(&freed);
    let id = open_link(&session, 10).await;
    assert!(!ids.contains(&id));
}

#[tokio::test]
async fn duplicate_client_can_be_rejected() {
    let server = Builder::new()
        .link_policy(LinkPolicy::Multiple { max_links: 4 })
        .reject_duplicate_client(true)
        .build(Loopback::default(), RecordingTransport::default());
    let session = server.connect(None);
    open_link(&session, 7).await;
    let response = create_link(&session, 7, "inst0").await;
    assert_eq!(response.error, ErrorCode::ChannelAlreadyEstablished);
    open_link(&session, 8).await;
}

#[tokio::test]
async fn device_names_are_validated() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let session = server.connect(None);
    assert_eq!(
        create_link(&session, 1, "bogus0").await.error,
        ErrorCode::InvalidLinkIdentifier
    );
    // The loopback instrument only answers to inst names
    assert_eq!(
        create_link(&session, 1, "gpib0,5").await.error,
        ErrorCode::DeviceNotAccessible
    );
    assert_eq!(server.link_count(), 0);
}

#[tokio::test]
async fn destroy_link_is_idempotent() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let session = server.connect(None);
    let link = open_link(&session, 1).await;
    assert_eq!(session.call(destroy(link)).await, CoreResponse::Error(ErrorCode::NoError));
    assert_eq!(
        session.call(destroy(link)).await,
        CoreResponse::Error(ErrorCode::ChannelNotEstablished)
    );
    assert_eq!(server.link_count(), 0);
    assert!(!server.remote_enabled());

    let other = open_link(&session, 2).await;
    assert_eq!(
        session.call(destroy(other + 1)).await,
        CoreResponse::Error(ErrorCode::InvalidLinkIdentifier)
    );
    // Calls on a destroyed link fail like calls on a link that never existed
    assert_eq!(
        expect_write(session.call(write(link, &b"x"[..], Default::default())).await).error,
        ErrorCode::InvalidLinkIdentifier
    );
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let mut events = server.subscribe();
    let session = server.connect(None);
    let first = open_link(&session, 3).await;
    let second = open_link(&session, 4).await;
    session.call(destroy(first)).await;
    drop(session);

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(events.recv().await.unwrap());
    }
    assert!(matches!(
        &received[0],
        ServerEvent::LinkCreated { client_id: 3, device, .. } if device == "inst0"
    ));
    assert!(matches!(&received[1], ServerEvent::LinkCreated { client_id: 4, .. }));
    assert!(matches!(
        &received[2],
        ServerEvent::LinkDestroyed { link, cause: DestroyCause::DestroyLink } if link.get() == first
    ));
    assert!(matches!(
        &received[3],
        ServerEvent::LinkDestroyed {
            link,
            cause: DestroyCause::ConnectionLost,
        } if link.get() == second
    ));
}

#[tokio::test]
async fn shutdown_stops_background_tasks() {
    let server = multi_link_server(RecordingTransport::default());
    let abort = server.abort_handle();
    server.shutdown().await;
    assert_eq!(abort.device_abort(1).await, ErrorCode::ChannelNotEstablished);
}
