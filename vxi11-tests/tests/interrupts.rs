use std::{net::Ipv4Addr, time::Duration};

use bytes::Bytes;
use vxi11_protocol::{
    CoreRequest, CoreResponse, DEVICE_INTR, DEVICE_INTR_VERSION, EnableSrqParams, ErrorCode,
    InterruptProtocol, RemoteFunc,
};
use vxi11_server::{Instrument, RpcTransport, server::Session};
use vxi11_tests::*;

const CALLBACK_PORT: u16 = 5025;

fn intr_chan(program: u32, protocol: InterruptProtocol) -> CoreRequest {
    CoreRequest::CreateIntrChan(RemoteFunc {
        host_addr: Ipv4Addr::LOCALHOST,
        host_port: CALLBACK_PORT,
        program,
        version: DEVICE_INTR_VERSION,
        protocol: protocol.code(),
    })
}

fn enable_srq(link_id: u32, enable: bool, handle: &[u8]) -> CoreRequest {
    CoreRequest::DeviceEnableSrq(EnableSrqParams {
        link_id,
        enable,
        handle: Bytes::copy_from_slice(handle),
    })
}

async fn trigger<I: Instrument, T: RpcTransport>(session: &Session<I, T>, link: u32) {
    assert_eq!(
        session.call(CoreRequest::DeviceTrigger(generic(link))).await,
        CoreResponse::Error(ErrorCode::NoError)
    );
}

#[tokio::test]
async fn interrupt_channel_is_created_once() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let session = server.connect(None);
    assert_eq!(
        session.call(CoreRequest::DestroyIntrChan).await.error(),
        ErrorCode::ChannelNotEstablished
    );
    assert_eq!(
        session
            .call(intr_chan(DEVICE_INTR, InterruptProtocol::Tcp))
            .await
            .error(),
        ErrorCode::NoError
    );
    assert!(server.interrupt_channel_established());
    assert_eq!(
        session
            .call(intr_chan(DEVICE_INTR, InterruptProtocol::Tcp))
            .await
            .error(),
        ErrorCode::ChannelAlreadyEstablished
    );
    assert_eq!(
        session.call(CoreRequest::DestroyIntrChan).await.error(),
        ErrorCode::NoError
    );
    assert_eq!(
        session.call(CoreRequest::DestroyIntrChan).await.error(),
        ErrorCode::ChannelNotEstablished
    );
}

#[tokio::test]
async fn foreign_interrupt_programs_are_refused() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let session = server.connect(None);
    assert_eq!(
        session
            .call(intr_chan(0x0607AF, InterruptProtocol::Tcp))
            .await
            .error(),
        ErrorCode::OperationNotSupported
    );
    assert_eq!(
        session
            .call(intr_chan(DEVICE_INTR, InterruptProtocol::Udp))
            .await
            .error(),
        ErrorCode::OperationNotSupported
    );
    assert!(!server.interrupt_channel_established());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn service_request_echoes_handle_over_lazy_connection() {
    init_logging();
    let transport = RecordingTransport::default();
    let server = multi_link_server(transport.clone());
    let session = server.connect(None);
    let enabled = open_link(&session, 1).await;
    let disabled = open_link(&session, 2).await;

    session
        .call(intr_chan(DEVICE_INTR, InterruptProtocol::Tcp))
        .await;
    assert_eq!(
        session.call(enable_srq(enabled, true, b"link-a")).await.error(),
        ErrorCode::NoError
    );
    session.call(enable_srq(disabled, true, b"link-b")).await;
    session.call(enable_srq(disabled, false, b"link-b")).await;
    // Nothing is connected before the first service request
    assert_eq!(transport.connects(), 0);

    trigger(&session, enabled).await;
    assert!(wait_until(|| transport.handles().len() == 1).await);
    assert_eq!(transport.handles(), vec![Bytes::from_static(b"link-a")]);
    let targets = transport.targets();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].address.port(), CALLBACK_PORT);
    assert_eq!(targets[0].program, DEVICE_INTR);

    trigger(&session, enabled).await;
    assert!(wait_until(|| transport.handles().len() == 2).await);
    assert_eq!(transport.connects(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_delivery_reconnects() {
    init_logging();
    let transport = RecordingTransport::default();
    let server = multi_link_server(transport.clone());
    let session = server.connect(None);
    let link = open_link(&session, 1).await;
    session
        .call(intr_chan(DEVICE_INTR, InterruptProtocol::Tcp))
        .await;
    session.call(enable_srq(link, true, b"h")).await;

    transport.fail_next_send();
    trigger(&session, link).await;
    assert!(wait_until(|| transport.failures() == 1).await);
    assert!(transport.handles().is_empty());

    trigger(&session, link).await;
    assert!(wait_until(|| transport.handles().len() == 1).await);
    assert_eq!(transport.connects(), 2);
}

#[tokio::test]
async fn oversized_srq_handle_is_refused() {
    let server = multi_link_server(RecordingTransport::default());
    let session = server.connect(None);
    let link = open_link(&session, 1).await;
    assert_eq!(
        session.call(enable_srq(link, true, &[0; 41])).await.error(),
        ErrorCode::ParameterError
    );
    assert_eq!(
        session.call(enable_srq(link, true, &[0; 40])).await.error(),
        ErrorCode::NoError
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroyed_links_receive_no_service_requests() {
    init_logging();
    let transport = RecordingTransport::default();
    let server = multi_link_server(transport.clone());
    let session = server.connect(None);
    let gone = open_link(&session, 1).await;
    let kept = open_link(&session, 2).await;
    session
        .call(intr_chan(DEVICE_INTR, InterruptProtocol::Tcp))
        .await;
    session.call(enable_srq(gone, true, b"gone")).await;
    session.call(destroy(gone)).await;

    trigger(&session, kept).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(transport.handles().is_empty());
}

#[tokio::test]
async fn closing_session_releases_its_interrupt_channel() {
    init_logging();
    let server = multi_link_server(RecordingTransport::default());
    let owner = server.connect(None);
    let other = server.connect(None);
    owner
        .call(intr_chan(DEVICE_INTR, InterruptProtocol::Tcp))
        .await;
    drop(other);
    assert!(server.interrupt_channel_established());
    owner.close();
    assert!(!server.interrupt_channel_established());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroying_interrupt_channel_disables_service_requests() {
    init_logging();
    let transport = RecordingTransport::default();
    let server = multi_link_server(transport.clone());
    let session = server.connect(None);
    let link = open_link(&session, 1).await;
    session
        .call(intr_chan(DEVICE_INTR, InterruptProtocol::Tcp))
        .await;
    session.call(enable_srq(link, true, b"h")).await;
    assert_eq!(
        session.call(CoreRequest::DestroyIntrChan).await.error(),
        ErrorCode::NoError
    );
    assert_eq!(
        session
            .call(intr_chan(DEVICE_INTR, InterruptProtocol::Tcp))
            .await
            .error(),
        ErrorCode::NoError
    );

    trigger(&session, link).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(transport.handles().is_empty());

    // Enabling again resumes delivery
    session.call(enable_srq(link, true, b"again")).await;
    trigger(&session, link).await;
    assert!(wait_until(|| transport.handles().len() == 1).await);
    assert_eq!(transport.handles(), vec![Bytes::from_static(b"again")]);
}
