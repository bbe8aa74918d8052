//! Fixtures shared by the integration tests: a transport that records service requests
//! and shorthands for building core-channel calls.
use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use vxi11_protocol::{
    CoreRequest, CoreResponse, CreateLinkParams, CreateLinkResponse, ErrorCode, GenericParams,
    LinkParams, LockParams, OperationFlags, ReadParams, ReadResponse, WriteParams, WriteResponse,
};
use vxi11_server::{
    Instrument, InterruptClient, InterruptTarget, LinkPolicy, RpcTransport,
    loopback::Loopback,
    server::{Builder, Server, Session},
};

pub const ABORT_PORT: u16 = 1025;
pub const IO_TIMEOUT: u32 = 1000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Default)]
pub struct Recording {
    pub targets: Vec<InterruptTarget>,
    pub handles: Vec<Bytes>,
    pub fail_next_send: bool,
    pub failures: usize,
}

/// Records interrupt connections and every delivered `device_intr_srq` handle.
#[derive(Clone, Debug, Default)]
pub struct RecordingTransport {
    recording: Arc<Mutex<Recording>>,
}

impl RecordingTransport {
    pub fn connects(&self) -> usize {
        self.recording.lock().unwrap().targets.len()
    }

    pub fn targets(&self) -> Vec<InterruptTarget> {
        self.recording.lock().unwrap().targets.clone()
    }

    pub fn handles(&self) -> Vec<Bytes> {
        self.recording.lock().unwrap().handles.clone()
    }

    pub fn failures(&self) -> usize {
        self.recording.lock().unwrap().failures
    }

    /// Make the next `device_intr_srq` fail as if the connection broke.
    pub fn fail_next_send(&self) {
        self.recording.lock().unwrap().fail_next_send = true;
    }
}

pub struct RecordingClient {
    recording: Arc<Mutex<Recording>>,
}

impl InterruptClient for RecordingClient {
    async fn device_intr_srq(&mut self, handle: Bytes) -> io::Result<()> {
        let mut recording = self.recording.lock().unwrap();
        if recording.fail_next_send {
            recording.fail_next_send = false;
            recording.failures += 1;
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        recording.handles.push(handle);
        Ok(())
    }
}

impl RpcTransport for RecordingTransport {
    type Interrupt = RecordingClient;

    fn abort_port(&self) -> u16 {
        ABORT_PORT
    }

    async fn connect_interrupt(&self, target: &InterruptTarget) -> io::Result<RecordingClient> {
        self.recording.lock().unwrap().targets.push(target.clone());
        Ok(RecordingClient {
            recording: self.recording.clone(),
        })
    }
}

pub type TestServer = Server<Loopback, RecordingTransport>;

/// A loopback server accepting several links.
pub fn multi_link_server(transport: RecordingTransport) -> TestServer {
    Builder::new()
        .link_policy(LinkPolicy::Multiple { max_links: 8 })
        .build(Loopback::default(), transport)
}

pub fn create_link_request(client_id: i32, device: &str) -> CoreRequest {
    CoreRequest::CreateLink(CreateLinkParams {
        client_id,
        lock_device: false,
        lock_timeout: 0,
        device: device.to_string(),
    })
}

pub async fn create_link<I: Instrument, T: RpcTransport>(
    session: &Session<I, T>,
    client_id: i32,
    device: &str,
) -> CreateLinkResponse {
    match session.call(create_link_request(client_id, device)).await {
        CoreResponse::CreateLink(response) => response,
        other => panic!("unexpected response to create_link: {:?}", other),
    }
}

/// Creates a link to `inst0` and returns its id.
pub async fn open_link<I: Instrument, T: RpcTransport>(
    session: &Session<I, T>,
    client_id: i32,
) -> u32 {
    let response = create_link(session, client_id, "inst0").await;
    assert_eq!(response.error, ErrorCode::NoError);
    response.link_id
}

pub fn generic(link_id: u32) -> GenericParams {
    GenericParams {
        link_id,
        flags: OperationFlags::NONE,
        lock_timeout: 0,
        io_timeout: IO_TIMEOUT,
    }
}

pub fn destroy(link_id: u32) -> CoreRequest {
    CoreRequest::DestroyLink(LinkParams { link_id })
}

pub fn write(link_id: u32, data: impl Into<Bytes>, flags: OperationFlags) -> CoreRequest {
    CoreRequest::DeviceWrite(WriteParams {
        link_id,
        io_timeout: IO_TIMEOUT,
        lock_timeout: 0,
        flags,
        data: data.into(),
    })
}

pub fn read(
    link_id: u32,
    request_size: u32,
    flags: OperationFlags,
    term_char: u8,
    io_timeout: u32,
) -> CoreRequest {
    CoreRequest::DeviceRead(ReadParams {
        link_id,
        request_size,
        io_timeout,
        lock_timeout: 0,
        flags,
        term_char,
    })
}

pub fn lock(link_id: u32, wait: bool, lock_timeout: u32) -> CoreRequest {
    CoreRequest::DeviceLock(LockParams {
        link_id,
        flags: if wait {
            OperationFlags::WAIT_LOCK
        } else {
            OperationFlags::NONE
        },
        lock_timeout,
    })
}

pub fn unlock(link_id: u32) -> CoreRequest {
    CoreRequest::DeviceUnlock(LinkParams { link_id })
}

pub fn expect_write(response: CoreResponse) -> WriteResponse {
    match response {
        CoreResponse::DeviceWrite(response) => response,
        other => panic!("unexpected response to device_write: {:?}", other),
    }
}

pub fn expect_read(response: CoreResponse) -> ReadResponse {
    match response {
        CoreResponse::DeviceRead(response) => response,
        other => panic!("unexpected response to device_read: {:?}", other),
    }
}

/// Polls `condition` for up to two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
