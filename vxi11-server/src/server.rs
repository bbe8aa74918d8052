use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use vxi11_protocol::{CoreRequest, CoreResponse, ErrorCode};

use crate::{
    AbortHandle, DeviceLock, Instrument, Link, LinkId, LinkPolicy, RpcTransport, ServiceRequest,
    ServiceRequester, SessionId, abort, engine::DeviceLinkEngine, interrupt::InterruptChannel,
    registry::LinkRegistry,
};

/// Smallest receive buffer a server will advertise.
pub const MIN_RECEIVE_SIZE: u32 = 1024;

/// Number of abort requests that may queue up before senders wait.
const ABORT_QUEUE: usize = 16;

#[derive(Debug, Clone)]
pub struct Config {
    /// Largest `device_write` payload and `device_read` response, reported by `create_link`
    pub max_receive_size: u32,
    pub link_policy: LinkPolicy,
    /// Refuse a second link for a client id that already has one
    pub reject_duplicate_client: bool,
    /// Longest single instrument call during reads and writes; bounds abort latency
    pub poll_interval: Duration,
    pub transfer_chunk_size: usize,
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_receive_size: 64 * 1024,
            link_policy: LinkPolicy::SingleDevice,
            reject_duplicate_client: false,
            poll_interval: Duration::from_millis(10),
            transfer_chunk_size: 4096,
            event_capacity: 64,
        }
    }
}

/// Why a link went away.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DestroyCause {
    /// The client called `destroy_link`
    DestroyLink,
    /// The session that created the link was closed
    ConnectionLost,
}

/// Notifications published by a running server, see [Server::subscribe].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerEvent {
    LinkCreated {
        link: LinkId,
        client_id: i32,
        device: String,
    },
    LinkDestroyed {
        link: LinkId,
        cause: DestroyCause,
    },
    /// The instrument panicked while serving `operation`
    HandlerFault {
        operation: &'static str,
        message: String,
    },
}

/// Builder to create a [Server] instance and modify configuration options
///
/// # Example
///
/// ```ignore
/// use vxi11_server::{LinkPolicy, server::Builder};
/// use std::time::Duration;
///
/// let server = Builder::new()
///     .max_receive_size(16 * 1024)
///     .link_policy(LinkPolicy::Multiple { max_links: 4 })
///     .poll_interval(Duration::from_millis(5))
///     .build(my_instrument, my_transport);
/// ```
#[derive(Default)]
pub struct Builder {
    config: Config,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Set the largest message size this server accepts and returns.
    /// Values below [MIN_RECEIVE_SIZE] are raised to it.
    pub fn max_receive_size(mut self, size: u32) -> Self {
        self.config.max_receive_size = size.max(MIN_RECEIVE_SIZE);
        self
    }

    pub fn link_policy(mut self, policy: LinkPolicy) -> Self {
        self.config.link_policy = policy;
        self
    }

    /// Refuse a second link for the same client id
    pub fn reject_duplicate_client(mut self, reject: bool) -> Self {
        self.config.reject_duplicate_client = reject;
        self
    }

    /// Set how long a single instrument read or write call may block
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the largest block handed to [Instrument::write] at once
    pub fn transfer_chunk_size(mut self, size: usize) -> Self {
        self.config.transfer_chunk_size = size;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Build and start the server. Must be called from within a Tokio runtime.
    pub fn build<I: Instrument, T: RpcTransport>(
        self,
        instrument: I,
        transport: T,
    ) -> Server<I, T> {
        Server::new(instrument, transport, self.config)
    }
}

struct Shared<I: Instrument, T: RpcTransport> {
    engine: DeviceLinkEngine<I>,
    interrupts: InterruptChannel<T>,
    next_session: AtomicU64,
}

/// A VXI-11 device server.
///
/// Owns the link engine, the abort listener and the interrupt channel. The transport opens a
/// [Session] per connection and feeds every decoded core-channel call through it.
pub struct Server<I: Instrument, T: RpcTransport> {
    shared: Arc<Shared<I, T>>,
    config: Config,
    abort: AbortHandle,
    requester: ServiceRequester,
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<I: Instrument, T: RpcTransport> Server<I, T> {
    /// Creates the server and starts the abort listener and service request tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(mut instrument: I, transport: T, mut config: Config) -> Server<I, T> {
        config.max_receive_size = config.max_receive_size.max(MIN_RECEIVE_SIZE);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let registry = Arc::new(LinkRegistry::new(
            config.link_policy,
            config.reject_duplicate_client,
        ));
        let (abort, abort_channel) = abort::channel(registry.clone(), ABORT_QUEUE);
        let (srq_sender, srq_receiver) = mpsc::unbounded_channel();
        let requester = ServiceRequester::new(srq_sender);
        instrument.attach_service_requests(requester.clone());

        let abort_port = transport.abort_port();
        let shared = Arc::new(Shared {
            engine: DeviceLinkEngine::new(
                config.clone(),
                abort_port,
                registry,
                instrument,
                events.clone(),
            ),
            interrupts: InterruptChannel::new(Arc::new(transport)),
            next_session: AtomicU64::new(1),
        });

        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(abort_channel.run(shutdown.clone())),
            tokio::spawn(service_requests(
                shared.clone(),
                srq_receiver,
                shutdown.clone(),
            )),
        ];
        log::info!(
            "Server started, abort port {}, max receive size {}",
            abort_port,
            config.max_receive_size
        );

        Server {
            shared,
            config,
            abort,
            requester,
            events,
            shutdown,
            tasks,
        }
    }

    /// Open a session for a new transport connection.
    pub fn connect(&self, peer: Option<SocketAddr>) -> Session<I, T> {
        let id = SessionId(self.shared.next_session.fetch_add(1, Ordering::Relaxed));
        match peer {
            Some(addr) => log::info!("New client connection {} from {}", id, addr),
            None => log::info!("New client connection {}", id),
        }
        Session {
            id,
            peer,
            shared: self.shared.clone(),
        }
    }

    /// The handle the transport's async-channel listener forwards `device_abort` calls to.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn service_requester(&self) -> ServiceRequester {
        self.requester.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn lock_status(&self) -> DeviceLock {
        self.shared.engine.lock_status()
    }

    /// The link currently holding the device lock
    pub fn lock_owner(&self) -> Option<LinkId> {
        self.lock_status().owner
    }

    pub fn link_count(&self) -> usize {
        self.shared.engine.link_count()
    }

    /// The active links, ordered by id
    pub fn links(&self) -> Vec<Link> {
        self.shared.engine.links()
    }

    pub fn remote_enabled(&self) -> bool {
        self.shared.engine.remote_enabled()
    }

    pub fn interrupt_channel_established(&self) -> bool {
        self.shared.interrupts.is_established()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the background tasks and wait for them to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(err) = task.await {
                log::error!("Server task failed: {}", err);
            }
        }
        log::info!("Server stopped");
    }
}

impl<I: Instrument, T: RpcTransport> Drop for Server<I, T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Forwards service requests to every link that enabled them.
async fn service_requests<I: Instrument, T: RpcTransport>(
    shared: Arc<Shared<I, T>>,
    mut requests: mpsc::UnboundedReceiver<ServiceRequest>,
    shutdown: CancellationToken,
) {
    log::debug!("Service request task started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            request = requests.recv() => {
                if request.is_none() {
                    break;
                }
                // Requests raised while a delivery was in flight are served by one delivery
                while requests.try_recv().is_ok() {}
                let handles: Vec<_> = shared
                    .engine
                    .srq_handles()
                    .into_iter()
                    .map(|(link, handle)| {
                        log::debug!("Service request for link {}", link);
                        handle
                    })
                    .collect();
                shared.interrupts.deliver(&handles).await;
            }
        }
    }
    log::debug!("Service request task stopped");
}

/// One transport connection.
///
/// Dropping the session destroys every link it created. If this session created the interrupt
/// channel, the channel is released and service requests are disabled on every link.
pub struct Session<I: Instrument, T: RpcTransport> {
    id: SessionId,
    peer: Option<SocketAddr>,
    shared: Arc<Shared<I, T>>,
}

impl<I: Instrument, T: RpcTransport> Session<I, T> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Process one core-channel call, forwarding the implementation to the engine.
    pub async fn call(&self, request: CoreRequest) -> CoreResponse {
        let engine = &self.shared.engine;
        match request {
            CoreRequest::CreateLink(params) => {
                log::debug!(
                    "Received create_link: client_id={}, device={:?}, lock_device={}, lock_timeout={}",
                    params.client_id,
                    params.device,
                    params.lock_device,
                    params.lock_timeout
                );
                let response = engine.create_link(self.id, params).await;
                log::debug!("create_link returned: {:?}", response);
                CoreResponse::CreateLink(response)
            }
            CoreRequest::DeviceWrite(params) => {
                log::debug!(
                    "Received device_write: link={}, len={}, flags={:#x}, io_timeout={}, lock_timeout={}",
                    params.link_id,
                    params.data.len(),
                    params.flags.bits(),
                    params.io_timeout,
                    params.lock_timeout
                );
                log::trace!("device_write data: {:02x?}", &params.data[..]);
                let response = engine.device_write(params).await;
                log::debug!("device_write returned: {:?}", response);
                CoreResponse::DeviceWrite(response)
            }
            CoreRequest::DeviceRead(params) => {
                log::debug!(
                    "Received device_read: link={}, request_size={}, flags={:#x}, term_char={:#04x}, io_timeout={}, lock_timeout={}",
                    params.link_id,
                    params.request_size,
                    params.flags.bits(),
                    params.term_char,
                    params.io_timeout,
                    params.lock_timeout
                );
                let response = engine.device_read(params).await;
                log::debug!(
                    "device_read returned: error={}, reason={:#x}, len={}",
                    response.error,
                    response.reason.bits(),
                    response.data.len()
                );
                log::trace!("device_read data: {:02x?}", &response.data[..]);
                CoreResponse::DeviceRead(response)
            }
            CoreRequest::DeviceReadStb(params) => {
                log::debug!("Received device_readstb: {:?}", params);
                CoreResponse::DeviceReadStb(engine.device_readstb(params).await)
            }
            CoreRequest::DeviceTrigger(params) => {
                log::debug!("Received device_trigger: {:?}", params);
                CoreResponse::Error(engine.device_trigger(params).await)
            }
            CoreRequest::DeviceClear(params) => {
                log::debug!("Received device_clear: {:?}", params);
                CoreResponse::Error(engine.device_clear(params).await)
            }
            CoreRequest::DeviceRemote(params) => {
                log::debug!("Received device_remote: {:?}", params);
                CoreResponse::Error(engine.device_remote(params).await)
            }
            CoreRequest::DeviceLocal(params) => {
                log::debug!("Received device_local: {:?}", params);
                CoreResponse::Error(engine.device_local(params).await)
            }
            CoreRequest::DeviceLock(params) => {
                log::debug!("Received device_lock: {:?}", params);
                CoreResponse::Error(engine.device_lock(params).await)
            }
            CoreRequest::DeviceUnlock(params) => {
                log::debug!("Received device_unlock: link={}", params.link_id);
                CoreResponse::Error(engine.device_unlock(params).await)
            }
            CoreRequest::DeviceEnableSrq(params) => {
                log::debug!(
                    "Received device_enable_srq: link={}, enable={}, handle_len={}",
                    params.link_id,
                    params.enable,
                    params.handle.len()
                );
                CoreResponse::Error(engine.device_enable_srq(params).await)
            }
            CoreRequest::DeviceDoCmd(params) => {
                log::debug!(
                    "Received device_docmd: link={}, cmd={:#x}, data_in_len={}",
                    params.link_id,
                    params.cmd,
                    params.data_in.len()
                );
                log::trace!("device_docmd data_in: {:02x?}", &params.data_in[..]);
                CoreResponse::DeviceDoCmd(engine.device_docmd(params).await)
            }
            CoreRequest::DestroyLink(params) => {
                log::debug!("Received destroy_link: link={}", params.link_id);
                CoreResponse::Error(engine.destroy_link(params).await)
            }
            CoreRequest::CreateIntrChan(remote) => {
                log::debug!("Received create_intr_chan: {:?}", remote);
                CoreResponse::Error(self.shared.interrupts.create(self.id, &remote))
            }
            CoreRequest::DestroyIntrChan => {
                log::debug!("Received destroy_intr_chan");
                let error = self.shared.interrupts.destroy();
                if error == ErrorCode::NoError {
                    let disabled = engine.disable_srq();
                    log::debug!("Service requests disabled on {} link(s)", disabled);
                }
                CoreResponse::Error(error)
            }
        }
    }

    /// Close the session, destroying its links.
    pub fn close(self) {}
}

impl<I: Instrument, T: RpcTransport> Drop for Session<I, T> {
    fn drop(&mut self) {
        let links = self.shared.engine.close_session(self.id);
        let interrupt = self.shared.interrupts.release_session(self.id);
        if interrupt {
            self.shared.engine.disable_srq();
        }
        log::info!(
            "Client connection {} closed, {} link(s) destroyed{}",
            self.id,
            links,
            if interrupt {
                ", interrupt channel released"
            } else {
                ""
            }
        );
    }
}
