use std::{
    net::SocketAddrV4,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tokio::sync::mpsc;
use vxi11_protocol::{
    DEVICE_INTR, DEVICE_INTR_VERSION, ErrorCode, InterruptProtocol, RemoteFunc,
};

use crate::{InterruptClient, InterruptTarget, RpcTransport, registry::SessionId};

/// A service request raised by the instrument.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ServiceRequest;

/// Handed to the instrument through [crate::Instrument::attach_service_requests].
#[derive(Clone, Debug)]
pub struct ServiceRequester {
    requests: mpsc::UnboundedSender<ServiceRequest>,
}

impl ServiceRequester {
    pub(crate) fn new(requests: mpsc::UnboundedSender<ServiceRequest>) -> ServiceRequester {
        ServiceRequester { requests }
    }

    /// Signal a service request to every link that enabled them.
    ///
    /// Never blocks. Returns `false` once the server is gone.
    pub fn request_service(&self) -> bool {
        self.requests.send(ServiceRequest).is_ok()
    }
}

type Connection<C> = Arc<tokio::sync::Mutex<Option<C>>>;

struct Registration<C> {
    target: InterruptTarget,
    session: SessionId,
    connection: Connection<C>,
}

/// The client-hosted endpoint that receives `device_intr_srq` calls.
///
/// Creating the channel only records the target. The connection is opened when the first
/// service request has to be delivered and reopened after a failed delivery.
pub(crate) struct InterruptChannel<T: RpcTransport> {
    transport: Arc<T>,
    registration: Mutex<Option<Registration<T::Interrupt>>>,
}

impl<T: RpcTransport> InterruptChannel<T> {
    pub fn new(transport: Arc<T>) -> InterruptChannel<T> {
        InterruptChannel {
            transport,
            registration: Mutex::new(None),
        }
    }

    fn lock_registration(&self) -> MutexGuard<'_, Option<Registration<T::Interrupt>>> {
        self.registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create(&self, session: SessionId, remote: &RemoteFunc) -> ErrorCode {
        let protocol = match InterruptProtocol::try_from(remote.protocol) {
            Ok(InterruptProtocol::Tcp) => InterruptProtocol::Tcp,
            Ok(InterruptProtocol::Udp) | Err(_) => {
                log::warn!("Rejecting interrupt channel with protocol {}", remote.protocol);
                return ErrorCode::OperationNotSupported;
            }
        };
        if remote.program != DEVICE_INTR || remote.version != DEVICE_INTR_VERSION {
            log::warn!(
                "Rejecting interrupt channel for program {:#x} version {}",
                remote.program,
                remote.version
            );
            return ErrorCode::OperationNotSupported;
        }

        let mut registration = self.lock_registration();
        if registration.is_some() {
            return ErrorCode::ChannelAlreadyEstablished;
        }
        let target = InterruptTarget {
            address: SocketAddrV4::new(remote.host_addr, remote.host_port),
            program: remote.program,
            version: remote.version,
            protocol,
        };
        log::info!("Interrupt channel registered for {} by session {}", target.address, session);
        *registration = Some(Registration {
            target,
            session,
            connection: Arc::default(),
        });
        ErrorCode::NoError
    }

    pub fn destroy(&self) -> ErrorCode {
        match self.lock_registration().take() {
            Some(registration) => {
                log::info!("Interrupt channel to {} destroyed", registration.target.address);
                ErrorCode::NoError
            }
            None => ErrorCode::ChannelNotEstablished,
        }
    }

    /// Drops the channel if `session` created it.
    pub fn release_session(&self, session: SessionId) -> bool {
        let mut registration = self.lock_registration();
        if registration
            .as_ref()
            .is_some_and(|registration| registration.session == session)
        {
            if let Some(registration) = registration.take() {
                log::info!(
                    "Interrupt channel to {} released with session {}",
                    registration.target.address,
                    session
                );
            }
            true
        } else {
            false
        }
    }

    pub fn is_established(&self) -> bool {
        self.lock_registration().is_some()
    }

    /// Sends one `device_intr_srq` per handle. Failures are logged and dropped.
    pub async fn deliver(&self, handles: &[Bytes]) {
        if handles.is_empty() {
            return;
        }
        let Some((target, connection)) = self
            .lock_registration()
            .as_ref()
            .map(|registration| (registration.target.clone(), registration.connection.clone()))
        else {
            log::debug!("Service request dropped, no interrupt channel");
            return;
        };

        let mut connection = connection.lock().await;
        if connection.is_none() {
            match self.transport.connect_interrupt(&target).await {
                Ok(client) => {
                    log::debug!("Connected interrupt channel to {}", target.address);
                    *connection = Some(client);
                }
                Err(err) => {
                    log::warn!(
                        "Could not connect interrupt channel to {}: {}",
                        target.address,
                        err
                    );
                    return;
                }
            }
        }

        let mut failed = false;
        if let Some(client) = connection.as_mut() {
            for handle in handles {
                log::trace!("device_intr_srq handle: {:02x?}", &handle[..]);
                if let Err(err) = client.device_intr_srq(handle.clone()).await {
                    log::warn!("Service request delivery to {} failed: {}", target.address, err);
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            *connection = None;
        }
    }
}
