use std::{
    io,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use vxi11_protocol::{
    CreateLinkParams, CreateLinkResponse, DoCmdParams, DoCmdResponse, EnableSrqParams, ErrorCode,
    GenericParams, LinkParams, LockParams, MAX_SRQ_HANDLE_LEN, OperationFlags, ReadParams,
    ReadResponse, ReadStbResponse, WriteParams, WriteResponse, device_name::DeviceName,
};

use crate::{
    Instrument,
    lock::{DeviceLock, LockManager},
    registry::{Link, LinkEntry, LinkId, LinkRegistry, NewLink, SessionId},
    server::{Config, DestroyCause, ServerEvent},
    transfer::{InstrumentHandle, IoControl, ReadRequest, error_from_io},
};

fn millis(ms: u32) -> Duration {
    Duration::from_millis(ms as u64)
}

/// The link and lock state machine of one device.
///
/// Every public operation returns a complete response; failures are reported through the
/// error code of the response.
pub(crate) struct DeviceLinkEngine<I> {
    config: Config,
    abort_port: u16,
    registry: Arc<LinkRegistry>,
    locks: LockManager,
    instrument: InstrumentHandle<I>,
    remote_enabled: AtomicBool,
    /// `*IDN?`-style identity, queried by the first successful `create_link`
    identity: OnceLock<String>,
    events: broadcast::Sender<ServerEvent>,
}

impl<I: Instrument> DeviceLinkEngine<I> {
    pub fn new(
        config: Config,
        abort_port: u16,
        registry: Arc<LinkRegistry>,
        instrument: I,
        events: broadcast::Sender<ServerEvent>,
    ) -> DeviceLinkEngine<I> {
        let instrument =
            InstrumentHandle::new(instrument, events.clone(), config.transfer_chunk_size);
        DeviceLinkEngine {
            config,
            abort_port,
            registry,
            locks: LockManager::new(),
            instrument,
            remote_enabled: AtomicBool::new(false),
            identity: OnceLock::new(),
            events,
        }
    }

    pub fn lock_status(&self) -> DeviceLock {
        self.locks.status()
    }

    pub fn link_count(&self) -> usize {
        self.registry.len()
    }

    pub fn links(&self) -> Vec<Link> {
        self.registry.links()
    }

    pub fn remote_enabled(&self) -> bool {
        self.remote_enabled.load(Ordering::SeqCst)
    }

    pub async fn create_link(
        &self,
        session: SessionId,
        params: CreateLinkParams,
    ) -> CreateLinkResponse {
        match self.link(session, params).await {
            Ok(link) => CreateLinkResponse {
                error: ErrorCode::NoError,
                link_id: link.id.get(),
                abort_port: link.abort_port,
                max_receive_size: link.max_receive_size,
            },
            Err(error) => CreateLinkResponse {
                error,
                link_id: 0,
                abort_port: self.abort_port,
                max_receive_size: self.config.max_receive_size,
            },
        }
    }

    async fn link(&self, session: SessionId, params: CreateLinkParams) -> Result<Link, ErrorCode> {
        self.registry.admit(params.client_id)?;
        let device: DeviceName = params.device.parse().map_err(|err| {
            log::warn!("Rejecting device name {:?}: {}", params.device, err);
            ErrorCode::InvalidLinkIdentifier
        })?;

        let requested = device.clone();
        let identify = self.identity.get().is_none();
        let (supported, identity) = self
            .instrument
            .call("create_link", move |instrument| {
                let supported = instrument.supports(&requested);
                let identity = (supported && identify).then(|| instrument.identify());
                Ok((supported, identity))
            })
            .await?
            .map_err(|err| error_from_io(&err))?;
        if !supported {
            log::warn!("Instrument does not serve device {}", device);
            return Err(ErrorCode::DeviceNotAccessible);
        }
        match identity {
            Some(Ok(identity)) => {
                log::info!("Instrument identifies as {}", identity);
                let _ = self.identity.set(identity);
            }
            Some(Err(err)) => log::warn!("Instrument identity unavailable: {}", err),
            None => {}
        }

        let entry = self.registry.create(NewLink {
            client_id: params.client_id,
            device: device.clone(),
            max_receive_size: self.config.max_receive_size,
            abort_port: self.abort_port,
            session,
        })?;
        let id = entry.id();

        if params.lock_device {
            // The client does not know the link id yet, so this wait cannot be aborted.
            let never = CancellationToken::new();
            if let Err(error) = self
                .locks
                .acquire(id, true, millis(params.lock_timeout), &never)
                .await
            {
                log::info!("Link {} could not lock {}: {}", id, device, error);
                if self.registry.remove_entry(&entry).is_ok() {
                    entry.close();
                }
                return Err(error);
            }
        }

        self.remote_enabled.store(true, Ordering::SeqCst);
        log::info!(
            "Created link {} to {} ({}) for client {} on session {}",
            id,
            device,
            self.identity.get().map_or("unidentified", String::as_str),
            params.client_id,
            session
        );
        let _ = self.events.send(ServerEvent::LinkCreated {
            link: id,
            client_id: params.client_id,
            device: device.to_string(),
        });
        Ok(entry.link().clone())
    }

    /// Removes a link once every earlier call on it has finished.
    pub async fn destroy_link(&self, params: LinkParams) -> ErrorCode {
        into_code(self.destroy(params).await)
    }

    async fn destroy(&self, params: LinkParams) -> Result<(), ErrorCode> {
        let entry = self.registry.lookup(params.link_id)?;
        let _order = entry.order().await;
        // The connection may have closed while this call waited
        self.registry.remove_entry(&entry)?;
        self.release(&entry, DestroyCause::DestroyLink);
        Ok(())
    }

    /// Destroys every link of a session whose connection went away.
    pub fn close_session(&self, session: SessionId) -> usize {
        let entries = self.registry.remove_session(session);
        for entry in &entries {
            self.release(entry, DestroyCause::ConnectionLost);
        }
        entries.len()
    }

    /// Cleanup shared by `destroy_link` and connection loss. Cannot fail.
    ///
    /// Only connection loss can find a call still in flight; it is cancelled.
    fn release(&self, entry: &LinkEntry, cause: DestroyCause) {
        entry.close();
        let id = entry.id();
        if self.locks.release_link(id) {
            log::debug!("Released device lock held by link {}", id);
        }
        if self.registry.is_empty() {
            self.remote_enabled.store(false, Ordering::SeqCst);
        }
        log::info!("Destroyed link {} ({:?})", id, cause);
        let _ = self
            .events
            .send(ServerEvent::LinkDestroyed { link: id, cause });
    }

    /// Looks up a link that is still open.
    fn enter(&self, link_id: u32) -> Result<Arc<LinkEntry>, ErrorCode> {
        let entry = self.registry.lookup(link_id)?;
        if entry.is_closed() {
            return Err(ErrorCode::InvalidLinkIdentifier);
        }
        Ok(entry)
    }

    pub async fn device_write(&self, params: WriteParams) -> WriteResponse {
        self.write(params)
            .await
            .unwrap_or_else(|error| WriteResponse { error, size: 0 })
    }

    async fn write(&self, params: WriteParams) -> Result<WriteResponse, ErrorCode> {
        let entry = self.enter(params.link_id)?;
        if params.data.len() > entry.link().max_receive_size as usize {
            log::warn!(
                "Link {} write of {} bytes exceeds the maximum of {}",
                entry.id(),
                params.data.len(),
                entry.link().max_receive_size
            );
            return Err(ErrorCode::IoError);
        }
        let _order = entry.order().await;
        let pending = entry.begin_io()?;
        self.locks
            .check(
                entry.id(),
                params.flags.contains(OperationFlags::WAIT_LOCK),
                millis(params.lock_timeout),
                pending.token(),
            )
            .await?;

        let mut control = IoControl::new(
            pending.token(),
            millis(params.io_timeout),
            self.config.poll_interval,
        );
        let outcome = self
            .instrument
            .write(
                params.data,
                params.flags.contains(OperationFlags::END),
                &mut control,
            )
            .await;
        Ok(WriteResponse {
            error: outcome.error,
            size: outcome.size as u32,
        })
    }

    pub async fn device_read(&self, params: ReadParams) -> ReadResponse {
        self.read(params)
            .await
            .unwrap_or_else(|error| ReadResponse {
                error,
                reason: Default::default(),
                data: Default::default(),
            })
    }

    async fn read(&self, params: ReadParams) -> Result<ReadResponse, ErrorCode> {
        let entry = self.enter(params.link_id)?;
        let _order = entry.order().await;
        let pending = entry.begin_io()?;
        self.locks
            .check(
                entry.id(),
                params.flags.contains(OperationFlags::WAIT_LOCK),
                millis(params.lock_timeout),
                pending.token(),
            )
            .await?;

        let request = ReadRequest {
            request_size: params.request_size as usize,
            capacity: entry.link().max_receive_size as usize,
            term_char: params
                .flags
                .contains(OperationFlags::TERM_CHAR_SET)
                .then_some(params.term_char),
        };
        let mut control = IoControl::new(
            pending.token(),
            millis(params.io_timeout),
            self.config.poll_interval,
        );
        let outcome = self.instrument.read(request, &mut control).await;
        Ok(ReadResponse {
            error: outcome.error,
            reason: outcome.reason,
            data: outcome.data.into(),
        })
    }

    /// Runs a lock-sensitive instrument operation bounded by `io_timeout`.
    async fn generic<R, F>(
        &self,
        operation: &'static str,
        params: &GenericParams,
        f: F,
    ) -> Result<R, ErrorCode>
    where
        F: FnOnce(&mut I) -> io::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.guarded(
            operation,
            params.link_id,
            params.flags,
            params.lock_timeout,
            params.io_timeout,
            f,
        )
        .await
    }

    /// The instrument call itself cannot be interrupted. When the caller gets `IoTimeout` or
    /// `Abort` the call keeps running on the blocking pool, and the next instrument call waits
    /// until it returns.
    async fn guarded<R, F>(
        &self,
        operation: &'static str,
        link_id: u32,
        flags: OperationFlags,
        lock_timeout: u32,
        io_timeout: u32,
        f: F,
    ) -> Result<R, ErrorCode>
    where
        F: FnOnce(&mut I) -> io::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let entry = self.enter(link_id)?;
        let _order = entry.order().await;
        let pending = entry.begin_io()?;
        self.locks
            .check(
                entry.id(),
                flags.contains(OperationFlags::WAIT_LOCK),
                millis(lock_timeout),
                pending.token(),
            )
            .await?;

        let call = tokio::time::timeout(millis(io_timeout), self.instrument.call(operation, f));
        tokio::select! {
            biased;
            _ = pending.token().cancelled() => Err(ErrorCode::Abort),
            result = call => match result {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(err))) => {
                    log::warn!("{} failed on link {}: {}", operation, entry.id(), err);
                    Err(error_from_io(&err))
                }
                Ok(Err(error)) => Err(error),
                Err(_) => Err(ErrorCode::IoTimeout),
            },
        }
    }

    pub async fn device_readstb(&self, params: GenericParams) -> ReadStbResponse {
        match self
            .generic("device_readstb", &params, |instrument| {
                instrument.read_status_byte()
            })
            .await
        {
            Ok(stb) => ReadStbResponse {
                error: ErrorCode::NoError,
                stb,
            },
            Err(error) => ReadStbResponse { error, stb: 0 },
        }
    }

    pub async fn device_trigger(&self, params: GenericParams) -> ErrorCode {
        into_code(
            self.generic("device_trigger", &params, |instrument| instrument.trigger())
                .await,
        )
    }

    pub async fn device_clear(&self, params: GenericParams) -> ErrorCode {
        into_code(
            self.generic("device_clear", &params, |instrument| instrument.clear())
                .await,
        )
    }

    pub async fn device_remote(&self, params: GenericParams) -> ErrorCode {
        self.set_remote("device_remote", params, true).await
    }

    pub async fn device_local(&self, params: GenericParams) -> ErrorCode {
        self.set_remote("device_local", params, false).await
    }

    async fn set_remote(
        &self,
        operation: &'static str,
        params: GenericParams,
        remote: bool,
    ) -> ErrorCode {
        let result = self
            .generic(operation, &params, move |instrument| {
                instrument.set_remote(remote)
            })
            .await;
        if result.is_ok() {
            self.remote_enabled.store(remote, Ordering::SeqCst);
        }
        into_code(result)
    }

    pub async fn device_lock(&self, params: LockParams) -> ErrorCode {
        into_code(self.lock(params).await)
    }

    async fn lock(&self, params: LockParams) -> Result<(), ErrorCode> {
        let entry = self.enter(params.link_id)?;
        let _order = entry.order().await;
        let pending = entry.begin_io()?;
        self.locks
            .acquire(
                entry.id(),
                params.flags.contains(OperationFlags::WAIT_LOCK),
                millis(params.lock_timeout),
                pending.token(),
            )
            .await?;
        log::debug!("Link {} locked the device", entry.id());
        Ok(())
    }

    pub async fn device_unlock(&self, params: LinkParams) -> ErrorCode {
        into_code(self.unlock(params).await)
    }

    async fn unlock(&self, params: LinkParams) -> Result<(), ErrorCode> {
        let entry = self.enter(params.link_id)?;
        let _order = entry.order().await;
        self.locks.release(entry.id())?;
        log::debug!("Link {} unlocked the device", entry.id());
        Ok(())
    }

    pub async fn device_enable_srq(&self, params: EnableSrqParams) -> ErrorCode {
        into_code(self.enable_srq(params).await)
    }

    async fn enable_srq(&self, params: EnableSrqParams) -> Result<(), ErrorCode> {
        let entry = self.enter(params.link_id)?;
        if params.handle.len() > MAX_SRQ_HANDLE_LEN {
            return Err(ErrorCode::ParameterError);
        }
        let _order = entry.order().await;
        entry.set_srq(params.enable, params.handle)?;
        log::debug!(
            "Link {} {} service requests",
            entry.id(),
            if params.enable { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub async fn device_docmd(&self, params: DoCmdParams) -> DoCmdResponse {
        let DoCmdParams {
            link_id,
            flags,
            io_timeout,
            lock_timeout,
            cmd,
            network_order,
            data_size,
            data_in,
        } = params;
        match self
            .guarded(
                "device_docmd",
                link_id,
                flags,
                lock_timeout,
                io_timeout,
                move |instrument| instrument.do_cmd(cmd, network_order, data_size, &data_in),
            )
            .await
        {
            Ok(data_out) => DoCmdResponse {
                error: ErrorCode::NoError,
                data_out: data_out.into(),
            },
            Err(error) => DoCmdResponse {
                error,
                data_out: Default::default(),
            },
        }
    }

    /// Disables service requests on every link, returning how many had them enabled.
    pub fn disable_srq(&self) -> usize {
        self.registry.disable_srq()
    }

    /// The handles of all links that currently accept service requests.
    pub fn srq_handles(&self) -> Vec<(LinkId, bytes::Bytes)> {
        self.registry.srq_handles()
    }
}

fn into_code(result: Result<(), ErrorCode>) -> ErrorCode {
    result.err().unwrap_or(ErrorCode::NoError)
}
