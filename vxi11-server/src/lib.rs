//! # VXI-11 Server Library
//!
//! This crate provides the device-link engine of a VXI-11 instrument server: the component
//! that creates and destroys links, arbitrates the device lock and executes reads, writes and
//! the other device operations against an instrument backend.
//!
//! ## Overview
//!
//! VXI-11 is a stateful protocol layered on ONC RPC. This library handles the protocol state
//! machine and leaves message framing and XDR marshaling to an RPC transport. Both sides are
//! expressed as traits:
//!
//! - **[`Instrument`]**: the backend that moves bytes to and from the physical device
//! - **[`RpcTransport`]**: the transport that reports the abort port and opens connections
//!   back to the client for service requests
//!
//! ## Architecture
//!
//! - **[`server::Server`]** owns the engine, the abort listener and the interrupt channel
//! - **[`server::Session`]** represents one transport connection; the transport feeds every
//!   decoded core-channel call through [`server::Session::call`]. Dropping a session destroys
//!   the links it created.
//! - **[`AbortHandle`]** is handed to the transport's async-channel listener and cancels the
//!   in-progress call of a link.
//! - **[`ServiceRequester`]** is handed to the instrument and forwards service requests to
//!   every link that enabled them.
//!
//! ## Basic Usage
//!
//! ```ignore
//! use vxi11_server::{loopback::Loopback, server::Builder};
//! use vxi11_protocol::{CoreRequest, CreateLinkParams};
//!
//! let server = Builder::new()
//!     .max_receive_size(16 * 1024)
//!     .build(Loopback::default(), my_transport);
//!
//! let session = server.connect(Some(peer_addr));
//! let response = session
//!     .call(CoreRequest::CreateLink(CreateLinkParams {
//!         client_id: 1,
//!         lock_device: false,
//!         lock_timeout: 0,
//!         device: "inst0".to_string(),
//!     }))
//!     .await;
//! ```
//!
//! ## Concurrency
//!
//! Every session may be driven from its own task. Calls on different links run concurrently and
//! only contend for the device lock. Calls on the same link are executed in order. Instrument
//! calls run on Tokio's blocking pool, one at a time.
//!
//! ## Logging
//!
//! This crate uses the `log` crate for diagnostics: link lifecycle at `info`, every dispatched
//! procedure at `debug` and payload bytes at `trace`.
use std::{future::Future, io, net::SocketAddrV4, time::Duration};

use bytes::Bytes;
use vxi11_protocol::{InterruptProtocol, device_name::DeviceName};

mod abort;
mod engine;
mod interrupt;
mod lock;
pub mod loopback;
mod registry;
pub mod server;
mod transfer;

pub use abort::AbortHandle;
pub use interrupt::{ServiceRequest, ServiceRequester};
pub use lock::DeviceLock;
pub use registry::{Link, LinkId, LinkPolicy, SessionId};

/// The result of a single [Instrument::read] call.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ReadChunk {
    /// Number of bytes placed at the start of the buffer
    pub len: usize,
    /// The last byte carried the END indicator
    pub end: bool,
}

/// Trait that instrument backends must implement.
///
/// The engine never calls an instrument concurrently. Calls run on a blocking thread, so
/// implementations may block for up to the timeout they are given.
///
/// `read` and `write` are called repeatedly with short timeouts so that aborts and I/O timeouts
/// are observed promptly. Returning an error of kind [io::ErrorKind::TimedOut] or
/// [io::ErrorKind::WouldBlock] from them means "no progress yet" and the engine polls again.
/// An error of kind [io::ErrorKind::Unsupported] is reported as `OperationNotSupported`, any
/// other error as `IoError`.
pub trait Instrument: Send + 'static {
    /// Write bytes to the device, marking the last byte with END if `end` is set.
    ///
    /// Returns the number of bytes the device accepted, which may be fewer than `data.len()`.
    /// `end` only applies when all bytes are accepted.
    fn write(&mut self, data: &[u8], end: bool, timeout: Duration) -> io::Result<usize>;

    /// Read bytes from the device into `buf`.
    ///
    /// Implementations must stop after a byte equal to `term_char` and after a byte carrying END.
    fn read(
        &mut self,
        buf: &mut [u8],
        term_char: Option<u8>,
        timeout: Duration,
    ) -> io::Result<ReadChunk>;

    fn read_status_byte(&mut self) -> io::Result<u8>;

    fn trigger(&mut self) -> io::Result<()>;

    /// Reset the device's input and output buffers.
    fn clear(&mut self) -> io::Result<()>;

    /// Enable (`true`) or disable (`false`) remote control of the device.
    fn set_remote(&mut self, remote: bool) -> io::Result<()> {
        let _ = remote;
        Ok(())
    }

    /// Execute a vendor specific command.
    fn do_cmd(
        &mut self,
        cmd: i32,
        network_order: bool,
        data_size: i32,
        data_in: &[u8],
    ) -> io::Result<Vec<u8>> {
        let _ = (cmd, network_order, data_size, data_in);
        Err(io::ErrorKind::Unsupported.into())
    }

    /// A human readable identity of the device, used for diagnostics.
    ///
    /// Queried by the first `create_link` that succeeds in reaching the instrument.
    fn identify(&mut self) -> io::Result<String>;

    /// Whether this instrument answers to the given device name.
    fn supports(&self, device: &DeviceName) -> bool {
        let _ = device;
        true
    }

    /// Called once when the server starts.
    /// Instruments that raise service requests keep the requester and call it later.
    fn attach_service_requests(&mut self, requester: ServiceRequester) {
        let _ = requester;
    }
}

/// The client-hosted endpoint that service requests are delivered to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InterruptTarget {
    pub address: SocketAddrV4,
    pub program: u32,
    pub version: u32,
    pub protocol: InterruptProtocol,
}

/// The RPC transport the server is bound to.
pub trait RpcTransport: Send + Sync + 'static {
    type Interrupt: InterruptClient;

    /// The port on which the transport serves the async (abort) program.
    fn abort_port(&self) -> u16;

    /// Open a connection to the client's interrupt channel.
    ///
    /// Called lazily, when the first service request has to be delivered.
    fn connect_interrupt(
        &self,
        target: &InterruptTarget,
    ) -> impl Future<Output = io::Result<Self::Interrupt>> + Send;
}

/// A connection to a client's interrupt channel.
pub trait InterruptClient: Send + 'static {
    /// Invoke `device_intr_srq` on the client. This is a one-way call; no reply is awaited.
    fn device_intr_srq(&mut self, handle: Bytes) -> impl Future<Output = io::Result<()>> + Send;
}
