use std::{
    fmt::Display,
    net::Ipv4Addr,
    ops::{BitOr, BitOrAssign},
};

use bytes::Bytes;

/// RPC program number of the core channel.
pub const DEVICE_CORE: u32 = 0x0607AF;
/// RPC program version of the core channel.
pub const DEVICE_CORE_VERSION: u32 = 1;
/// RPC program number of the async (abort) channel.
pub const DEVICE_ASYNC: u32 = 0x0607B0;
/// RPC program version of the async (abort) channel.
pub const DEVICE_ASYNC_VERSION: u32 = 1;
/// RPC program number of the interrupt channel hosted by the client.
pub const DEVICE_INTR: u32 = 0x0607B1;
/// RPC program version of the interrupt channel hosted by the client.
pub const DEVICE_INTR_VERSION: u32 = 1;

/// Procedure numbers of the three VXI-11 programs.
pub mod procedure {
    pub const DEVICE_ABORT: u32 = 1;

    pub const CREATE_LINK: u32 = 10;
    pub const DEVICE_WRITE: u32 = 11;
    pub const DEVICE_READ: u32 = 12;
    pub const DEVICE_READSTB: u32 = 13;
    pub const DEVICE_TRIGGER: u32 = 14;
    pub const DEVICE_CLEAR: u32 = 15;
    pub const DEVICE_REMOTE: u32 = 16;
    pub const DEVICE_LOCAL: u32 = 17;
    pub const DEVICE_LOCK: u32 = 18;
    pub const DEVICE_UNLOCK: u32 = 19;
    pub const DEVICE_ENABLE_SRQ: u32 = 20;
    pub const DEVICE_DOCMD: u32 = 22;
    pub const DESTROY_LINK: u32 = 23;
    pub const CREATE_INTR_CHAN: u32 = 25;
    pub const DESTROY_INTR_CHAN: u32 = 26;

    pub const DEVICE_INTR_SRQ: u32 = 30;
}

/// Maximum length of the opaque handle passed to `device_enable_srq`.
pub const MAX_SRQ_HANDLE_LEN: usize = 40;

/// Error codes returned by every VXI-11 procedure.
///
/// The discriminants are the values transferred on the wire and must not change.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    NoError = 0,
    SyntaxError = 1,
    DeviceNotAccessible = 3,
    InvalidLinkIdentifier = 4,
    ParameterError = 5,
    ChannelNotEstablished = 6,
    OperationNotSupported = 8,
    OutOfResources = 9,
    DeviceLockedByAnotherLink = 11,
    NoLockHeldByThisLink = 12,
    IoTimeout = 15,
    IoError = 17,
    InvalidAddress = 21,
    Abort = 23,
    ChannelAlreadyEstablished = 29,
}

impl ErrorCode {
    /// The wire value of this error code
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::NoError
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ErrorCode::NoError,
            1 => ErrorCode::SyntaxError,
            3 => ErrorCode::DeviceNotAccessible,
            4 => ErrorCode::InvalidLinkIdentifier,
            5 => ErrorCode::ParameterError,
            6 => ErrorCode::ChannelNotEstablished,
            8 => ErrorCode::OperationNotSupported,
            9 => ErrorCode::OutOfResources,
            11 => ErrorCode::DeviceLockedByAnotherLink,
            12 => ErrorCode::NoLockHeldByThisLink,
            15 => ErrorCode::IoTimeout,
            17 => ErrorCode::IoError,
            21 => ErrorCode::InvalidAddress,
            23 => ErrorCode::Abort,
            29 => ErrorCode::ChannelAlreadyEstablished,
            other => return Err(other),
        })
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorCode::NoError => "no error",
            ErrorCode::SyntaxError => "syntax error",
            ErrorCode::DeviceNotAccessible => "device not accessible",
            ErrorCode::InvalidLinkIdentifier => "invalid link identifier",
            ErrorCode::ParameterError => "parameter error",
            ErrorCode::ChannelNotEstablished => "channel not established",
            ErrorCode::OperationNotSupported => "operation not supported",
            ErrorCode::OutOfResources => "out of resources",
            ErrorCode::DeviceLockedByAnotherLink => "device locked by another link",
            ErrorCode::NoLockHeldByThisLink => "no lock held by this link",
            ErrorCode::IoTimeout => "I/O timeout",
            ErrorCode::IoError => "I/O error",
            ErrorCode::InvalidAddress => "invalid address",
            ErrorCode::Abort => "abort",
            ErrorCode::ChannelAlreadyEstablished => "channel already established",
        };
        write!(f, "{} ({})", text, self.code())
    }
}

/// Flags passed with most device operations.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct OperationFlags(u32);

impl OperationFlags {
    pub const NONE: OperationFlags = OperationFlags(0);
    /// Block until the device lock is free instead of failing immediately.
    pub const WAIT_LOCK: OperationFlags = OperationFlags(0x01);
    /// The last byte of a write carries the END indicator.
    pub const END: OperationFlags = OperationFlags(0x08);
    /// `term_char` of a read is valid.
    pub const TERM_CHAR_SET: OperationFlags = OperationFlags(0x80);

    pub fn from_bits(bits: u32) -> OperationFlags {
        OperationFlags(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: OperationFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OperationFlags {
    type Output = OperationFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        OperationFlags(self.0 | rhs.0)
    }
}

/// Bitmask describing why a `device_read` terminated.
///
/// Several reasons may be present at the same time.
/// An empty reason means the read stopped because the response buffer was full.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ReadReason(u32);

impl ReadReason {
    pub const NONE: ReadReason = ReadReason(0);
    /// The requested number of bytes has been transferred.
    pub const REQCNT: ReadReason = ReadReason(0x01);
    /// The termination character has been read.
    pub const CHR: ReadReason = ReadReason(0x02);
    /// The device signalled END with the last byte.
    pub const END: ReadReason = ReadReason(0x04);

    pub fn from_bits(bits: u32) -> ReadReason {
        ReadReason(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ReadReason) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ReadReason {
    type Output = ReadReason;

    fn bitor(self, rhs: Self) -> Self::Output {
        ReadReason(self.0 | rhs.0)
    }
}

impl BitOrAssign for ReadReason {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Transport protocol the client requests for the interrupt channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum InterruptProtocol {
    Tcp,
    Udp,
}

impl InterruptProtocol {
    pub fn code(self) -> u32 {
        match self {
            InterruptProtocol::Tcp => 0,
            InterruptProtocol::Udp => 1,
        }
    }
}

impl TryFrom<u32> for InterruptProtocol {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(InterruptProtocol::Tcp),
            1 => Ok(InterruptProtocol::Udp),
            other => Err(other),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateLinkParams {
    /// Chosen by the client, never validated by the server.
    pub client_id: i32,
    pub lock_device: bool,
    /// Milliseconds to wait for the lock when `lock_device` is set.
    pub lock_timeout: u32,
    pub device: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreateLinkResponse {
    pub error: ErrorCode,
    pub link_id: u32,
    pub abort_port: u16,
    pub max_receive_size: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteParams {
    pub link_id: u32,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub flags: OperationFlags,
    pub data: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WriteResponse {
    pub error: ErrorCode,
    /// Number of bytes actually transferred, also on failure.
    pub size: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadParams {
    pub link_id: u32,
    pub request_size: u32,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub flags: OperationFlags,
    pub term_char: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadResponse {
    pub error: ErrorCode,
    pub reason: ReadReason,
    /// Bytes actually transferred, also on failure.
    pub data: Bytes,
}

/// Parameters shared by readstb, trigger, clear, remote and local.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GenericParams {
    pub link_id: u32,
    pub flags: OperationFlags,
    pub lock_timeout: u32,
    pub io_timeout: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadStbResponse {
    pub error: ErrorCode,
    pub stb: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LockParams {
    pub link_id: u32,
    pub flags: OperationFlags,
    pub lock_timeout: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkParams {
    pub link_id: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnableSrqParams {
    pub link_id: u32,
    pub enable: bool,
    /// Echoed back verbatim with every service request.
    pub handle: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DoCmdParams {
    pub link_id: u32,
    pub flags: OperationFlags,
    pub io_timeout: u32,
    pub lock_timeout: u32,
    pub cmd: i32,
    pub network_order: bool,
    pub data_size: i32,
    pub data_in: Bytes,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DoCmdResponse {
    pub error: ErrorCode,
    pub data_out: Bytes,
}

/// Where the client hosts its interrupt channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteFunc {
    pub host_addr: Ipv4Addr,
    pub host_port: u16,
    pub program: u32,
    pub version: u32,
    pub protocol: u32,
}

/// A call arriving on the core channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CoreRequest {
    CreateLink(CreateLinkParams),
    DeviceWrite(WriteParams),
    DeviceRead(ReadParams),
    DeviceReadStb(GenericParams),
    DeviceTrigger(GenericParams),
    DeviceClear(GenericParams),
    DeviceRemote(GenericParams),
    DeviceLocal(GenericParams),
    DeviceLock(LockParams),
    DeviceUnlock(LinkParams),
    DeviceEnableSrq(EnableSrqParams),
    DeviceDoCmd(DoCmdParams),
    DestroyLink(LinkParams),
    CreateIntrChan(RemoteFunc),
    DestroyIntrChan,
}

impl CoreRequest {
    /// The RPC procedure number of this call.
    pub fn procedure(&self) -> u32 {
        match self {
            CoreRequest::CreateLink(_) => procedure::CREATE_LINK,
            CoreRequest::DeviceWrite(_) => procedure::DEVICE_WRITE,
            CoreRequest::DeviceRead(_) => procedure::DEVICE_READ,
            CoreRequest::DeviceReadStb(_) => procedure::DEVICE_READSTB,
            CoreRequest::DeviceTrigger(_) => procedure::DEVICE_TRIGGER,
            CoreRequest::DeviceClear(_) => procedure::DEVICE_CLEAR,
            CoreRequest::DeviceRemote(_) => procedure::DEVICE_REMOTE,
            CoreRequest::DeviceLocal(_) => procedure::DEVICE_LOCAL,
            CoreRequest::DeviceLock(_) => procedure::DEVICE_LOCK,
            CoreRequest::DeviceUnlock(_) => procedure::DEVICE_UNLOCK,
            CoreRequest::DeviceEnableSrq(_) => procedure::DEVICE_ENABLE_SRQ,
            CoreRequest::DeviceDoCmd(_) => procedure::DEVICE_DOCMD,
            CoreRequest::DestroyLink(_) => procedure::DESTROY_LINK,
            CoreRequest::CreateIntrChan(_) => procedure::CREATE_INTR_CHAN,
            CoreRequest::DestroyIntrChan => procedure::DESTROY_INTR_CHAN,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CoreRequest::CreateLink(_) => "create_link",
            CoreRequest::DeviceWrite(_) => "device_write",
            CoreRequest::DeviceRead(_) => "device_read",
            CoreRequest::DeviceReadStb(_) => "device_readstb",
            CoreRequest::DeviceTrigger(_) => "device_trigger",
            CoreRequest::DeviceClear(_) => "device_clear",
            CoreRequest::DeviceRemote(_) => "device_remote",
            CoreRequest::DeviceLocal(_) => "device_local",
            CoreRequest::DeviceLock(_) => "device_lock",
            CoreRequest::DeviceUnlock(_) => "device_unlock",
            CoreRequest::DeviceEnableSrq(_) => "device_enable_srq",
            CoreRequest::DeviceDoCmd(_) => "device_docmd",
            CoreRequest::DestroyLink(_) => "destroy_link",
            CoreRequest::CreateIntrChan(_) => "create_intr_chan",
            CoreRequest::DestroyIntrChan => "destroy_intr_chan",
        }
    }
}

/// The reply to a [CoreRequest].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CoreResponse {
    CreateLink(CreateLinkResponse),
    DeviceWrite(WriteResponse),
    DeviceRead(ReadResponse),
    DeviceReadStb(ReadStbResponse),
    DeviceDoCmd(DoCmdResponse),
    /// Procedures that only report an error code.
    Error(ErrorCode),
}

impl CoreResponse {
    /// The error code carried by any response variant.
    pub fn error(&self) -> ErrorCode {
        match self {
            CoreResponse::CreateLink(resp) => resp.error,
            CoreResponse::DeviceWrite(resp) => resp.error,
            CoreResponse::DeviceRead(resp) => resp.error,
            CoreResponse::DeviceReadStb(resp) => resp.error,
            CoreResponse::DeviceDoCmd(resp) => resp.error,
            CoreResponse::Error(error) => *error,
        }
    }
}

#[test]
fn error_codes_match_wire_values() {
    let expected = [
        (ErrorCode::NoError, 0),
        (ErrorCode::SyntaxError, 1),
        (ErrorCode::DeviceNotAccessible, 3),
        (ErrorCode::InvalidLinkIdentifier, 4),
        (ErrorCode::ParameterError, 5),
        (ErrorCode::ChannelNotEstablished, 6),
        (ErrorCode::OperationNotSupported, 8),
        (ErrorCode::OutOfResources, 9),
        (ErrorCode::DeviceLockedByAnotherLink, 11),
        (ErrorCode::NoLockHeldByThisLink, 12),
        (ErrorCode::IoTimeout, 15),
        (ErrorCode::IoError, 17),
        (ErrorCode::InvalidAddress, 21),
        (ErrorCode::Abort, 23),
        (ErrorCode::ChannelAlreadyEstablished, 29),
    ];
    for (error, code) in expected {
        assert_eq!(error.code(), code);
        assert_eq!(ErrorCode::try_from(code), Ok(error));
    }
    assert_eq!(ErrorCode::try_from(2), Err(2));
}

#[test]
fn read_reasons_combine() {
    let mut reason = ReadReason::END;
    reason |= ReadReason::CHR;
    assert!(reason.contains(ReadReason::END));
    assert!(reason.contains(ReadReason::CHR));
    assert!(!reason.contains(ReadReason::REQCNT));
    assert_eq!(reason.bits(), 0x06);
    assert!(ReadReason::NONE.is_empty());
}

#[test]
fn operation_flags() {
    let flags = OperationFlags::from_bits(0x89);
    assert!(flags.contains(OperationFlags::WAIT_LOCK));
    assert!(flags.contains(OperationFlags::END));
    assert!(flags.contains(OperationFlags::TERM_CHAR_SET));
    assert!(!OperationFlags::NONE.contains(OperationFlags::END));
    assert_eq!(
        (OperationFlags::WAIT_LOCK | OperationFlags::END).bits(),
        0x09
    );
}
