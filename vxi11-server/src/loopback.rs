//! A reference [Instrument] that echoes written messages back to readers.
use std::{collections::VecDeque, io, time::Duration};

use vxi11_protocol::device_name::{DeviceName, InterfaceFamily};

use crate::{Instrument, ReadChunk, ServiceRequester};

/// Status byte bit: a message is available for reading
pub const MAV: u8 = 0x10;
/// Status byte bit: the device requests service
pub const RQS: u8 = 0x40;

/// Echoes every write back to the next reads, keeping the END marker of each write.
///
/// A trigger sets [RQS] in the status byte and raises a service request;
/// reading the status byte clears [RQS].
#[derive(Debug)]
pub struct Loopback {
    identity: String,
    output: VecDeque<(u8, bool)>,
    status: u8,
    remote: bool,
    triggers: usize,
    clears: usize,
    requester: Option<ServiceRequester>,
}

impl Default for Loopback {
    fn default() -> Self {
        Loopback::new("VXI11,Loopback,0,0.1")
    }
}

impl Loopback {
    pub fn new(identity: impl Into<String>) -> Loopback {
        Loopback {
            identity: identity.into(),
            output: VecDeque::new(),
            status: 0,
            remote: false,
            triggers: 0,
            clears: 0,
            requester: None,
        }
    }

    /// Set the status byte bits other than [MAV], which tracks pending output.
    pub fn set_status(&mut self, status: u8) {
        self.status = status & !MAV;
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn triggers(&self) -> usize {
        self.triggers
    }

    pub fn clears(&self) -> usize {
        self.clears
    }

    /// Bytes waiting to be read
    pub fn pending(&self) -> usize {
        self.output.len()
    }
}

impl Instrument for Loopback {
    fn write(&mut self, data: &[u8], end: bool, _timeout: Duration) -> io::Result<usize> {
        let last = data.len().saturating_sub(1);
        self.output
            .extend(data.iter().enumerate().map(|(i, byte)| (*byte, end && i == last)));
        Ok(data.len())
    }

    fn read(
        &mut self,
        buf: &mut [u8],
        term_char: Option<u8>,
        timeout: Duration,
    ) -> io::Result<ReadChunk> {
        if self.output.is_empty() {
            std::thread::sleep(timeout);
            return Err(io::ErrorKind::TimedOut.into());
        }
        let mut chunk = ReadChunk::default();
        while chunk.len < buf.len() {
            let Some((byte, end)) = self.output.pop_front() else {
                break;
            };
            buf[chunk.len] = byte;
            chunk.len += 1;
            if end {
                chunk.end = true;
                break;
            }
            if term_char == Some(byte) {
                break;
            }
        }
        Ok(chunk)
    }

    fn read_status_byte(&mut self) -> io::Result<u8> {
        let mut stb = self.status;
        if !self.output.is_empty() {
            stb |= MAV;
        }
        self.status &= !RQS;
        Ok(stb)
    }

    fn trigger(&mut self) -> io::Result<()> {
        self.triggers += 1;
        self.status |= RQS;
        if let Some(requester) = &self.requester {
            requester.request_service();
        }
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.clears += 1;
        self.output.clear();
        Ok(())
    }

    fn set_remote(&mut self, remote: bool) -> io::Result<()> {
        self.remote = remote;
        Ok(())
    }

    fn identify(&mut self) -> io::Result<String> {
        Ok(self.identity.clone())
    }

    /// Answers to `inst` names only.
    fn supports(&self, device: &DeviceName) -> bool {
        device.family() == InterfaceFamily::Inst
    }

    fn attach_service_requests(&mut self, requester: ServiceRequester) {
        self.requester = Some(requester);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(1);

    #[test]
    fn echoes_until_end() {
        let mut loopback = Loopback::default();
        loopback.write(b"AB", true, TIMEOUT).unwrap();
        loopback.write(b"C", false, TIMEOUT).unwrap();
        let mut buf = [0; 8];
        let chunk = loopback.read(&mut buf, None, TIMEOUT).unwrap();
        assert_eq!(chunk, ReadChunk { len: 2, end: true });
        assert_eq!(&buf[..2], b"AB");
        let chunk = loopback.read(&mut buf, None, TIMEOUT).unwrap();
        assert_eq!(chunk, ReadChunk { len: 1, end: false });
        assert_eq!(
            loopback.read(&mut buf, None, TIMEOUT).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
    }

    #[test]
    fn stops_after_term_char() {
        let mut loopback = Loopback::default();
        loopback.write(b"1\n2\n", true, TIMEOUT).unwrap();
        let mut buf = [0; 8];
        let chunk = loopback.read(&mut buf, Some(b'\n'), TIMEOUT).unwrap();
        assert_eq!(chunk, ReadChunk { len: 2, end: false });
        assert_eq!(loopback.pending(), 2);
    }

    #[test]
    fn status_byte_tracks_output_and_trigger() {
        let mut loopback = Loopback::default();
        assert_eq!(loopback.read_status_byte().unwrap(), 0);
        loopback.write(b"x", true, TIMEOUT).unwrap();
        loopback.trigger().unwrap();
        assert_eq!(loopback.read_status_byte().unwrap(), MAV | RQS);
        // RQS is cleared by the serial poll
        assert_eq!(loopback.read_status_byte().unwrap(), MAV);
        loopback.clear().unwrap();
        assert_eq!(loopback.read_status_byte().unwrap(), 0);
        assert_eq!((loopback.triggers(), loopback.clears()), (1, 1));
    }

    #[test]
    fn only_inst_devices_are_supported() {
        let loopback = Loopback::default();
        assert!(loopback.supports(&"inst0".parse().unwrap()));
        assert!(!loopback.supports(&"gpib0,5".parse().unwrap()));
    }
}
