use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use tokio::{sync::broadcast, time::Instant};
use tokio_util::sync::CancellationToken;
use vxi11_protocol::{ErrorCode, ReadReason};

use crate::{Instrument, server::ServerEvent};

/// Maps an instrument error to the error code reported to the client.
pub(crate) fn error_from_io(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorCode::IoTimeout,
        io::ErrorKind::Unsupported => ErrorCode::OperationNotSupported,
        _ => ErrorCode::IoError,
    }
}

fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Bounds a read or write by its I/O timeout and its abort token.
pub(crate) struct IoControl<'a> {
    cancel: &'a CancellationToken,
    deadline: Instant,
    poll_interval: Duration,
    attempted: bool,
}

impl<'a> IoControl<'a> {
    pub fn new(
        cancel: &'a CancellationToken,
        io_timeout: Duration,
        poll_interval: Duration,
    ) -> IoControl<'a> {
        IoControl {
            cancel,
            deadline: Instant::now() + io_timeout,
            poll_interval,
            attempted: false,
        }
    }

    /// The timeout for the next instrument call.
    ///
    /// Fails with `Abort` once cancelled and with `IoTimeout` once the deadline has passed.
    /// The first call always gets a chance, even with a zero I/O timeout.
    fn next_slice(&mut self) -> Result<Duration, ErrorCode> {
        if self.cancel.is_cancelled() {
            return Err(ErrorCode::Abort);
        }
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() && self.attempted {
            return Err(ErrorCode::IoTimeout);
        }
        self.attempted = true;
        Ok(remaining.min(self.poll_interval))
    }
}

/// What a `device_write` achieved.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct WriteOutcome {
    pub size: usize,
    pub error: ErrorCode,
}

/// What a `device_read` achieved.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct ReadOutcome {
    pub data: Vec<u8>,
    pub reason: ReadReason,
    pub error: ErrorCode,
}

pub(crate) struct ReadRequest {
    pub request_size: usize,
    /// Size of the response buffer
    pub capacity: usize,
    pub term_char: Option<u8>,
}

/// Shared access to the instrument.
///
/// Every call runs on the blocking pool while holding the instrument mutex,
/// so the instrument only ever sees one call at a time.
pub(crate) struct InstrumentHandle<I> {
    instrument: Arc<Mutex<I>>,
    events: broadcast::Sender<ServerEvent>,
    chunk_size: usize,
}

impl<I: Instrument> InstrumentHandle<I> {
    pub fn new(
        instrument: I,
        events: broadcast::Sender<ServerEvent>,
        chunk_size: usize,
    ) -> InstrumentHandle<I> {
        InstrumentHandle {
            instrument: Arc::new(Mutex::new(instrument)),
            events,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Runs `f` against the instrument.
    ///
    /// A panic inside `f` is reported as a [ServerEvent::HandlerFault] and mapped to `IoError`.
    pub async fn call<R, F>(
        &self,
        operation: &'static str,
        f: F,
    ) -> Result<io::Result<R>, ErrorCode>
    where
        F: FnOnce(&mut I) -> io::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let instrument = self.instrument.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut instrument = instrument.lock().unwrap_or_else(|poisoned| {
                log::warn!("Instrument lock was poisoned by an earlier panic, recovering");
                poisoned.into_inner()
            });
            f(&mut instrument)
        });
        match task.await {
            Ok(result) => Ok(result),
            Err(err) => {
                let message = err.to_string();
                log::error!("Instrument failed during {}: {}", operation, message);
                let _ = self
                    .events
                    .send(ServerEvent::HandlerFault { operation, message });
                Err(ErrorCode::IoError)
            }
        }
    }

    /// Writes `data` in chunks, reporting the number of bytes accepted even on failure.
    pub async fn write(&self, data: Bytes, end: bool, control: &mut IoControl<'_>) -> WriteOutcome {
        let mut written = 0;
        while written < data.len() {
            let timeout = match control.next_slice() {
                Ok(timeout) => timeout,
                Err(error) => {
                    return WriteOutcome {
                        size: written,
                        error,
                    };
                }
            };
            let chunk_end = (written + self.chunk_size).min(data.len());
            let chunk = data.slice(written..chunk_end);
            let last = end && chunk_end == data.len();
            log::trace!("Write chunk: {:02x?}", &chunk[..]);
            match self
                .call("device_write", move |instrument| {
                    instrument.write(&chunk, last, timeout)
                })
                .await
            {
                Ok(Ok(accepted)) => written += accepted.min(chunk_end - written),
                Ok(Err(err)) if is_poll_timeout(&err) => {}
                Ok(Err(err)) => {
                    log::warn!("Write failed after {} bytes: {}", written, err);
                    return WriteOutcome {
                        size: written,
                        error: error_from_io(&err),
                    };
                }
                Err(error) => {
                    return WriteOutcome {
                        size: written,
                        error,
                    };
                }
            }
        }
        WriteOutcome {
            size: written,
            error: ErrorCode::NoError,
        }
    }

    /// Reads until END, the requested count, the termination character or a full buffer.
    ///
    /// All reasons that hold at termination are reported together. The bytes read so far are
    /// returned on timeout, abort and error as well.
    pub async fn read(&self, request: ReadRequest, control: &mut IoControl<'_>) -> ReadOutcome {
        let mut data = Vec::new();
        if request.request_size == 0 {
            return ReadOutcome {
                data,
                reason: ReadReason::REQCNT,
                error: ErrorCode::NoError,
            };
        }
        let limit = request.request_size.min(request.capacity);
        let term_char = request.term_char;
        loop {
            let timeout = match control.next_slice() {
                Ok(timeout) => timeout,
                Err(error) => {
                    return ReadOutcome {
                        data,
                        reason: ReadReason::NONE,
                        error,
                    };
                }
            };
            let want = (limit - data.len()).min(self.chunk_size);
            let result = self
                .call("device_read", move |instrument| {
                    let mut buf = vec![0; want];
                    let chunk = instrument.read(&mut buf, term_char, timeout)?;
                    buf.truncate(chunk.len.min(want));
                    Ok((buf, chunk.end))
                })
                .await;
            match result {
                Ok(Ok((bytes, end))) => {
                    log::trace!("Read chunk: {:02x?}, end={}", &bytes[..], end);
                    let matched_term = term_char.is_some_and(|term| bytes.last() == Some(&term));
                    data.extend_from_slice(&bytes);

                    let mut reason = ReadReason::NONE;
                    if end {
                        reason |= ReadReason::END;
                    }
                    if data.len() >= request.request_size {
                        reason |= ReadReason::REQCNT;
                    }
                    if matched_term {
                        reason |= ReadReason::CHR;
                    }
                    if !reason.is_empty() || data.len() >= limit {
                        return ReadOutcome {
                            data,
                            reason,
                            error: ErrorCode::NoError,
                        };
                    }
                }
                Ok(Err(err)) if is_poll_timeout(&err) => {}
                Ok(Err(err)) => {
                    log::warn!("Read failed after {} bytes: {}", data.len(), err);
                    return ReadOutcome {
                        data,
                        reason: ReadReason::NONE,
                        error: error_from_io(&err),
                    };
                }
                Err(error) => {
                    return ReadOutcome {
                        data,
                        reason: ReadReason::NONE,
                        error,
                    };
                }
            }
        }
    }
}
