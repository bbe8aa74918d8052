use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use vxi11_protocol::ErrorCode;

use crate::registry::LinkId;

/// The state of the device lock.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceLock {
    /// The link holding the lock, `None` if the device is unlocked
    pub owner: Option<LinkId>,
    /// The lock timeout supplied by the owner when it acquired the lock
    pub timeout: Duration,
}

/// The advisory lock of the device.
///
/// Only `device_lock` (and `create_link` with `lock_device`) take ownership.
/// All other lock-sensitive operations merely wait until the device is not locked
/// by another link.
pub(crate) struct LockManager {
    state: Mutex<DeviceLock>,
    released: Notify,
}

impl LockManager {
    pub fn new() -> LockManager {
        LockManager {
            state: Mutex::new(DeviceLock::default()),
            released: Notify::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, DeviceLock> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> DeviceLock {
        *self.lock_state()
    }

    /// Takes the lock for `link`.
    ///
    /// Succeeds immediately if the device is unlocked or already owned by `link`.
    /// Otherwise fails with `DeviceLockedByAnotherLink`, either immediately (`wait == false`)
    /// or once `timeout` has elapsed. Fails with `Abort` when `cancel` fires while waiting.
    pub async fn acquire(
        &self,
        link: LinkId,
        wait: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ErrorCode> {
        self.wait_for(link, wait, timeout, cancel, true).await
    }

    /// Waits until `link` may use the device, without taking the lock.
    pub async fn check(
        &self,
        link: LinkId,
        wait: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ErrorCode> {
        self.wait_for(link, wait, timeout, cancel, false).await
    }

    async fn wait_for(
        &self,
        link: LinkId,
        wait: bool,
        timeout: Duration,
        cancel: &CancellationToken,
        take: bool,
    ) -> Result<(), ErrorCode> {
        let deadline = Instant::now() + timeout;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register before inspecting the owner so a release in between is not missed
            released.as_mut().enable();

            {
                let mut state = self.lock_state();
                match state.owner {
                    None => {
                        if take {
                            *state = DeviceLock {
                                owner: Some(link),
                                timeout,
                            };
                        }
                        return Ok(());
                    }
                    Some(owner) if owner == link => {
                        if take {
                            state.timeout = timeout;
                        }
                        return Ok(());
                    }
                    Some(owner) if !wait => {
                        log::debug!("Link {} refused, device locked by link {}", link, owner);
                        return Err(ErrorCode::DeviceLockedByAnotherLink);
                    }
                    Some(_) => {}
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ErrorCode::Abort),
                _ = &mut released => {}
                _ = tokio::time::sleep_until(deadline) => {
                    log::debug!("Link {} timed out waiting for the device lock", link);
                    return Err(ErrorCode::DeviceLockedByAnotherLink);
                }
            }
        }
    }

    /// Releases the lock held by `link`.
    pub fn release(&self, link: LinkId) -> Result<(), ErrorCode> {
        if self.release_link(link) {
            Ok(())
        } else {
            Err(ErrorCode::NoLockHeldByThisLink)
        }
    }

    /// Releases the lock if `link` holds it. Returns whether it did.
    pub fn release_link(&self, link: LinkId) -> bool {
        {
            let mut state = self.lock_state();
            if state.owner != Some(link) {
                return false;
            }
            *state = DeviceLock::default();
        }
        self.released.notify_waiters();
        true
    }
}
