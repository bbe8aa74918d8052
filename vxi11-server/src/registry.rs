use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use vxi11_protocol::{ErrorCode, device_name::DeviceName};

/// Highest link identifier; link ids travel as a signed 32 bit integer.
const MAX_LINK_ID: u32 = i32::MAX as u32;

/// Identifies an active link.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct LinkId(pub(crate) u32);

impl LinkId {
    pub fn get(self) -> u32 {
        self.0
    }
}

impl Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one transport connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SessionId(pub(crate) u64);

impl Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How many links the server accepts at the same time.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkPolicy {
    /// At most one link. A second `create_link` fails with `ChannelAlreadyEstablished`.
    SingleDevice,
    /// Up to `max_links` links. Further `create_link` calls fail with `OutOfResources`.
    Multiple { max_links: usize },
}

/// One client's session with the device.
#[derive(Clone, Debug)]
pub struct Link {
    pub id: LinkId,
    pub client_id: i32,
    pub device: DeviceName,
    pub max_receive_size: u32,
    pub abort_port: u16,
    /// The connection that created the link
    pub session: SessionId,
}

/// Service request settings of a link.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct InterruptRegistration {
    pub enabled: bool,
    pub handle: Bytes,
}

#[derive(Default)]
struct LinkState {
    srq: InterruptRegistration,
    pending: Option<CancellationToken>,
    closed: bool,
}

/// A registered link together with its mutable state.
pub(crate) struct LinkEntry {
    link: Link,
    ordering: tokio::sync::Mutex<()>,
    state: Mutex<LinkState>,
}

impl LinkEntry {
    fn new(link: Link) -> LinkEntry {
        LinkEntry {
            link,
            ordering: tokio::sync::Mutex::new(()),
            state: Mutex::new(LinkState::default()),
        }
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    pub fn id(&self) -> LinkId {
        self.link.id
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits until all earlier calls on this link have finished.
    pub async fn order(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.ordering.lock().await
    }

    /// Registers the in-flight call of this link so that it can be aborted.
    pub fn begin_io(&self) -> Result<PendingIo<'_>, ErrorCode> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(ErrorCode::InvalidLinkIdentifier);
        }
        let token = CancellationToken::new();
        state.pending = Some(token.clone());
        Ok(PendingIo { entry: self, token })
    }

    /// Cancels the in-flight call, if there is one.
    pub fn abort(&self) -> bool {
        match &self.lock_state().pending {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    pub fn srq(&self) -> InterruptRegistration {
        self.lock_state().srq.clone()
    }

    pub fn set_srq(&self, enabled: bool, handle: Bytes) -> Result<(), ErrorCode> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(ErrorCode::InvalidLinkIdentifier);
        }
        state.srq = InterruptRegistration { enabled, handle };
        Ok(())
    }

    /// Returns whether service requests were enabled.
    fn clear_srq(&self) -> bool {
        std::mem::take(&mut self.lock_state().srq).enabled
    }

    /// Marks the link as gone: clears the service request registration and cancels the
    /// in-flight call.
    pub fn close(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        state.srq = InterruptRegistration::default();
        if let Some(token) = state.pending.take() {
            token.cancel();
        }
    }
}

/// The in-flight call of a link. Dropping it unregisters the call.
pub(crate) struct PendingIo<'a> {
    entry: &'a LinkEntry,
    token: CancellationToken,
}

impl PendingIo<'_> {
    /// Cancelled when the call is aborted or the link goes away.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for PendingIo<'_> {
    fn drop(&mut self) {
        self.entry.lock_state().pending = None;
    }
}

struct RegistryState {
    links: HashMap<LinkId, Arc<LinkEntry>>,
    clients: HashMap<i32, Vec<LinkId>>,
    next_id: u32,
}

impl RegistryState {
    fn allocate_id(&mut self) -> LinkId {
        loop {
            let id = LinkId(self.next_id);
            self.next_id = if self.next_id >= MAX_LINK_ID {
                1
            } else {
                self.next_id + 1
            };
            if !self.links.contains_key(&id) {
                return id;
            }
        }
    }

    fn detach(&mut self, entry: &LinkEntry) {
        let client_id = entry.link.client_id;
        if let Some(ids) = self.clients.get_mut(&client_id) {
            ids.retain(|id| *id != entry.id());
            if ids.is_empty() {
                self.clients.remove(&client_id);
            }
        }
    }

    fn resolve(&self, link_id: u32) -> Result<LinkId, ErrorCode> {
        if self.links.is_empty() {
            return Err(ErrorCode::ChannelNotEstablished);
        }
        let id = LinkId(link_id);
        if self.links.contains_key(&id) {
            Ok(id)
        } else {
            Err(ErrorCode::InvalidLinkIdentifier)
        }
    }
}

/// The parameters of a link that is about to be created.
pub(crate) struct NewLink {
    pub client_id: i32,
    pub device: DeviceName,
    pub max_receive_size: u32,
    pub abort_port: u16,
    pub session: SessionId,
}

/// Maps link ids to links, with a reverse index from client ids to their links.
///
/// Every check-then-modify sequence happens under a single lock.
pub(crate) struct LinkRegistry {
    policy: LinkPolicy,
    reject_duplicate_client: bool,
    state: Mutex<RegistryState>,
}

impl LinkRegistry {
    pub fn new(policy: LinkPolicy, reject_duplicate_client: bool) -> LinkRegistry {
        LinkRegistry {
            policy,
            reject_duplicate_client,
            state: Mutex::new(RegistryState {
                links: HashMap::new(),
                clients: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            log::warn!("Link registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn check_admission(&self, state: &RegistryState, client_id: i32) -> Result<(), ErrorCode> {
        match self.policy {
            LinkPolicy::SingleDevice if !state.links.is_empty() => {
                return Err(ErrorCode::ChannelAlreadyEstablished);
            }
            LinkPolicy::Multiple { max_links }
                if state.links.len() >= max_links.min(MAX_LINK_ID as usize) =>
            {
                return Err(ErrorCode::OutOfResources);
            }
            _ => {}
        }
        if self.reject_duplicate_client && state.clients.contains_key(&client_id) {
            return Err(ErrorCode::ChannelAlreadyEstablished);
        }
        Ok(())
    }

    /// Fails like [LinkRegistry::create] would if a link for `client_id` were created now.
    pub fn admit(&self, client_id: i32) -> Result<(), ErrorCode> {
        self.check_admission(&self.lock_state(), client_id)
    }

    pub fn create(&self, new: NewLink) -> Result<Arc<LinkEntry>, ErrorCode> {
        let mut state = self.lock_state();
        self.check_admission(&state, new.client_id)?;

        let id = state.allocate_id();
        let entry = Arc::new(LinkEntry::new(Link {
            id,
            client_id: new.client_id,
            device: new.device,
            max_receive_size: new.max_receive_size,
            abort_port: new.abort_port,
            session: new.session,
        }));
        state.links.insert(id, entry.clone());
        state.clients.entry(new.client_id).or_default().push(id);
        Ok(entry)
    }

    /// Finds a link. Fails with `ChannelNotEstablished` if there are no links at all and
    /// with `InvalidLinkIdentifier` if there are links, but not this one.
    pub fn lookup(&self, link_id: u32) -> Result<Arc<LinkEntry>, ErrorCode> {
        let state = self.lock_state();
        let id = state.resolve(link_id)?;
        Ok(state.links[&id].clone())
    }

    /// Removes `entry` if it is still registered, with the same failure modes as
    /// [LinkRegistry::lookup] otherwise.
    pub fn remove_entry(&self, entry: &Arc<LinkEntry>) -> Result<(), ErrorCode> {
        let mut state = self.lock_state();
        let id = state.resolve(entry.id().get())?;
        if !Arc::ptr_eq(&state.links[&id], entry) {
            return Err(ErrorCode::InvalidLinkIdentifier);
        }
        state.links.remove(&id);
        state.detach(entry);
        Ok(())
    }

    /// Removes all links created by a session.
    pub fn remove_session(&self, session: SessionId) -> Vec<Arc<LinkEntry>> {
        let mut state = self.lock_state();
        let ids: Vec<LinkId> = state
            .links
            .values()
            .filter(|entry| entry.link.session == session)
            .map(|entry| entry.id())
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = state.links.remove(&id) {
                state.detach(&entry);
                removed.push(entry);
            }
        }
        removed
    }

    /// Cancels the in-flight call of a link. Unknown links are ignored.
    pub fn abort(&self, link_id: u32) -> bool {
        let entry = self.lock_state().links.get(&LinkId(link_id)).cloned();
        entry.is_some_and(|entry| entry.abort())
    }

    /// The handles of all links that enabled service requests.
    pub fn srq_handles(&self) -> Vec<(LinkId, Bytes)> {
        let entries: Vec<Arc<LinkEntry>> = self.lock_state().links.values().cloned().collect();
        let mut handles: Vec<(LinkId, Bytes)> = entries
            .iter()
            .filter_map(|entry| {
                let srq = entry.srq();
                srq.enabled.then(|| (entry.id(), srq.handle))
            })
            .collect();
        handles.sort_by_key(|(id, _)| *id);
        handles
    }

    /// Turns service requests off on every link and forgets their handles.
    pub fn disable_srq(&self) -> usize {
        let entries: Vec<Arc<LinkEntry>> = self.lock_state().links.values().cloned().collect();
        entries
            .iter()
            .filter(|entry| entry.clear_srq())
            .count()
    }

    /// All active links, ordered by id.
    pub fn links(&self) -> Vec<Link> {
        let mut links: Vec<Link> = self
            .lock_state()
            .links
            .values()
            .map(|entry| entry.link.clone())
            .collect();
        links.sort_by_key(|link| link.id);
        links
    }

    pub fn len(&self) -> usize {
        self.lock_state().links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
