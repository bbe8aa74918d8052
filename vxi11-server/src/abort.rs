use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use vxi11_protocol::ErrorCode;

use crate::registry::LinkRegistry;

struct AbortRequest {
    link_id: u32,
    reply: oneshot::Sender<ErrorCode>,
}

/// Entry point for `device_abort` calls arriving on the async channel.
///
/// Aborts are served by their own task and never wait behind core-channel calls.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    requests: mpsc::Sender<AbortRequest>,
}

impl AbortHandle {
    /// Cancels the in-progress read, write, lock wait or generic call of `link_id`.
    ///
    /// Returns `NoError` whether or not a call was in progress, including for unknown links.
    /// Returns `ChannelNotEstablished` once the server has shut down.
    pub async fn device_abort(&self, link_id: u32) -> ErrorCode {
        let (reply, response) = oneshot::channel();
        if self
            .requests
            .send(AbortRequest { link_id, reply })
            .await
            .is_err()
        {
            return ErrorCode::ChannelNotEstablished;
        }
        response.await.unwrap_or(ErrorCode::ChannelNotEstablished)
    }
}

/// The serving side of [AbortHandle].
pub(crate) struct AbortChannel {
    registry: Arc<LinkRegistry>,
    requests: mpsc::Receiver<AbortRequest>,
}

pub(crate) fn channel(registry: Arc<LinkRegistry>, capacity: usize) -> (AbortHandle, AbortChannel) {
    let (sender, requests) = mpsc::channel(capacity.max(1));
    (
        AbortHandle { requests: sender },
        AbortChannel { registry, requests },
    )
}

impl AbortChannel {
    pub async fn run(mut self, shutdown: CancellationToken) {
        log::debug!("Abort listener started");
        loop {
            let request = tokio::select! {
                _ = shutdown.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            if self.registry.abort(request.link_id) {
                log::info!("Aborted in-progress call on link {}", request.link_id);
            } else {
                log::debug!("Abort for link {} found no call in progress", request.link_id);
            }
            let _ = request.reply.send(ErrorCode::NoError);
        }
        log::debug!("Abort listener stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::{LinkPolicy, NewLink, SessionId};

    #[tokio::test]
    async fn abort_cancels_pending_call() {
        let registry = Arc::new(LinkRegistry::new(LinkPolicy::SingleDevice, false));
        let entry = registry
            .create(NewLink {
                client_id: 1,
                device: "inst0".parse().unwrap(),
                max_receive_size: 1024,
                abort_port: 0,
                session: SessionId(1),
            })
            .unwrap();
        let (handle, channel) = channel(registry.clone(), 4);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(channel.run(shutdown.clone()));

        let pending = entry.begin_io().unwrap();
        assert_eq!(handle.device_abort(entry.id().get()).await, ErrorCode::NoError);
        assert!(pending.token().is_cancelled());
        // Unknown links are not an error
        assert_eq!(handle.device_abort(42).await, ErrorCode::NoError);

        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(
            handle.device_abort(entry.id().get()).await,
            ErrorCode::ChannelNotEstablished
        );
    }
}
