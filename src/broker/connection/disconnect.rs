//! Teardown and will emission
//!
//! Runs on every exit path of a connected pipe: deregister the handles,
//! drain the pipe index into topic-index mutations (detach for surviving
//! sessions, delete otherwise), publish the will on abnormal closes, and
//! cache or drop the session per clean-start.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::Connection;
use crate::protocol::{Properties, Publish};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn teardown(&mut self, publish_will: bool) {
        let Some(active) = self.active.take() else {
            // never reached CONNECT; nothing was registered
            return;
        };

        self.shared.connections.remove(&self.pipe);
        self.shared
            .client_pipes
            .remove_if(&active.client_id, |_, pipe| *pipe == self.pipe);

        // When the client id was taken over, the new pipe already owns the
        // topic-index entries; only this pipe's reverse index is dropped.
        let taken_over = self
            .shared
            .client_pipes
            .get(&active.client_id)
            .map(|entry| *entry != self.pipe)
            .unwrap_or(false);

        let filters = self.shared.pipes.drop_pipe(self.pipe);

        if !taken_over {
            let keep_session = active.session.read().session_expiry != 0;

            {
                let session = active.session.read();
                let stale = session.pipe == self.pipe
                    && !session.subscriptions.is_empty()
                    && filters.is_empty();
                if stale {
                    // the two indices disagree; finish teardown best-effort
                    warn!(
                        "pipe {}: pipe index empty but session lists subscriptions",
                        self.pipe
                    );
                    debug_assert!(false, "pipe index out of sync at teardown");
                }
            }

            for filter in &filters {
                let cleared = if keep_session {
                    self.shared.subscriptions.detach(filter, self.pipe)
                } else {
                    self.shared.subscriptions.unsubscribe(filter, self.pipe).is_some()
                };
                if !cleared {
                    // usually a takeover race that already rewrote the entry
                    debug!(
                        "pipe {}: filter {:?} not held by this pipe at teardown",
                        self.pipe, filter
                    );
                }
            }
        }

        if publish_will {
            if let Some(ref will) = active.cparam.will {
                debug!(
                    "pipe {}: publishing will for {} on {:?}",
                    self.pipe, active.client_id, will.topic
                );
                let publish = Publish {
                    dup: false,
                    qos: will.qos,
                    retain: will.retain,
                    topic: will.topic.as_str().into(),
                    packet_id: None,
                    payload: will.payload.clone(),
                    properties: Properties::default(),
                };
                self.shared.router.publish(&publish);
            }
        }

        self.shared
            .sessions
            .disconnect(&active.client_id, self.pipe);

        debug!("pipe {}: {} disconnected", self.pipe, active.client_id);
    }
}
