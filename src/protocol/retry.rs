//! Outbound connects with timer-driven retries.
//!
//! ```text
//!             connect_to
//!                 │
//!                 ▼
//!   ┌────────▶ CONNECTING ── success ──▶ CONNECTED
//!   │             │
//!   │          failure
//!   │             ├── budget spent ──▶ FAILED
//!   │             ▼
//!   └─ timer ─ RETRY_WAIT ── close ──▶ ABORTED
//! ```
//!
//! Every attempt uses a fresh transport. One timer per protocol is re-armed after
//! each failure and closed once the connector settles.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    net::{NetResult, NetworkError, Stream, Transport, Uri},
    poll::lock,
    runloop::{Repeat, Timer},
};

use super::{Codec, Facility, Protocol, Role, Scope};

pub type ConnectedCallback<C> = Box<dyn FnOnce(&Protocol<C>, bool) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Connecting,
    Connected,
    RetryWait,
    Failed,
    Aborted,
}

impl ConnectState {
    fn is_settled(self) -> bool {
        matches!(
            self,
            ConnectState::Connected | ConnectState::Failed | ConnectState::Aborted
        )
    }
}

pub(super) struct Connector<C: Codec> {
    pub(super) uri: Uri,
    pub(super) on_connected: Option<ConnectedCallback<C>>,
    pub(super) state: ConnectState,
    pub(super) transport: Option<Arc<dyn Transport>>,
    pub(super) timer: Option<Timer>,
    pub(super) remaining: u32,
    pub(super) attempts: u32,
}

impl<C: Codec> Protocol<C> {
    /// Connects to `uri`, retrying per the configured [`RetryPolicy`]. `on_connected`
    /// runs exactly once on this protocol's runloop: `true` once the stream is
    /// attached and reading, `false` when retries are spent or the protocol closed
    /// first. Must be called on the runloop thread.
    ///
    /// [`RetryPolicy`]: crate::config::RetryPolicy
    pub fn connect_to<F>(&self, uri: &Uri, on_connected: F) -> Result<()>
    where
        F: FnOnce(&Protocol<C>, bool) + Send + 'static,
    {
        self.runloop().check_thread()?;
        if self.is_closing() {
            return Err(Error::Closing);
        }
        self.inner.network.factory(uri.scheme())?;
        {
            let mut role = lock(&self.inner.role);
            if *role != Role::Invalid {
                return Err(Error::InvalidRole(*role));
            }
            *role = match self.inner.config.scope {
                Scope::Internal => Role::OutboundInternal,
                Scope::External => Role::OutboundExternal,
            };
        }

        *lock(&self.inner.connector) = Some(Connector {
            uri: uri.clone(),
            on_connected: Some(Box::new(on_connected)),
            state: ConnectState::Connecting,
            transport: None,
            timer: None,
            remaining: self.inner.config.retry.budget(),
            attempts: 0,
        });
        debug!(protocol = self.id(), %uri, retry = ?self.inner.config.retry, "connecting");
        self.attempt();
        Ok(())
    }

    /// Where the outbound connector stands, if this protocol ever connected.
    pub fn connect_state(&self) -> Option<ConnectState> {
        lock(&self.inner.connector)
            .as_ref()
            .map(|connector| connector.state)
    }

    /// Connect attempts made so far.
    pub fn connect_attempts(&self) -> u32 {
        lock(&self.inner.connector)
            .as_ref()
            .map_or(0, |connector| connector.attempts)
    }

    fn attempt(&self) {
        let runloop = self.runloop();
        let uri = {
            let mut connector = lock(&self.inner.connector);
            let Some(connector) = connector.as_mut() else {
                return;
            };
            connector.state = ConnectState::Connecting;
            connector.attempts += 1;
            debug!(protocol = self.id(), uri = %connector.uri, attempt = connector.attempts, "connect attempt");
            connector.uri.clone()
        };

        let transport = match self.inner.network.transport(&runloop, &uri) {
            Ok(transport) => transport,
            Err(err) => return self.schedule_failure(err),
        };
        if let Some(connector) = lock(&self.inner.connector).as_mut() {
            connector.transport = Some(transport.clone());
        }

        let this = self.clone();
        let connecting = transport.connect(
            &uri,
            Box::new(move |result| this.on_connect_result(result)),
        );
        if let Err(err) = connecting {
            if let Some(connector) = lock(&self.inner.connector).as_mut() {
                connector.transport = None;
            }
            transport.close(Box::new(|| {}));
            self.schedule_failure(err);
        }
    }

    // Failures found while starting an attempt are reported on a later turn like
    // every other connect outcome.
    fn schedule_failure(&self, err: NetworkError) {
        let this = self.clone();
        self.runloop()
            .schedule(Box::new(move || this.connect_failed(err)));
    }

    fn on_connect_result(&self, result: NetResult<Arc<dyn Stream>>) {
        let transport = lock(&self.inner.connector)
            .as_mut()
            .and_then(|connector| connector.transport.take());
        if let Some(transport) = transport {
            transport.close(Box::new(|| {}));
        }

        match result {
            Ok(stream) if self.is_closing() => {
                stream.close(Box::new(|| {}));
                self.finish_connect(ConnectState::Aborted);
            }
            Ok(stream) => {
                debug!(protocol = self.id(), peer = ?stream.peer(), "connected");
                if let Err(err) = self.attach(Facility::Communication(stream)) {
                    warn!(protocol = self.id(), %err, "failed to start reading");
                    self.finish_connect(ConnectState::Failed);
                    self.close();
                    return;
                }
                self.finish_connect(ConnectState::Connected);
                self.request_drain();
            }
            Err(err) => self.connect_failed(err),
        }
    }

    fn connect_failed(&self, err: NetworkError) {
        if self.is_closing() {
            self.finish_connect(ConnectState::Aborted);
            return;
        }
        let retry = {
            let mut connector = lock(&self.inner.connector);
            let Some(connector) = connector.as_mut() else {
                return;
            };
            if connector.remaining > 0 {
                connector.remaining -= 1;
                connector.state = ConnectState::RetryWait;
                true
            } else {
                false
            }
        };

        if !retry {
            warn!(protocol = self.id(), %err, attempts = self.connect_attempts(), "connect failed");
            self.finish_connect(ConnectState::Failed);
            return;
        }
        debug!(protocol = self.id(), %err, "connect failed, retrying");

        let runloop = self.runloop();
        let timer = {
            let mut connector = lock(&self.inner.connector);
            let Some(connector) = connector.as_mut() else {
                return;
            };
            connector
                .timer
                .get_or_insert_with(|| {
                    Timer::new(
                        runloop.backend(),
                        self.inner.config.retry.interval(),
                        Repeat::Times(1),
                    )
                })
                .clone()
        };
        let weak = Arc::downgrade(&self.inner);
        let armed = timer.start(&runloop, move |_| {
            if let Some(inner) = weak.upgrade() {
                let protocol = Protocol { inner };
                if !protocol.is_closing() {
                    protocol.attempt();
                }
            }
        });
        if let Err(err) = armed {
            warn!(protocol = self.id(), %err, "failed to arm retry timer");
            self.finish_connect(ConnectState::Failed);
        }
    }

    /// Settles the connector and reports the outcome. Only the first call reports.
    pub(super) fn finish_connect(&self, state: ConnectState) {
        let (on_connected, timer) = {
            let mut connector = lock(&self.inner.connector);
            let Some(connector) = connector.as_mut() else {
                return;
            };
            let Some(on_connected) = connector.on_connected.take() else {
                return;
            };
            connector.state = state;
            let timer = if state.is_settled() {
                connector.timer.take()
            } else {
                None
            };
            (on_connected, timer)
        };
        if let Some(timer) = timer {
            if let Err(err) = timer.close(|| {}) {
                debug!(protocol = self.id(), %err, "retry timer already closed");
            }
        }
        debug!(protocol = self.id(), ?state, "connect settled");
        on_connected(self, state == ConnectState::Connected);
    }
}
