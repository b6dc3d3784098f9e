use crate::event::Readiness;
use mio::Interest;
use std::sync::Arc;

/// Receives readiness for an I/O source registered on a `mio` runloop.
///
/// Handlers always run on the runloop's own thread.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &Readiness);
}

pub(crate) struct HandlerEntry {
    pub handler: Arc<dyn EventHandler>,
    pub interest: Interest,
}

impl HandlerEntry {
    pub fn new<H>(handler: H, interest: Interest) -> Self
    where
        H: EventHandler + 'static,
    {
        HandlerEntry {
            handler: Arc::new(handler),
            interest,
        }
    }

    /// Whether `event` carries anything this entry asked for. Errors and hang-ups
    /// are always delivered.
    pub fn wants(&self, event: &Readiness) -> bool {
        (self.interest.is_readable() && event.is_readable())
            || (self.interest.is_writable() && event.is_writable())
            || event.is_error()
            || event.is_closed()
    }
}
