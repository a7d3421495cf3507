//! Bridge endpoint contract.
//!
//! The acceptor builds one endpoint per accepted link and drives it
//! through this trait; an endpoint fires its close callback exactly once
//! when it tears itself down for any reason.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::amqp::Link;
use crate::error::Result;

/// Callback invoked when an endpoint closes.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// One side of the bridge: a sink (Kafka to AMQP) or source (AMQP to
/// Kafka) endpoint bound to a single link.
pub trait BridgeEndpoint {
    fn open(&mut self);

    /// Handle the link this endpoint was created for. Invoked once.
    fn handle(&mut self, link: Link) -> Result<()>;

    /// Tear the endpoint down. Idempotent.
    fn close(&mut self);

    /// Register the close callback.
    fn on_close(&mut self, callback: CloseCallback);
}

/// Single-fire close notification, safe against reentrant close paths.
#[derive(Clone, Default)]
pub struct CloseNotifier {
    callback: Arc<Mutex<Option<CloseCallback>>>,
}

impl CloseNotifier {
    pub fn set(&self, callback: CloseCallback) {
        *self.callback.lock() = Some(callback);
    }

    /// Invoke the callback if it has not fired yet.
    pub fn fire(&self) {
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}
