// AutoFollow — link-layer capability traits.

use anyhow::Result;

/// Fixed-size datagram channel to one preconfigured peer. Delivery is
/// unreliable; reliability lives in the node's stop-and-wait discipline.
pub trait Transport: Send + Sync {
    /// Fire one frame at the peer. A send error is transient: the caller
    /// re-registers the peer and retries on its next cycle.
    fn send(&self, frame: &[u8]) -> Result<()>;

    /// Drop and re-add the peer on the currently active channel.
    fn reregister_peer(&self) -> Result<()>;

    /// Deregister the peer at session teardown.
    fn close(&self) -> Result<()>;
}

/// Consumer of decoded protocol events, bound to a node before `start()`.
pub trait LinkHandler: Send + Sync {
    fn on_handshake(&self, payload: &str);
    fn on_wave(&self, payload: &str);
    fn on_ping(&self, payload: &str);
}
