/// Observation points for session traffic and lifecycle.
///
/// Every method defaults to a no-op, so embedders implement only what they
/// watch. Callbacks run on the session's receiver or sender task: they must
/// return promptly and must not call back into blocking session methods.
pub trait Observer: Send + Sync {
    /// A line was handed to the transport, as formatted for the wire.
    fn on_send(&self, _line: &str) {}
    /// A complete line arrived from the firmware.
    fn on_recv(&self, _line: &str) {}
    /// An acknowledgement carried a temperature report.
    fn on_temp(&self, _line: &str) {}
    /// The firmware reported an error, or a malformed directive arrived.
    fn on_error(&self, _line: &str) {}
    /// First response after connecting; the firmware is alive.
    fn on_online(&self) {}
    /// A print run began.
    fn on_start(&self) {}
    /// A print run ended: completed, paused, or lost the link.
    fn on_end(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {}

impl<T: Observer + ?Sized> Observer for std::sync::Arc<T> {
    fn on_send(&self, line: &str) {
        (**self).on_send(line)
    }
    fn on_recv(&self, line: &str) {
        (**self).on_recv(line)
    }
    fn on_temp(&self, line: &str) {
        (**self).on_temp(line)
    }
    fn on_error(&self, line: &str) {
        (**self).on_error(line)
    }
    fn on_online(&self) {
        (**self).on_online()
    }
    fn on_start(&self) {
        (**self).on_start()
    }
    fn on_end(&self) {
        (**self).on_end()
    }
}
