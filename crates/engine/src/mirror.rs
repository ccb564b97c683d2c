use crate::Event;

/// Receives every accepted event after it is committed.
///
/// `dispatch` is called while the decider still holds the entity lock, so
/// implementations must hand the event off (queue it, spawn a task) and
/// return immediately. Whatever happens afterwards never reaches the caller
/// of the command.
pub trait MirrorSink: Send + Sync {
    fn dispatch(&self, event: &Event);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMirror;

impl MirrorSink for NoopMirror {
    fn dispatch(&self, _event: &Event) {}
}
