/// Events recorded by [`crate::Device`]'s worker, for test assertions and
/// postmortem debugging. The host analogue of the teacher's
/// `ringbuf_entry!` call sites scattered through a driver task's main loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Booted,
    Reset,
    TransactionDispatched { tid: u8 },
    TransactionCompleted { tid: u8 },
    TransactionFailed { tid: u8 },
    Poll,
    Fatal,
}
