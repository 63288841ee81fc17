//! Delivery of completion callbacks onto caller-owned execution contexts.

/// Runs work on an execution context chosen by the caller.
///
/// Hosts that require state to be touched from a particular thread or region implement this
/// to hop back onto it, see [`CompletionHandle::on_complete_on`](crate::CompletionHandle::on_complete_on).
pub trait Dispatch: Send + Sync {
    /// Identifies the context to run on, such as a region or a thread.
    type Context: Send + 'static;

    /// Runs `work` on `context`.
    ///
    /// This may run `work` synchronously, or schedule it to run later.
    fn run_on(&self, context: &Self::Context, work: Box<dyn FnOnce() + Send>);
}

/// Dispatches onto a tokio runtime, ignoring the context.
impl Dispatch for tokio::runtime::Handle {
    type Context = ();

    fn run_on(&self, _context: &(), work: Box<dyn FnOnce() + Send>) {
        self.spawn(async move { work() });
    }
}
