/// Narrow capability surface an embedding host calls into.
///
/// Adapters for a particular host (a signal handler, a desktop shell, an
/// admin request) translate their callbacks into these two hooks.
pub trait LifecycleHooks: Send + Sync {
    /// The host wants the server to stop. Must return promptly; the actual
    /// shutdown runs on the server's own thread.
    fn on_shutdown_requested(&self);

    /// The host gained or lost focus.
    fn on_focus_change(&self, focused: bool);
}
