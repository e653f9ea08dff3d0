use super::message::Message;

/// Capability implemented by every agent that receives messages.
///
/// Returning `Err` counts as a failed delivery attempt and may be retried.
/// Handlers can publish back into the bus; no bus lock is held while they run.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, message: &Message) -> anyhow::Result<()> {
        self(message)
    }
}

/// Pins a closure to the handler signature so its argument type is inferred.
///
/// ```
/// use repairbus::{handler_fn, Message};
///
/// let handler = handler_fn(|msg: &Message| {
///     assert!(!msg.sender.is_empty());
///     Ok(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F>(f: F) -> F
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    f
}
