/// Severity of a user-visible notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
    Success,
}

/// Fire-and-forget user notification sink.
///
/// The desktop shell routes these into its toast layer; tests count them.
pub trait Notifier: Send + Sync {
    fn notify(&self, kind: NotificationKind, title: &str, description: &str);
}

/// Notifier that forwards everything to the tracing subscriber. Useful for
/// headless embedding and as a default while no UI sink is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, kind: NotificationKind, title: &str, description: &str) {
        match kind {
            NotificationKind::Error => {
                tracing::error!(title = %title, description = %description, "notification");
            }
            NotificationKind::Warning => {
                tracing::warn!(title = %title, description = %description, "notification");
            }
            NotificationKind::Info | NotificationKind::Success => {
                tracing::info!(title = %title, description = %description, "notification");
            }
        }
    }
}
