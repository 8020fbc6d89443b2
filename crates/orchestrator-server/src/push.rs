//! Push-notification delivery is an external collaborator (spec §1
//! "Out of scope: ... push-notification delivery"). The Client WS Hub only
//! needs somewhere to hand off a debounced "Task Complete" / approval /
//! question notification once it has decided (via `!hasSubscribers &&
//! notificationsEnabled`) that one is due; delivery itself — APNs, FCM,
//! whatever — lives outside this crate behind this trait.

use tracing::info;

pub trait PushNotifier: Send + Sync {
    fn notify(&self, session_id: &str, title: &str, body: &str);
}

/// Default notifier for this binary: logs the notification that would have
/// been sent. Swapped for a real delivery backend by the process embedding
/// this crate, not by anything in the core.
pub struct LoggingPushNotifier;

impl PushNotifier for LoggingPushNotifier {
    fn notify(&self, session_id: &str, title: &str, body: &str) {
        info!(session_id, title, body, "push notification (no delivery backend configured)");
    }
}
