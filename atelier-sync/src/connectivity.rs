//! Network reachability monitor.
//!
//! Wraps the platform-reported reachability signal in a watch channel.
//! A `false→true` transition is the single upstream trigger for queue
//! draining ([`crate::sync::SyncEngine::run`]) and for the session's
//! reconnect-now ([`run_reconnect_trigger`]). Reachability is an
//! imperfect hint, not a guarantee — operation attempts remain the
//! ground truth for failure detection. Going offline clears nothing:
//! queued operations and room membership are preserved for resumption.

use tokio::sync::watch;

use crate::session::RealtimeSession;

/// Observes reachability transitions.
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_reachable: bool) -> Self {
        let (tx, _) = watch::channel(initially_reachable);
        Self { tx }
    }

    /// Feed a platform reachability report. No-op if unchanged.
    pub fn set_reachable(&self, reachable: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current != reachable {
                *current = reachable;
                true
            } else {
                false
            }
        });
        if changed {
            log::info!(
                "reachability changed: {}",
                if reachable { "online" } else { "offline" }
            );
        }
    }

    /// Current reachability.
    pub fn is_reachable(&self) -> bool {
        *self.tx.borrow()
    }

    /// Subscribe to transitions.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Kick the session's backoff wait whenever connectivity is restored.
///
/// Runs until the monitor is dropped. Complements
/// [`crate::sync::SyncEngine::run`], which consumes its own
/// subscription for queue draining.
pub async fn run_reconnect_trigger(mut reachability: watch::Receiver<bool>, session: RealtimeSession) {
    let mut was_reachable = *reachability.borrow();
    while reachability.changed().await.is_ok() {
        let now_reachable = *reachability.borrow_and_update();
        if now_reachable && !was_reachable {
            log::info!("connectivity restored, nudging realtime session");
            session.reconnect_now().await;
        }
        was_reachable = now_reachable;
    }
    log::debug!("connectivity monitor dropped, stopping reconnect trigger");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientFrame;
    use crate::router::EventRouter;
    use crate::session::{
        ConnectionState, Connector, Link, LinkEvent, SessionConfig, SessionError, StaticToken,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Fails the first N handshakes, then hands out an open link.
    struct FlakyConnector {
        attempts: AtomicU32,
        fail_first: u32,
        /// Far sides of handed-out links, kept alive.
        links: Mutex<Vec<(mpsc::Sender<LinkEvent>, mpsc::Receiver<ClientFrame>)>>,
    }

    impl FlakyConnector {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicU32::new(0),
                fail_first,
                links: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, _bearer_token: &str) -> Result<Link, SessionError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(SessionError::Handshake("refused".to_string()));
            }
            let (out_tx, out_rx) = mpsc::channel(8);
            let (in_tx, in_rx) = mpsc::channel(8);
            self.links.lock().unwrap().push((in_tx, out_rx));
            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_kicks_session_out_of_backoff_wait() {
        let connector = FlakyConnector::new(1);
        let session = RealtimeSession::spawn(
            SessionConfig::default(),
            connector.clone(),
            Arc::new(StaticToken("token".to_string())),
            Arc::new(EventRouter::new()),
        );

        let monitor = ConnectivityMonitor::new(false);
        tokio::spawn(run_reconnect_trigger(monitor.subscribe(), session.clone()));

        session.connect().await;
        // First handshake fails; the session is now in its 1s backoff
        while connector.attempts.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }

        let before = tokio::time::Instant::now();
        monitor.set_reachable(true);

        let mut rx = session.watch_status();
        while rx.borrow_and_update().state != ConnectionState::Connected {
            rx.changed().await.unwrap();
        }

        // Reconnected off the transition, not the backoff timer
        assert!(tokio::time::Instant::now() - before < Duration::from_millis(100));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_monitor_reports_transitions() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();
        assert!(!monitor.is_reachable());

        monitor.set_reachable(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());
        assert!(monitor.is_reachable());

        monitor.set_reachable(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_monitor_suppresses_duplicate_reports() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();

        monitor.set_reachable(true);
        monitor.set_reachable(true);
        assert!(!rx.has_changed().unwrap());

        monitor.set_reachable(false);
        assert!(rx.has_changed().unwrap());
    }
}
