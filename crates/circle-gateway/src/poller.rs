use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use circle_db::Database;
use circle_types::events::GatewayEvent;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Per-connection timer that pushes friend requests the user has not been
/// sent yet.
///
/// Delivery is at-least-once: requests are flagged as sent only after the
/// event was handed to the connection, and a failed flag update means the
/// same requests go out again on the next tick. Two connections of the
/// same user poll independently.
pub struct NotificationPoller {
    db: Arc<Database>,
    user_id: Uuid,
    period: Duration,
}

enum Tick {
    Idle,
    Delivered(usize),
    /// The connection's event channel is closed.
    Closed,
}

impl NotificationPoller {
    pub fn new(db: Arc<Database>, user_id: Uuid, period: Duration) -> Self {
        Self { db, user_id, period }
    }

    /// Run until `cancel` fires or the event receiver is dropped.
    pub fn spawn(
        self,
        events: mpsc::UnboundedSender<GatewayEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(events, cancel))
    }

    async fn run(self, events: mpsc::UnboundedSender<GatewayEvent>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick(&events).await {
                Tick::Idle => {}
                Tick::Delivered(n) => debug!("Pushed {} friend request(s) to {}", n, self.user_id),
                Tick::Closed => break,
            }
        }

        info!("Notification poller for {} stopped", self.user_id);
    }

    async fn tick(&self, events: &mpsc::UnboundedSender<GatewayEvent>) -> Tick {
        let uid = self.user_id.to_string();
        let rows = match self.db.call(move |db| db.incoming_requests(&uid)).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Notification query for {} failed: {}", self.user_id, e);
                let event = GatewayEvent::NewNotification {
                    error: "Could not load notifications".to_string(),
                };
                return if events.send(event).is_err() { Tick::Closed } else { Tick::Idle };
            }
        };

        let unsent: Vec<_> = rows.iter().filter(|r| !r.request.send_request).collect();
        if unsent.is_empty() {
            return Tick::Idle;
        }

        let ids: Vec<String> = unsent.iter().map(|r| r.request.id.clone()).collect();
        let event = GatewayEvent::Notification {
            requests: unsent.iter().map(|r| r.to_incoming()).collect(),
        };
        if events.send(event).is_err() {
            return Tick::Closed;
        }

        let count = ids.len();
        if let Err(e) = self.db.call(move |db| db.mark_requests_sent(&ids)).await {
            warn!("Could not flag requests as sent for {}, they will be re-sent: {}", self.user_id, e);
        }
        Tick::Delivered(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use circle_db::users::NewUser;
    use circle_types::models::Role;

    fn user(db: &Database, username: &str) -> String {
        let id = Uuid::new_v4().to_string();
        db.create_user(&NewUser {
            id: &id,
            email: &format!("{}@x.com", username),
            username,
            surname: "Tester",
            password_hash: "hash",
            role: Role::User,
            activation_code: None,
        })
        .unwrap();
        id
    }

    fn setup() -> (Arc<Database>, String, String) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = user(&db, "alice");
        let bob = user(&db, "bob");
        (db, alice, bob)
    }

    #[tokio::test]
    async fn pushes_each_request_once() {
        let (db, alice, bob) = setup();
        let request_id = Uuid::new_v4();
        db.create_friend_request(&request_id.to_string(), &alice, &bob, "hi")
            .unwrap();

        let poller = NotificationPoller::new(db.clone(), bob.parse().unwrap(), DEFAULT_POLL_INTERVAL);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(matches!(poller.tick(&tx).await, Tick::Delivered(1)));
        match rx.try_recv().unwrap() {
            GatewayEvent::Notification { requests } => {
                assert_eq!(requests.len(), 1);
                assert_eq!(requests[0].id, request_id);
                assert_eq!(requests[0].requester.username, "alice");
            }
            other => panic!("unexpected event {:?}", other),
        }

        assert!(matches!(poller.tick(&tx).await, Tick::Idle));
        assert!(rx.try_recv().is_err());
        let stored = db.get_friend_request(&request_id.to_string()).unwrap().unwrap();
        assert!(stored.send_request);
    }

    #[tokio::test]
    async fn batches_only_unsent_requests() {
        let (db, alice, bob) = setup();
        let carol = user(&db, "carol");
        db.create_friend_request("r1", &alice, &bob, "hi").unwrap();
        db.mark_requests_sent(&["r1".to_string()]).unwrap();
        db.create_friend_request("r2", &carol, &bob, "hello").unwrap();

        let poller = NotificationPoller::new(db, bob.parse().unwrap(), DEFAULT_POLL_INTERVAL);
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert!(matches!(poller.tick(&tx).await, Tick::Delivered(1)));
        let GatewayEvent::Notification { requests } = rx.try_recv().unwrap() else {
            panic!("expected notification");
        };
        assert_eq!(requests[0].requester.username, "carol");
    }

    #[tokio::test]
    async fn closed_channel_leaves_requests_unsent() {
        let (db, alice, bob) = setup();
        db.create_friend_request("r1", &alice, &bob, "hi").unwrap();

        let poller = NotificationPoller::new(db.clone(), bob.parse().unwrap(), DEFAULT_POLL_INTERVAL);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        assert!(matches!(poller.tick(&tx).await, Tick::Closed));
        assert!(!db.get_friend_request("r1").unwrap().unwrap().send_request);
    }

    #[tokio::test]
    async fn resolved_requests_are_not_pushed() {
        let (db, alice, bob) = setup();
        db.create_friend_request("r1", &alice, &bob, "hi").unwrap();
        db.resolve_friend_request("r1", circle_types::models::Decision::Reject, &bob)
            .unwrap();

        let poller = NotificationPoller::new(db, bob.parse().unwrap(), DEFAULT_POLL_INTERVAL);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(poller.tick(&tx).await, Tick::Idle));
    }

    #[tokio::test]
    async fn spawned_poller_stops_on_cancel() {
        let (db, alice, bob) = setup();
        db.create_friend_request("r1", &alice, &bob, "hi").unwrap();

        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = NotificationPoller::new(db, bob.parse().unwrap(), Duration::from_millis(10))
            .spawn(tx, cancel.clone());

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no notification")
            .expect("channel closed");
        assert!(matches!(first, GatewayEvent::Notification { .. }));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller did not stop")
            .unwrap();

        // Nothing new was pending, so nothing else was queued.
        assert!(rx.try_recv().is_err());
    }
}
