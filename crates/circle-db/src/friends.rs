use anyhow::{Result, anyhow};
use rusqlite::{Connection, Row};
use tracing::debug;

use circle_types::models::Decision;

use crate::chats;
use crate::models::{ChatRow, FriendRequestRow, RequestWithUser, SummaryRow};
use crate::users::{summary_at, summary_from_row, user_exists};
use crate::{Database, OptionalExt};

const REQUEST_COLUMNS: &str = "r.id, r.request_user_id, r.target_user_id, r.message, r.status, r.decision, r.seen, r.send_request, r.created_at, r.updated_at";

#[derive(Debug, PartialEq, Eq)]
pub enum NewRequestOutcome {
    Created,
    RequesterNotFound,
    TargetNotFound,
    AlreadyFriends,
    /// An open request for the same ordered pair already exists.
    Duplicate,
}

pub enum ResolveOutcome {
    NotFound,
    /// The acting user is not the target of the request.
    NotTarget,
    /// The request was resolved earlier; nothing was changed.
    AlreadyResolved,
    Resolved {
        request: FriendRequestRow,
        /// Chat provisioned for a newly formed friendship.
        chat: Option<ChatRow>,
    },
}

impl Database {
    /// Create an open friend request. All checks and the insert run in one
    /// transaction.
    pub fn create_friend_request(
        &self,
        id: &str,
        requester_id: &str,
        target_id: &str,
        message: &str,
    ) -> Result<NewRequestOutcome> {
        self.with_tx(|tx| {
            if !user_exists(tx, requester_id)? {
                return Ok(NewRequestOutcome::RequesterNotFound);
            }
            if !user_exists(tx, target_id)? {
                return Ok(NewRequestOutcome::TargetNotFound);
            }
            if query_are_friends(tx, requester_id, target_id)? {
                return Ok(NewRequestOutcome::AlreadyFriends);
            }
            if query_has_open_request(tx, requester_id, target_id)? {
                return Ok(NewRequestOutcome::Duplicate);
            }

            tx.execute(
                "INSERT INTO friend_requests (id, request_user_id, target_user_id, message)
                 VALUES (?1, ?2, ?3, ?4)",
                (id, requester_id, target_id, message),
            )?;
            Ok(NewRequestOutcome::Created)
        })
    }

    pub fn get_friend_request(&self, id: &str) -> Result<Option<FriendRequestRow>> {
        self.with_conn(|conn| query_request(conn, id))
    }

    /// Open requests targeting `user_id`, oldest first, joined with the
    /// requester.
    pub fn incoming_requests(&self, user_id: &str) -> Result<Vec<RequestWithUser>> {
        self.with_conn(|conn| query_requests_with_user(conn, user_id, Direction::Incoming))
    }

    /// Open requests authored by `user_id`, oldest first, joined with the
    /// target.
    pub fn outgoing_requests(&self, user_id: &str) -> Result<Vec<RequestWithUser>> {
        self.with_conn(|conn| query_requests_with_user(conn, user_id, Direction::Outgoing))
    }

    /// Flag requests as pushed to their target. Returns how many flipped from
    /// unsent to sent; already-sent ids are left alone.
    pub fn mark_requests_sent(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.with_conn_mut(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "UPDATE friend_requests SET send_request = 1
                 WHERE send_request = 0 AND id IN ({})",
                placeholders.join(", ")
            );
            let params: Vec<&dyn rusqlite::types::ToSql> = ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();
            Ok(conn.execute(&sql, params.as_slice())?)
        })
    }

    pub fn mark_request_seen(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE friend_requests
                 SET seen = 1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1",
                [id],
            )?;
            Ok(changed == 1)
        })
    }

    /// Close an open request with `decision`, on behalf of `actor_id`.
    ///
    /// Runs as one transaction: the request is closed with a conditional
    /// update (`status = 1`), so of two concurrent deciders only one gets
    /// `Resolved`. On accept the canonical friendship row is inserted, any
    /// open request in the reverse direction is closed too, and a chat is
    /// provisioned if the friendship is new.
    pub fn resolve_friend_request(
        &self,
        id: &str,
        decision: Decision,
        actor_id: &str,
    ) -> Result<ResolveOutcome> {
        self.with_tx(|tx| {
            let Some(request) = query_request(tx, id)? else {
                return Ok(ResolveOutcome::NotFound);
            };
            if request.target_user_id != actor_id {
                return Ok(ResolveOutcome::NotTarget);
            }

            let closed = tx.execute(
                "UPDATE friend_requests
                 SET status = 0, decision = ?2, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1 AND status = 1",
                (id, decision.as_str()),
            )?;
            if closed == 0 {
                return Ok(ResolveOutcome::AlreadyResolved);
            }

            let mut chat = None;
            if decision == Decision::Accept {
                let requester = request.request_user_id.as_str();
                let target = request.target_user_id.as_str();
                let (a, b) = canonical_pair(requester, target);
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO friendships (user_a, user_b) VALUES (?1, ?2)",
                    (a, b),
                )?;

                let reverse = tx.execute(
                    "UPDATE friend_requests
                     SET status = 0, decision = 'ACCEPT',
                         updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                     WHERE request_user_id = ?1 AND target_user_id = ?2 AND status = 1",
                    (target, requester),
                )?;
                if reverse > 0 {
                    debug!("Closed {} reverse request(s) between {} and {}", reverse, target, requester);
                }

                if inserted == 1 {
                    chat = Some(chats::provision_in(tx, requester, target)?);
                }
            }

            let request = query_request(tx, id)?
                .ok_or_else(|| anyhow!("Friend request {} vanished inside its transaction", id))?;
            Ok(ResolveOutcome::Resolved { request, chat })
        })
    }

    pub fn are_friends(&self, a: &str, b: &str) -> Result<bool> {
        self.with_conn(|conn| query_are_friends(conn, a, b))
    }

    /// Whether `from_id` has an open request targeting `to_id`.
    pub fn has_open_request(&self, from_id: &str, to_id: &str) -> Result<bool> {
        self.with_conn(|conn| query_has_open_request(conn, from_id, to_id))
    }

    /// Friends of `user_id`, whichever side of the pair they were stored on.
    pub fn friends_of(&self, user_id: &str) -> Result<Vec<SummaryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT u.id, u.username, u.surname, u.role, u.avatar
                 FROM friendships f
                 JOIN users u
                   ON u.id = CASE WHEN f.user_a = ?1 THEN f.user_b ELSE f.user_a END
                 WHERE f.user_a = ?1 OR f.user_b = ?1
                 ORDER BY u.username, u.surname",
            )?;
            let rows = stmt
                .query_map([user_id], summary_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

/// Friendships are stored once, smaller id first.
pub(crate) fn canonical_pair<'a>(x: &'a str, y: &'a str) -> (&'a str, &'a str) {
    if x < y { (x, y) } else { (y, x) }
}

enum Direction {
    Incoming,
    Outgoing,
}

fn query_requests_with_user(
    conn: &Connection,
    user_id: &str,
    direction: Direction,
) -> Result<Vec<RequestWithUser>> {
    // Join the *other* side of the request.
    let (filter, join) = match direction {
        Direction::Incoming => ("r.target_user_id", "r.request_user_id"),
        Direction::Outgoing => ("r.request_user_id", "r.target_user_id"),
    };
    let sql = format!(
        "SELECT {}, u.id, u.username, u.surname, u.role, u.avatar
         FROM friend_requests r
         JOIN users u ON u.id = {}
         WHERE {} = ?1 AND r.status = 1
         ORDER BY r.created_at",
        REQUEST_COLUMNS, join, filter
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([user_id], |row| {
            Ok(RequestWithUser {
                request: request_from_row(row)?,
                user: summary_at(row, 10)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn query_request(conn: &Connection, id: &str) -> Result<Option<FriendRequestRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM friend_requests r WHERE r.id = ?1",
        REQUEST_COLUMNS
    ))?;
    stmt.query_row([id], request_from_row).optional()
}

fn query_are_friends(conn: &Connection, x: &str, y: &str) -> Result<bool> {
    let (a, b) = canonical_pair(x, y);
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM friendships WHERE user_a = ?1 AND user_b = ?2",
            (a, b),
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn query_has_open_request(conn: &Connection, from_id: &str, to_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM friend_requests
             WHERE request_user_id = ?1 AND target_user_id = ?2 AND status = 1",
            (from_id, to_id),
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<FriendRequestRow> {
    Ok(FriendRequestRow {
        id: row.get(0)?,
        request_user_id: row.get(1)?,
        target_user_id: row.get(2)?,
        message: row.get(3)?,
        status: row.get(4)?,
        decision: row.get(5)?,
        seen: row.get(6)?,
        send_request: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    fn resolved(outcome: ResolveOutcome) -> (FriendRequestRow, Option<ChatRow>) {
        match outcome {
            ResolveOutcome::Resolved { request, chat } => (request, chat),
            _ => panic!("expected Resolved"),
        }
    }

    #[test]
    fn duplicate_open_request_is_refused() {
        let db = testutil::db();
        let alice = testutil::user(&db, "alice");
        let bob = testutil::user(&db, "bob");

        assert_eq!(
            db.create_friend_request("r1", &alice, &bob, "hi").unwrap(),
            NewRequestOutcome::Created
        );
        assert_eq!(
            db.create_friend_request("r2", &alice, &bob, "hi again").unwrap(),
            NewRequestOutcome::Duplicate
        );
        assert_eq!(
            db.create_friend_request("r3", &alice, "nobody", "hi").unwrap(),
            NewRequestOutcome::TargetNotFound
        );
        assert_eq!(
            db.create_friend_request("r4", "nobody", &bob, "hi").unwrap(),
            NewRequestOutcome::RequesterNotFound
        );
    }

    #[test]
    fn accept_creates_symmetric_friendship_and_one_chat() {
        let db = testutil::db();
        let alice = testutil::user(&db, "alice");
        let bob = testutil::user(&db, "bob");
        db.create_friend_request("r1", &alice, &bob, "hi").unwrap();

        let (request, chat) = resolved(db.resolve_friend_request("r1", Decision::Accept, &bob).unwrap());
        assert!(!request.status);
        assert_eq!(request.decision(), Some(Decision::Accept));

        let chat = chat.expect("chat provisioned");
        assert_eq!(chat.participants.len(), 2);
        assert!(chat.participants.contains(&alice));
        assert!(chat.participants.contains(&bob));

        assert!(db.are_friends(&alice, &bob).unwrap());
        assert!(db.are_friends(&bob, &alice).unwrap());
        assert_eq!(db.friends_of(&alice).unwrap()[0].id, bob);
        assert_eq!(db.friends_of(&bob).unwrap()[0].id, alice);
        assert_eq!(db.count_chats_between(&alice, &bob).unwrap(), 1);
    }

    #[test]
    fn second_decision_changes_nothing() {
        let db = testutil::db();
        let alice = testutil::user(&db, "alice");
        let bob = testutil::user(&db, "bob");
        db.create_friend_request("r1", &alice, &bob, "hi").unwrap();

        resolved(db.resolve_friend_request("r1", Decision::Accept, &bob).unwrap());
        assert!(matches!(
            db.resolve_friend_request("r1", Decision::Accept, &bob).unwrap(),
            ResolveOutcome::AlreadyResolved
        ));
        assert!(matches!(
            db.resolve_friend_request("r1", Decision::Reject, &bob).unwrap(),
            ResolveOutcome::AlreadyResolved
        ));
        assert_eq!(db.count_chats_between(&alice, &bob).unwrap(), 1);

        let request = db.get_friend_request("r1").unwrap().unwrap();
        assert_eq!(request.decision(), Some(Decision::Accept));
    }

    #[test]
    fn reject_only_closes_the_request() {
        let db = testutil::db();
        let alice = testutil::user(&db, "alice");
        let bob = testutil::user(&db, "bob");
        db.create_friend_request("r1", &alice, &bob, "hi").unwrap();

        let (request, chat) = resolved(db.resolve_friend_request("r1", Decision::Reject, &bob).unwrap());
        assert!(!request.status);
        assert!(chat.is_none());
        assert!(!db.are_friends(&alice, &bob).unwrap());
        assert_eq!(db.count_chats_between(&alice, &bob).unwrap(), 0);

        // Closed requests no longer block a new one.
        assert_eq!(
            db.create_friend_request("r2", &alice, &bob, "second try").unwrap(),
            NewRequestOutcome::Created
        );
    }

    #[test]
    fn only_the_target_may_decide() {
        let db = testutil::db();
        let alice = testutil::user(&db, "alice");
        let bob = testutil::user(&db, "bob");
        db.create_friend_request("r1", &alice, &bob, "hi").unwrap();

        assert!(matches!(
            db.resolve_friend_request("r1", Decision::Accept, &alice).unwrap(),
            ResolveOutcome::NotTarget
        ));
        assert!(matches!(
            db.resolve_friend_request("missing", Decision::Accept, &bob).unwrap(),
            ResolveOutcome::NotFound
        ));
        assert!(db.get_friend_request("r1").unwrap().unwrap().status);
    }

    #[test]
    fn accepting_closes_crossed_request() {
        let db = testutil::db();
        let alice = testutil::user(&db, "alice");
        let bob = testutil::user(&db, "bob");
        db.create_friend_request("r1", &alice, &bob, "hi").unwrap();
        db.create_friend_request("r2", &bob, &alice, "hi too").unwrap();

        resolved(db.resolve_friend_request("r1", Decision::Accept, &bob).unwrap());

        assert!(db.incoming_requests(&alice).unwrap().is_empty());
        assert!(matches!(
            db.resolve_friend_request("r2", Decision::Accept, &alice).unwrap(),
            ResolveOutcome::AlreadyResolved
        ));
        assert_eq!(db.count_chats_between(&alice, &bob).unwrap(), 1);
        assert_eq!(
            db.create_friend_request("r3", &bob, &alice, "again").unwrap(),
            NewRequestOutcome::AlreadyFriends
        );
    }

    #[test]
    fn incoming_and_outgoing_show_the_same_request() {
        let db = testutil::db();
        let alice = testutil::user(&db, "alice");
        let bob = testutil::user(&db, "bob");
        db.create_friend_request("r1", &alice, &bob, "hi").unwrap();

        let incoming = db.incoming_requests(&bob).unwrap();
        let outgoing = db.outgoing_requests(&alice).unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(outgoing.len(), 1);
        assert_eq!(incoming[0].request.id, outgoing[0].request.id);
        assert_eq!(incoming[0].user.username, "alice");
        assert_eq!(outgoing[0].user.username, "bob");
    }

    #[test]
    fn mark_sent_flips_each_request_once() {
        let db = testutil::db();
        let alice = testutil::user(&db, "alice");
        let bob = testutil::user(&db, "bob");
        db.create_friend_request("r1", &alice, &bob, "hi").unwrap();

        let ids = vec!["r1".to_string()];
        assert_eq!(db.mark_requests_sent(&ids).unwrap(), 1);
        assert_eq!(db.mark_requests_sent(&ids).unwrap(), 0);
        assert!(db.get_friend_request("r1").unwrap().unwrap().send_request);
    }
}
