use anyhow::Result;

use crate::{Database, OptionalExt};

impl Database {
    /// Put `(jti, user_id)` on the deny-list until `expires_at` (unix
    /// seconds). Returns `false` if the pair was already there; the primary
    /// key makes the check and the insert one statement.
    pub fn insert_revocation(&self, jti: &str, user_id: &str, expires_at: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO revoked_tokens (jti, user_id, expires_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![jti, user_id, expires_at],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn is_revoked(&self, jti: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM revoked_tokens WHERE jti = ?1 AND user_id = ?2",
                    (jti, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Delete deny-list entries whose retention ended before `now`.
    pub fn prune_revocations(&self, now: i64) -> Result<usize> {
        self.with_conn_mut(|conn| {
            Ok(conn.execute("DELETE FROM revoked_tokens WHERE expires_at < ?1", [now])?)
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil;

    #[test]
    fn revocation_is_scoped_to_user_and_pruned_after_expiry() {
        let db = testutil::db();
        let alice = testutil::user(&db, "alice");
        let bob = testutil::user(&db, "bob");

        assert!(db.insert_revocation("jti-1", &alice, 1_000).unwrap());
        assert!(!db.insert_revocation("jti-1", &alice, 1_000).unwrap());
        assert!(db.is_revoked("jti-1", &alice).unwrap());
        assert!(!db.is_revoked("jti-1", &bob).unwrap());

        assert_eq!(db.prune_revocations(999).unwrap(), 0);
        assert_eq!(db.prune_revocations(1_001).unwrap(), 1);
        assert!(!db.is_revoked("jti-1", &alice).unwrap());
    }
}
