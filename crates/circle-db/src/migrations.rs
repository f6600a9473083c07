use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id              TEXT PRIMARY KEY,
                email           TEXT NOT NULL UNIQUE,
                username        TEXT NOT NULL,
                surname         TEXT NOT NULL,
                password        TEXT NOT NULL,
                role            TEXT NOT NULL DEFAULT 'USER',
                activation_code TEXT,
                avatar          BLOB NOT NULL DEFAULT x'',
                public_profile  INTEGER NOT NULL DEFAULT 1,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX idx_users_activation ON users(activation_code);

            CREATE TABLE friend_requests (
                id              TEXT PRIMARY KEY,
                request_user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                target_user_id  TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                message         TEXT NOT NULL,
                status          INTEGER NOT NULL DEFAULT 1,
                decision        TEXT,
                seen            INTEGER NOT NULL DEFAULT 0,
                send_request    INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at      TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX idx_friend_requests_target
                ON friend_requests(target_user_id, status);

            -- At most one open request per ordered pair
            CREATE UNIQUE INDEX idx_friend_requests_open_pair
                ON friend_requests(request_user_id, target_user_id)
                WHERE status = 1;

            CREATE TABLE friendships (
                user_a      TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                user_b      TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (user_a, user_b),
                CHECK (user_a < user_b)
            );

            CREATE INDEX idx_friendships_b ON friendships(user_b);

            CREATE TABLE chats (
                id                TEXT PRIMARY KEY,
                conversation_name TEXT,
                created_at        TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TABLE chat_participants (
                chat_id     TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                PRIMARY KEY (chat_id, user_id)
            );

            CREATE INDEX idx_chat_participants_user ON chat_participants(user_id);

            CREATE TABLE messages (
                id          TEXT PRIMARY KEY,
                chat_id     TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                author_id   TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                text        TEXT NOT NULL,
                is_visible  INTEGER NOT NULL DEFAULT 1,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX idx_messages_chat ON messages(chat_id, created_at);

            CREATE TABLE revoked_tokens (
                jti         TEXT NOT NULL,
                user_id     TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                expires_at  INTEGER NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (jti, user_id)
            );

            CREATE INDEX idx_revoked_tokens_expiry ON revoked_tokens(expires_at);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run(&conn).unwrap();
        run(&conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }
}
