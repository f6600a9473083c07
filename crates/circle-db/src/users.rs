use anyhow::Result;
use rusqlite::{Connection, Row};

use circle_types::models::Role;

use crate::models::{SummaryRow, UserRow};
use crate::{Database, OptionalExt};

const USER_COLUMNS: &str = "id, email, username, surname, password, role, activation_code, avatar, public_profile, created_at, updated_at";

pub struct NewUser<'a> {
    pub id: &'a str,
    pub email: &'a str,
    pub username: &'a str,
    pub surname: &'a str,
    pub password_hash: &'a str,
    pub role: Role,
    pub activation_code: Option<&'a str>,
}

pub struct ProfileChanges<'a> {
    pub username: &'a str,
    pub surname: &'a str,
    pub email: &'a str,
    pub public_profile: Option<bool>,
    /// `Some(empty)` clears the avatar, `None` leaves it untouched.
    pub avatar: Option<&'a [u8]>,
    /// Set when the email changed and the account must be re-activated.
    pub activation_code: Option<&'a str>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProfileUpdate {
    Updated,
    NotFound,
    EmailTaken,
}

impl Database {
    /// Insert a user. Returns `false` when the email is already registered.
    pub fn create_user(&self, user: &NewUser<'_>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (id, email, username, surname, password, role, activation_code)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(email) DO NOTHING",
                rusqlite::params![
                    user.id,
                    user.email,
                    user.username,
                    user.surname,
                    user.password_hash,
                    user.role.as_str(),
                    user.activation_code,
                ],
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn list_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM users ORDER BY created_at",
                USER_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], user_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Clear the activation code that matches `code`. Returns the activated
    /// account's email, or `None` when no pending account has that code.
    pub fn activate_user(&self, code: &str) -> Result<Option<String>> {
        self.with_conn_mut(|conn| {
            conn.query_row(
                "UPDATE users
                 SET activation_code = NULL,
                     updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE activation_code = ?1
                 RETURNING email",
                [code],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn update_password(&self, id: &str, password_hash: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE users
                 SET password = ?2, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1",
                (id, password_hash),
            )?;
            Ok(changed == 1)
        })
    }

    pub fn update_profile(&self, id: &str, changes: &ProfileChanges<'_>) -> Result<ProfileUpdate> {
        self.with_tx(|tx| {
            if query_user(tx, "id", id)?.is_none() {
                return Ok(ProfileUpdate::NotFound);
            }

            let taken: Option<String> = tx
                .query_row(
                    "SELECT id FROM users WHERE email = ?1 AND id != ?2",
                    (changes.email, id),
                    |row| row.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Ok(ProfileUpdate::EmailTaken);
            }

            tx.execute(
                "UPDATE users
                 SET username = ?2,
                     surname = ?3,
                     email = ?4,
                     public_profile = COALESCE(?5, public_profile),
                     updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE id = ?1",
                rusqlite::params![
                    id,
                    changes.username,
                    changes.surname,
                    changes.email,
                    changes.public_profile,
                ],
            )?;

            if let Some(avatar) = changes.avatar {
                tx.execute("UPDATE users SET avatar = ?2 WHERE id = ?1", rusqlite::params![id, avatar])?;
            }

            if let Some(code) = changes.activation_code {
                tx.execute("UPDATE users SET activation_code = ?2 WHERE id = ?1", (id, code))?;
            }

            Ok(ProfileUpdate::Updated)
        })
    }

    /// Delete a user. Requests, friendships, chat memberships, messages and
    /// revocations cascade.
    pub fn delete_user(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
            Ok(changed == 1)
        })
    }

    /// Case-insensitive substring match on username or surname, excluding
    /// `exclude_id`.
    pub fn search_users(&self, query: &str, exclude_id: &str, limit: u32) -> Result<Vec<SummaryRow>> {
        let pattern = format!("%{}%", escape_like(query));
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, username, surname, role, avatar FROM users
                 WHERE id != ?1
                   AND (username LIKE ?2 ESCAPE '\\' OR surname LIKE ?2 ESCAPE '\\')
                 ORDER BY username, surname
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![exclude_id, pattern, limit], summary_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

pub(crate) fn user_exists(conn: &Connection, id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM users WHERE {} = ?1",
        USER_COLUMNS, column
    ))?;
    stmt.query_row([value], user_from_row).optional()
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        username: row.get(2)?,
        surname: row.get(3)?,
        password: row.get(4)?,
        role: row.get(5)?,
        activation_code: row.get(6)?,
        avatar: row.get(7)?,
        public_profile: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Maps `id, username, surname, role, avatar` starting at column `0`.
pub(crate) fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SummaryRow> {
    summary_at(row, 0)
}

pub(crate) fn summary_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<SummaryRow> {
    Ok(SummaryRow {
        id: row.get(offset)?,
        username: row.get(offset + 1)?,
        surname: row.get(offset + 2)?,
        role: row.get(offset + 3)?,
        avatar: row.get(offset + 4)?,
    })
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
