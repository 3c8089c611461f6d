use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{OptionalExtension, Row};
use serde::Serialize;

use super::{now_ts, parse_ts, Store};
use crate::identity::{IdentityProfile, IdentityStore, StoredIdentity};

const USER_COLUMNS: &str = "open_id, union_id, user_id, name, en_name, avatar, description, email,
     city, job_title, work_station, employee_no, gender, leader_user_id, department_ids,
     department_names, join_time, first_seen, last_seen, msg_count, updated_at";

/// A stored user with its activity counters, as returned by the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    #[serde(flatten)]
    pub profile: IdentityProfile,
    pub first_seen: String,
    pub last_seen: String,
    pub msg_count: i64,
    pub updated_at: String,
}

fn encode_list(values: &[String]) -> Result<String> {
    serde_json::to_string(values).context("Failed to encode department list")
}

fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Maps a row selected with `USER_COLUMNS`.
fn row_to_record(row: &Row<'_>) -> rusqlite::Result<UserRecord> {
    let department_ids: String = row.get(14)?;
    let department_names: String = row.get(15)?;
    Ok(UserRecord {
        profile: IdentityProfile {
            open_id: row.get(0)?,
            union_id: row.get(1)?,
            user_id: row.get(2)?,
            name: row.get(3)?,
            en_name: row.get(4)?,
            avatar: row.get(5)?,
            description: row.get(6)?,
            email: row.get(7)?,
            city: row.get(8)?,
            job_title: row.get(9)?,
            work_station: row.get(10)?,
            employee_no: row.get(11)?,
            gender: row.get(12)?,
            leader_user_id: row.get(13)?,
            department_ids: decode_list(&department_ids),
            department_names: decode_list(&department_names),
            join_time: row.get(16)?,
        },
        first_seen: row.get(17)?,
        last_seen: row.get(18)?,
        msg_count: row.get(19)?,
        updated_at: row.get(20)?,
    })
}

impl Store {
    /// All known users, most recently active first.
    pub async fn list_users(&self) -> Result<Vec<UserRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users ORDER BY last_seen DESC, open_id"
            ))
            .context("Failed to prepare user query")?;
        let users = stmt
            .query_map([], row_to_record)
            .context("Failed to query users")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to collect users")?;
        Ok(users)
    }

    pub async fn get_user(&self, open_id: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE open_id = ?1"),
            rusqlite::params![open_id],
            row_to_record,
        )
        .optional()
        .context("Failed to load user")
    }
}

#[async_trait]
impl IdentityStore for Store {
    async fn get(&self, open_id: &str) -> Result<Option<StoredIdentity>> {
        Ok(self.get_user(open_id).await?.map(|record| StoredIdentity {
            // An unparsable stamp counts as stale so the next sync refreshes it.
            updated_at: parse_ts(&record.updated_at).unwrap_or_default(),
            profile: record.profile,
        }))
    }

    async fn upsert(&self, profile: &IdentityProfile) -> Result<()> {
        let department_ids = encode_list(&profile.department_ids)?;
        let department_names = encode_list(&profile.department_names)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users
             (open_id, union_id, user_id, name, en_name, avatar, description, email, city,
              job_title, work_station, employee_no, gender, leader_user_id, department_ids,
              department_names, join_time, first_seen, last_seen, msg_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                     ?18, ?18, 0, ?18)
             ON CONFLICT(open_id) DO UPDATE SET
                union_id = excluded.union_id,
                user_id = excluded.user_id,
                name = excluded.name,
                en_name = excluded.en_name,
                avatar = excluded.avatar,
                description = excluded.description,
                email = excluded.email,
                city = excluded.city,
                job_title = excluded.job_title,
                work_station = excluded.work_station,
                employee_no = excluded.employee_no,
                gender = excluded.gender,
                leader_user_id = excluded.leader_user_id,
                department_ids = excluded.department_ids,
                department_names = excluded.department_names,
                join_time = excluded.join_time,
                last_seen = excluded.last_seen,
                updated_at = excluded.updated_at",
            rusqlite::params![
                profile.open_id,
                profile.union_id,
                profile.user_id,
                profile.name,
                profile.en_name,
                profile.avatar,
                profile.description,
                profile.email,
                profile.city,
                profile.job_title,
                profile.work_station,
                profile.employee_no,
                profile.gender,
                profile.leader_user_id,
                department_ids,
                department_names,
                profile.join_time,
                now_ts(),
            ],
        )
        .with_context(|| format!("Failed to upsert user {}", profile.open_id))?;
        Ok(())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT open_id FROM users ORDER BY open_id")
            .context("Failed to prepare user id query")?;
        let ids = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to query user ids")?
            .collect::<rusqlite::Result<Vec<String>>>()
            .context("Failed to collect user ids")?;
        Ok(ids)
    }

    async fn increment_msg_count(&self, open_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE users SET msg_count = msg_count + 1, last_seen = ?1 WHERE open_id = ?2",
            rusqlite::params![now_ts(), open_id],
        )
        .context("Failed to increment message count")?;
        Ok(())
    }
}
