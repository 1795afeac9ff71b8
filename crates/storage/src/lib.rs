use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{EventId, PlayerId, SessionId, SessionStatus, TournamentId},
    protocol::{DrawEvent, DrawEventRecord, DrawSessionSeed, DrawSnapshot},
};

/// Append-only draw log backed by SQLite.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

const SESSION_COLUMNS: &str =
    "id, tournament_id, status, group_count, group_size, total_players, player_ids, created_at";

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Every connection to `sqlite::memory:` opens its own database.
        let max_connections = if is_memory_url(database_url) { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Creates a live session and cancels any pending or live session the
    /// tournament already had.
    pub async fn create_session(
        &self,
        tournament_id: TournamentId,
        group_count: u32,
        group_size: u32,
        player_ids: &[PlayerId],
    ) -> Result<DrawSessionSeed> {
        let roster = serde_json::to_string(player_ids).context("failed to encode roster")?;
        let total_players = u32::try_from(player_ids.len()).context("roster too large")?;
        let created_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE draw_sessions SET status = ?
             WHERE tournament_id = ? AND status IN ('pending', 'live')",
        )
        .bind(SessionStatus::Canceled.as_str())
        .bind(tournament_id.0)
        .execute(&mut *tx)
        .await
        .context("failed to cancel superseded sessions")?;

        let rec = sqlx::query(
            "INSERT INTO draw_sessions
                (tournament_id, status, group_count, group_size, total_players, player_ids, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(tournament_id.0)
        .bind(SessionStatus::Live.as_str())
        .bind(i64::from(group_count))
        .bind(i64::from(group_size))
        .bind(i64::from(total_players))
        .bind(roster)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(DrawSessionSeed {
            session_id: SessionId(rec.get::<i64, _>(0)),
            tournament_id,
            status: SessionStatus::Live,
            group_count,
            group_size,
            total_players,
            player_ids: player_ids.to_vec(),
            created_at: Some(created_at),
        })
    }

    pub async fn load_session(&self, session_id: SessionId) -> Result<Option<DrawSessionSeed>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM draw_sessions WHERE id = ?"
        ))
        .bind(session_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn latest_session_for_tournament(
        &self,
        tournament_id: TournamentId,
    ) -> Result<Option<DrawSessionSeed>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM draw_sessions
             WHERE tournament_id = ?
             ORDER BY id DESC
             LIMIT 1"
        ))
        .bind(tournament_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn set_session_status(
        &self,
        session_id: SessionId,
        status: SessionStatus,
    ) -> Result<()> {
        sqlx::query("UPDATE draw_sessions SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(session_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn append_event(
        &self,
        session_id: SessionId,
        step: u32,
        event: &DrawEvent,
    ) -> Result<DrawEventRecord> {
        let payload = event
            .payload_json()
            .with_context(|| format!("failed to encode {} payload", event.event_type()))?;
        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO draw_events (session_id, step, event_type, payload, created_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(session_id.0)
        .bind(i64::from(step))
        .bind(event.event_type())
        .bind(payload.to_string())
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to append {} to session {session_id}", event.event_type()))?;

        Ok(DrawEventRecord {
            id: EventId(rec.get::<i64, _>(0)),
            session_id,
            step,
            event: event.clone(),
            created_at,
        })
    }

    /// All records of a session in fold order `(step, id)`.
    pub async fn list_events(&self, session_id: SessionId) -> Result<Vec<DrawEventRecord>> {
        let rows = sqlx::query(
            "SELECT id, session_id, step, event_type, payload, created_at
             FROM draw_events
             WHERE session_id = ?
             ORDER BY step ASC, id ASC",
        )
        .bind(session_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn load_snapshot(&self, session_id: SessionId) -> Result<Option<DrawSnapshot>> {
        let Some(session) = self.load_session(session_id).await? else {
            return Ok(None);
        };
        let events = self.list_events(session_id).await?;
        Ok(Some(DrawSnapshot { session, events }))
    }
}

fn session_from_row(row: &SqliteRow) -> Result<DrawSessionSeed> {
    let raw_status: String = row.try_get("status")?;
    let status = SessionStatus::parse(&raw_status)
        .ok_or_else(|| anyhow!("unknown session status '{raw_status}'"))?;
    let roster: String = row.try_get("player_ids")?;
    let player_ids: Vec<PlayerId> =
        serde_json::from_str(&roster).context("failed to decode stored roster")?;
    Ok(DrawSessionSeed {
        session_id: SessionId(row.try_get("id")?),
        tournament_id: TournamentId(row.try_get("tournament_id")?),
        status,
        group_count: u32::try_from(row.try_get::<i64, _>("group_count")?)?,
        group_size: u32::try_from(row.try_get::<i64, _>("group_size")?)?,
        total_players: u32::try_from(row.try_get::<i64, _>("total_players")?)?,
        player_ids,
        created_at: row.try_get::<Option<DateTime<Utc>>, _>("created_at")?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<DrawEventRecord> {
    let id: i64 = row.try_get("id")?;
    let event_type: String = row.try_get("event_type")?;
    let payload: String = row.try_get("payload")?;
    let payload: serde_json::Value = serde_json::from_str(&payload)
        .with_context(|| format!("event {id} has a malformed payload"))?;
    let event = DrawEvent::from_parts(&event_type, payload)
        .with_context(|| format!("event {id} ({event_type}) does not match its schema"))?;
    Ok(DrawEventRecord {
        id: EventId(id),
        session_id: SessionId(row.try_get("session_id")?),
        step: u32::try_from(row.try_get::<i64, _>("step")?)?,
        event,
        created_at: row.try_get("created_at")?,
    })
}

fn is_memory_url(database_url: &str) -> bool {
    database_url.starts_with("sqlite::memory:") || database_url.contains("mode=memory")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if is_memory_url(database_url) || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
