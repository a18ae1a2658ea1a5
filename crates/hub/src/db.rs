use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::gateway::ActuatorCommand;
use crate::options::RawOptions;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Persisted phase clock and master switch of one box, as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBoxState {
    pub current_phase: String,
    /// RFC 3339; may be absent or unparsable in old rows.
    pub phase_start_date: Option<String>,
    pub master_enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandRow {
    pub ts: i64,
    pub box_id: String,
    pub entity: String,
    pub action: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/growbox/growbox.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database lives per connection; keep exactly one.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Box state
    // ----------------------------

    pub async fn save_box_state(
        &self,
        box_id: &str,
        current_phase: &str,
        phase_start_date: OffsetDateTime,
        master_enabled: bool,
    ) -> Result<()> {
        let start = phase_start_date
            .format(&Rfc3339)
            .context("failed to format phase start date")?;
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .context("failed to format timestamp")?;
        sqlx::query(
            r#"
            INSERT INTO box_state (box_id, current_phase, phase_start_date, master_enabled, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(box_id) DO UPDATE SET
              current_phase=excluded.current_phase,
              phase_start_date=excluded.phase_start_date,
              master_enabled=excluded.master_enabled,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(box_id)
        .bind(current_phase)
        .bind(start)
        .bind(master_enabled)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("save_box_state failed")?;
        Ok(())
    }

    pub async fn load_box_state(&self, box_id: &str) -> Result<Option<StoredBoxState>> {
        let row = sqlx::query(
            r#"
            SELECT current_phase, phase_start_date, master_enabled
            FROM box_state
            WHERE box_id = ?
            "#,
        )
        .bind(box_id)
        .fetch_optional(&self.pool)
        .await
        .context("load_box_state failed")?;

        row.map(|r| -> Result<StoredBoxState> {
            Ok(StoredBoxState {
                current_phase: r.try_get("current_phase")?,
                phase_start_date: r.try_get("phase_start_date")?,
                master_enabled: r.try_get("master_enabled")?,
            })
        })
        .transpose()
    }

    // ----------------------------
    // Option overrides
    // ----------------------------

    pub async fn save_options(&self, box_id: &str, options: &RawOptions) -> Result<()> {
        let mut tx = self.pool.begin().await.context("save_options: begin failed")?;
        for (key, value) in options {
            if value.is_null() {
                continue;
            }
            let json = serde_json::to_string(value).context("failed to encode option")?;
            sqlx::query(
                r#"
                INSERT INTO box_options (box_id, key, value_json)
                VALUES (?, ?, ?)
                ON CONFLICT(box_id, key) DO UPDATE SET value_json=excluded.value_json
                "#,
            )
            .bind(box_id)
            .bind(key)
            .bind(json)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("save_options failed for key '{key}'"))?;
        }
        tx.commit().await.context("save_options: commit failed")?;
        Ok(())
    }

    pub async fn load_options(&self, box_id: &str) -> Result<RawOptions> {
        let rows = sqlx::query(
            r#"
            SELECT key, value_json
            FROM box_options
            WHERE box_id = ?
            "#,
        )
        .bind(box_id)
        .fetch_all(&self.pool)
        .await
        .context("load_options failed")?;

        let mut out = RawOptions::new();
        for r in rows {
            let key: String = r.try_get("key")?;
            let json: String = r.try_get("value_json")?;
            let value = serde_json::from_str(&json)
                .with_context(|| format!("corrupt stored option '{key}' for box '{box_id}'"))?;
            out.insert(key, value);
        }
        Ok(out)
    }

    // ----------------------------
    // Command journal
    // ----------------------------

    pub async fn insert_command(
        &self,
        ts: OffsetDateTime,
        box_id: &str,
        cmd: &ActuatorCommand,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO actuator_commands (ts, box_id, entity, action)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(ts.unix_timestamp())
        .bind(box_id)
        .bind(&cmd.entity)
        .bind(cmd.action.to_string())
        .execute(&self.pool)
        .await
        .context("insert_command failed")?;
        Ok(())
    }

    /// Most recent commands for a box, newest first.
    pub async fn recent_commands(&self, box_id: &str, limit: i64) -> Result<Vec<CommandRow>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, box_id, entity, action
            FROM actuator_commands
            WHERE box_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(box_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_commands failed")?;

        rows.into_iter()
            .map(|r| {
                Ok(CommandRow {
                    ts: r.try_get("ts")?,
                    box_id: r.try_get("box_id")?,
                    entity: r.try_get("entity")?,
                    action: r.try_get("action")?,
                })
            })
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Action;
    use serde_json::json;
    use time::macros::datetime;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn box_state_round_trips() {
        let db = test_db().await;
        let start = datetime!(2024-05-01 18:30 +02:00);
        db.save_box_state("tent-1", "flowering", start, false).await.unwrap();

        let stored = db.load_box_state("tent-1").await.unwrap().unwrap();
        assert_eq!(stored.current_phase, "flowering");
        assert!(!stored.master_enabled);
        let parsed =
            OffsetDateTime::parse(stored.phase_start_date.as_deref().unwrap(), &Rfc3339).unwrap();
        assert_eq!(parsed, start);
    }

    #[tokio::test]
    async fn box_state_upsert_overwrites() {
        let db = test_db().await;
        let start = datetime!(2024-05-01 00:00 UTC);
        db.save_box_state("tent-1", "seedling", start, true).await.unwrap();
        db.save_box_state("tent-1", "vegetative", start, true).await.unwrap();
        let stored = db.load_box_state("tent-1").await.unwrap().unwrap();
        assert_eq!(stored.current_phase, "vegetative");
    }

    #[tokio::test]
    async fn missing_box_state_is_none() {
        let db = test_db().await;
        assert!(db.load_box_state("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn options_round_trip_and_skip_nulls() {
        let db = test_db().await;
        let opts: RawOptions = [
            ("target_temp".to_string(), json!(22.5)),
            ("fan_entity".to_string(), json!("")),
            ("pump_entity".to_string(), json!(null)),
        ]
        .into_iter()
        .collect();
        db.save_options("tent-1", &opts).await.unwrap();

        let loaded = db.load_options("tent-1").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["target_temp"], json!(22.5));
        assert_eq!(loaded["fan_entity"], json!(""));
        assert!(db.load_options("tent-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commands_newest_first() {
        let db = test_db().await;
        let t0 = datetime!(2024-06-01 12:00 UTC);
        db.insert_command(t0, "tent-1", &ActuatorCommand::new("switch.pump", Action::On))
            .await
            .unwrap();
        db.insert_command(
            t0 + time::Duration::seconds(30),
            "tent-1",
            &ActuatorCommand::new("switch.pump", Action::Off),
        )
        .await
        .unwrap();

        let rows = db.recent_commands("tent-1", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, "OFF");
        assert_eq!(rows[1].action, "ON");
        assert_eq!(rows[1].ts, t0.unix_timestamp());
    }
}
