use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::Store;
use crate::errors::Result;
use crate::model::{
    Channel, CutoffProgress, CutoffRule, DeviceState, RelayArray, RelayState, Schedule,
    ScheduleConfig, TelemetrySample, Timer, TimerMode, TripEvent, TripLevel, TripSettings,
    TripThresholds,
};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SAMPLE_COLUMNS: &str = "device_id, ts, voltage, current, power, energy_wh, \
     v1, i1, p1, e1_wh, v3, i3, p3, e3_wh, clip_i1, clip_i3, rssi, relay1, relay2, received_at, raw";

const TIMER_COLUMNS: &str = "id, device_id, ch, mode, end_at, end_state, active, created_at";

const SCHEDULE_COLUMNS: &str =
    "device_id, ch, enabled, on_time, off_time, invert, last_applied_state";

const CUTOFF_COLUMNS: &str =
    "device_id, ch, enabled, limit_mwh, start_wh, last_wh, consumed_mwh";

const TRIP_SETTINGS_COLUMNS: &str =
    "device_id, v_min, v_max, i_min, i_max, p_min, p_max, latched, latched_at, last_fault";

const TRIP_EVENT_COLUMNS: &str = "id, device_id, level, kind, fault, message, meta, created_at";

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

fn channel_col(row: &PgRow) -> std::result::Result<Channel, sqlx::Error> {
    let ch: i16 = row.try_get("ch")?;
    Channel::parse(i64::from(ch)).map_err(|e| decode_err(e.to_string()))
}

fn relay_col(row: &PgRow, col: &str) -> std::result::Result<RelayState, sqlx::Error> {
    let raw: i16 = row.try_get(col)?;
    RelayState::parse(i64::from(raw)).map_err(|e| decode_err(e.to_string()))
}

fn sample_from_row(row: &PgRow) -> std::result::Result<TelemetrySample, sqlx::Error> {
    let relay1: Option<i16> = row.try_get("relay1")?;
    let relay2: Option<i16> = row.try_get("relay2")?;
    let relay = match (relay1, relay2) {
        (Some(r1), Some(r2)) => Some([
            RelayState::from(r1 == 1),
            RelayState::from(r2 == 1),
        ]),
        _ => None,
    };

    Ok(TelemetrySample {
        device_id: row.try_get("device_id")?,
        ts: row.try_get("ts")?,
        voltage: row.try_get("voltage")?,
        current: row.try_get("current")?,
        power: row.try_get("power")?,
        energy_wh: row.try_get("energy_wh")?,
        v1: row.try_get("v1")?,
        i1: row.try_get("i1")?,
        p1: row.try_get("p1")?,
        e1_wh: row.try_get("e1_wh")?,
        v3: row.try_get("v3")?,
        i3: row.try_get("i3")?,
        p3: row.try_get("p3")?,
        e3_wh: row.try_get("e3_wh")?,
        clip_i1: row.try_get("clip_i1")?,
        clip_i3: row.try_get("clip_i3")?,
        rssi: row.try_get("rssi")?,
        relay,
        received_at: row.try_get("received_at")?,
        raw: row.try_get("raw")?,
    })
}

fn timer_from_row(row: &PgRow) -> std::result::Result<Timer, sqlx::Error> {
    let mode: String = row.try_get("mode")?;
    Ok(Timer {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        ch: channel_col(row)?,
        mode: TimerMode::parse(&mode).map_err(|e| decode_err(e.to_string()))?,
        end_at: row.try_get("end_at")?,
        end_state: relay_col(row, "end_state")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn schedule_from_row(row: &PgRow) -> std::result::Result<Schedule, sqlx::Error> {
    Ok(Schedule {
        device_id: row.try_get("device_id")?,
        ch: channel_col(row)?,
        enabled: row.try_get("enabled")?,
        on: row.try_get("on_time")?,
        off: row.try_get("off_time")?,
        invert: row.try_get("invert")?,
        last_applied_state: relay_col(row, "last_applied_state")?,
    })
}

fn cutoff_from_row(row: &PgRow) -> std::result::Result<CutoffRule, sqlx::Error> {
    Ok(CutoffRule {
        device_id: row.try_get("device_id")?,
        ch: channel_col(row)?,
        enabled: row.try_get("enabled")?,
        limit_mwh: row.try_get("limit_mwh")?,
        start_wh: row.try_get("start_wh")?,
        last_wh: row.try_get("last_wh")?,
        consumed_mwh: row.try_get("consumed_mwh")?,
    })
}

fn trip_settings_from_row(row: &PgRow) -> std::result::Result<TripSettings, sqlx::Error> {
    Ok(TripSettings {
        device_id: row.try_get("device_id")?,
        thresholds: TripThresholds {
            v_min: row.try_get("v_min")?,
            v_max: row.try_get("v_max")?,
            i_min: row.try_get("i_min")?,
            i_max: row.try_get("i_max")?,
            p_min: row.try_get("p_min")?,
            p_max: row.try_get("p_max")?,
        },
        latched: row.try_get("latched")?,
        latched_at: row.try_get("latched_at")?,
        last_fault: row.try_get("last_fault")?,
    })
}

fn trip_event_from_row(row: &PgRow) -> std::result::Result<TripEvent, sqlx::Error> {
    let level: String = row.try_get("level")?;
    Ok(TripEvent {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        level: TripLevel::parse(&level),
        kind: row.try_get("kind")?,
        fault: row.try_get("fault")?,
        message: row.try_get("message")?,
        meta: row.try_get("meta")?,
        created_at: row.try_get("created_at")?,
    })
}

fn ch_param(ch: Channel) -> i16 {
    i16::from(ch.number())
}

fn relay_column(ch: Channel) -> &'static str {
    match ch {
        Channel::One => "relay1",
        Channel::Two => "relay2",
    }
}

impl Store for PgStore {
    async fn insert_sample(&self, sample: &TelemetrySample) -> Result<()> {
        let query = format!(
            "INSERT INTO telemetry ({}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)",
            SAMPLE_COLUMNS
        );
        let relay = sample.relay.map(|r| [r[0].as_i16(), r[1].as_i16()]);

        sqlx::query(&query)
            .bind(&sample.device_id)
            .bind(sample.ts)
            .bind(sample.voltage)
            .bind(sample.current)
            .bind(sample.power)
            .bind(sample.energy_wh)
            .bind(sample.v1)
            .bind(sample.i1)
            .bind(sample.p1)
            .bind(sample.e1_wh)
            .bind(sample.v3)
            .bind(sample.i3)
            .bind(sample.p3)
            .bind(sample.e3_wh)
            .bind(sample.clip_i1)
            .bind(sample.clip_i3)
            .bind(sample.rssi)
            .bind(relay.map(|r| r[0]))
            .bind(relay.map(|r| r[1]))
            .bind(sample.received_at)
            .bind(&sample.raw)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn latest_sample(&self, device_id: &str) -> Result<Option<TelemetrySample>> {
        let query = format!(
            "SELECT {} FROM telemetry WHERE device_id = $1 ORDER BY id DESC LIMIT 1",
            SAMPLE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(sample_from_row).transpose()?)
    }

    async fn recent_samples(&self, device_id: &str, limit: usize) -> Result<Vec<TelemetrySample>> {
        let query = format!(
            "SELECT {} FROM (
                SELECT id, {} FROM telemetry WHERE device_id = $1 ORDER BY id DESC LIMIT $2
             ) recent ORDER BY id ASC",
            SAMPLE_COLUMNS, SAMPLE_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(device_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(sample_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn device(&self, device_id: &str) -> Result<Option<DeviceState>> {
        let row = sqlx::query(
            "SELECT device_id, last_seen, relay1, relay2 FROM devices WHERE device_id = $1",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DeviceState {
            device_id: row.try_get("device_id")?,
            last_seen: row.try_get("last_seen")?,
            relay: [relay_col(&row, "relay1")?, relay_col(&row, "relay2")?],
        }))
    }

    async fn record_seen(
        &self,
        device_id: &str,
        last_seen: i64,
        relay: Option<RelayArray>,
    ) -> Result<()> {
        match relay {
            Some(relay) => {
                sqlx::query(
                    r#"
                    INSERT INTO devices (device_id, last_seen, relay1, relay2)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (device_id) DO UPDATE
                    SET last_seen = EXCLUDED.last_seen, relay1 = EXCLUDED.relay1,
                        relay2 = EXCLUDED.relay2, updated_at = NOW()
                    "#,
                )
                .bind(device_id)
                .bind(last_seen)
                .bind(relay[0].as_i16())
                .bind(relay[1].as_i16())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO devices (device_id, last_seen) VALUES ($1, $2)
                    ON CONFLICT (device_id) DO UPDATE
                    SET last_seen = EXCLUDED.last_seen, updated_at = NOW()
                    "#,
                )
                .bind(device_id)
                .bind(last_seen)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn set_relay(&self, device_id: &str, ch: Channel, state: RelayState) -> Result<()> {
        let col = relay_column(ch);
        let query = format!(
            "INSERT INTO devices (device_id, {col}) VALUES ($1, $2)
             ON CONFLICT (device_id) DO UPDATE SET {col} = EXCLUDED.{col}, updated_at = NOW()"
        );
        sqlx::query(&query)
            .bind(device_id)
            .bind(state.as_i16())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_timer(&self, timer: &Timer) -> Result<()> {
        let query = format!(
            "INSERT INTO timers ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            TIMER_COLUMNS
        );
        sqlx::query(&query)
            .bind(timer.id)
            .bind(&timer.device_id)
            .bind(ch_param(timer.ch))
            .bind(timer.mode.as_str())
            .bind(timer.end_at)
            .bind(timer.end_state.as_i16())
            .bind(timer.active)
            .bind(timer.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn active_timers(&self, device_id: &str) -> Result<Vec<Timer>> {
        let query = format!(
            "SELECT {} FROM timers WHERE device_id = $1 AND active ORDER BY ch",
            TIMER_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(timer_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>> {
        let query = format!(
            "SELECT {} FROM timers WHERE active AND end_at <= $1 ORDER BY end_at",
            TIMER_COLUMNS
        );
        let rows = sqlx::query(&query).bind(now).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(timer_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn deactivate_timer(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE timers SET active = FALSE WHERE id = $1 AND active")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn cancel_timers(&self, device_id: &str, ch: Option<Channel>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE timers SET active = FALSE
             WHERE device_id = $1 AND active AND ($2::SMALLINT IS NULL OR ch = $2)",
        )
        .bind(device_id)
        .bind(ch.map(ch_param))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn schedules(&self, device_id: &str) -> Result<Vec<Schedule>> {
        let query = format!(
            "SELECT {} FROM schedules WHERE device_id = $1 ORDER BY ch",
            SCHEDULE_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(schedule_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn enabled_schedules(&self) -> Result<Vec<Schedule>> {
        let query = format!("SELECT {} FROM schedules WHERE enabled", SCHEDULE_COLUMNS);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(schedule_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn upsert_schedule(
        &self,
        device_id: &str,
        ch: Channel,
        config: &ScheduleConfig,
    ) -> Result<Schedule> {
        let query = format!(
            "INSERT INTO schedules (device_id, ch, enabled, on_time, off_time, invert)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (device_id, ch) DO UPDATE
             SET enabled = EXCLUDED.enabled, on_time = EXCLUDED.on_time,
                 off_time = EXCLUDED.off_time, invert = EXCLUDED.invert, updated_at = NOW()
             RETURNING {}",
            SCHEDULE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(device_id)
            .bind(ch_param(ch))
            .bind(config.enabled)
            .bind(&config.on)
            .bind(&config.off)
            .bind(config.invert)
            .fetch_one(&self.pool)
            .await?;
        Ok(schedule_from_row(&row)?)
    }

    async fn mark_schedule_applied(
        &self,
        device_id: &str,
        ch: Channel,
        expected: RelayState,
        applied: RelayState,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE schedules SET last_applied_state = $4, updated_at = NOW()
             WHERE device_id = $1 AND ch = $2 AND last_applied_state = $3",
        )
        .bind(device_id)
        .bind(ch_param(ch))
        .bind(expected.as_i16())
        .bind(applied.as_i16())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_schedule(&self, device_id: &str, ch: Channel) -> Result<u64> {
        let result = sqlx::query("DELETE FROM schedules WHERE device_id = $1 AND ch = $2")
            .bind(device_id)
            .bind(ch_param(ch))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn cutoffs(&self, device_id: &str) -> Result<Vec<CutoffRule>> {
        let query = format!(
            "SELECT {} FROM cutoffs WHERE device_id = $1 ORDER BY ch",
            CUTOFF_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(device_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(cutoff_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn cutoff(&self, device_id: &str, ch: Channel) -> Result<Option<CutoffRule>> {
        let query = format!(
            "SELECT {} FROM cutoffs WHERE device_id = $1 AND ch = $2",
            CUTOFF_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(device_id)
            .bind(ch_param(ch))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(cutoff_from_row).transpose()?)
    }

    async fn upsert_cutoff(
        &self,
        device_id: &str,
        ch: Channel,
        enabled: bool,
        limit_mwh: f64,
    ) -> Result<CutoffRule> {
        let query = format!(
            "INSERT INTO cutoffs (device_id, ch, enabled, limit_mwh)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (device_id, ch) DO UPDATE
             SET enabled = EXCLUDED.enabled, limit_mwh = EXCLUDED.limit_mwh,
                 start_wh = NULL, last_wh = NULL, consumed_mwh = 0, updated_at = NOW()
             RETURNING {}",
            CUTOFF_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(device_id)
            .bind(ch_param(ch))
            .bind(enabled)
            .bind(limit_mwh)
            .fetch_one(&self.pool)
            .await?;
        Ok(cutoff_from_row(&row)?)
    }

    async fn save_cutoff_progress(
        &self,
        device_id: &str,
        ch: Channel,
        progress: CutoffProgress,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE cutoffs SET start_wh = $3, last_wh = $4, consumed_mwh = $5, updated_at = NOW()
             WHERE device_id = $1 AND ch = $2",
        )
        .bind(device_id)
        .bind(ch_param(ch))
        .bind(progress.start_wh)
        .bind(progress.last_wh)
        .bind(progress.consumed_mwh)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_cutoff(&self, device_id: &str, ch: Channel) -> Result<u64> {
        let result = sqlx::query("DELETE FROM cutoffs WHERE device_id = $1 AND ch = $2")
            .bind(device_id)
            .bind(ch_param(ch))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn trip_settings(&self, device_id: &str) -> Result<Option<TripSettings>> {
        let query = format!(
            "SELECT {} FROM trip_settings WHERE device_id = $1",
            TRIP_SETTINGS_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(trip_settings_from_row).transpose()?)
    }

    async fn save_trip_thresholds(
        &self,
        device_id: &str,
        thresholds: &TripThresholds,
    ) -> Result<TripSettings> {
        let query = format!(
            "INSERT INTO trip_settings (device_id, v_min, v_max, i_min, i_max, p_min, p_max)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (device_id) DO UPDATE
             SET v_min = EXCLUDED.v_min, v_max = EXCLUDED.v_max,
                 i_min = EXCLUDED.i_min, i_max = EXCLUDED.i_max,
                 p_min = EXCLUDED.p_min, p_max = EXCLUDED.p_max,
                 latched = FALSE, latched_at = NULL, last_fault = '', updated_at = NOW()
             RETURNING {}",
            TRIP_SETTINGS_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(device_id)
            .bind(thresholds.v_min)
            .bind(thresholds.v_max)
            .bind(thresholds.i_min)
            .bind(thresholds.i_max)
            .bind(thresholds.p_min)
            .bind(thresholds.p_max)
            .fetch_one(&self.pool)
            .await?;
        Ok(trip_settings_from_row(&row)?)
    }

    async fn latch_trip(&self, device_id: &str, at: DateTime<Utc>, fault: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO trip_settings (device_id, latched, latched_at, last_fault)
            VALUES ($1, TRUE, $2, $3)
            ON CONFLICT (device_id) DO UPDATE
            SET latched = TRUE, latched_at = EXCLUDED.latched_at,
                last_fault = EXCLUDED.last_fault, updated_at = NOW()
            WHERE trip_settings.latched = FALSE
            "#,
        )
        .bind(device_id)
        .bind(at)
        .bind(fault)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_trip_latch(&self, device_id: &str) -> Result<TripSettings> {
        let query = format!(
            "INSERT INTO trip_settings (device_id) VALUES ($1)
             ON CONFLICT (device_id) DO UPDATE
             SET latched = FALSE, latched_at = NULL, last_fault = '', updated_at = NOW()
             RETURNING {}",
            TRIP_SETTINGS_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(device_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(trip_settings_from_row(&row)?)
    }

    async fn insert_trip_event(&self, event: &TripEvent) -> Result<()> {
        let query = format!(
            "INSERT INTO trip_events ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            TRIP_EVENT_COLUMNS
        );
        sqlx::query(&query)
            .bind(event.id)
            .bind(&event.device_id)
            .bind(event.level.as_str())
            .bind(&event.kind)
            .bind(&event.fault)
            .bind(&event.message)
            .bind(&event.meta)
            .bind(event.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn trip_events(&self, device_id: &str, limit: usize) -> Result<Vec<TripEvent>> {
        let query = format!(
            "SELECT {} FROM trip_events WHERE device_id = $1 ORDER BY created_at DESC LIMIT $2",
            TRIP_EVENT_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(device_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(trip_event_from_row)
            .collect::<std::result::Result<_, _>>()?)
    }

    async fn delete_trip_events(&self, device_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM trip_events WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_trip_event(&self, device_id: &str, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM trip_events WHERE id = $1 AND device_id = $2")
            .bind(id)
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
