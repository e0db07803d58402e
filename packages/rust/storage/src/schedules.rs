//! Recurrence schedule persistence.

use libsql::params;
use wikiselect_shared::{RecurrenceSchedule, Result, ScheduleStatus, WikiSelectError};

use crate::{Storage, db_err, get_opt_string, get_string, now_ts, parse_ts, ts};

const SCHEDULE_COLUMNS: &str = "id, builder_id, queue_job_id, interval_secs,
     remaining_generations, status, title, description, long_description, email,
     email_confirmation_token, email_confirmed, last_updated_at, unsubscribe_token, last_error";

impl Storage {
    pub async fn insert_schedule(&self, schedule: &RecurrenceSchedule) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO schedules (id, builder_id, queue_job_id, interval_secs,
                   remaining_generations, status, title, description, long_description, email,
                   email_confirmation_token, email_confirmed, last_updated_at, unsubscribe_token,
                   last_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    schedule.id.as_str(),
                    schedule.builder_id.as_str(),
                    schedule.queue_job_id.as_deref(),
                    schedule.interval_secs,
                    schedule.remaining_generations,
                    schedule.status.to_string(),
                    schedule.title.as_str(),
                    schedule.description.as_deref(),
                    schedule.long_description.as_deref(),
                    schedule.email.as_deref(),
                    schedule.email_confirmation_token.as_deref(),
                    schedule.email_confirmed as i64,
                    ts(&schedule.last_updated_at),
                    schedule.unsubscribe_token.as_deref(),
                    schedule.last_error.as_deref(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Option<RecurrenceSchedule>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_schedule(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    pub async fn list_schedules(&self, builder_id: &str) -> Result<Vec<RecurrenceSchedule>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE builder_id = ?1
                     ORDER BY last_updated_at DESC"
                ),
                params![builder_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_schedule(&row)?);
        }
        Ok(results)
    }

    /// Record the armed timer job, the remaining budget and the status in one write.
    pub async fn update_schedule_timer(
        &self,
        id: &str,
        queue_job_id: Option<&str>,
        remaining_generations: Option<i64>,
        status: ScheduleStatus,
    ) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE schedules
                 SET queue_job_id = ?1, remaining_generations = ?2, status = ?3,
                     last_updated_at = ?4
                 WHERE id = ?5",
                params![
                    queue_job_id,
                    remaining_generations,
                    status.to_string(),
                    now_ts(),
                    id
                ],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(WikiSelectError::not_found(format!("schedule {id}")));
        }
        Ok(())
    }

    /// Move the timer of an active schedule from `expected_job_id` to
    /// `queue_job_id`, spending one firing.
    ///
    /// Returns `false` if the schedule is no longer active or its timer is not
    /// `expected_job_id` any more, i.e. another firing or a cancellation got
    /// there first.
    pub async fn advance_schedule_timer(
        &self,
        id: &str,
        expected_job_id: &str,
        queue_job_id: Option<&str>,
        remaining_generations: Option<i64>,
        status: ScheduleStatus,
    ) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE schedules
                 SET queue_job_id = ?1, remaining_generations = ?2, status = ?3,
                     last_updated_at = ?4
                 WHERE id = ?5 AND status = 'ACTIVE' AND queue_job_id = ?6",
                params![
                    queue_job_id,
                    remaining_generations,
                    status.to_string(),
                    now_ts(),
                    id,
                    expected_job_id
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(updated > 0)
    }

    /// Record a failed firing together with the timer state it leaves behind.
    ///
    /// Applies only while the timer is still `expected_job_id` and the schedule
    /// has not been cancelled.
    pub async fn record_schedule_failure(
        &self,
        id: &str,
        expected_job_id: Option<&str>,
        queue_job_id: Option<&str>,
        remaining_generations: Option<i64>,
        status: ScheduleStatus,
        error: &str,
    ) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE schedules
                 SET queue_job_id = ?1, remaining_generations = ?2, status = ?3,
                     last_error = ?4, last_updated_at = ?5
                 WHERE id = ?6 AND status != 'CANCELLED' AND queue_job_id IS ?7",
                params![
                    queue_job_id,
                    remaining_generations,
                    status.to_string(),
                    error,
                    now_ts(),
                    id,
                    expected_job_id
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(updated > 0)
    }

    pub async fn find_schedule_by_token(&self, token: &str) -> Result<Option<RecurrenceSchedule>> {
        self.find_schedule_where("email_confirmation_token", token).await
    }

    pub async fn find_schedule_by_unsubscribe_token(
        &self,
        token: &str,
    ) -> Result<Option<RecurrenceSchedule>> {
        self.find_schedule_where("unsubscribe_token", token).await
    }

    async fn find_schedule_where(
        &self,
        column: &'static str,
        token: &str,
    ) -> Result<Option<RecurrenceSchedule>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE {column} = ?1"),
                params![token],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_schedule(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Confirm the address behind a pending token.
    ///
    /// The token is cleared by the confirming write, so a second confirmation
    /// with the same token is reported as not found.
    pub async fn confirm_schedule_email(&self, token: &str) -> Result<RecurrenceSchedule> {
        let schedule = self
            .find_schedule_by_token(token)
            .await?
            .ok_or_else(|| WikiSelectError::not_found("confirmation token"))?;

        let updated = self
            .conn
            .execute(
                "UPDATE schedules
                 SET email_confirmed = 1, email_confirmation_token = NULL, last_updated_at = ?1
                 WHERE id = ?2 AND email_confirmation_token = ?3",
                params![now_ts(), schedule.id.as_str(), token],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(WikiSelectError::not_found("confirmation token"));
        }

        self.get_schedule(&schedule.id)
            .await?
            .ok_or_else(|| WikiSelectError::not_found(format!("schedule {}", schedule.id)))
    }

    /// Drop the notification address and both of its tokens.
    pub async fn clear_schedule_email(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE schedules
                 SET email = NULL, email_confirmation_token = NULL, email_confirmed = 0,
                     unsubscribe_token = NULL, last_updated_at = ?1
                 WHERE id = ?2",
                params![now_ts(), id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

fn row_to_schedule(row: &libsql::Row) -> Result<RecurrenceSchedule> {
    let status: ScheduleStatus = get_string(row, 5)?
        .parse()
        .map_err(WikiSelectError::Storage)?;
    Ok(RecurrenceSchedule {
        id: get_string(row, 0)?,
        builder_id: get_string(row, 1)?,
        queue_job_id: get_opt_string(row, 2),
        interval_secs: row.get::<i64>(3).ok(),
        remaining_generations: row.get::<i64>(4).ok(),
        status,
        title: get_string(row, 6)?,
        description: get_opt_string(row, 7),
        long_description: get_opt_string(row, 8),
        email: get_opt_string(row, 9),
        email_confirmation_token: get_opt_string(row, 10),
        email_confirmed: row.get::<i64>(11).unwrap_or(0) != 0,
        last_updated_at: parse_ts(&get_string(row, 12)?)?,
        unsubscribe_token: get_opt_string(row, 13),
        last_error: get_opt_string(row, 14),
    })
}
