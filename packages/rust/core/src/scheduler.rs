//! Recurrence schedules: periodic regeneration and export of a builder.
//!
//! Every schedule owns at most one armed timer job on the schedule queue.
//! Each firing enqueues a builder run and arms the next timer, until the
//! generation budget is spent. A firing first moves the schedule from the
//! timer that fired to the next one in a single guarded write, so two
//! firings of the same timer cannot both spend a generation.

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use wikiselect_shared::{RecurrenceSchedule, Result, ScheduleStatus, WikiSelectError, new_id};

use crate::builders::owned_builder;
use crate::context::AppContext;
use crate::jobs::JobPayload;
use crate::mail::confirmation_message;
use crate::orchestrator::BuilderRun;

/// Delay before a firing that could not enqueue its run is retried.
const FIRE_RETRY_DELAY_SECS: i64 = 300;

/// Parameters of a new schedule.
#[derive(Debug, Clone, Default)]
pub struct NewSchedule {
    /// Seconds between firings. `None` fires once.
    pub interval_secs: Option<i64>,
    /// Number of firings. `None` is unlimited.
    pub remaining_generations: Option<i64>,
    /// Archive title; defaults to the builder name.
    pub title: Option<String>,
    pub description: Option<String>,
    pub long_description: Option<String>,
    pub email: Option<String>,
}

/// Result of one firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// Schedule missing or no longer active.
    Ignored,
    /// Run enqueued and the next timer armed.
    Rearmed {
        run: BuilderRun,
        next_job_id: String,
        remaining_generations: Option<i64>,
    },
    /// Run enqueued; this was the last one.
    Exhausted { run: BuilderRun },
}

impl FireOutcome {
    pub fn run(&self) -> Option<&BuilderRun> {
        match self {
            Self::Ignored => None,
            Self::Rearmed { run, .. } | Self::Exhausted { run } => Some(run),
        }
    }
}

pub struct RecurrenceScheduler<'a> {
    ctx: &'a AppContext,
}

impl<'a> RecurrenceScheduler<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self { ctx }
    }

    /// Create a schedule and arm its first firing immediately.
    #[instrument(skip_all, fields(actor = %actor, builder_id = %builder_id))]
    pub async fn create_schedule(
        &self,
        actor: &str,
        builder_id: &str,
        params: NewSchedule,
    ) -> Result<RecurrenceSchedule> {
        let builder = owned_builder(&self.ctx.storage, actor, builder_id).await?;
        validate(&params)?;

        let email = params
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string);
        // The timer id is recorded before the timer exists, so a worker picking
        // it up right away already finds it armed.
        let timer = new_id();
        let schedule = RecurrenceSchedule {
            id: new_id(),
            builder_id: builder.id.clone(),
            queue_job_id: Some(timer.clone()),
            interval_secs: params.interval_secs,
            remaining_generations: params.remaining_generations,
            status: ScheduleStatus::Active,
            title: params
                .title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| builder.name.clone()),
            description: params.description,
            long_description: params.long_description,
            email_confirmation_token: email.as_ref().map(|_| Uuid::new_v4().to_string()),
            unsubscribe_token: email.as_ref().map(|_| Uuid::new_v4().to_string()),
            email,
            email_confirmed: false,
            last_error: None,
            last_updated_at: Utc::now(),
        };
        self.ctx.storage.insert_schedule(&schedule).await?;

        if let Err(e) = self.arm(&schedule.id, &timer, Utc::now()).await {
            self.ctx
                .storage
                .update_schedule_timer(
                    &schedule.id,
                    None,
                    schedule.remaining_generations,
                    ScheduleStatus::Cancelled,
                )
                .await?;
            return Err(e);
        }
        info!(schedule_id = %schedule.id, "schedule created");

        if let (Some(email), Some(confirmation), Some(unsubscribe)) = (
            schedule.email.as_deref(),
            schedule.email_confirmation_token.as_deref(),
            schedule.unsubscribe_token.as_deref(),
        ) {
            let message = confirmation_message(
                &schedule,
                email,
                confirmation,
                unsubscribe,
                &self.ctx.config.app.web_base_url,
            );
            if let Err(e) = self.ctx.mailer.send(&message).await {
                warn!(schedule_id = %schedule.id, error = %e, "confirmation mail not sent");
            }
        }

        self.get(&schedule.id).await
    }

    /// Fire a schedule out of band, as if its armed timer had come due.
    pub async fn fire(&self, schedule_id: &str) -> Result<FireOutcome> {
        let timer = match self.ctx.storage.get_schedule(schedule_id).await? {
            Some(RecurrenceSchedule {
                queue_job_id: Some(timer),
                ..
            }) => timer,
            _ => return Ok(FireOutcome::Ignored),
        };
        self.fire_timer(schedule_id, &timer).await
    }

    /// Handle the firing of timer job `timer_job_id`.
    ///
    /// A timer that is no longer the schedule's armed one is ignored.
    #[instrument(skip_all, fields(schedule_id = %schedule_id, timer = %timer_job_id))]
    pub async fn fire_timer(&self, schedule_id: &str, timer_job_id: &str) -> Result<FireOutcome> {
        let Some(schedule) = self.ctx.storage.get_schedule(schedule_id).await? else {
            warn!("timer fired for a deleted schedule");
            return Ok(FireOutcome::Ignored);
        };
        if schedule.status != ScheduleStatus::Active {
            info!(status = %schedule.status, "timer fired for an inactive schedule");
            return Ok(FireOutcome::Ignored);
        }
        if schedule.queue_job_id.as_deref() != Some(timer_job_id) {
            info!("stale timer fired");
            return Ok(FireOutcome::Ignored);
        }

        let remaining = schedule.remaining_generations.map(|r| r - 1);
        let next = schedule
            .interval()
            .filter(|_| remaining.is_none_or(|r| r > 0))
            .map(|interval| (new_id(), Utc::now() + interval));
        let status = if next.is_some() {
            ScheduleStatus::Active
        } else {
            ScheduleStatus::Exhausted
        };
        let next_job_id = next.as_ref().map(|(id, _)| id.as_str());

        if !self
            .ctx
            .storage
            .advance_schedule_timer(&schedule.id, timer_job_id, next_job_id, remaining, status)
            .await?
        {
            info!("schedule changed while firing");
            return Ok(FireOutcome::Ignored);
        }

        // The firing timer is already running when the worker calls this; an
        // out-of-band firing leaves it queued.
        if let Err(e) = self.ctx.queue.cancel(timer_job_id).await {
            warn!(error = %e, "could not disarm fired timer");
        }

        let run = match self
            .ctx
            .orchestrator()
            .enqueue_builder_run(&schedule.builder_id, Some(&schedule.id))
            .await
        {
            Ok(run) => run,
            Err(e) => {
                self.retry_later(&schedule, next_job_id, &e).await;
                return Err(e);
            }
        };

        let Some((next_job_id, at)) = next else {
            info!("schedule exhausted");
            return Ok(FireOutcome::Exhausted { run });
        };
        if let Err(e) = self.arm(&schedule.id, &next_job_id, at).await {
            let message = format!("could not arm next timer: {e}");
            error!(error = %e, "schedule stopped");
            self.record_failure(
                &schedule.id,
                Some(&next_job_id),
                None,
                remaining,
                ScheduleStatus::Cancelled,
                &message,
            )
            .await;
            return Err(e);
        }
        info!(next_job = %next_job_id, remaining = ?remaining, "schedule re-armed");
        Ok(FireOutcome::Rearmed {
            run,
            next_job_id,
            remaining_generations: remaining,
        })
    }

    /// Give back the generation of a firing whose run was never enqueued and
    /// arm a retry. If even that fails the schedule is stopped, with the
    /// reason kept on the schedule.
    async fn retry_later(
        &self,
        schedule: &RecurrenceSchedule,
        claimed_job_id: Option<&str>,
        cause: &WikiSelectError,
    ) {
        let retry_job_id = new_id();
        let message = format!("could not enqueue run: {cause}");
        error!(error = %cause, retry_in_secs = FIRE_RETRY_DELAY_SECS, "firing failed");
        if !self
            .record_failure(
                &schedule.id,
                claimed_job_id,
                Some(&retry_job_id),
                schedule.remaining_generations,
                ScheduleStatus::Active,
                &message,
            )
            .await
        {
            return;
        }

        let at = Utc::now() + Duration::seconds(FIRE_RETRY_DELAY_SECS);
        if let Err(e) = self.arm(&schedule.id, &retry_job_id, at).await {
            error!(error = %e, "schedule stopped");
            self.record_failure(
                &schedule.id,
                Some(&retry_job_id),
                None,
                schedule.remaining_generations,
                ScheduleStatus::Cancelled,
                &format!("{message}; could not arm retry: {e}"),
            )
            .await;
        }
    }

    async fn record_failure(
        &self,
        schedule_id: &str,
        expected_job_id: Option<&str>,
        queue_job_id: Option<&str>,
        remaining_generations: Option<i64>,
        status: ScheduleStatus,
        message: &str,
    ) -> bool {
        match self
            .ctx
            .storage
            .record_schedule_failure(
                schedule_id,
                expected_job_id,
                queue_job_id,
                remaining_generations,
                status,
                message,
            )
            .await
        {
            Ok(recorded) => recorded,
            Err(e) => {
                error!(schedule_id, error = %e, "could not record firing failure");
                false
            }
        }
    }

    /// Stop a schedule and disarm its timer.
    #[instrument(skip_all, fields(actor = %actor, schedule_id = %schedule_id))]
    pub async fn cancel(&self, actor: &str, schedule_id: &str) -> Result<RecurrenceSchedule> {
        let schedule = self.owned_schedule(actor, schedule_id).await?;
        if let Some(job_id) = &schedule.queue_job_id {
            self.ctx.queue.cancel(job_id).await?;
        }
        self.ctx
            .storage
            .update_schedule_timer(
                &schedule.id,
                None,
                schedule.remaining_generations,
                ScheduleStatus::Cancelled,
            )
            .await?;
        info!("schedule cancelled");
        self.get(schedule_id).await
    }

    /// Confirm a notification address. Tokens are single-use.
    pub async fn confirm_email(&self, token: &str) -> Result<RecurrenceSchedule> {
        let schedule = self.ctx.storage.confirm_schedule_email(token).await?;
        info!(schedule_id = %schedule.id, "notification address confirmed");
        Ok(schedule)
    }

    /// Drop the notification address behind `token`.
    pub async fn unsubscribe_by_token(&self, token: &str) -> Result<RecurrenceSchedule> {
        let schedule = self
            .ctx
            .storage
            .find_schedule_by_unsubscribe_token(token)
            .await?
            .ok_or_else(|| WikiSelectError::not_found("unsubscribe token"))?;
        self.ctx.storage.clear_schedule_email(&schedule.id).await?;
        info!(schedule_id = %schedule.id, "notification address removed");
        self.get(&schedule.id).await
    }

    pub async fn unsubscribe(&self, actor: &str, schedule_id: &str) -> Result<RecurrenceSchedule> {
        let schedule = self.owned_schedule(actor, schedule_id).await?;
        self.ctx.storage.clear_schedule_email(&schedule.id).await?;
        self.get(schedule_id).await
    }

    pub async fn get(&self, schedule_id: &str) -> Result<RecurrenceSchedule> {
        self.ctx
            .storage
            .get_schedule(schedule_id)
            .await?
            .ok_or_else(|| WikiSelectError::not_found(format!("schedule {schedule_id}")))
    }

    pub async fn list(&self, builder_id: &str) -> Result<Vec<RecurrenceSchedule>> {
        self.ctx.storage.list_schedules(builder_id).await
    }

    async fn owned_schedule(&self, actor: &str, schedule_id: &str) -> Result<RecurrenceSchedule> {
        let schedule = self.get(schedule_id).await?;
        owned_builder(&self.ctx.storage, actor, &schedule.builder_id).await?;
        Ok(schedule)
    }

    async fn arm(&self, schedule_id: &str, job_id: &str, at: DateTime<Utc>) -> Result<()> {
        let payload = JobPayload::FireSchedule {
            schedule_id: schedule_id.to_string(),
        };
        self.ctx
            .queue
            .enqueue(payload.to_job()?.with_id(job_id).run_at(at))
            .await?;
        Ok(())
    }
}

fn validate(params: &NewSchedule) -> Result<()> {
    let mut errors = Vec::new();
    if matches!(params.interval_secs, Some(secs) if secs <= 0) {
        errors.push("interval must be positive");
    }
    if matches!(params.remaining_generations, Some(n) if n < 1) {
        errors.push("remaining generations must be at least 1");
    }
    if let Some(email) = params.email.as_deref().map(str::trim) {
        if !email.is_empty() && !email.contains('@') {
            errors.push("email address is invalid");
        }
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(WikiSelectError::validation(errors.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use serde_json::json;
    use wikiselect_shared::{EmailState, Environment, JobStatus};

    #[tokio::test]
    async fn create_arms_a_timer_and_asks_for_confirmation() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let mut params = schedule_params(Some(3600), Some(3));
        params.email = Some("alice@example.org".into());

        let schedule = harness
            .ctx
            .scheduler()
            .create_schedule("alice", &builder.id, params)
            .await
            .unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Active);
        assert_eq!(schedule.title, "Physics articles");
        assert_eq!(schedule.email_state(), EmailState::PendingConfirmation);

        let timer = harness
            .ctx
            .storage
            .get_job(schedule.queue_job_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(timer.queue, crate::jobs::SCHEDULE_QUEUE);

        let sent = harness.mailer.sent();
        assert_eq!(sent.len(), 1);
        let token = schedule.email_confirmation_token.unwrap();
        assert!(sent[0].body.contains(&token));
    }

    #[tokio::test]
    async fn invalid_parameters_are_rejected() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let scheduler = harness.ctx.scheduler();

        let err = scheduler
            .create_schedule("alice", &builder.id, schedule_params(Some(0), Some(0)))
            .await
            .unwrap_err();
        assert!(matches!(err, WikiSelectError::Validation { .. }));
        assert!(err.to_string().contains("interval"));
        assert!(err.to_string().contains("generations"));

        let err = scheduler
            .create_schedule("bob", &builder.id, schedule_params(None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, WikiSelectError::Authorization { .. }));
        assert!(scheduler.list(&builder.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn budget_runs_out_after_the_last_firing() {
        let harness = Harness::with_environment(Environment::Development).await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let scheduler = harness.ctx.scheduler();
        let schedule = scheduler
            .create_schedule("alice", &builder.id, schedule_params(Some(60), Some(2)))
            .await
            .unwrap();
        let first_timer = schedule.queue_job_id.clone().unwrap();

        let outcome = scheduler.fire(&schedule.id).await.unwrap();
        let FireOutcome::Rearmed {
            next_job_id,
            remaining_generations,
            ..
        } = outcome
        else {
            panic!("expected re-arm, got {outcome:?}");
        };
        assert_eq!(remaining_generations, Some(1));
        assert_eq!(
            harness.ctx.queue.status(&first_timer).await.unwrap(),
            Some(JobStatus::Canceled)
        );
        assert_eq!(
            harness.ctx.queue.status(&next_job_id).await.unwrap(),
            Some(JobStatus::Scheduled)
        );

        let outcome = scheduler.fire(&schedule.id).await.unwrap();
        assert!(matches!(outcome, FireOutcome::Exhausted { .. }));
        assert_eq!(
            harness.ctx.queue.status(&next_job_id).await.unwrap(),
            Some(JobStatus::Canceled)
        );

        let schedule = scheduler.get(&schedule.id).await.unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Exhausted);
        assert_eq!(schedule.remaining_generations, Some(0));
        assert!(schedule.queue_job_id.is_none());

        assert_eq!(scheduler.fire(&schedule.id).await.unwrap(), FireOutcome::Ignored);
        let materializations = harness
            .ctx
            .storage
            .list_jobs(Some(crate::jobs::MATERIALIZE_QUEUE))
            .await
            .unwrap();
        assert_eq!(materializations.len(), 2);
    }

    #[tokio::test]
    async fn unlimited_schedule_keeps_rearming() {
        let harness = Harness::with_environment(Environment::Development).await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let scheduler = harness.ctx.scheduler();
        let schedule = scheduler
            .create_schedule("alice", &builder.id, schedule_params(Some(60), None))
            .await
            .unwrap();

        for _ in 0..3 {
            let outcome = scheduler.fire(&schedule.id).await.unwrap();
            assert!(matches!(
                outcome,
                FireOutcome::Rearmed {
                    remaining_generations: None,
                    ..
                }
            ));
        }
        assert_eq!(
            scheduler.get(&schedule.id).await.unwrap().status,
            ScheduleStatus::Active
        );
    }

    #[tokio::test]
    async fn one_shot_schedule_fires_once() {
        let harness = Harness::with_environment(Environment::Development).await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let scheduler = harness.ctx.scheduler();
        let schedule = scheduler
            .create_schedule("alice", &builder.id, schedule_params(None, None))
            .await
            .unwrap();

        let outcome = scheduler.fire(&schedule.id).await.unwrap();
        assert!(matches!(outcome, FireOutcome::Exhausted { .. }));
    }

    #[tokio::test]
    async fn cancel_disarms_timer() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let scheduler = harness.ctx.scheduler();
        let schedule = scheduler
            .create_schedule("alice", &builder.id, schedule_params(Some(60), None))
            .await
            .unwrap();
        let timer = schedule.queue_job_id.clone().unwrap();

        let err = scheduler.cancel("bob", &schedule.id).await.unwrap_err();
        assert!(matches!(err, WikiSelectError::Authorization { .. }));

        let cancelled = scheduler.cancel("alice", &schedule.id).await.unwrap();
        assert_eq!(cancelled.status, ScheduleStatus::Cancelled);
        assert_eq!(
            harness.ctx.queue.status(&timer).await.unwrap(),
            Some(JobStatus::Canceled)
        );
        assert_eq!(scheduler.fire(&schedule.id).await.unwrap(), FireOutcome::Ignored);
    }

    #[tokio::test]
    async fn confirmation_token_works_once_and_unsubscribe_clears_email() {
        let harness = Harness::new().await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let scheduler = harness.ctx.scheduler();
        let mut params = schedule_params(None, Some(1));
        params.email = Some("alice@example.org".into());
        let schedule = scheduler
            .create_schedule("alice", &builder.id, params)
            .await
            .unwrap();
        let token = schedule.email_confirmation_token.clone().unwrap();

        let unsubscribe = schedule.unsubscribe_token.clone().unwrap();
        assert_ne!(token, unsubscribe);

        let confirmed = scheduler.confirm_email(&token).await.unwrap();
        assert_eq!(confirmed.email_state(), EmailState::Confirmed);
        assert!(confirmed.email_confirmation_token.is_none());
        let err = scheduler.confirm_email(&token).await.unwrap_err();
        assert!(matches!(err, WikiSelectError::NotFound { .. }));

        // A spent confirmation token is not an unsubscribe credential.
        let err = scheduler.unsubscribe_by_token(&token).await.unwrap_err();
        assert!(matches!(err, WikiSelectError::NotFound { .. }));
        assert_eq!(
            scheduler.get(&schedule.id).await.unwrap().email_state(),
            EmailState::Confirmed
        );

        let cleared = scheduler.unsubscribe_by_token(&unsubscribe).await.unwrap();
        assert_eq!(cleared.email_state(), EmailState::None);
        let err = scheduler.unsubscribe_by_token(&unsubscribe).await.unwrap_err();
        assert!(matches!(err, WikiSelectError::NotFound { .. }));
    }

    #[tokio::test]
    async fn stale_timer_does_not_spend_a_generation() {
        let harness = Harness::with_environment(Environment::Development).await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let scheduler = harness.ctx.scheduler();
        let schedule = scheduler
            .create_schedule("alice", &builder.id, schedule_params(Some(60), Some(3)))
            .await
            .unwrap();
        let timer = schedule.queue_job_id.clone().unwrap();

        let first = scheduler.fire_timer(&schedule.id, &timer).await.unwrap();
        assert!(matches!(first, FireOutcome::Rearmed { .. }));
        // A second firing that read the same timer loses.
        let second = scheduler.fire_timer(&schedule.id, &timer).await.unwrap();
        assert_eq!(second, FireOutcome::Ignored);

        let schedule = scheduler.get(&schedule.id).await.unwrap();
        assert_eq!(schedule.remaining_generations, Some(2));
        let materializations = harness
            .ctx
            .storage
            .list_jobs(Some(crate::jobs::MATERIALIZE_QUEUE))
            .await
            .unwrap();
        assert_eq!(materializations.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_firings_keep_budget_and_timer_consistent() {
        let harness = Harness::with_environment(Environment::Development).await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let scheduler = harness.ctx.scheduler();
        let schedule = scheduler
            .create_schedule("alice", &builder.id, schedule_params(Some(60), Some(5)))
            .await
            .unwrap();

        let (a, b) = tokio::join!(scheduler.fire(&schedule.id), scheduler.fire(&schedule.id));
        let runs = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|outcome| outcome.run().is_some())
            .count() as i64;
        assert!(runs >= 1);

        let schedule = scheduler.get(&schedule.id).await.unwrap();
        assert_eq!(schedule.remaining_generations, Some(5 - runs));
        let materializations = harness
            .ctx
            .storage
            .list_jobs(Some(crate::jobs::MATERIALIZE_QUEUE))
            .await
            .unwrap();
        assert_eq!(materializations.len() as i64, runs);

        let live_timers: Vec<_> = harness
            .ctx
            .storage
            .list_jobs(Some(crate::jobs::SCHEDULE_QUEUE))
            .await
            .unwrap()
            .into_iter()
            .filter(|job| matches!(job.status, JobStatus::Scheduled | JobStatus::Queued))
            .collect();
        assert_eq!(live_timers.len(), 1);
        assert_eq!(schedule.queue_job_id.as_deref(), Some(live_timers[0].id.as_str()));
    }

    #[tokio::test]
    async fn failed_enqueue_rearms_a_retry_and_keeps_the_generation() {
        let mut harness = Harness::with_environment(Environment::Development).await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let schedule = harness
            .ctx
            .scheduler()
            .create_schedule("alice", &builder.id, schedule_params(Some(3600), Some(2)))
            .await
            .unwrap();
        let timer = schedule.queue_job_id.clone().unwrap();
        harness.fail_enqueues(&[crate::jobs::MATERIALIZE_QUEUE]);

        let scheduler = harness.ctx.scheduler();
        let err = scheduler.fire(&schedule.id).await.unwrap_err();
        assert!(err.to_string().contains("broker unavailable"));

        let schedule = scheduler.get(&schedule.id).await.unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Active);
        assert_eq!(schedule.remaining_generations, Some(2));
        assert!(
            schedule
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("broker unavailable"))
        );
        let retry = schedule.queue_job_id.clone().unwrap();
        assert_ne!(retry, timer);
        assert_eq!(
            harness.ctx.queue.status(&retry).await.unwrap(),
            Some(JobStatus::Scheduled)
        );
    }

    #[tokio::test]
    async fn schedule_is_stopped_when_no_retry_can_be_armed() {
        let mut harness = Harness::with_environment(Environment::Development).await;
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let schedule = harness
            .ctx
            .scheduler()
            .create_schedule("alice", &builder.id, schedule_params(Some(3600), None))
            .await
            .unwrap();
        harness.fail_enqueues(&[crate::jobs::MATERIALIZE_QUEUE, crate::jobs::SCHEDULE_QUEUE]);

        let scheduler = harness.ctx.scheduler();
        assert!(scheduler.fire(&schedule.id).await.is_err());

        let schedule = scheduler.get(&schedule.id).await.unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Cancelled);
        assert!(schedule.queue_job_id.is_none());
        assert!(
            schedule
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("could not arm retry"))
        );
    }

    #[tokio::test]
    async fn failed_confirmation_mail_does_not_fail_creation() {
        let harness = Harness::new().await;
        harness.mailer.fail_sends();
        let builder = harness.builder("alice", json!({"list": ["Photon"]})).await;
        let mut params = schedule_params(None, Some(1));
        params.email = Some("alice@example.org".into());

        let schedule = harness
            .ctx
            .scheduler()
            .create_schedule("alice", &builder.id, params)
            .await
            .unwrap();
        assert_eq!(schedule.status, ScheduleStatus::Active);
        assert!(harness.mailer.sent().is_empty());
    }
}
