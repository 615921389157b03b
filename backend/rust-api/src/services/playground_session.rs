use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::metrics::record_superseded_result;
use crate::models::playground::{DisplayState, InFlightResult, InFlightStatus};
use crate::models::submission::Submission;
use crate::models::Exercise;

use super::reconciler::{
    find_record, resolve_display_state, GradingError, GradingOutcome, SessionReconciler,
};

const SESSION_IDLE_TTL: Duration = Duration::from_secs(60 * 60);

/// Identifies one grading request. Only the newest ticket may touch the
/// in-flight slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradingTicket {
    pub id: u64,
    pub exercise: Exercise,
    pub code: String,
}

/// What one user currently sees in the playground.
#[derive(Debug)]
pub struct PlaygroundSession {
    user_id: String,
    exercise: Exercise,
    buffer: String,
    submissions: Option<Vec<Submission>>,
    initialised: bool,
    in_flight: Option<(u64, InFlightResult)>,
    next_ticket: u64,
}

impl PlaygroundSession {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            exercise: Exercise::default(),
            buffer: String::new(),
            submissions: None,
            initialised: false,
            in_flight: None,
            next_ticket: 0,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn exercise(&self) -> Exercise {
        self.exercise
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn needs_reload(&self) -> bool {
        self.submissions.is_none()
    }

    /// Installs a fresh read of the user's records. The editor is seeded from
    /// the persisted code only the first time; later reloads keep whatever the
    /// user has typed.
    pub fn load(&mut self, submissions: Vec<Submission>) {
        if !self.initialised {
            self.buffer = self.persisted_code(&submissions, self.exercise);
            self.initialised = true;
        }
        self.submissions = Some(submissions);
    }

    pub fn invalidate(&mut self) {
        self.submissions = None;
    }

    pub fn select_exercise(&mut self, exercise: Exercise) {
        if matches!(&self.in_flight, Some((_, r)) if r.exercise != exercise) {
            tracing::debug!(
                "Dropping in-flight result: user={}, from={}, to={}",
                self.user_id,
                self.exercise,
                exercise
            );
            self.in_flight = None;
        }
        self.exercise = exercise;
        self.buffer = self
            .submissions
            .as_deref()
            .map(|subs| self.persisted_code(subs, exercise))
            .unwrap_or_default();
    }

    pub fn set_buffer(&mut self, code: impl Into<String>) {
        self.buffer = code.into();
    }

    pub fn begin_grading(&mut self) -> GradingTicket {
        self.next_ticket += 1;
        let ticket = GradingTicket {
            id: self.next_ticket,
            exercise: self.exercise,
            code: self.buffer.clone(),
        };
        self.in_flight = Some((
            ticket.id,
            InFlightResult {
                exercise: ticket.exercise,
                code: ticket.code.clone(),
                feedback: String::new(),
                status: InFlightStatus::Streaming,
            },
        ));
        ticket
    }

    pub fn is_current(&self, ticket: &GradingTicket) -> bool {
        matches!(&self.in_flight, Some((id, _)) if *id == ticket.id)
    }

    pub fn apply_chunk(&mut self, ticket: &GradingTicket, chunk: &str) {
        if let Some((id, result)) = self.in_flight.as_mut() {
            if *id == ticket.id {
                result.feedback.push_str(chunk);
            }
        }
    }

    pub fn finish(&mut self, ticket: &GradingTicket, result: &Result<GradingOutcome, GradingError>) {
        let current = self.is_current(ticket);
        match result {
            Ok(outcome) if current => self.remember(outcome.submission.clone()),
            // A reset may have deleted the record since it was written
            Ok(_) => self.invalidate(),
            Err(e) if e.invalidates_cache() => self.invalidate(),
            Err(_) => {}
        }

        if !current {
            record_superseded_result();
            tracing::debug!(
                "Discarding superseded grading result: user={}, ticket={}, exercise={}",
                self.user_id,
                ticket.id,
                ticket.exercise
            );
            return;
        }

        let settled = match result {
            Ok(outcome) => Some((outcome.feedback.clone(), outcome.passed)),
            Err(e) => e.feedback().map(|(text, passed)| (text.to_string(), passed)),
        };

        match settled {
            Some((feedback, passed)) => {
                if let Some((_, slot)) = self.in_flight.as_mut() {
                    slot.feedback = feedback;
                    slot.status = InFlightStatus::Completed { passed };
                }
            }
            // Nothing worth keeping on screen; fall back to the stored record
            None => self.in_flight = None,
        }
    }

    /// Drops the cached record and any in-flight output for `exercise`.
    pub fn forget(&mut self, exercise: Exercise) {
        if let Some(subs) = self.submissions.as_mut() {
            subs.retain(|s| s.exercise != exercise);
        }
        if matches!(&self.in_flight, Some((_, r)) if r.exercise == exercise) {
            self.in_flight = None;
        }
        if self.exercise == exercise {
            self.buffer.clear();
        }
    }

    pub fn display(&self) -> DisplayState {
        let submissions = self.submissions.as_deref().unwrap_or_default();
        let mut state = resolve_display_state(
            submissions,
            self.exercise,
            &self.user_id,
            self.in_flight.as_ref().map(|(_, r)| r),
        );
        if !state.grading {
            state.code = self.buffer.clone();
        }
        state
    }

    fn remember(&mut self, submission: Submission) {
        let Some(subs) = self.submissions.as_mut() else {
            return;
        };
        match subs
            .iter_mut()
            .find(|s| s.id == submission.id || s.belongs_to(&submission.user_id, submission.exercise))
        {
            Some(existing) => *existing = submission,
            None => subs.push(submission),
        }
    }

    fn persisted_code(&self, submissions: &[Submission], exercise: Exercise) -> String {
        find_record(submissions, exercise, &self.user_id)
            .map(|s| s.submission.clone())
            .unwrap_or_default()
    }
}

pub type SessionHandle = Arc<Mutex<PlaygroundSession>>;

/// Registry of per-user sessions held by `AppState`.
#[derive(Default)]
pub struct PlaygroundSessions {
    sessions: Mutex<HashMap<String, (SessionHandle, Instant)>>,
}

impl PlaygroundSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, user_id: &str) -> SessionHandle {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        sessions.retain(|_, (handle, seen)| {
            now.duration_since(*seen) < SESSION_IDLE_TTL || Arc::strong_count(handle) > 1
        });

        let entry = sessions
            .entry(user_id.to_string())
            .or_insert_with(|| (Arc::new(Mutex::new(PlaygroundSession::new(user_id))), now));
        entry.1 = now;
        entry.0.clone()
    }

    /// Returns the user's session with a usable record list, re-reading the
    /// store when the cache is missing or stale.
    pub async fn load(
        &self,
        reconciler: &SessionReconciler,
        user_id: &str,
    ) -> Result<SessionHandle, GradingError> {
        let handle = self.handle(user_id);
        if lock_session(&handle).needs_reload() {
            let submissions = reconciler.list(user_id).await?;
            lock_session(&handle).load(submissions);
        }
        Ok(handle)
    }

    /// Marks an existing session's record list stale after a write made
    /// outside the playground routes.
    pub fn invalidate(&self, user_id: &str) {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((handle, _)) = sessions.get(user_id) {
            lock_session(handle).invalidate();
        }
    }

    /// Drops an existing session's record and in-flight output for
    /// `exercise` after it was deleted outside the playground routes.
    pub fn forget(&self, user_id: &str, exercise: Exercise) {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((handle, _)) = sessions.get(user_id) {
            lock_session(handle).forget(exercise);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Session locks are never held across an await, so a poisoned lock only
/// means a panic mid-update; the state is still usable.
pub fn lock_session(handle: &SessionHandle) -> MutexGuard<'_, PlaygroundSession> {
    handle.lock().unwrap_or_else(|e| e.into_inner())
}
