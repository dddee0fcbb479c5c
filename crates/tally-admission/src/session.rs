//! Session registry and runtime monitors.
//!
//! Each running session gets a monitor task that re-reads the balance on a
//! fixed interval and whenever a transaction for the account is published,
//! then applies the continuation policy.

use crate::controller::{AdmissionController, AdmissionDecision, RuntimeVerdict};
use crate::estimate::{CostEstimate, ServiceProfile};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tally_core::events::{LedgerEvent, SessionStateChangedPayload};
use tally_core::ids::{AccountId, SessionId};
use tally_core::ports::{EventBus, EventStream};
use tally_core::session::SessionState;
use tally_core::{Error, Result};
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub account_id: AccountId,
    pub state: SessionState,
    pub profile: ServiceProfile,
    pub estimate: CostEstimate,
    /// Optional add-ons are off while degraded.
    pub add_ons_enabled: bool,
    pub degraded_by_user: bool,
    pub low_balance: bool,
    pub last_available: Option<i64>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of asking to open a session.
#[derive(Debug, Clone, Serialize)]
pub struct Opened {
    pub decision: AdmissionDecision,
    /// Present when admitted.
    pub session: Option<Session>,
}

pub struct SessionRegistry {
    controller: Arc<AdmissionController>,
    events: Option<Arc<dyn EventBus>>,
    sessions: RwLock<HashMap<SessionId, Session>>,
    monitors: std::sync::Mutex<HashMap<SessionId, watch::Sender<bool>>>,
}

impl SessionRegistry {
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self {
            controller,
            events: None,
            sessions: RwLock::new(HashMap::new()),
            monitors: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn controller(&self) -> &AdmissionController {
        &self.controller
    }

    /// Estimate and admit a session. Admitted sessions are registered in
    /// the `Admitted` state; denials register nothing.
    pub async fn open(
        &self,
        account: AccountId,
        profile: ServiceProfile,
        planned_minutes: u64,
    ) -> Result<Opened> {
        self.prune(self.controller.config().session_retention()).await;
        let estimate = self.controller.estimate(&profile, planned_minutes)?;
        let decision = self.controller.admit(&account, &estimate).await?;
        if !decision.is_admitted() {
            return Ok(Opened {
                decision,
                session: None,
            });
        }

        let now = Utc::now();
        let session = Session {
            id: SessionId::new(),
            account_id: account,
            state: SessionState::NotStarted,
            profile,
            estimate,
            add_ons_enabled: true,
            degraded_by_user: false,
            low_balance: false,
            last_available: None,
            reason: None,
            created_at: now,
            updated_at: now,
        };
        let id = session.id;
        self.sessions.write().await.insert(id, session);
        let session = self
            .transition(id, SessionState::Admitted, None, |_| {})
            .await?;

        Ok(Opened {
            decision,
            session: Some(session),
        })
    }

    /// Move an admitted session to `Running` and start its monitor.
    pub async fn start(self: &Arc<Self>, id: SessionId) -> Result<Session> {
        let session = self
            .transition(id, SessionState::Running, None, |_| {})
            .await?;

        let (tx, rx) = watch::channel(false);
        self.monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        tokio::spawn(self.clone().monitor(id, session.account_id.clone(), rx));

        Ok(session)
    }

    /// The user chose to continue without add-ons. Never undone automatically.
    pub async fn degrade(&self, id: SessionId) -> Result<Session> {
        self.transition(
            id,
            SessionState::Degraded,
            Some("degraded at the user's request".to_string()),
            |s| {
                s.degraded_by_user = true;
                s.add_ons_enabled = false;
            },
        )
        .await
    }

    pub async fn complete(&self, id: SessionId) -> Result<Session> {
        self.transition(id, SessionState::Completed, None, |_| {}).await
    }

    pub async fn get(&self, id: SessionId) -> Result<Session> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::SessionNotFound(id))
    }

    pub async fn list_for(&self, account: &AccountId) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| &s.account_id == account)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Forget completed and terminated sessions last changed more than
    /// `retention` ago. Returns how many were dropped.
    pub async fn prune(&self, retention: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r))
        else {
            return 0;
        };
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !(s.state.is_terminal() && s.updated_at <= cutoff));
        let pruned = before - sessions.len();
        if pruned > 0 {
            debug!(pruned, "Pruned finished sessions");
        }
        pruned
    }

    /// Apply the continuation policy to a live session at `available`.
    pub async fn observe(&self, id: SessionId, available: i64) -> Result<Session> {
        let (verdict, current) = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&id).ok_or(Error::SessionNotFound(id))?;
            session.last_available = Some(available);
            let verdict = self.controller.evaluate(available, session.degraded_by_user);
            session.low_balance = matches!(verdict, RuntimeVerdict::Continue { low_balance: true });
            (verdict, session.clone())
        };

        if !current.state.is_live() {
            return Ok(current);
        }

        match verdict {
            RuntimeVerdict::Terminate => {
                let floor = -self.controller.config().emergency_buffer;
                self.transition(
                    id,
                    SessionState::Terminated,
                    Some(format!("balance {} fell below the hard floor {}", available, floor)),
                    |s| s.add_ons_enabled = false,
                )
                .await
            }
            RuntimeVerdict::Degrade { requested_by_user } if current.state == SessionState::Running => {
                let reason = if requested_by_user {
                    "degraded at the user's request"
                } else {
                    "running on the emergency buffer"
                };
                self.transition(id, SessionState::Degraded, Some(reason.to_string()), |s| {
                    s.add_ons_enabled = false
                })
                .await
            }
            RuntimeVerdict::Continue { low_balance: true } => {
                warn!(
                    session_id = %id,
                    account = %current.account_id,
                    available,
                    "Session running on a low balance"
                );
                Ok(current)
            }
            _ => Ok(current),
        }
    }

    async fn transition(
        &self,
        id: SessionId,
        to: SessionState,
        reason: Option<String>,
        edit: impl FnOnce(&mut Session),
    ) -> Result<Session> {
        let (from, snapshot) = {
            let mut sessions = self.sessions.write().await;
            let session = sessions.get_mut(&id).ok_or(Error::SessionNotFound(id))?;
            if !session.state.can_transition_to(to) {
                return Err(Error::InvalidSessionTransition {
                    from: session.state,
                    to,
                });
            }
            let from = session.state;
            session.state = to;
            session.reason = reason.clone();
            session.updated_at = Utc::now();
            edit(session);
            (from, session.clone())
        };

        info!(
            session_id = %id,
            account = %snapshot.account_id,
            from = ?from,
            to = ?to,
            "Session state changed"
        );

        if to.is_terminal() {
            self.stop_monitor(id);
        }

        if let Some(events) = &self.events {
            let event = LedgerEvent::SessionStateChanged(SessionStateChangedPayload {
                session_id: id,
                account_id: snapshot.account_id.clone(),
                from,
                state: to,
                reason,
                changed_at: snapshot.updated_at,
            });
            if let Err(e) = events.publish(event).await {
                warn!(session_id = %id, error = %e, "Failed to publish session event");
            }
        }

        Ok(snapshot)
    }

    fn stop_monitor(&self, id: SessionId) {
        if let Some(tx) = self
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
        {
            let _ = tx.send(true);
        }
    }

    async fn monitor(self: Arc<Self>, id: SessionId, account: AccountId, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.controller.config().poll_interval());
        let mut updates = match &self.events {
            Some(events) => events.subscribe().await.ok(),
            None => None,
        };
        debug!(session_id = %id, "Session monitor started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
                event = next_event(&mut updates) => match event {
                    Some(LedgerEvent::TransactionRecorded(p)) if p.account_id == account => {}
                    Some(_) => continue,
                    None => {
                        updates = None;
                        continue;
                    }
                },
            }

            let available = match self.controller.available(&account).await {
                Ok(available) => available,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Balance check failed; keeping session as is");
                    continue;
                }
            };

            match self.observe(id, available).await {
                Ok(session) if session.state.is_terminal() => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(session_id = %id, error = %e, "Session monitor stopping");
                    break;
                }
            }
        }

        debug!(session_id = %id, "Session monitor stopped");
    }
}

async fn next_event(updates: &mut Option<EventStream>) -> Option<LedgerEvent> {
    match updates {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
