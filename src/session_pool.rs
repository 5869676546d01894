//! `SessionPool`: a bounded, persistable pool of `Session` identities served
//! fairly while filtering out unusable ones, mirroring the way the teacher's
//! browser pool tracks a fixed set of instances and rotates through them.

use crate::config::SessionPoolConfig;
use crate::error::CrawlError;
use crate::events::{CrawlEvent, EventBus};
use crate::session::{Session, SessionState};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionPoolState {
    pub sessions: Vec<SessionState>,
}

pub struct SessionPool {
    config: SessionPoolConfig,
    sessions: Arc<Mutex<Vec<Session>>>,
    events: EventBus,
}

impl SessionPool {
    pub fn new(config: SessionPoolConfig, events: EventBus) -> Self {
        Self {
            config,
            sessions: Arc::new(Mutex::new(Vec::new())),
            events,
        }
    }

    /// Loads persisted state (if supplied) and otherwise starts with an
    /// empty pool; sessions are created lazily on first `get_session`.
    pub async fn initialize(&self, state: Option<SessionPoolState>) {
        if let Some(state) = state {
            let mut sessions = self.sessions.lock().await;
            *sessions = state.sessions.into_iter().map(Session::from_state).collect();
            info!("Session pool restored {} sessions from persisted state", sessions.len());
        }
    }

    /// Returns an existing usable session chosen uniformly at random; if
    /// none exists and the pool isn't full, creates a fresh one; if the pool
    /// is full and none are usable, retires the oldest slot and replaces it.
    pub async fn get_session(&self) -> Result<Session, CrawlError> {
        let mut sessions = self.sessions.lock().await;

        let usable_indices: Vec<usize> = sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_usable())
            .map(|(i, _)| i)
            .collect();

        if let Some(&idx) = usable_indices.choose(&mut rand::thread_rng()) {
            return Ok(sessions[idx].clone_for_use());
        }

        if sessions.len() < self.config.max_pool_size {
            let session = Session::new(&self.config);
            sessions.push(session.clone_for_use());
            return Ok(sessions.last().unwrap().clone_for_use());
        }

        // Pool full and nothing usable: retire the oldest slot and replace it.
        if let Some((idx, _)) = sessions
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.created_at)
        {
            let retiring_id = sessions[idx].id.clone();
            let fresh = Session::new(&self.config);
            sessions[idx] = fresh.clone_for_use();
            self.events.publish(CrawlEvent::SessionRetired { session_id: retiring_id });
            warn!("Session pool full with no usable session; retired oldest slot");
            return Ok(sessions[idx].clone_for_use());
        }

        Err(CrawlError::ResourceExhausted("session pool exhausted".to_string()))
    }

    /// Inserts an externally-constructed session, respecting `max_pool_size`.
    pub async fn add_session(&self, session: Session) -> Result<(), CrawlError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.len() >= self.config.max_pool_size {
            return Err(CrawlError::ResourceExhausted("session pool at capacity".to_string()));
        }
        sessions.push(session);
        Ok(())
    }

    pub async fn mark_good(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) {
            session.mark_good();
        }
    }

    pub async fn mark_bad(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.iter_mut().find(|s| s.id == session_id) {
            session.mark_bad();
        }
    }

    /// Removes a session from the pool immediately and emits `SESSION_RETIRED`.
    pub async fn retire(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(pos) = sessions.iter().position(|s| s.id == session_id) {
            sessions.remove(pos);
            self.events.publish(CrawlEvent::SessionRetired { session_id: session_id.to_string() });
        }
    }

    pub async fn get_state(&self) -> SessionPoolState {
        let sessions = self.sessions.lock().await;
        SessionPoolState {
            sessions: sessions.iter().map(Session::to_state).collect(),
        }
    }

    pub async fn size(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn usable_count(&self) -> usize {
        self.sessions.lock().await.iter().filter(|s| s.is_usable()).count()
    }

    pub async fn teardown(&self) {
        self.sessions.lock().await.clear();
    }
}

impl Session {
    /// Cheap clone used when handing a session out for use; the pool
    /// retains the authoritative copy and reconciles it back via
    /// `mark_good`/`mark_bad`/`retire` keyed by `id`.
    fn clone_for_use(&self) -> Session {
        self.clone()
    }
}
