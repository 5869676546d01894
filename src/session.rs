//! `Session`: an identity — cookie jar plus error score — reused across
//! requests to spread load and isolate block/ban signals.

use crate::config::SessionPoolConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// JSON-friendly mirror of a Session, used for the SessionPool state blob.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionState {
    pub id: String,
    pub cookies: HashMap<String, String>,
    pub user_data: serde_json::Value,
    pub created_at: u64,
    pub expires_at: u64,
    pub usage_count: usize,
    pub error_score: f64,
    pub max_error_score: f64,
    pub error_score_decrement: f64,
    pub max_usage_count: usize,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub cookies: HashMap<String, String>,
    pub user_data: serde_json::Value,
    pub created_at: u64,
    pub expires_at: u64,
    pub usage_count: usize,
    pub error_score: f64,
    pub max_error_score: f64,
    pub error_score_decrement: f64,
    pub max_usage_count: usize,
}

impl Session {
    pub fn new(config: &SessionPoolConfig) -> Self {
        let created_at = now_secs();
        Self {
            id: Uuid::new_v4().to_string(),
            cookies: HashMap::new(),
            user_data: serde_json::Value::Null,
            created_at,
            expires_at: created_at + config.session_max_age.as_secs(),
            usage_count: 0,
            error_score: 0.0,
            max_error_score: config.session_max_error_score,
            error_score_decrement: config.session_error_score_decrement,
            max_usage_count: config.session_max_usage_count,
        }
    }

    pub fn from_state(state: SessionState) -> Self {
        Self {
            id: state.id,
            cookies: state.cookies,
            user_data: state.user_data,
            created_at: state.created_at,
            expires_at: state.expires_at,
            usage_count: state.usage_count,
            error_score: state.error_score,
            max_error_score: state.max_error_score,
            error_score_decrement: state.error_score_decrement,
            max_usage_count: state.max_usage_count,
        }
    }

    pub fn to_state(&self) -> SessionState {
        SessionState {
            id: self.id.clone(),
            cookies: self.cookies.clone(),
            user_data: self.user_data.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            usage_count: self.usage_count,
            error_score: self.error_score,
            max_error_score: self.max_error_score,
            error_score_decrement: self.error_score_decrement,
            max_usage_count: self.max_usage_count,
        }
    }

    pub fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }

    pub fn is_max_usage_reached(&self) -> bool {
        self.usage_count >= self.max_usage_count
    }

    pub fn is_blocked(&self) -> bool {
        self.error_score >= self.max_error_score
    }

    pub fn is_usable(&self) -> bool {
        !self.is_expired() && !self.is_blocked() && !self.is_max_usage_reached()
    }

    /// Records a successful use: decrements `errorScore` (floored at 0) and
    /// increments `usageCount`.
    pub fn mark_good(&mut self) {
        self.error_score = (self.error_score - self.error_score_decrement).max(0.0);
        self.usage_count += 1;
    }

    /// Records a failed use: increments both `errorScore` and `usageCount`.
    pub fn mark_bad(&mut self) {
        self.error_score += 1.0;
        self.usage_count += 1;
    }

    pub fn remaining_lifetime(&self) -> Duration {
        let now = now_secs();
        if self.expires_at > now {
            Duration::from_secs(self.expires_at - now)
        } else {
            Duration::from_secs(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionPoolConfig {
        SessionPoolConfig {
            max_pool_size: 10,
            persist_state_key: None,
            session_max_age: Duration::from_secs(3600),
            session_max_error_score: 3.0,
            session_error_score_decrement: 0.5,
            session_max_usage_count: 5,
        }
    }

    #[test]
    fn test_fresh_session_is_usable() {
        let session = Session::new(&config());
        assert!(session.is_usable());
    }

    #[test]
    fn test_mark_bad_blocks_after_threshold() {
        let mut session = Session::new(&config());
        for _ in 0..3 {
            session.mark_bad();
        }
        assert!(session.is_blocked());
        assert!(!session.is_usable());
    }

    #[test]
    fn test_mark_good_floors_at_zero() {
        let mut session = Session::new(&config());
        session.mark_good();
        assert_eq!(session.error_score, 0.0);
    }

    #[test]
    fn test_max_usage_reached() {
        let mut session = Session::new(&config());
        for _ in 0..5 {
            session.mark_good();
        }
        assert!(session.is_max_usage_reached());
        assert!(!session.is_usable());
    }

    #[test]
    fn test_usability_predicate_matches_invariant_8() {
        let mut session = Session::new(&config());
        assert_eq!(
            session.is_usable(),
            !session.is_expired() && !session.is_blocked() && !session.is_max_usage_reached()
        );
        session.mark_bad();
        session.mark_bad();
        session.mark_bad();
        assert_eq!(
            session.is_usable(),
            !session.is_expired() && !session.is_blocked() && !session.is_max_usage_reached()
        );
    }

    #[test]
    fn test_round_trip_state_preserves_scores() {
        let mut session = Session::new(&config());
        session.mark_bad();
        session.mark_good();
        let state = session.to_state();
        let restored = Session::from_state(state);
        assert_eq!(restored.usage_count, session.usage_count);
        assert!((restored.error_score - session.error_score).abs() < f64::EPSILON);
    }
}
