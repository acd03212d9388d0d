//! Human check before expensive actions: pick the heart shown, with a short
//! lockout after repeated misses.

use crate::store::{self, KeyValueStore, CAPTCHA_KEY};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use clap::ValueEnum;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

pub const MAX_FAILURES: u32 = 3;
pub const LOCKOUT_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Heart {
    Red,
    Sparkling,
    Ribbon,
    Two,
    Growing,
    Beating,
}

impl Heart {
    pub const ALL: [Heart; 6] =
        [Heart::Red, Heart::Sparkling, Heart::Ribbon, Heart::Two, Heart::Growing, Heart::Beating];

    pub fn emoji(&self) -> &'static str {
        match self {
            Heart::Red => "❤️",
            Heart::Sparkling => "💖",
            Heart::Ribbon => "💝",
            Heart::Two => "💕",
            Heart::Growing => "💗",
            Heart::Beating => "💓",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Heart::Red => "Red Heart",
            Heart::Sparkling => "Sparkling Heart",
            Heart::Ribbon => "Heart with Ribbon",
            Heart::Two => "Two Hearts",
            Heart::Growing => "Growing Heart",
            Heart::Beating => "Beating Heart",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartChallenge {
    target: Heart,
}

impl HeartChallenge {
    pub fn random() -> Self {
        let target = Heart::ALL.choose(&mut rand::thread_rng()).copied().unwrap_or(Heart::Red);
        Self { target }
    }

    pub fn target(&self) -> Heart {
        self.target
    }

    pub fn check(&self, choice: Heart) -> bool {
        choice == self.target
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleStatus {
    Open { attempts_left: u32 },
    Locked { remaining_secs: i64 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct AttemptState {
    count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_attempt_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timeout_until: Option<i64>,
}

/// Persisted failure counter shared by every verification prompt.
pub struct VerificationThrottle {
    store: Arc<dyn KeyValueStore>,
}

impl VerificationThrottle {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn status(&self, now: DateTime<Utc>) -> Result<ThrottleStatus> {
        let state = self.current(now)?;
        Ok(status_of(&state, now))
    }

    /// Applies one attempt. A locked throttle ignores it.
    pub fn record(&self, passed: bool, now: DateTime<Utc>) -> Result<ThrottleStatus> {
        let mut state = self.current(now)?;
        if let ThrottleStatus::Locked { .. } = status_of(&state, now) {
            return Ok(status_of(&state, now));
        }
        if passed {
            state = AttemptState::default();
        } else {
            state.count += 1;
            state.last_attempt_time = Some(now.timestamp_millis());
            if state.count >= MAX_FAILURES {
                let until = now + Duration::seconds(LOCKOUT_SECS);
                state.timeout_until = Some(until.timestamp_millis());
                warn!("verification locked for {LOCKOUT_SECS}s after {} misses", state.count);
            }
        }
        store::write_json(self.store.as_ref(), CAPTCHA_KEY, &state)?;
        Ok(status_of(&state, now))
    }

    // An expired lock reads as a fresh start.
    fn current(&self, now: DateTime<Utc>) -> Result<AttemptState> {
        let state = match store::read_json::<AttemptState>(self.store.as_ref(), CAPTCHA_KEY) {
            Ok(state) => state.unwrap_or_default(),
            Err(err) => {
                debug!("ignoring unreadable verification state: {err:#}");
                AttemptState::default()
            }
        };
        match state.timeout_until {
            Some(until) if until <= now.timestamp_millis() => {
                let fresh = AttemptState::default();
                store::write_json(self.store.as_ref(), CAPTCHA_KEY, &fresh)?;
                Ok(fresh)
            }
            _ => Ok(state),
        }
    }
}

fn status_of(state: &AttemptState, now: DateTime<Utc>) -> ThrottleStatus {
    match state.timeout_until {
        Some(until) if until > now.timestamp_millis() => {
            let remaining_ms = until - now.timestamp_millis();
            ThrottleStatus::Locked { remaining_secs: (remaining_ms + 999) / 1000 }
        }
        _ => ThrottleStatus::Open { attempts_left: MAX_FAILURES.saturating_sub(state.count) },
    }
}
