// src/session.rs

use crate::config::RatingScale;
use crate::error::{Result, VqError};
use chrono::{DateTime, Local};
use log::{debug, info};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const MIN_SCORE: f64 = 0.0;
pub const MAX_SCORE: f64 = 10.0;

/// Stable trial identity: the distorted video's index in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(pub usize);

impl fmt::Display for TrialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0 + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Setup,
    Running,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub id: TrialId,
    pub distorted: PathBuf,
    pub presentation_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub trial_id: TrialId,
    pub score: f64,
    pub timestamp: DateTime<Local>,
}

/// One exported result row, joinable back to the distorted video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingRecord {
    pub trial_id: TrialId,
    pub distorted: PathBuf,
    pub presentation_index: usize,
    pub score: f64,
    pub timestamp: DateTime<Local>,
}

/// What the caller should do after a rating was recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Next(Trial),
    Complete,
}

/// Collects the inputs a session needs before it can start.
#[derive(Debug, Clone, Default)]
pub struct SessionSetup {
    label: String,
    reference: Option<PathBuf>,
    distorted: Vec<PathBuf>,
    scale: RatingScale,
}

impl SessionSetup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        SessionState::Setup
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn reference(mut self, path: impl Into<PathBuf>) -> Self {
        self.reference = Some(path.into());
        self
    }

    pub fn distorted(mut self, path: impl Into<PathBuf>) -> Self {
        self.distorted.push(path.into());
        self
    }

    pub fn distorted_all<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.distorted.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn scale(mut self, scale: RatingScale) -> Self {
        self.scale = scale;
        self
    }

    fn check(&self) -> Result<()> {
        if self.label.trim().is_empty() {
            return Err(VqError::IncompleteConfiguration("session label is empty".to_string()));
        }
        if self.reference.is_none() {
            return Err(VqError::IncompleteConfiguration("no reference video registered".to_string()));
        }
        if self.distorted.is_empty() {
            return Err(VqError::IncompleteConfiguration("no distorted videos registered".to_string()));
        }
        Ok(())
    }

    /// Starts the session with a uniformly shuffled presentation order.
    pub fn start<R: Rng + ?Sized>(self, rng: &mut R) -> Result<Session> {
        self.check()?;
        let mut order: Vec<usize> = (0..self.distorted.len()).collect();
        order.shuffle(rng);
        self.start_with_order(order)
    }

    /// Starts the session with an explicit presentation order.
    ///
    /// `order[i]` is the index of the distorted video shown at position `i`;
    /// it must be a permutation of `0..distorted.len()`.
    pub fn start_with_order(self, order: Vec<usize>) -> Result<Session> {
        self.check()?;
        let n = self.distorted.len();
        let mut seen = vec![false; n];
        for &idx in &order {
            if idx >= n || std::mem::replace(&mut seen[idx], true) {
                return Err(VqError::Input(format!("presentation order {:?} is not a permutation of 0..{}", order, n)));
            }
        }
        if order.len() != n {
            return Err(VqError::Input(format!("presentation order has {} entries, expected {}", order.len(), n)));
        }

        let SessionSetup { label, reference, distorted, scale } = self;
        let Some(reference) = reference else {
            return Err(VqError::IncompleteConfiguration("no reference video registered".to_string()));
        };
        let trials: Vec<Trial> = order
            .iter()
            .enumerate()
            .map(|(presentation_index, &idx)| Trial {
                id: TrialId(idx),
                distorted: distorted[idx].clone(),
                presentation_index,
            })
            .collect();

        info!("Session '{}' started with {} trials", label, trials.len());
        debug!("Presentation order: {:?}", order);

        Ok(Session {
            label: label.trim().to_string(),
            reference,
            trials,
            ratings: Vec::with_capacity(n),
            scale,
        })
    }
}

/// A running or completed session.
///
/// `ratings.len()` always equals the current position; the session is
/// complete once every trial has a rating.
#[derive(Debug, Clone)]
pub struct Session {
    label: String,
    reference: PathBuf,
    trials: Vec<Trial>,
    ratings: Vec<Rating>,
    scale: RatingScale,
}

impl Session {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn reference(&self) -> &Path {
        &self.reference
    }

    /// Trials in presentation order.
    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn ratings(&self) -> &[Rating] {
        &self.ratings
    }

    pub fn scale(&self) -> RatingScale {
        self.scale
    }

    pub fn position(&self) -> usize {
        self.ratings.len()
    }

    pub fn state(&self) -> SessionState {
        if self.is_complete() {
            SessionState::Complete
        } else {
            SessionState::Running
        }
    }

    pub fn is_complete(&self) -> bool {
        self.position() == self.trials.len()
    }

    pub fn current_trial(&self) -> Option<&Trial> {
        self.trials.get(self.position())
    }

    /// Checks a score against the session's scale without recording it.
    pub fn validate_score(&self, score: f64) -> Result<()> {
        let in_range = score.is_finite() && (MIN_SCORE..=MAX_SCORE).contains(&score);
        let on_scale = match self.scale {
            RatingScale::Discrete => score.fract() == 0.0,
            RatingScale::Continuous => true,
        };
        if in_range && on_scale {
            Ok(())
        } else {
            Err(VqError::OutOfRange { score })
        }
    }

    /// Records the rating for the current trial and advances.
    ///
    /// Invalid scores leave the session unchanged.
    pub fn record_rating(&mut self, score: f64) -> Result<Progress> {
        let Some(trial) = self.current_trial() else {
            return Err(VqError::InvalidState("session is already complete".to_string()));
        };
        self.validate_score(score)?;
        let trial_id = trial.id;
        self.ratings.push(Rating {
            trial_id,
            score,
            timestamp: Local::now(),
        });
        info!(
            "Recorded rating {} for trial {} ({}/{})",
            score,
            trial_id,
            self.position(),
            self.trials.len()
        );

        Ok(match self.current_trial() {
            Some(next) => Progress::Next(next.clone()),
            None => {
                info!("Session '{}' complete", self.label);
                Progress::Complete
            }
        })
    }

    /// Recorded ratings joined with their trial identity, in presentation order.
    pub fn export(&self) -> Vec<RatingRecord> {
        self.trials
            .iter()
            .zip(&self.ratings)
            .map(|(trial, rating)| RatingRecord {
                trial_id: trial.id,
                distorted: trial.distorted.clone(),
                presentation_index: trial.presentation_index,
                score: rating.score,
                timestamp: rating.timestamp,
            })
            .collect()
    }
}
