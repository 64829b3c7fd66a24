// src/experiment.rs

use crate::analysis::{self, AnalysisReport};
use crate::config::Config;
use crate::error::{Result, VqError};
use crate::metrics::MetricEngine;
use crate::playback::{PlaybackOptions, PresentationSink, Synchronizer};
use crate::session::{Progress, Session, SessionState, Trial};
use crate::source::SourceOpener;
use log::{error, info, warn};
use std::sync::Arc;

/// Control context of a running experiment.
///
/// Owns the session and at most one live [`Synchronizer`]. Each trial gets a
/// fresh synchronizer; the previous one is stopped and its sources closed
/// before the next trial's sources are opened.
pub struct Experiment {
    session: Session,
    opener: Arc<dyn SourceOpener>,
    sink: Arc<dyn PresentationSink>,
    config: Config,
    playback: Option<Synchronizer>,
    report: Option<AnalysisReport>,
}

impl Experiment {
    pub fn new(
        session: Session,
        opener: Arc<dyn SourceOpener>,
        sink: Arc<dyn PresentationSink>,
        config: Config,
    ) -> Self {
        Self {
            session,
            opener,
            sink,
            config,
            playback: None,
            report: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn playback(&self) -> Option<&Synchronizer> {
        self.playback.as_ref()
    }

    /// Analysis results, present once every trial has been rated.
    pub fn report(&self) -> Option<&AnalysisReport> {
        self.report.as_ref()
    }

    /// Starts playback for the current trial.
    ///
    /// Any running playback is torn down first. If either video cannot be
    /// opened the error is returned and the trial is left without playback;
    /// the session itself is unaffected and the trial can still be rated.
    pub fn open_trial(&mut self) -> Result<Trial> {
        self.close_playback()?;
        let Some(trial) = self.session.current_trial().cloned() else {
            return Err(VqError::InvalidState("no trial left to open".to_string()));
        };

        let reference = self.opener.open(self.session.reference())?;
        let distorted = self.opener.open(&trial.distorted)?;
        let options = PlaybackOptions {
            canvas: self.config.canvas,
            autoplay: self.config.autoplay,
            label: trial.id.to_string(),
        };
        let sync = Synchronizer::start(reference, distorted, Arc::clone(&self.sink), options)?;
        info!(
            "Trial {}/{} ({}) ready, {}",
            trial.presentation_index + 1,
            self.session.trials().len(),
            trial.id,
            if self.config.autoplay { "playing" } else { "paused" }
        );
        self.playback = Some(sync);
        Ok(trial)
    }

    /// Stops the current trial's playback, if any, and waits for it to exit.
    pub fn close_playback(&mut self) -> Result<()> {
        match self.playback.take() {
            Some(sync) => sync.stop(),
            None => Ok(()),
        }
    }

    /// Flips play/pause and returns whether playback is now running.
    pub fn toggle_playback(&self) -> Result<bool> {
        Ok(self.active()?.toggle())
    }

    pub fn restart_playback(&self) -> Result<()> {
        self.active()?.restart()
    }

    fn active(&self) -> Result<&Synchronizer> {
        self.playback
            .as_ref()
            .ok_or_else(|| VqError::InvalidState("no trial is playing".to_string()))
    }

    /// Records a rating for the current trial.
    ///
    /// A rejected score leaves playback and the session untouched. An
    /// accepted one ends the trial's playback; after the final trial the
    /// analysis runs and its report becomes available through
    /// [`Experiment::report`]. Opening the next trial is left to the caller.
    pub fn submit_rating(&mut self, score: f64) -> Result<Progress> {
        if self.session.state() == SessionState::Complete {
            return Err(VqError::InvalidState("session is already complete".to_string()));
        }
        self.session.validate_score(score)?;
        if let Err(e) = self.close_playback() {
            error!("Playback teardown failed: {}", e);
        }

        let progress = self.session.record_rating(score)?;
        if progress == Progress::Complete {
            self.run_analysis();
        }
        Ok(progress)
    }

    fn run_analysis(&mut self) {
        let records = self.session.export();
        let engine = MetricEngine::new(self.opener.as_ref()).with_frame_cap(self.config.frame_cap);
        let report = analysis::analyze(
            self.session.label(),
            self.session.reference(),
            &records,
            &engine,
            self.config.workers,
        );
        if report.trials.len() != records.len() {
            warn!(
                "Analysis covers {} of {} rated trials",
                report.trials.len(),
                records.len()
            );
        }
        self.report = Some(report);
    }

    /// Stops playback and hands back the session and report.
    pub fn finish(mut self) -> (Session, Option<AnalysisReport>) {
        if let Err(e) = self.close_playback() {
            error!("Playback teardown failed: {}", e);
        }
        (self.session, self.report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RatingScale;
    use crate::playback::LatestFrameSlot;
    use crate::session::SessionSetup;
    use crate::source::{MemoryClip, MemoryOpener};
    use std::time::{Duration, Instant};

    fn opener() -> MemoryOpener {
        let mut opener = MemoryOpener::new();
        opener
            .insert("ref.mp4", MemoryClip::solid(16, 16, 4, 120, 30.0))
            .insert("a.mp4", MemoryClip::solid(16, 16, 4, 110, 30.0))
            .insert("b.mp4", MemoryClip::solid(16, 16, 4, 60, 30.0));
        opener
    }

    fn experiment(opener: Arc<MemoryOpener>, distorted: &[&str]) -> Experiment {
        let session = SessionSetup::new()
            .label("unit")
            .reference("ref.mp4")
            .distorted_all(distorted.iter().copied())
            .scale(RatingScale::Discrete)
            .start_with_order((0..distorted.len()).collect())
            .unwrap();
        let config = Config {
            workers: 2,
            ..Config::default()
        };
        Experiment::new(session, opener, Arc::new(LatestFrameSlot::new()), config)
    }

    #[test]
    fn trials_never_overlap_decoders() {
        let opener = Arc::new(opener());
        let mut exp = experiment(Arc::clone(&opener), &["a.mp4", "b.mp4"]);

        exp.open_trial().unwrap();
        assert_eq!(opener.open_handles(), 2);
        assert!(!exp.playback().unwrap().is_playing());

        assert_eq!(exp.submit_rating(6.0).unwrap(), Progress::Next(exp.session().trials()[1].clone()));
        assert_eq!(opener.open_handles(), 0);
        assert!(exp.playback().is_none());

        exp.open_trial().unwrap();
        assert_eq!(opener.open_handles(), 2);
        assert_eq!(exp.submit_rating(3.0).unwrap(), Progress::Complete);
        assert_eq!(opener.open_handles(), 0);

        let report = exp.report().unwrap();
        assert_eq!(report.trials.len(), 2);
        assert!(report.trials.iter().all(|t| t.frames_compared == 4));
    }

    #[test]
    fn rejected_rating_keeps_playback_running() {
        let opener = Arc::new(opener());
        let mut exp = experiment(Arc::clone(&opener), &["a.mp4"]);
        exp.open_trial().unwrap();
        assert!(exp.toggle_playback().unwrap());

        assert!(matches!(exp.submit_rating(11.0), Err(VqError::OutOfRange { .. })));
        assert!(matches!(exp.submit_rating(4.5), Err(VqError::OutOfRange { .. })));
        assert_eq!(exp.session().position(), 0);
        assert!(exp.playback().is_some());

        let deadline = Instant::now() + Duration::from_secs(2);
        while exp.playback().unwrap().presented_frames() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(exp.playback().unwrap().presented_frames() > 0);
    }

    #[test]
    fn missing_video_only_aborts_trial_setup() {
        let opener = Arc::new(opener());
        let mut exp = experiment(Arc::clone(&opener), &["missing.mp4", "a.mp4"]);

        assert!(matches!(exp.open_trial(), Err(VqError::SourceUnavailable { .. })));
        assert!(exp.playback().is_none());
        assert_eq!(opener.open_handles(), 0);
        assert!(matches!(exp.toggle_playback(), Err(VqError::InvalidState(_))));

        exp.submit_rating(2.0).unwrap();
        exp.open_trial().unwrap();
        assert_eq!(exp.submit_rating(8.0).unwrap(), Progress::Complete);

        let report = exp.report().unwrap();
        let missing = report.trials.iter().find(|t| t.distorted.ends_with("missing.mp4")).unwrap();
        assert_eq!((missing.psnr, missing.ssim, missing.frames_compared), (0.0, 0.0, 0));
    }

    #[test]
    fn completed_experiment_rejects_more_ratings() {
        let mut exp = experiment(Arc::new(opener()), &["a.mp4"]);
        exp.submit_rating(5.0).unwrap();
        assert!(matches!(exp.submit_rating(5.0), Err(VqError::InvalidState(_))));
        assert!(matches!(exp.open_trial(), Err(VqError::InvalidState(_))));
        let (session, report) = exp.finish();
        assert_eq!(session.position(), 1);
        assert!(report.is_some());
    }
}
