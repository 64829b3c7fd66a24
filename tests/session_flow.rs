// tests/session_flow.rs

use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use vqlab::analysis::{Metric, ModelKind};
use vqlab::config::Config;
use vqlab::experiment::Experiment;
use vqlab::playback::{LatestFrameSlot, NullSink};
use vqlab::report::{self, SessionResults};
use vqlab::session::{Progress, SessionSetup, SessionState, TrialId};
use vqlab::source::{MemoryClip, MemoryOpener};

/// Reference at 128 and three distortions of increasing fidelity.
fn clips() -> Arc<MemoryOpener> {
    let mut opener = MemoryOpener::new();
    opener
        .insert("R.mp4", MemoryClip::solid(32, 24, 6, 128, 30.0))
        .insert("A.mp4", MemoryClip::solid(32, 24, 6, 108, 30.0))
        .insert("B.mp4", MemoryClip::solid(32, 24, 6, 123, 30.0))
        .insert("C.mp4", MemoryClip::solid(16, 12, 6, 127, 60.0));
    Arc::new(opener)
}

fn setup() -> SessionSetup {
    SessionSetup::new()
        .label("end to end")
        .reference("R.mp4")
        .distorted_all(["A.mp4", "B.mp4", "C.mp4"])
}

fn presentation_order(seed: u64) -> Vec<PathBuf> {
    let session = setup().start(&mut StdRng::seed_from_u64(seed)).unwrap();
    session.trials().iter().map(|t| t.distorted.clone()).collect()
}

#[test]
fn ratings_map_back_to_distorted_videos() {
    let opener = clips();
    let wanted = ["B.mp4", "A.mp4", "C.mp4"].map(PathBuf::from);
    let seed = (0u64..10_000)
        .find(|&seed| presentation_order(seed) == wanted)
        .expect("some seed shuffles the trials into B, A, C");

    let session = setup().start(&mut StdRng::seed_from_u64(seed)).unwrap();
    let order: Vec<PathBuf> = session.trials().iter().map(|t| t.distorted.clone()).collect();
    assert_eq!(order, wanted);
    let ids: Vec<TrialId> = session.trials().iter().map(|t| t.id).collect();
    assert_eq!(ids, [TrialId(1), TrialId(0), TrialId(2)]);

    let config = Config {
        workers: 3,
        ..Config::default()
    };
    let mut exp = Experiment::new(session, opener.clone(), Arc::new(LatestFrameSlot::new()), config);
    for score in [7.0, 4.0, 9.0] {
        exp.open_trial().unwrap();
        assert_eq!(opener.open_handles(), 2);
        exp.toggle_playback().unwrap();
        exp.submit_rating(score).unwrap();
        assert_eq!(opener.open_handles(), 0);
    }

    assert_eq!(exp.session().position(), 3);
    assert_eq!(exp.session().state(), SessionState::Complete);

    let by_video: HashMap<PathBuf, f64> = exp
        .session()
        .export()
        .into_iter()
        .map(|r| (r.distorted, r.score))
        .collect();
    assert_eq!(by_video[&PathBuf::from("B.mp4")], 7.0);
    assert_eq!(by_video[&PathBuf::from("A.mp4")], 4.0);
    assert_eq!(by_video[&PathBuf::from("C.mp4")], 9.0);

    // Ratings rise with fidelity, so both metrics rank the trials the same way.
    let report = exp.report().unwrap();
    assert_eq!(report.trials.len(), 3);
    for metric in Metric::ALL {
        let corr = report.correlation(metric).unwrap();
        assert!((corr.spearman - 1.0).abs() < 1e-9, "{}: {:?}", metric, corr);
        assert!(corr.pearson > 0.0);
        let linear = report.model(metric, ModelKind::Linear).unwrap();
        assert!(!linear.degenerate);
        assert!(linear.coefficients[0] > 0.0);
    }
    let c = report.trials.iter().find(|t| t.trial_id == TrialId(2)).unwrap();
    assert_eq!(c.frames_compared, 6);
    assert!(c.psnr > 40.0);
    assert_eq!(report.psnr_normalized.len(), 3);
}

#[test]
fn seeded_order_is_reproducible_and_joinable() {
    let scores: HashMap<&str, f64> = [("A.mp4", 4.0), ("B.mp4", 7.0), ("C.mp4", 9.0)].into();
    let run = |seed: u64| {
        let mut session = setup().start(&mut StdRng::seed_from_u64(seed)).unwrap();
        while let Some(trial) = session.current_trial() {
            let name = trial.distorted.to_string_lossy().into_owned();
            session.record_rating(scores[name.as_str()]).unwrap();
        }
        session
    };

    let first = run(42);
    let second = run(42);
    assert_eq!(first.trials(), second.trials());
    for record in first.export() {
        let name = record.distorted.to_string_lossy().into_owned();
        assert_eq!(record.score, scores[name.as_str()]);
        assert_eq!(first.trials()[record.presentation_index].id, record.trial_id);
    }
}

#[test]
fn constant_ratings_write_neutral_report() {
    let opener = clips();
    let session = setup().start_with_order(vec![0, 1, 2]).unwrap();
    let mut exp = Experiment::new(session, opener, Arc::new(NullSink), Config::default());
    assert!(matches!(exp.submit_rating(5.0).unwrap(), Progress::Next(_)));
    exp.submit_rating(5.0).unwrap();
    assert_eq!(exp.submit_rating(5.0).unwrap(), Progress::Complete);

    // Constant ratings carry no signal, so correlations fall back to zero.
    let (session, report) = exp.finish();
    let report = report.unwrap();
    for metric in Metric::ALL {
        let corr = report.correlation(metric).unwrap();
        assert_eq!((corr.pearson, corr.spearman), (0.0, 0.0));
    }

    let dir = tempfile::tempdir().unwrap();
    let results = SessionResults::from_session(&session);
    let paths = report::write_all(dir.path(), &results, Some(&report)).unwrap();
    assert!(paths.dir.ends_with("end_to_end"));
    assert_eq!(SessionResults::load(&paths.results.unwrap()).unwrap().records.len(), 3);
}
