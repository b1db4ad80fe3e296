use super::*;

#[test]
fn silence_confidence_scales_linearly() {
    assert_eq!(silence_confidence(Duration::from_millis(500)), 0.0);
    assert!(silence_confidence(Duration::from_millis(3000)) >= SILENCE_MAX_CONFIDENCE - 0.001);
    let mid = silence_confidence(Duration::from_millis(1750));
    assert!(mid > 0.35 && mid < 0.45);
}

#[test]
fn natural_ending_detects_sentence_punctuation() {
    assert_eq!(natural_ending_confidence("All done."), NATURAL_ENDING_CONFIDENCE);
    assert_eq!(natural_ending_confidence("ready> "), NATURAL_ENDING_CONFIDENCE);
}

#[test]
fn natural_ending_negates_on_open_structures() {
    assert_eq!(natural_ending_confidence("here is a list,"), 0.0);
    assert_eq!(natural_ending_confidence("building the thing"), 0.0);
}

#[test]
fn two_agreeing_signals_earn_a_bonus() {
    let detector = IdleDetector::new(DEFAULT_IDLE_THRESHOLD);
    // No pid, but silence alone won't clear 0.7; with agreement it can.
    let sample = detector.sample(None, "Done.");
    // silence confidence is near 0 immediately after construction, so only
    // the natural-ending signal (0.6) contributes here.
    assert!(sample.confidence <= NATURAL_ENDING_CONFIDENCE + 0.001);
}

#[test]
fn running_process_is_definitively_not_idle() {
    // PID 1 is virtually guaranteed to exist under Linux and, depending on
    // the container, its state may vary; we instead exercise the pure
    // confidence function against a synthetic state.
    assert_eq!(process_confidence(Some(ProcessState::Running)), Some(0.0));
    assert_eq!(process_confidence(Some(ProcessState::WaitingOnInput)), Some(PROCESS_MAX_CONFIDENCE));
    assert_eq!(process_confidence(None), None);
}

#[tokio::test]
async fn wait_for_idle_returns_true_once_sampler_reports_idle() {
    let detector = IdleDetector::new(0.5);
    let mut calls = 0;
    let idle = detector
        .wait_for_idle(Duration::from_secs(2), Duration::from_millis(10), || {
            calls += 1;
            let is_idle = calls >= 3;
            async move { IdleSample { confidence: if is_idle { 0.9 } else { 0.1 }, is_idle } }
        })
        .await;
    assert!(idle);
    assert!(calls >= 3);
}

#[tokio::test]
async fn wait_for_idle_times_out_when_never_idle() {
    let detector = IdleDetector::new(0.9);
    let idle = detector
        .wait_for_idle(Duration::from_millis(50), Duration::from_millis(10), || async {
            IdleSample { confidence: 0.0, is_idle: false }
        })
        .await;
    assert!(!idle);
}
