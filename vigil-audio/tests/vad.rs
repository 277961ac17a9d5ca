//! Integration tests for the energy VAD and the voice monitor loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vigil_audio::{
    calibrated_threshold, AudioChunk, DiscardReason, SpeechDetector, VadConfig, VadEvent,
    VoiceMonitor,
};
use vigil_core::collab::{ChannelPresentation, PresentationUpdate};
use vigil_core::SpeakingFlag;

const RATE: u32 = 16_000;

fn cfg() -> VadConfig {
    VadConfig {
        sample_rate_hz: RATE,
        static_floor: 100.0,
        threshold_multiplier: 2.5,
        calibration: Duration::from_secs(3),
        noise_window: 100,
        silence_timeout: Duration::from_millis(800),
        min_speech: Duration::from_millis(300),
        validation_min: Duration::from_millis(500),
        max_utterance: Duration::from_secs(30),
    }
}

/// 100 ms of a square-ish signal with the given mean absolute amplitude.
fn tone(level: i16) -> AudioChunk {
    let samples = (0..1_600)
        .map(|i| if i % 2 == 0 { level } else { -level })
        .collect();
    AudioChunk::new(samples, RATE)
}

fn silence() -> AudioChunk {
    AudioChunk::new(vec![0; 1_600], RATE)
}

fn calibrate(d: &mut SpeechDetector) -> f32 {
    let levels = [40i16, 50, 60];
    let mut out = None;
    for i in 0..30 {
        if let Some(e) = d.process(&tone(levels[i % 3]), false) {
            out = Some(e);
        }
    }
    match out {
        Some(VadEvent::Calibrated { threshold }) => threshold,
        other => panic!("expected calibration, got {other:?}"),
    }
}

/// Feed chunks and collect every event emitted.
fn feed(d: &mut SpeechDetector, chunks: impl IntoIterator<Item = AudioChunk>) -> Vec<VadEvent> {
    chunks
        .into_iter()
        .filter_map(|c| d.process(&c, false))
        .collect()
}

#[test]
fn calibration_uses_mean_noise_times_multiplier() {
    assert_eq!(calibrated_threshold(&[40.0, 50.0, 60.0], 100.0, 2.5), 125.0);

    let mut d = SpeechDetector::new(cfg());
    assert!(d.is_calibrating());
    assert_eq!(d.threshold(), None);
    let threshold = calibrate(&mut d);
    assert_eq!(threshold, 125.0);
    assert!(!d.is_calibrating());
}

#[test]
fn loud_audio_during_calibration_is_never_classified() {
    let mut d = SpeechDetector::new(cfg());
    let events = feed(&mut d, (0..29).map(|_| tone(5_000)));
    assert!(events.is_empty());
    assert!(!d.is_speaking());
}

#[test]
fn short_blip_is_never_emitted_even_before_long_silence() {
    let mut d = SpeechDetector::new(cfg());
    calibrate(&mut d);

    let mut chunks = vec![tone(3_000), tone(3_000)];
    chunks.extend((0..50).map(|_| silence()));
    let events = feed(&mut d, chunks);

    assert_eq!(events.first(), Some(&VadEvent::SpeechStarted));
    assert!(!events.iter().any(|e| matches!(e, VadEvent::Utterance(_))));
    assert!(events.iter().any(|e| matches!(
        e,
        VadEvent::Discarded {
            reason: DiscardReason::TooShort,
            ..
        }
    )));
}

#[test]
fn speech_followed_by_silence_becomes_an_utterance() {
    let mut d = SpeechDetector::new(cfg());
    calibrate(&mut d);

    let mut chunks: Vec<AudioChunk> = (0..12).map(|_| tone(3_000)).collect();
    chunks.extend((0..12).map(|_| silence()));
    let events = feed(&mut d, chunks);

    let utterance = events
        .iter()
        .find_map(|e| match e {
            VadEvent::Utterance(u) => Some(u.clone()),
            _ => None,
        })
        .expect("utterance");
    assert_eq!(utterance.voiced, Duration::from_millis(1_200));
    assert_eq!(utterance.started_at, Duration::from_secs(3));
    // 1.2 s voiced + 0.9 s trailing silence
    assert_eq!(utterance.samples.len(), 21 * 1_600);
    assert_eq!(&utterance.to_wav()[0..4], b"RIFF");
    assert!(!d.is_speaking());
}

#[test]
fn brief_dips_inside_speech_do_not_end_the_utterance() {
    let mut d = SpeechDetector::new(cfg());
    calibrate(&mut d);

    let mut chunks: Vec<AudioChunk> = (0..5).map(|_| tone(3_000)).collect();
    chunks.extend((0..5).map(|_| silence()));
    chunks.extend((0..5).map(|_| tone(3_000)));
    chunks.extend((0..10).map(|_| silence()));
    let events = feed(&mut d, chunks);

    let utterances: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            VadEvent::Utterance(u) => Some(u),
            _ => None,
        })
        .collect();
    assert_eq!(utterances.len(), 1);
    assert_eq!(utterances[0].voiced, Duration::from_millis(1_500));
}

#[test]
fn continuous_speech_is_cut_at_the_hard_cap() {
    let mut c = cfg();
    c.max_utterance = Duration::from_secs(2);
    let mut d = SpeechDetector::new(c);
    calibrate(&mut d);

    let events = feed(&mut d, (0..20).map(|_| tone(3_000)));
    let utterance = events
        .iter()
        .find_map(|e| match e {
            VadEvent::Utterance(u) => Some(u),
            _ => None,
        })
        .expect("capped utterance");
    assert_eq!(utterance.duration(), Duration::from_secs(2));
}

#[test]
fn playback_suppression_ignores_loud_audio() {
    let mut d = SpeechDetector::new(cfg());
    let threshold = calibrate(&mut d);

    for _ in 0..20 {
        assert_eq!(d.process(&tone(10_000), true), None);
    }
    assert!(!d.is_speaking());
    assert_eq!(d.threshold(), Some(threshold));

    // Suppression starting mid-utterance counts as silence.
    assert_eq!(d.process(&tone(3_000), false), Some(VadEvent::SpeechStarted));
    let tail: Vec<_> = (0..10).filter_map(|_| d.process(&tone(3_000), true)).collect();
    assert!(matches!(
        tail.as_slice(),
        [VadEvent::Discarded {
            reason: DiscardReason::TooShort,
            ..
        }]
    ));
}

/// Wait until the monitor has taken every queued chunk. On the current-thread
/// runtime a taken chunk is also fully processed by then.
async fn drained(tx: &mpsc::Sender<AudioChunk>) {
    while tx.capacity() < tx.max_capacity() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn monitor_hands_off_utterances_and_respects_speaking_flag() {
    let (chunk_tx, chunk_rx) = mpsc::channel(256);
    let (utt_tx, mut utt_rx) = mpsc::channel(4);
    let (presentation, mut updates) = ChannelPresentation::new();
    let speaking = SpeakingFlag::new();
    let cancel = CancellationToken::new();

    let handle = VoiceMonitor::new(cfg(), speaking.clone(), Arc::new(presentation)).start(
        chunk_rx,
        utt_tx,
        cancel.clone(),
    );

    for i in 0..30 {
        chunk_tx.send(tone([40, 50, 60][i % 3])).await.unwrap();
    }
    drained(&chunk_tx).await;
    // Assistant talking: nothing should come out.
    speaking.set_active();
    for _ in 0..10 {
        chunk_tx.send(tone(3_000)).await.unwrap();
    }
    for _ in 0..10 {
        chunk_tx.send(silence()).await.unwrap();
    }
    drained(&chunk_tx).await;
    speaking.clear();
    for _ in 0..8 {
        chunk_tx.send(tone(3_000)).await.unwrap();
    }
    for _ in 0..10 {
        chunk_tx.send(silence()).await.unwrap();
    }

    let utterance = tokio::time::timeout(Duration::from_secs(2), utt_rx.recv())
        .await
        .expect("utterance in time")
        .expect("channel open");
    assert_eq!(utterance.voiced, Duration::from_millis(800));
    assert!(utt_rx.try_recv().is_err());

    cancel.cancel();
    handle.await.unwrap();

    let statuses: Vec<String> = std::iter::from_fn(|| updates.try_recv().ok())
        .filter_map(|u| match u {
            PresentationUpdate::Status(s) => Some(s),
            _ => None,
        })
        .collect();
    assert!(statuses.iter().any(|s| s.contains("ready")));
    assert!(statuses.iter().any(|s| s.contains("Listening")));
}
