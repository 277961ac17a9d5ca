mod config;
mod controls;

use config::MonitorConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vigil_audio::{CliPlayer, CliSynthesizer, PlaybackScheduler, Utterance};
use vigil_core::collab::{
    ChatClient, HttpObjectStore, PresentationSink, PresentedMessage, Speaker, TracingPresentation,
};
use vigil_core::journal::BehaviorJournal;
use vigil_core::speech::MutedSpeech;
use vigil_core::vision::{AnalysisDispatcher, CaptureScheduler, FfmpegCamera, FrameSource};
use vigil_core::{BehaviorTracker, EventQueue, EventRouter, SpeakingFlag, SpeechOutput};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    vigil_core::telemetry::init_tracing(
        "info,vigil_core=info,vigil_audio=info,vigil_monitor=info",
    );
    info!(
        target = "vigil_monitor",
        "Starting Vigil: Camera → Vision → Tracker → Reply → TTS, Mic → VAD → STT"
    );

    let cfg = MonitorConfig::load();
    let cancel = CancellationToken::new();
    let presentation: Arc<dyn PresentationSink> = Arc::new(TracingPresentation);
    let queue = EventQueue::new();
    let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    // 1) Camera → latest frame
    let camera = FfmpegCamera::new(cfg.camera.clone());
    let (frames, camera_thread) = FrameSource::spawn(
        camera,
        cfg.frames.clone(),
        Arc::clone(&presentation),
        cancel.clone(),
    )?;

    // 2) Speech output (playback worker + speaking flag for the VAD)
    let speaking = SpeakingFlag::new();
    let speech: Arc<dyn SpeechOutput> = if cfg.speech_enabled {
        match CliPlayer::detect() {
            Some(player) => {
                let playback = PlaybackScheduler::new(cfg.playback.clone(), speaking.clone());
                let synth = Arc::new(CliSynthesizer::new(cfg.tts.clone()));
                handles.push((
                    "playback",
                    playback.start(synth, Arc::new(player), cancel.clone())?,
                ));
                Arc::new(playback)
            }
            None => {
                warn!(target = "vigil_monitor", "No audio player found (aplay/paplay/ffplay)");
                presentation.push_status("No audio player found; replies will not be spoken");
                Arc::new(MutedSpeech)
            }
        }
    } else {
        Arc::new(MutedSpeech)
    };

    // 3) Router: tracker, history, replies
    let reply = Arc::new(ChatClient::new(cfg.reply.clone())?);
    let router = EventRouter::new(
        queue.clone(),
        BehaviorTracker::new(cfg.tracker.clone()),
        reply,
        Arc::clone(&speech),
        Arc::clone(&presentation),
        cfg.router.clone(),
    )
    .with_journal(BehaviorJournal::new(cfg.journal_path.clone()));
    handles.push(("router", router.start(cancel.clone())?));

    // 4) Capture scheduler → analysis dispatcher → queue
    let dispatcher = AnalysisDispatcher::new(
        frames,
        Arc::new(HttpObjectStore::new(cfg.storage.clone())?),
        Arc::new(ChatClient::new(cfg.vision.clone())?),
        queue.clone(),
        Arc::clone(&presentation),
        cfg.dispatcher.clone(),
    );
    let (scheduler, scheduler_task) =
        CaptureScheduler::new(Arc::new(dispatcher), cfg.scheduler.clone()).start(cancel.clone())?;
    handles.push(("capture", scheduler_task));

    // 5) Mic → VAD → STT → queue
    if cfg.voice_enabled {
        let (utt_tx, utt_rx) = mpsc::channel::<Utterance>(8);
        handles.extend(start_voice_input(
            &cfg,
            speaking.clone(),
            utt_tx,
            Arc::clone(&presentation),
            cancel.clone(),
        )?);
        let transcriber = Arc::new(vigil_core::collab::HttpTranscriber::new(cfg.stt.clone())?);
        let handoff = vigil_audio::TranscriptionHandoff::new(
            transcriber,
            queue.clone(),
            Arc::clone(&speech),
            Arc::clone(&presentation),
            cfg.handoff.clone(),
        );
        handles.push(("stt", handoff.start(utt_rx, cancel.clone())));
    }

    // 6) Timestamp separators and keyboard controls
    handles.push((
        "timestamps",
        spawn_timestamps(
            Arc::clone(&presentation),
            cfg.timestamp_interval,
            cancel.clone(),
        ),
    ));
    handles.push((
        "controls",
        controls::spawn_controls(scheduler.clone(), Arc::clone(&speech), cancel.clone()),
    ));
    info!(
        target = "vigil_monitor",
        "Running. Controls: <space>/p = skip audio + pause/resume, s = skip audio, q = quit"
    );

    tokio::select! {
        _ = signal::ctrl_c() => info!(target = "vigil_monitor", "Ctrl+C received"),
        _ = cancel.cancelled() => {}
    }

    info!(target = "vigil_monitor", "Shutting down");
    speech.skip();
    cancel.cancel();
    queue.close();
    for (name, handle) in handles {
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(target = "vigil_monitor", task = name, "Task panicked: {}", e),
            Err(_) => warn!(target = "vigil_monitor", task = name, "Task did not stop in time"),
        }
    }
    if let Ok(Err(_)) = tokio::task::spawn_blocking(move || camera_thread.join()).await {
        warn!(target = "vigil_monitor", "Camera thread panicked");
    }
    let stats = scheduler.snapshot();
    info!(
        target = "vigil_monitor",
        cycles = stats.cycles_started,
        completed = stats.cycles_completed,
        abandoned = stats.cycles_abandoned,
        "Stopped"
    );
    Ok(())
}

#[cfg(feature = "mic")]
fn start_voice_input(
    cfg: &MonitorConfig,
    speaking: SpeakingFlag,
    utterances: mpsc::Sender<Utterance>,
    presentation: Arc<dyn PresentationSink>,
    cancel: CancellationToken,
) -> vigil_core::Result<Vec<(&'static str, JoinHandle<()>)>> {
    use vigil_audio::{MicCapture, VoiceMonitor};

    let (chunk_tx, chunk_rx) = mpsc::channel(256);
    // The capture thread exits on its own once `cancel` fires.
    let _mic_thread =
        MicCapture::new(cfg.mic.clone(), Arc::clone(&presentation)).start(chunk_tx, cancel.clone())?;
    let monitor = VoiceMonitor::new(cfg.vad.clone(), speaking, presentation).start(
        chunk_rx,
        utterances,
        cancel,
    );
    Ok(vec![("voice", monitor)])
}

#[cfg(not(feature = "mic"))]
fn start_voice_input(
    _cfg: &MonitorConfig,
    _speaking: SpeakingFlag,
    _utterances: mpsc::Sender<Utterance>,
    presentation: Arc<dyn PresentationSink>,
    _cancel: CancellationToken,
) -> vigil_core::Result<Vec<(&'static str, JoinHandle<()>)>> {
    warn!(target = "vigil_monitor", "Built without the `mic` feature; voice input disabled");
    presentation.push_status("Voice input disabled (built without microphone support)");
    Ok(Vec::new())
}

fn spawn_timestamps(
    presentation: Arc<dyn PresentationSink>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M").to_string();
                    presentation.push_message(PresentedMessage::new(Speaker::System, stamp));
                }
            }
        }
    })
}
