//! In-order chunk playback with stop/cancel

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use super::{ChunkRenderer, SpeechOutput};
use crate::error::ErrorKind;
use crate::voice::events::OutputEvents;
use crate::voice::playback::{AudioClip, AudioSink, AudioUnlock, decode_audio};
use crate::voice::types::{SequenceOutcome, SpeechChunk, TtsProviderId, TtsState};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    None,
    Stop,
    Cancel,
}

/// Resolves once `stop()` or `cancel()` has been requested
async fn interrupted(rx: &mut watch::Receiver<Interrupt>) -> Interrupt {
    loop {
        let current = *rx.borrow_and_update();
        if current != Interrupt::None {
            return current;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Plays chunks through an [`AudioSink`] one at a time
///
/// The next chunk is only rendered once the previous one finished playing.
/// A chunk that fails to render or play is skipped; its speak-end still fires.
pub struct SequencedOutput<R> {
    id: TtsProviderId,
    renderer: R,
    sink: Arc<dyn AudioSink>,
    unlock: Option<Arc<AudioUnlock>>,
    events: Arc<dyn OutputEvents>,
    state: Mutex<TtsState>,
    speaking: AtomicBool,
    interrupt: watch::Sender<Interrupt>,
}

impl<R: ChunkRenderer> SequencedOutput<R> {
    pub fn new(
        id: TtsProviderId,
        renderer: R,
        sink: Arc<dyn AudioSink>,
        events: Arc<dyn OutputEvents>,
    ) -> Self {
        let (interrupt, _) = watch::channel(Interrupt::None);
        Self {
            id,
            renderer,
            sink,
            unlock: None,
            events,
            state: Mutex::new(TtsState::Idle),
            speaking: AtomicBool::new(false),
            interrupt,
        }
    }

    /// Retry autoplay rejections once after unlocking through `unlock`
    #[must_use]
    pub fn with_unlock(mut self, unlock: Arc<AudioUnlock>) -> Self {
        self.unlock = Some(unlock);
        self
    }

    pub const fn renderer(&self) -> &R {
        &self.renderer
    }

    fn set_state(&self, state: TtsState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    async fn play_chunk(&self, chunk: &SpeechChunk) {
        let asset = match self.renderer.render(chunk).await {
            Ok(asset) => asset,
            Err(e) => {
                tracing::warn!(provider = %self.id, message_id = %chunk.message_id, error = %e, "chunk render failed");
                return;
            }
        };
        let clip = match decode_audio(&asset) {
            Ok(clip) => clip,
            Err(e) => {
                tracing::warn!(provider = %self.id, message_id = %chunk.message_id, error = %e, "rendered audio undecodable");
                return;
            }
        };

        self.set_state(TtsState::Speaking);
        if let Err(e) = self.play_clip(clip).await {
            tracing::warn!(provider = %self.id, message_id = %chunk.message_id, error = %e, "chunk playback failed");
            if e.kind() == ErrorKind::PlaybackBlocked {
                self.events.on_error(&e, Some(&chunk.message_id));
            }
        }
    }

    async fn play_clip(&self, clip: AudioClip) -> crate::Result<()> {
        let retry = self.unlock.as_ref().map(|_| clip.clone());
        match self.sink.play(clip).await {
            Err(e) if e.kind() == ErrorKind::PlaybackBlocked => {
                let (Some(unlock), Some(clip)) = (&self.unlock, retry) else {
                    return Err(e);
                };
                tracing::debug!(provider = %self.id, "playback blocked, unlocking and retrying");
                let retried = match unlock.ensure_unlocked().await {
                    Ok(()) => self.sink.play(clip).await,
                    Err(unlock_error) => Err(unlock_error),
                };
                retried.map_err(|e| match e {
                    Error::PlaybackBlocked(_) => e,
                    other => Error::PlaybackBlocked(other.to_string()),
                })
            }
            other => other,
        }
    }
}

#[async_trait]
impl<R: ChunkRenderer> SpeechOutput for SequencedOutput<R> {
    fn id(&self) -> TtsProviderId {
        self.id
    }

    fn state(&self) -> TtsState {
        self.state.lock().map(|s| *s).unwrap_or_default()
    }

    async fn speak(&self, chunks: Vec<SpeechChunk>) -> SequenceOutcome {
        if self.speaking.swap(true, Ordering::SeqCst) {
            tracing::warn!(provider = %self.id, "already speaking, ignoring new sequence");
            return SequenceOutcome::AlreadySpeaking;
        }
        self.interrupt.send_replace(Interrupt::None);
        let mut interrupt = self.interrupt.subscribe();

        let chunks: Vec<_> = chunks.into_iter().filter(SpeechChunk::has_text).collect();
        tracing::debug!(provider = %self.id, chunks = chunks.len(), "speaking sequence");

        let mut outcome = SequenceOutcome::Completed;
        for chunk in &chunks {
            match *interrupt.borrow() {
                Interrupt::None => {}
                Interrupt::Stop => {
                    outcome = SequenceOutcome::Stopped;
                    break;
                }
                Interrupt::Cancel => {
                    outcome = SequenceOutcome::Cancelled;
                    break;
                }
            }

            self.events.on_speak_start(&chunk.message_id);
            self.set_state(TtsState::Loading);

            tokio::select! {
                () = self.play_chunk(chunk) => {}
                reason = interrupted(&mut interrupt) => {
                    tracing::debug!(provider = %self.id, message_id = %chunk.message_id, ?reason, "chunk interrupted");
                    outcome = if reason == Interrupt::Stop {
                        SequenceOutcome::Stopped
                    } else {
                        SequenceOutcome::Cancelled
                    };
                }
            }

            self.events.on_speak_end(&chunk.message_id);
            if outcome != SequenceOutcome::Completed {
                break;
            }
        }

        self.set_state(TtsState::Idle);
        self.speaking.store(false, Ordering::SeqCst);

        if outcome != SequenceOutcome::Stopped {
            self.events.on_sequence_complete();
        }
        outcome
    }

    fn stop(&self) {
        if self.speaking.load(Ordering::SeqCst) {
            self.interrupt.send_replace(Interrupt::Stop);
        }
        self.sink.halt();
    }

    fn cancel(&self) {
        if self.speaking.load(Ordering::SeqCst) {
            self.interrupt.send_replace(Interrupt::Cancel);
        }
        self.sink.halt();
    }
}
