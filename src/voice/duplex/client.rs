//! Full-duplex session client
//!
//! One socket carries captured user audio out and model audio/text in.
//! `disconnected -> connecting -> handshaking -> active -> disconnected`.
//! Audio is only sent once the remote acknowledged setup; inbound audio seen
//! before that is dropped.

use std::sync::{Arc, Mutex};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use super::protocol::{self, Inbound, ServerContent, Setup};
use crate::voice::capture::{CaptureSession, FRAME_SAMPLES, Microphone, SAMPLE_RATE};
use crate::voice::events::{InputEvents, OutputEvents};
use crate::voice::pcm::{decode_pcm16, samples_to_wav};
use crate::voice::playback::{AudioSink, PLAYBACK_SAMPLE_RATE, PcmStream};
use crate::voice::session::{SessionGuard, SessionToken};
use crate::voice::types::{FinishedTurn, InputLanguage};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplexState {
    #[default]
    Disconnected,
    Connecting,
    Handshaking,
    Active,
}

/// Settings for the full-duplex session
#[derive(Debug, Clone)]
pub struct DuplexConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    /// Rate of captured audio sent upstream
    pub input_sample_rate: u32,
    /// Rate of PCM16 audio the remote sends back
    pub output_sample_rate: u32,
    pub frame_samples: usize,
}

impl Default for DuplexConfig {
    fn default() -> Self {
        Self {
            url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            api_key: None,
            voice: None,
            system_instruction: None,
            input_sample_rate: SAMPLE_RATE,
            output_sample_rate: PLAYBACK_SAMPLE_RATE,
            frame_samples: FRAME_SAMPLES,
        }
    }
}

impl DuplexConfig {
    fn url(&self) -> Result<String> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid duplex URL: {e}")))?;
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key.expose_secret());
        }
        Ok(url.into())
    }
}

/// Tracks the agent's current turn so each boundary is reported once
#[derive(Debug, Default)]
pub struct TurnTracker {
    current: Option<String>,
}

impl TurnTracker {
    /// Start a turn if none is open; returns the new turn's id
    pub fn begin(&mut self) -> Option<String> {
        if self.current.is_some() {
            return None;
        }
        let id = Uuid::new_v4().to_string();
        self.current = Some(id.clone());
        Some(id)
    }

    /// Close the open turn, if any
    pub const fn end(&mut self) -> Option<String> {
        self.current.take()
    }

    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.current.is_some()
    }
}

/// Why the open user turn is ending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnEnd {
    /// Explicit stop; `emit` false drops the turn without `on_stop`
    Stopped { emit: bool },
    /// The model started answering
    ModelReplied,
    /// The connection went away
    Closed,
}

struct UserTurn {
    token: SessionToken,
    language: InputLanguage,
    transcript: String,
    audio_mark: usize,
}

#[derive(Default)]
struct Tasks {
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    forward: Option<JoinHandle<()>>,
}

struct Inner {
    config: DuplexConfig,
    mic: Arc<dyn Microphone>,
    sink: Arc<dyn AudioSink>,
    input: Arc<dyn InputEvents>,
    output: Arc<dyn OutputEvents>,
    state: watch::Sender<DuplexState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    tasks: Mutex<Tasks>,
    capture: Mutex<Option<CaptureSession>>,
    playback: Mutex<Option<Box<dyn PcmStream>>>,
    agent: Mutex<TurnTracker>,
    user_guard: SessionGuard,
    user: Mutex<Option<UserTurn>>,
}

/// Full-duplex session over one persistent socket
#[derive(Clone)]
pub struct DuplexClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DuplexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexClient")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DuplexClient {
    pub fn new(
        config: DuplexConfig,
        mic: Arc<dyn Microphone>,
        sink: Arc<dyn AudioSink>,
        input: Arc<dyn InputEvents>,
        output: Arc<dyn OutputEvents>,
    ) -> Self {
        let (state, _) = watch::channel(DuplexState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                config,
                mic,
                sink,
                input,
                output,
                state,
                outbound: Mutex::new(None),
                tasks: Mutex::new(Tasks::default()),
                capture: Mutex::new(None),
                playback: Mutex::new(None),
                agent: Mutex::new(TurnTracker::default()),
                user_guard: SessionGuard::new(),
                user: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> DuplexState {
        *self.inner.state.borrow()
    }

    /// Whether the agent is mid-turn
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.inner
            .agent
            .lock()
            .map(|agent| agent.is_speaking())
            .unwrap_or(false)
    }

    /// Whether the microphone is streaming into the session
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.inner
            .capture
            .lock()
            .map(|capture| capture.is_some())
            .unwrap_or(false)
    }

    /// Open the socket and send the setup frame
    ///
    /// Resolves once the socket is open; the session becomes
    /// [`DuplexState::Active`] when the remote acknowledges setup.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the socket cannot be opened, or if the
    /// session was disconnected before it finished opening
    pub async fn connect(&self) -> Result<()> {
        if self.open().await? {
            Ok(())
        } else {
            Err(Error::Transport(
                "duplex session closed while connecting".to_string(),
            ))
        }
    }

    /// Open the session unless one is already open or opening
    ///
    /// Returns false if a disconnect superseded the attempt.
    async fn open(&self) -> Result<bool> {
        let inner = &self.inner;
        let claimed = inner.state.send_if_modified(|state| {
            if *state == DuplexState::Disconnected {
                *state = DuplexState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            tracing::debug!("duplex session already connected");
            return Ok(true);
        }

        let opened = async {
            let url = inner.config.url()?;
            let setup = Setup::new(
                &inner.config.model,
                inner.config.voice.as_deref(),
                inner.config.system_instruction.as_deref(),
            );
            let setup = protocol::setup_frame(&setup)?;
            let (socket, _) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| Error::Transport(format!("failed to open duplex session: {e}")))?;
            Ok::<_, Error>((socket, setup))
        }
        .await;

        let (socket, setup) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                inner.state.send_replace(DuplexState::Disconnected);
                return Err(e);
            }
        };
        if *inner.state.borrow() != DuplexState::Connecting {
            tracing::debug!("duplex session closed while connecting");
            return Ok(false);
        }

        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Message::Text(setup));

        let writer = tokio::spawn(Inner::write_loop(sink, rx));
        if let Ok(mut outbound) = inner.outbound.lock() {
            *outbound = Some(tx);
        }
        inner.state.send_replace(DuplexState::Handshaking);
        tracing::info!(model = %inner.config.model, "duplex session open, awaiting setup");

        let reader = tokio::spawn(Arc::clone(inner).read_loop(stream));
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.writer = Some(writer);
            tasks.reader = Some(reader);
        }
        Ok(true)
    }

    /// Wait until setup is acknowledged; false if the session closed instead
    pub async fn wait_active(&self) -> bool {
        let mut state = self.inner.state.subscribe();
        let settled = state
            .wait_for(|s| matches!(s, DuplexState::Active | DuplexState::Disconnected))
            .await
            .map(|s| *s == DuplexState::Active);
        settled.unwrap_or(false)
    }

    /// Connect if needed, then stream the microphone into the session
    ///
    /// # Errors
    ///
    /// Returns the transport or capture error that prevented the start
    pub async fn start_capture(&self, language: InputLanguage) -> Result<()> {
        let inner = &self.inner;
        if self.is_capturing() {
            return Ok(());
        }
        if !self.open().await? {
            tracing::debug!("duplex session closed before capture started");
            return Ok(());
        }

        let (capture, mut frames) = match CaptureSession::start_streaming(
            inner.mic.as_ref(),
            inner.config.input_sample_rate,
            inner.config.frame_samples,
        ) {
            Ok(started) => started,
            Err(e) => {
                inner.teardown(false);
                return Err(e);
            }
        };

        // A disconnect may have landed while the device was opening
        let stale = match inner.capture.lock() {
            Ok(mut slot) if inner.is_open() => {
                *slot = Some(capture);
                None
            }
            _ => Some(capture),
        };
        if let Some(capture) = stale {
            let recording = capture.finish();
            tracing::debug!(
                samples = recording.sample_count(),
                "duplex session closed before capture started"
            );
            return Ok(());
        }
        inner.begin_user_turn(language);

        let forwarder = Arc::clone(inner);
        let forward = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                if !forwarder.send_audio(&frame) {
                    tracing::trace!("dropping audio frame before setup complete");
                }
            }
        });
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.forward = Some(forward);
        }
        Ok(())
    }

    /// Send one PCM16 frame; returns false if the session is not active
    #[must_use]
    pub fn send_audio(&self, pcm: &[u8]) -> bool {
        self.inner.send_audio(pcm)
    }

    /// Send a typed user turn
    ///
    /// # Errors
    ///
    /// Returns a transport error if the session is not active
    pub fn send_text(&self, text: &str) -> Result<()> {
        let inner = &self.inner;
        if *inner.state.borrow() != DuplexState::Active {
            return Err(Error::Transport("duplex session is not active".to_string()));
        }
        if !inner.send(Message::Text(protocol::text_frame(text)?)) {
            return Err(Error::Transport("duplex session closed".to_string()));
        }
        Ok(())
    }

    /// Stop in-flight agent audio
    pub fn interrupt_playback(&self) {
        self.inner.flush_playback();
        if let Some(id) = self.inner.end_agent_turn() {
            self.inner.output.on_speak_end(&id);
        }
    }

    /// End the user turn (if any) and tear the session down
    ///
    /// Safe in any state. With `trigger_callback` false the open user turn is
    /// dropped without `on_stop`.
    pub fn disconnect(&self, trigger_callback: bool) {
        let inner = &self.inner;
        inner.finish_user_turn(TurnEnd::Stopped {
            emit: trigger_callback,
        });
        if *inner.state.borrow() == DuplexState::Disconnected {
            return;
        }
        inner.teardown(false);
    }
}

impl Inner {
    async fn write_loop(
        mut sink: SplitSink<WsStream, Message>,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(message) = outbound.recv().await {
            if let Err(e) = sink.send(message).await {
                tracing::warn!(error = %e, "duplex send failed");
                break;
            }
        }
        if let Err(e) = sink.close().await {
            tracing::debug!(error = %e, "duplex socket close failed");
        }
    }

    async fn read_loop(self: Arc<Self>, mut stream: SplitStream<WsStream>) {
        let mut failure = None;

        while let Some(message) = stream.next().await {
            let inbound = match message {
                Ok(Message::Binary(bytes)) => protocol::parse_binary(bytes),
                Ok(Message::Text(text)) => protocol::parse_control(&text),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "duplex session closed by remote");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            };
            match inbound {
                Ok(inbound) => self.dispatch(inbound),
                Err(e) => tracing::warn!(error = %e, "dropping inbound message"),
            }
        }

        if *self.state.borrow() == DuplexState::Disconnected {
            return;
        }
        let error = Error::Transport(failure.unwrap_or_else(|| {
            "duplex session closed unexpectedly".to_string()
        }));
        tracing::warn!(error = %error, "duplex session ended");
        self.finish_user_turn(TurnEnd::Closed);
        self.input.on_error(&error);
        self.teardown(true);
    }

    fn dispatch(&self, inbound: Inbound) {
        match inbound {
            Inbound::SetupComplete => {
                if *self.state.borrow() == DuplexState::Handshaking {
                    self.state.send_replace(DuplexState::Active);
                    tracing::info!("duplex session active");
                }
            }
            Inbound::Audio(pcm) => self.play_audio(&pcm),
            Inbound::Content(content) => self.handle_content(&content),
            Inbound::ToolCalls(calls) => {
                for call in &calls {
                    tracing::debug!(name = %call.name, "tool call");
                    self.output.on_tool_call(call);
                }
            }
            Inbound::Error(message) => {
                self.output
                    .on_error(&Error::Transport(format!("remote error: {message}")), None);
            }
        }
    }

    fn handle_content(&self, content: &ServerContent) {
        if let Some(transcription) = &content.input_transcription {
            if !transcription.text.is_empty() {
                self.append_user_transcript(&transcription.text);
            }
        }

        if content.has_model_output() {
            self.begin_agent_turn();
        }
        for pcm in content.audio() {
            self.play_audio(&pcm);
        }
        if let Some(text) = content.text() {
            self.output.on_transcript(&text);
        }
        if let Some(transcription) = &content.output_transcription {
            if !transcription.text.is_empty() {
                self.output.on_transcript(&transcription.text);
            }
        }

        if content.interrupted {
            tracing::debug!("agent interrupted");
            self.flush_playback();
            if let Some(id) = self.end_agent_turn() {
                self.output.on_speak_end(&id);
            }
        }
        if content.turn_complete {
            if let Some(id) = self.end_agent_turn() {
                self.output.on_speak_end(&id);
                self.output.on_sequence_complete();
            }
        }
    }

    fn play_audio(&self, pcm: &[u8]) {
        if *self.state.borrow() != DuplexState::Active {
            tracing::debug!(bytes = pcm.len(), "dropping audio before setup complete");
            return;
        }
        let samples = decode_pcm16(pcm);
        if samples.is_empty() {
            return;
        }
        self.begin_agent_turn();

        let Ok(mut playback) = self.playback.lock() else {
            return;
        };
        if playback.is_none() {
            match self.sink.open_stream(self.config.output_sample_rate) {
                Ok(stream) => *playback = Some(stream),
                Err(e) => {
                    drop(playback);
                    tracing::warn!(error = %e, "failed to open duplex output");
                    self.output.on_error(&e, None);
                    return;
                }
            }
        }
        if let Some(stream) = playback.as_mut() {
            stream.push(&samples);
        }
    }

    fn flush_playback(&self) {
        if let Ok(mut playback) = self.playback.lock() {
            if let Some(stream) = playback.as_mut() {
                stream.flush();
            }
        }
    }

    fn begin_agent_turn(&self) {
        let started = self.agent.lock().ok().and_then(|mut agent| agent.begin());
        if let Some(id) = started {
            self.finish_user_turn(TurnEnd::ModelReplied);
            self.output.on_speak_start(&id);
        }
    }

    fn end_agent_turn(&self) -> Option<String> {
        self.agent.lock().ok().and_then(|mut agent| agent.end())
    }

    fn is_open(&self) -> bool {
        *self.state.borrow() != DuplexState::Disconnected
    }

    fn send(&self, message: Message) -> bool {
        self.outbound
            .lock()
            .ok()
            .and_then(|outbound| outbound.as_ref().map(|tx| tx.send(message).is_ok()))
            .unwrap_or(false)
    }

    fn send_audio(&self, pcm: &[u8]) -> bool {
        if *self.state.borrow() != DuplexState::Active {
            return false;
        }
        match protocol::audio_frame(pcm, self.config.input_sample_rate) {
            Ok(frame) => self.send(Message::Text(frame)),
            Err(e) => {
                tracing::debug!(error = %e, "failed to encode audio frame");
                false
            }
        }
    }

    fn captured_samples(&self) -> Vec<f32> {
        self.capture
            .lock()
            .ok()
            .and_then(|capture| capture.as_ref().map(CaptureSession::snapshot))
            .unwrap_or_default()
    }

    fn begin_user_turn(&self, language: InputLanguage) {
        let token = self.user_guard.mint();
        let audio_mark = self.captured_samples().len();
        if let Ok(mut user) = self.user.lock() {
            *user = Some(UserTurn {
                token,
                language,
                transcript: String::new(),
                audio_mark,
            });
        }
        self.input.on_start(&token.id(), language);
    }

    fn append_user_transcript(&self, fragment: &str) {
        let text = self.user.lock().ok().and_then(|mut user| {
            user.as_mut().map(|turn| {
                turn.transcript.push_str(fragment);
                turn.transcript.trim().to_string()
            })
        });
        if let Some(text) = text {
            self.input.on_transcript(&text, false);
        }
    }

    /// Finalize the open user turn
    ///
    /// Automatic finalization is skipped while nothing was transcribed. After a
    /// model reply a fresh turn opens immediately on the live capture.
    fn finish_user_turn(&self, end: TurnEnd) {
        let user_initiated = matches!(end, TurnEnd::Stopped { .. });
        let trigger_callback = match end {
            TurnEnd::Stopped { emit } => emit,
            TurnEnd::ModelReplied | TurnEnd::Closed => true,
        };
        let Some(token) = self.user_guard.current() else {
            return;
        };
        let empty = self
            .user
            .lock()
            .map(|user| user.as_ref().is_none_or(|turn| turn.transcript.trim().is_empty()))
            .unwrap_or(true);
        if !user_initiated && empty {
            return;
        }
        if !self.user_guard.claim(&token) {
            return;
        }
        let Some(turn) = self.user.lock().ok().and_then(|mut user| user.take()) else {
            return;
        };

        if trigger_callback {
            let samples = self.captured_samples();
            let audio = samples.get(turn.audio_mark..).unwrap_or_default();
            match samples_to_wav(audio, self.config.input_sample_rate) {
                Ok(audio) => {
                    let transcript = turn.transcript.trim().to_string();
                    if !transcript.is_empty() {
                        self.input.on_transcript(&transcript, true);
                    }
                    self.input.on_stop(FinishedTurn {
                        transcript,
                        message_id: turn.token.id(),
                        language: turn.language,
                        audio,
                        user_initiated,
                    });
                }
                Err(e) => self.input.on_error(&e),
            }
        }

        let capturing = self.capture.lock().map(|c| c.is_some()).unwrap_or(false);
        if end == TurnEnd::ModelReplied && capturing {
            self.begin_user_turn(turn.language);
        }
    }

    /// Release everything in a fixed order; each step runs even if an earlier one failed
    fn teardown(&self, from_reader: bool) {
        // Marked first so a capture opening concurrently sees the close
        self.state.send_replace(DuplexState::Disconnected);
        let mut tasks = self
            .tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default();

        if let Some(forward) = tasks.forward.take() {
            forward.abort();
        }

        let output = self.playback.lock().ok().and_then(|mut p| p.take());
        if let Some(mut output) = output {
            if let Err(e) = output.close() {
                tracing::warn!(error = %e, "failed to close duplex output");
            }
        }

        let capture = self.capture.lock().ok().and_then(|mut c| c.take());
        if let Some(capture) = capture {
            let recording = capture.finish();
            tracing::debug!(samples = recording.sample_count(), "duplex capture released");
        }

        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.take();
        }
        if !from_reader {
            if let Some(reader) = tasks.reader.take() {
                reader.abort();
            }
        }

        self.user_guard.invalidate();
        if let Ok(mut user) = self.user.lock() {
            user.take();
        }
        if let Some(id) = self.end_agent_turn() {
            self.output.on_speak_end(&id);
        }
        tracing::info!("duplex session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_tracker_reports_each_boundary_once() {
        let mut tracker = TurnTracker::default();
        let id = tracker.begin().unwrap();
        assert!(tracker.begin().is_none());
        assert!(tracker.is_speaking());
        assert_eq!(tracker.end(), Some(id));
        assert_eq!(tracker.end(), None);
        assert!(!tracker.is_speaking());
    }

    #[test]
    fn api_key_goes_in_query() {
        let config = DuplexConfig {
            url: "wss://example.test/live".to_string(),
            api_key: Some(SecretString::from("gm-key".to_string())),
            ..DuplexConfig::default()
        };
        assert_eq!(config.url().unwrap(), "wss://example.test/live?key=gm-key");
    }

    #[test]
    fn input_and_output_rates_are_independent() {
        let config = DuplexConfig::default();
        assert_eq!(config.input_sample_rate, 16000);
        assert_eq!(config.output_sample_rate, 24000);
    }
}
