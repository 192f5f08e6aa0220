//! Streaming multilingual recognition
//!
//! Captured PCM16 frames go out over a persistent socket in capture order.
//! The service runs voice-activity detection and answers with interim and
//! final transcript events. A turn ends on the first of: an explicit stop, an
//! `UtteranceEnd` event, a `speech_final` flag, or the socket closing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::SpeechInput;
use crate::voice::capture::{CaptureSession, FRAME_SAMPLES, Microphone, SAMPLE_RATE};
use crate::voice::events::InputEvents;
use crate::voice::session::{SessionGuard, SessionToken};
use crate::voice::types::{FinishedTurn, InputLanguage, SttProviderId, SttState};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const KEEPALIVE: &str = r#"{"type":"KeepAlive"}"#;
const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;

/// How long teardown waits for the writer to flush `CloseStream`
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Settings for the streaming connection
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub sample_rate: u32,
    pub frame_samples: usize,
    pub keepalive: Duration,
    pub utterance_end_ms: u32,
    pub endpointing_ms: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.deepgram.com/v1/listen".to_string(),
            model: "nova-3".to_string(),
            api_key: None,
            sample_rate: SAMPLE_RATE,
            frame_samples: FRAME_SAMPLES,
            keepalive: Duration::from_secs(8),
            utterance_end_ms: 1000,
            endpointing_ms: 300,
        }
    }
}

impl StreamingConfig {
    fn request(&self) -> Result<Request> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("invalid streaming URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("model", &self.model)
            .append_pair("language", "multi")
            .append_pair("encoding", "linear16")
            .append_pair("sample_rate", &self.sample_rate.to_string())
            .append_pair("channels", "1")
            .append_pair("interim_results", "true")
            .append_pair("punctuate", "true")
            .append_pair("smart_format", "true")
            .append_pair("vad_events", "true")
            .append_pair("utterance_end_ms", &self.utterance_end_ms.to_string())
            .append_pair("endpointing", &self.endpointing_ms.to_string());

        let mut request = url.as_str().into_client_request()?;
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Token {}", key.expose_secret()))
                .map_err(|e| Error::Config(format!("invalid API key header: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

/// Inbound event from the streaming recognition service
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ListenEvent {
    Results {
        channel: ResultChannel,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
    },
    UtteranceEnd {},
    SpeechStarted {},
    Metadata {},
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct ResultChannel {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// What the session should do in response to an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamAction {
    Transcript { text: String, is_final: bool },
    EndOfTurn,
}

/// Committed final segments plus the latest interim hypothesis
#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    committed: String,
    interim: String,
}

impl TranscriptAccumulator {
    pub fn apply(&mut self, event: ListenEvent) -> Vec<StreamAction> {
        match event {
            ListenEvent::Results {
                channel,
                is_final,
                speech_final,
            } => {
                let text = channel
                    .alternatives
                    .first()
                    .map(|a| a.transcript.trim().to_string())
                    .unwrap_or_default();

                if is_final {
                    if !text.is_empty() {
                        if !self.committed.is_empty() {
                            self.committed.push(' ');
                        }
                        self.committed.push_str(&text);
                    }
                    self.interim.clear();
                } else {
                    self.interim = text.clone();
                }

                let mut actions = Vec::new();
                if !text.is_empty() {
                    actions.push(StreamAction::Transcript {
                        text: self.text(),
                        is_final,
                    });
                }
                if speech_final {
                    actions.push(StreamAction::EndOfTurn);
                }
                actions
            }
            ListenEvent::UtteranceEnd {} => vec![StreamAction::EndOfTurn],
            ListenEvent::SpeechStarted {} | ListenEvent::Metadata {} | ListenEvent::Other => {
                Vec::new()
            }
        }
    }

    /// Everything heard so far, interim included
    #[must_use]
    pub fn text(&self) -> String {
        match (self.committed.is_empty(), self.interim.is_empty()) {
            (_, true) => self.committed.clone(),
            (true, false) => self.interim.clone(),
            (false, false) => format!("{} {}", self.committed, self.interim),
        }
    }

    pub fn clear(&mut self) {
        self.committed.clear();
        self.interim.clear();
    }
}

/// Why a session is being finalized
enum Trigger {
    User { trigger_callback: bool },
    EndOfTurn,
    Closed,
    Failed(Error),
}

struct Active {
    token: SessionToken,
    language: InputLanguage,
    capture: CaptureSession,
    shutdown: Option<oneshot::Sender<()>>,
    writer: JoinHandle<()>,
    reader: Option<JoinHandle<()>>,
}

struct Inner {
    mic: Arc<dyn Microphone>,
    events: Arc<dyn InputEvents>,
    config: StreamingConfig,
    guard: SessionGuard,
    active: Mutex<Option<Active>>,
    transcript: Mutex<TranscriptAccumulator>,
    user_stop: AtomicBool,
}

/// Streaming multilingual provider
pub struct StreamingInput {
    inner: Arc<Inner>,
}

impl StreamingInput {
    pub fn new(
        mic: Arc<dyn Microphone>,
        events: Arc<dyn InputEvents>,
        config: StreamingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                mic,
                events,
                config,
                guard: SessionGuard::new(),
                active: Mutex::new(None),
                transcript: Mutex::new(TranscriptAccumulator::default()),
                user_stop: AtomicBool::new(false),
            }),
        }
    }
}

impl Inner {
    fn transcript_text(&self) -> String {
        self.transcript
            .lock()
            .map(|t| t.text())
            .unwrap_or_default()
    }

    fn take_active(&self, token: &SessionToken) -> Option<Active> {
        let mut active = self.active.lock().ok()?;
        if active.as_ref().is_some_and(|a| a.token == *token) {
            active.take()
        } else {
            None
        }
    }

    /// Forward frames, keep-alives, and the final `CloseStream`
    async fn write_loop(
        mut sink: SplitSink<WsStream, Message>,
        mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
        mut shutdown: oneshot::Receiver<()>,
        keepalive: Duration,
    ) {
        let mut ticker = tokio::time::interval(keepalive);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    while let Ok(pcm) = frames.try_recv() {
                        if sink.send(Message::Binary(pcm)).await.is_err() {
                            break;
                        }
                    }
                    if let Err(e) = sink.send(Message::Text(CLOSE_STREAM.to_string())).await {
                        tracing::debug!(error = %e, "failed to send CloseStream");
                    }
                    if let Err(e) = sink.close().await {
                        tracing::debug!(error = %e, "failed to close stream socket");
                    }
                    break;
                }
                frame = frames.recv() => {
                    let Some(pcm) = frame else { break };
                    if let Err(e) = sink.send(Message::Binary(pcm)).await {
                        tracing::warn!(error = %e, "failed to send audio frame");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = sink.send(Message::Text(KEEPALIVE.to_string())).await {
                        tracing::debug!(error = %e, "keep-alive failed");
                        break;
                    }
                }
            }
        }
    }

    async fn read_loop(self: Arc<Self>, token: SessionToken, mut stream: SplitStream<WsStream>) {
        let mut failure = None;

        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if !self.guard.is_current(&token) {
                        return;
                    }
                    let event = match serde_json::from_str::<ListenEvent>(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            tracing::debug!(error = %e, "dropping malformed transcript event");
                            continue;
                        }
                    };
                    let actions = match self.transcript.lock() {
                        Ok(mut transcript) => transcript.apply(event),
                        Err(_) => Vec::new(),
                    };
                    for action in actions {
                        match action {
                            StreamAction::Transcript { text, is_final } => {
                                self.events.on_transcript(&text, is_final);
                            }
                            StreamAction::EndOfTurn => {
                                if self.finish(token, Trigger::EndOfTurn).await {
                                    return;
                                }
                            }
                        }
                    }
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "stream closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    failure = Some(Error::Transport(format!("streaming connection failed: {e}")));
                    break;
                }
            }
        }

        let trigger = failure.map_or(Trigger::Closed, Trigger::Failed);
        self.finish(token, trigger).await;
    }

    /// Finalize the turn if `token` is still live; returns whether it did
    async fn finish(&self, token: SessionToken, trigger: Trigger) -> bool {
        if matches!(trigger, Trigger::EndOfTurn) && self.transcript_text().trim().is_empty() {
            tracing::debug!(session = %token, "ignoring end-of-turn without transcript");
            return false;
        }
        if !self.guard.claim(&token) {
            return false;
        }
        let Some(mut active) = self.take_active(&token) else {
            return true;
        };

        // Finishing queues the partial last frame ahead of CloseStream
        let recording = active.capture.finish();
        if let Some(shutdown) = active.shutdown.take() {
            let _ = shutdown.send(());
        }
        if matches!(trigger, Trigger::User { .. }) {
            if let Some(reader) = &active.reader {
                reader.abort();
            }
        }
        if tokio::time::timeout(WRITER_DRAIN, active.writer).await.is_err() {
            tracing::debug!("stream writer did not drain in time");
        }

        let transcript = self.transcript_text().trim().to_string();
        tracing::debug!(
            session = %token,
            samples = recording.sample_count(),
            chars = transcript.len(),
            "streaming session finished"
        );

        let emit = match &trigger {
            Trigger::User { trigger_callback } => *trigger_callback,
            Trigger::EndOfTurn => true,
            Trigger::Closed => !transcript.is_empty(),
            Trigger::Failed(e) => {
                tracing::warn!(error = %e, "streaming recognition failed");
                self.events.on_error(e);
                !transcript.is_empty()
            }
        };
        if !emit {
            return true;
        }

        let audio = match recording.to_wav() {
            Ok(audio) => audio,
            Err(e) => {
                self.events.on_error(&e);
                return true;
            }
        };
        let user_initiated =
            matches!(trigger, Trigger::User { .. }) || self.user_stop.load(Ordering::SeqCst);
        self.events.on_stop(FinishedTurn {
            transcript,
            message_id: token.id(),
            language: active.language,
            audio,
            user_initiated,
        });
        true
    }

    fn fail_start(&self, error: Error) -> Result<()> {
        self.guard.invalidate();
        tracing::warn!(error = %error, "streaming recognition failed to start");
        self.events.on_error(&error);
        Err(error)
    }
}

#[async_trait]
impl SpeechInput for StreamingInput {
    fn id(&self) -> SttProviderId {
        SttProviderId::Streaming
    }

    fn state(&self) -> SttState {
        if self.inner.guard.current().is_some() {
            SttState::Listening
        } else {
            SttState::Idle
        }
    }

    async fn start(&self, language: InputLanguage) -> Result<()> {
        let inner = &self.inner;
        if inner.guard.current().is_some() {
            tracing::warn!("streaming recognition already listening");
            return Ok(());
        }

        inner.user_stop.store(false, Ordering::SeqCst);
        if let Ok(mut transcript) = inner.transcript.lock() {
            transcript.clear();
        }
        let token = inner.guard.mint();

        let request = match inner.config.request() {
            Ok(request) => request,
            Err(e) => return inner.fail_start(e),
        };
        let socket = match tokio_tungstenite::connect_async(request).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                return inner.fail_start(Error::Transport(format!(
                    "failed to connect to streaming recognizer: {e}"
                )));
            }
        };
        if !inner.guard.is_current(&token) {
            tracing::debug!("stopped while connecting");
            return Ok(());
        }

        let (capture, frames) = match CaptureSession::start_streaming(
            inner.mic.as_ref(),
            inner.config.sample_rate,
            inner.config.frame_samples,
        ) {
            Ok(started) => started,
            Err(e) => return inner.fail_start(e),
        };

        let (sink, stream) = socket.split();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let writer = tokio::spawn(Inner::write_loop(
            sink,
            frames,
            shutdown_rx,
            inner.config.keepalive,
        ));

        if let Ok(mut active) = inner.active.lock() {
            *active = Some(Active {
                token,
                language,
                capture,
                shutdown: Some(shutdown_tx),
                writer,
                reader: None,
            });
        }

        tracing::info!(session = %token, "streaming recognition started");
        inner.events.on_start(&token.id(), language);

        let reader = tokio::spawn(Arc::clone(inner).read_loop(token, stream));
        if let Ok(mut active) = inner.active.lock() {
            if let Some(a) = active.as_mut().filter(|a| a.token == token) {
                a.reader = Some(reader);
            }
        }

        Ok(())
    }

    async fn stop(&self, trigger_callback: bool) {
        let inner = &self.inner;
        inner.user_stop.store(true, Ordering::SeqCst);
        let Some(token) = inner.guard.current() else {
            return;
        };
        inner.finish(token, Trigger::User { trigger_callback }).await;
    }
}
