//! Speech output tests
//!
//! The chunk sequencer runs against a fake renderer and sink; the remote
//! renderer talks to a local HTTP server.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_speech::voice::pcm::samples_to_wav;
use parley_speech::voice::playback::{AudioSink, AudioUnlock, PLAYBACK_SAMPLE_RATE};
use parley_speech::voice::tts::{ChunkRenderer, RemoteSpeech, SequencedOutput, SpeechOutput};
use parley_speech::voice::{EventBridge, OutputEvents, TtsState};
use parley_speech::{SequenceOutcome, SpeechChunk, SpeechEvents, TtsProviderId};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

mod common;
use common::{Event, FakeRenderer, FakeSink, Recorder};

fn bridge(recorder: &Arc<Recorder>) -> Arc<dyn OutputEvents> {
    let events: Arc<dyn SpeechEvents> = recorder.clone();
    EventBridge::shared(events)
}

fn output(
    sink: &Arc<FakeSink>,
    recorder: &Arc<Recorder>,
) -> Arc<SequencedOutput<FakeRenderer>> {
    Arc::new(SequencedOutput::new(
        TtsProviderId::Device,
        FakeRenderer::default(),
        sink.clone(),
        bridge(recorder),
    ))
}

fn chunks(texts: &[&str]) -> Vec<SpeechChunk> {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| SpeechChunk::new(*text, Some("FR"), (i + 1).to_string()))
        .collect()
}

#[tokio::test]
async fn test_chunks_play_in_order() {
    let sink = FakeSink::new(Duration::from_millis(5));
    let recorder = Recorder::new();
    let tts = output(&sink, &recorder);

    let outcome = tts.speak(chunks(&["Bonjour.", "Comment ça va ?", "Très bien."])).await;

    assert_eq!(outcome, SequenceOutcome::Completed);
    assert_eq!(
        *tts.renderer().rendered.lock().unwrap(),
        vec!["Bonjour.", "Comment ça va ?", "Très bien."]
    );
    assert_eq!(
        recorder.agent_trail(),
        vec!["start:1", "end:1", "start:2", "end:2", "start:3", "end:3", "complete"]
    );
    assert_eq!(sink.plays.load(Ordering::SeqCst), 3);
    assert_eq!(tts.state(), TtsState::Idle);
}

#[tokio::test]
async fn test_sequences_of_every_length_complete_once() {
    for len in 0..4 {
        let sink = FakeSink::new(Duration::ZERO);
        let recorder = Recorder::new();
        let tts = output(&sink, &recorder);
        let texts: Vec<String> = (0..len).map(|i| format!("Phrase {i}.")).collect();
        let texts: Vec<&str> = texts.iter().map(String::as_str).collect();

        let outcome = tts.speak(chunks(&texts)).await;

        assert_eq!(outcome, SequenceOutcome::Completed);
        let trail = recorder.agent_trail();
        let starts = trail.iter().filter(|e| e.starts_with("start:")).count();
        let ends = trail.iter().filter(|e| e.starts_with("end:")).count();
        assert_eq!((starts, ends), (len, len), "trail for {len} chunks: {trail:?}");
        assert_eq!(trail.last().map(String::as_str), Some("complete"));
        assert_eq!(recorder.count(|e| *e == Event::AgentComplete), 1);
        assert_eq!(sink.plays.load(Ordering::SeqCst), len);
        assert_eq!(tts.state(), TtsState::Idle);
    }
}

#[tokio::test]
async fn test_empty_chunks_are_filtered() {
    let sink = FakeSink::new(Duration::ZERO);
    let recorder = Recorder::new();
    let tts = output(&sink, &recorder);

    tts.speak(chunks(&["Salut", "   ", "", "À bientôt"])).await;

    assert_eq!(
        recorder.agent_trail(),
        vec!["start:1", "end:1", "start:4", "end:4", "complete"]
    );
    assert_eq!(tts.renderer().rendered.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_render_skips_only_that_chunk() {
    let sink = FakeSink::new(Duration::ZERO);
    let recorder = Recorder::new();
    let tts = output(&sink, &recorder);

    let outcome = tts.speak(chunks(&["Un", "broken deux", "Trois"])).await;

    assert_eq!(outcome, SequenceOutcome::Completed);
    assert_eq!(
        recorder.agent_trail(),
        vec!["start:1", "end:1", "start:2", "end:2", "start:3", "end:3", "complete"]
    );
    assert_eq!(sink.plays.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.count(|e| matches!(e, Event::Error(..))), 0);
}

#[tokio::test]
async fn test_speak_while_speaking_is_refused() {
    let sink = FakeSink::new(Duration::from_millis(200));
    let recorder = Recorder::new();
    let tts = output(&sink, &recorder);

    let first = tokio::spawn({
        let tts = tts.clone();
        async move { tts.speak(chunks(&["Premier"])).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_ne!(tts.state(), TtsState::Idle);

    let second = tts.speak(chunks(&["Second"])).await;
    assert_eq!(second, SequenceOutcome::AlreadySpeaking);

    assert_eq!(first.await.unwrap(), SequenceOutcome::Completed);
    assert_eq!(*tts.renderer().rendered.lock().unwrap(), vec!["Premier"]);
    assert_eq!(recorder.count(|e| *e == Event::AgentComplete), 1);
}

#[tokio::test]
async fn test_stop_halts_without_sequence_complete() {
    let sink = FakeSink::new(Duration::from_secs(5));
    let recorder = Recorder::new();
    let tts = output(&sink, &recorder);

    let speaking = tokio::spawn({
        let tts = tts.clone();
        async move { tts.speak(chunks(&["Un", "Deux", "Trois"])).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    tts.stop();

    let outcome = tokio::time::timeout(Duration::from_secs(1), speaking)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, SequenceOutcome::Stopped);
    assert_eq!(recorder.agent_trail(), vec!["start:1", "end:1"]);
    assert_eq!(*tts.renderer().rendered.lock().unwrap(), vec!["Un"]);
    assert!(sink.halts.load(Ordering::SeqCst) >= 1);
    assert_eq!(tts.state(), TtsState::Idle);
}

#[tokio::test]
async fn test_cancel_completes_sequence_once() {
    let sink = FakeSink::new(Duration::from_secs(5));
    let recorder = Recorder::new();
    let tts = output(&sink, &recorder);

    let speaking = tokio::spawn({
        let tts = tts.clone();
        async move { tts.speak(chunks(&["Un", "Deux"])).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    tts.cancel();
    tts.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(1), speaking)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome, SequenceOutcome::Cancelled);
    assert_eq!(recorder.agent_trail(), vec!["start:1", "end:1", "complete"]);
}

#[tokio::test]
async fn test_stop_when_idle_is_a_no_op() {
    let sink = FakeSink::new(Duration::ZERO);
    let recorder = Recorder::new();
    let tts = output(&sink, &recorder);

    tts.stop();
    tts.cancel();
    assert!(recorder.events().is_empty());

    // A later sequence is unaffected by the earlier stop
    let outcome = tts.speak(chunks(&["Encore"])).await;
    assert_eq!(outcome, SequenceOutcome::Completed);
}

#[tokio::test]
async fn test_blocked_playback_retries_after_unlock() {
    let sink = FakeSink::new(Duration::ZERO);
    let recorder = Recorder::new();
    let dyn_sink: Arc<dyn AudioSink> = sink.clone();
    let unlock = Arc::new(AudioUnlock::new(dyn_sink));
    let tts = output_with_unlock(&sink, &recorder, &unlock);

    sink.block_next(1);
    tts.speak(chunks(&["Bonjour"])).await;

    assert!(unlock.is_unlocked());
    // Priming clip plus the retried chunk
    assert_eq!(sink.plays.load(Ordering::SeqCst), 2);
    assert_eq!(recorder.count(|e| matches!(e, Event::Error(..))), 0);
}

#[tokio::test]
async fn test_blocked_retry_failure_surfaces_interaction_error() {
    let sink = FakeSink::new(Duration::ZERO);
    let recorder = Recorder::new();
    let dyn_sink: Arc<dyn AudioSink> = sink.clone();
    let unlock = Arc::new(AudioUnlock::new(dyn_sink));
    let tts = output_with_unlock(&sink, &recorder, &unlock);

    // The chunk and the unlock priming are both refused
    sink.block_next(2);
    let outcome = tts.speak(chunks(&["Bonjour", "Merci"])).await;

    assert_eq!(outcome, SequenceOutcome::Completed);
    let errors: Vec<_> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Error(message, context) => Some((message, context)),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].0.contains("requires interaction"));
    assert_eq!(errors[0].1.as_deref(), Some("1"));

    // The sequence carried on to the second chunk
    assert_eq!(
        recorder.agent_trail(),
        vec!["start:1", "end:1", "start:2", "end:2", "complete"]
    );
}

fn output_with_unlock(
    sink: &Arc<FakeSink>,
    recorder: &Arc<Recorder>,
    unlock: &Arc<AudioUnlock>,
) -> SequencedOutput<FakeRenderer> {
    SequencedOutput::new(
        TtsProviderId::Openai,
        FakeRenderer::default(),
        sink.clone(),
        bridge(recorder),
    )
    .with_unlock(unlock.clone())
}

/// Minimal HTTP server: one request per connection, 500 for texts containing "middle"
async fn render_server() -> (String, Arc<Mutex<Vec<Value>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let wav = samples_to_wav(&[0.0; 480], PLAYBACK_SAMPLE_RATE).unwrap();

    let seen = bodies.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let body = read_request_body(&mut socket).await;
            let json: Value = serde_json::from_slice(&body).unwrap();
            let fail = json["text"].as_str().unwrap_or_default().contains("middle");
            seen.lock().unwrap().push(json);

            if fail {
                let message = b"renderer exploded";
                let head = format!(
                    "HTTP/1.1 500 Internal Server Error\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    message.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(message).await.unwrap();
            } else {
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: audio/wav\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    wav.len()
                );
                socket.write_all(head.as_bytes()).await.unwrap();
                socket.write_all(&wav).await.unwrap();
            }
            socket.shutdown().await.ok();
        }
    });

    (format!("http://{addr}/api/tts"), bodies)
}

async fn read_request_body(socket: &mut tokio::net::TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 1024];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before headers");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
    let length: usize = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .map_or(0, |v| v.trim().parse().unwrap());

    while buf.len() < header_end + length {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before body");
        buf.extend_from_slice(&chunk[..n]);
    }
    buf[header_end..header_end + length].to_vec()
}

#[tokio::test]
async fn test_remote_failure_skips_middle_chunk() {
    let (url, bodies) = render_server().await;
    let sink = FakeSink::new(Duration::ZERO);
    let recorder = Recorder::new();
    let tts = SequencedOutput::new(
        TtsProviderId::Openai,
        RemoteSpeech::endpoint(url, TtsProviderId::Openai, "fr"),
        sink.clone(),
        bridge(&recorder),
    );

    let outcome = tts
        .speak(vec![
            SpeechChunk::new("Bonjour", Some("FR"), "a"),
            SpeechChunk::new("the middle one", Some("EN"), "b"),
            SpeechChunk::new("Au revoir", None, "c"),
        ])
        .await;

    assert_eq!(outcome, SequenceOutcome::Completed);
    assert_eq!(
        recorder.agent_trail(),
        vec!["start:a", "end:a", "start:b", "end:b", "start:c", "end:c", "complete"]
    );
    assert_eq!(sink.plays.load(Ordering::SeqCst), 2);

    let bodies = bodies.lock().unwrap();
    assert_eq!(bodies.len(), 3);
    assert_eq!(bodies[0]["text"], "Bonjour");
    assert_eq!(bodies[0]["language"], "FR");
    assert_eq!(bodies[0]["learningLanguage"], "fr");
    assert_eq!(bodies[0]["provider"], "openai");
    // Untagged chunks fall back to the learning language
    assert_eq!(bodies[2]["language"], "fr");
}

#[tokio::test]
async fn test_remote_renderer_reports_status() {
    let (url, _bodies) = render_server().await;
    let speech = RemoteSpeech::endpoint(url, TtsProviderId::Elevenlabs, "es");

    let err = speech
        .render(&SpeechChunk::new("middle", None, "x"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"));
    assert_eq!(speech.provider(), TtsProviderId::Elevenlabs);
}
