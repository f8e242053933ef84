//! End-to-end sessions against an in-process synthesis server.

use std::time::{Duration, Instant};

use debatevoice_core::protocol::encode_audio_payload;
use debatevoice_core::{Config, NullOutput, Side, SpeechEvent, SpeechService, WavRecorder, default_config};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

type Received = Vec<(Instant, Value)>;

/// What a scripted server saw, reported as it happens.
#[derive(Debug, PartialEq)]
enum Seen {
    Opened(usize),
    FirstMessage(usize, String),
    ChunkSent(usize),
    Closed(usize),
}

#[derive(Clone, Copy)]
enum Script {
    /// Read everything, answer nothing.
    Silent,
    /// Acknowledge the handshake and send one chunk, but never complete.
    StallAfterChunk,
}

fn pcm(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// Serve `connections` sessions in turn, streaming `chunks` for each.
async fn spawn_server(connections: usize, chunks: Vec<Vec<u8>>) -> (String, JoinHandle<Vec<Received>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let task = tokio::spawn(async move {
        let mut sessions = Vec::new();
        for _ in 0..connections {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let mut received = Vec::new();

            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                let value: Value = serde_json::from_str(&text).unwrap();
                let event_type = value["event_type"].as_str().unwrap_or_default().to_string();
                received.push((Instant::now(), value));

                match event_type.as_str() {
                    "speech.update" => {
                        let ack = json!({"id": "ack", "event_type": "speech.updated"});
                        ws.send(Message::Text(ack.to_string())).await.unwrap();
                    }
                    "input_text_buffer.complete" => {
                        for (i, chunk) in chunks.iter().enumerate() {
                            let update = json!({
                                "id": format!("audio-{}", i),
                                "event_type": "speech.audio.update",
                                "data": { "delta": encode_audio_payload(chunk) }
                            });
                            ws.send(Message::Text(update.to_string())).await.unwrap();
                        }
                        let done = json!({"id": "done", "event_type": "speech.audio.completed"});
                        ws.send(Message::Text(done.to_string())).await.unwrap();
                    }
                    _ => {}
                }
            }
            sessions.push(received);
        }
        sessions
    });

    (url, task)
}

/// Accept connections forever, running `script` on each.
async fn spawn_scripted_server(script: Script) -> (String, UnboundedReceiver<Seen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, rx) = unbounded_channel();

    tokio::spawn(async move {
        let mut n = 0;
        while let Ok((tcp, _)) = listener.accept().await {
            n += 1;
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(tcp).await else {
                    return;
                };
                let _ = tx.send(Seen::Opened(n));
                let mut first = true;

                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let value: Value = serde_json::from_str(&text).unwrap();
                    let event_type = value["event_type"].as_str().unwrap_or_default().to_string();
                    if first {
                        first = false;
                        let _ = tx.send(Seen::FirstMessage(n, event_type.clone()));
                    }

                    if let Script::StallAfterChunk = script {
                        match event_type.as_str() {
                            "speech.update" => {
                                let ack = json!({"id": "ack", "event_type": "speech.updated"});
                                let _ = ws.send(Message::Text(ack.to_string())).await;
                            }
                            "input_text_buffer.complete" => {
                                let update = json!({
                                    "id": "audio-0",
                                    "event_type": "speech.audio.update",
                                    "data": { "delta": encode_audio_payload(&pcm(&[5, 6])) }
                                });
                                let _ = ws.send(Message::Text(update.to_string())).await;
                                let _ = tx.send(Seen::ChunkSent(n));
                            }
                            _ => {}
                        }
                    }
                }
                let _ = tx.send(Seen::Closed(n));
            });
        }
    });

    (url, rx)
}

async fn next_seen(seen: &mut UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(10), seen.recv())
        .await
        .expect("server saw nothing")
        .expect("server stopped")
}

async fn next_event(events: &mut UnboundedReceiver<SpeechEvent>) -> SpeechEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("no speech event")
        .expect("service stopped")
}

fn test_config(url: &str) -> Config {
    let mut config = default_config();
    config.speech.ws_url = url.to_string();
    config.speech.sample_rate = 16000;
    config.speech.completion_timeout_secs = 5;
    config.voices.positive_voice = "pos-voice".to_string();
    config.voices.negative_voice = "neg-voice".to_string();
    config
}

fn event_channel() -> (
    Box<dyn Fn(SpeechEvent) + Send + Sync>,
    UnboundedReceiver<SpeechEvent>,
) {
    let (tx, rx) = unbounded_channel();
    let callback: Box<dyn Fn(SpeechEvent) + Send + Sync> = Box::new(move |event| {
        let _ = tx.send(event);
    });
    (callback, rx)
}

/// Collect events up to and including the first `TurnEnded`.
async fn until_turn_end(events: &mut UnboundedReceiver<SpeechEvent>) -> Vec<SpeechEvent> {
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            let ended = matches!(event, SpeechEvent::TurnEnded { .. });
            seen.push(event);
            if ended {
                break;
            }
        }
    })
    .await
    .expect("turn did not end");
    seen
}

fn event_types(received: &Received) -> Vec<String> {
    received
        .iter()
        .map(|(_, v)| v["event_type"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn speaks_one_utterance_end_to_end() {
    let chunks = vec![pcm(&[100, 101]), pcm(&[200]), pcm(&[300, 301, 302])];
    let (url, server) = spawn_server(1, chunks).await;
    let wav_path = std::env::temp_dir().join(format!("debatevoice-e2e-{}.wav", std::process::id()));

    let (callback, mut events) = event_channel();
    let path = wav_path.clone();
    let service = SpeechService::spawn(
        &test_config(&url),
        move |tx| WavRecorder::create(&path, 16000, NullOutput::new(tx)),
        Some(callback),
    )
    .unwrap();

    service.submit("hello", Side::Positive).unwrap();
    let seen = until_turn_end(&mut events).await;
    service.shutdown().await;

    assert_eq!(
        seen,
        vec![
            SpeechEvent::TurnStarted { side: Side::Positive },
            SpeechEvent::TurnEnded {
                side: Some(Side::Positive)
            },
        ]
    );

    let sessions = server.await.unwrap();
    let received = &sessions[0];
    assert_eq!(
        event_types(received)[..3],
        [
            "speech.update".to_string(),
            "input_text_buffer.append".to_string(),
            "input_text_buffer.complete".to_string()
        ]
    );
    assert_eq!(received[0].1["data"]["output_audio"]["voice_id"], "pos-voice");
    assert_eq!(received[0].1["data"]["output_audio"]["pcm_config"]["sample_rate"], 16000);
    assert_eq!(received[1].1["data"]["delta"], "hello");
    // Timestamps are taken on receipt, so a late read of the append can
    // shave a few milliseconds off the 300ms the client waited.
    assert!(received[2].0.duration_since(received[1].0) >= Duration::from_millis(280));

    let mut reader = hound::WavReader::open(&wav_path).unwrap();
    let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples, vec![100, 101, 200, 300, 301, 302]);
    let _ = std::fs::remove_file(&wav_path);
}

#[tokio::test]
async fn pending_utterance_follows_without_idle() {
    let (url, server) = spawn_server(2, vec![pcm(&[1, 2, 3])]).await;

    let (callback, mut events) = event_channel();
    let service = SpeechService::spawn(
        &test_config(&url),
        |tx| Ok(NullOutput::new(tx)),
        Some(callback),
    )
    .unwrap();

    service.submit("A", Side::Positive).unwrap();
    service.submit("B", Side::Negative).unwrap();
    let seen = until_turn_end(&mut events).await;
    service.shutdown().await;

    assert_eq!(
        seen,
        vec![
            SpeechEvent::TurnStarted { side: Side::Positive },
            SpeechEvent::TurnStarted { side: Side::Negative },
            SpeechEvent::TurnEnded {
                side: Some(Side::Negative)
            },
        ]
    );

    let sessions = server.await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0][1].1["data"]["delta"], "A");
    assert_eq!(sessions[1][0].1["data"]["output_audio"]["voice_id"], "neg-voice");
    assert_eq!(sessions[1][1].1["data"]["delta"], "B");
}

#[tokio::test]
async fn refused_connection_still_ends_turn() {
    // Bind then drop so nothing is listening on the port.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let (callback, mut events) = event_channel();
    let service = SpeechService::spawn(
        &test_config(&url),
        |tx| Ok(NullOutput::new(tx)),
        Some(callback),
    )
    .unwrap();

    service.submit("nobody is listening", Side::Negative).unwrap();
    let seen = until_turn_end(&mut events).await;
    service.shutdown().await;

    assert_eq!(seen.len(), 3);
    assert!(matches!(
        seen[1],
        SpeechEvent::SessionFailed {
            side: Side::Negative,
            ..
        }
    ));
    assert_eq!(
        seen[2],
        SpeechEvent::TurnEnded {
            side: Some(Side::Negative)
        }
    );
}

#[tokio::test]
async fn silent_server_times_out_and_ends_turn() {
    let (url, mut server) = spawn_scripted_server(Script::Silent).await;
    let mut config = test_config(&url);
    config.speech.completion_timeout_secs = 1;

    let (callback, mut events) = event_channel();
    let service = SpeechService::spawn(&config, |tx| Ok(NullOutput::new(tx)), Some(callback)).unwrap();

    let started = Instant::now();
    service.submit("is anyone there", Side::Positive).unwrap();
    let seen = until_turn_end(&mut events).await;

    assert!(started.elapsed() >= Duration::from_millis(900));
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], SpeechEvent::TurnStarted { side: Side::Positive });
    assert!(matches!(
        seen[1],
        SpeechEvent::SessionFailed {
            side: Side::Positive,
            ..
        }
    ));
    assert_eq!(
        seen[2],
        SpeechEvent::TurnEnded {
            side: Some(Side::Positive)
        }
    );
    assert_eq!(next_seen(&mut server).await, Seen::Opened(1));

    // The scheduler is idle again and takes new work.
    service.reset().unwrap();
    service.submit("second try", Side::Negative).unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SpeechEvent::TurnStarted { side: Side::Negative }
    );
    service.shutdown().await;
}

#[tokio::test]
async fn reset_closes_live_connection() {
    let (url, mut server) = spawn_scripted_server(Script::StallAfterChunk).await;

    let (callback, mut events) = event_channel();
    let service = SpeechService::spawn(
        &test_config(&url),
        |tx| Ok(NullOutput::new(tx)),
        Some(callback),
    )
    .unwrap();

    service.submit("first", Side::Positive).unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SpeechEvent::TurnStarted { side: Side::Positive }
    );
    assert_eq!(next_seen(&mut server).await, Seen::Opened(1));
    assert_eq!(
        next_seen(&mut server).await,
        Seen::FirstMessage(1, "speech.update".to_string())
    );
    assert_eq!(next_seen(&mut server).await, Seen::ChunkSent(1));

    service.reset().unwrap();
    assert_eq!(next_seen(&mut server).await, Seen::Closed(1));

    service.submit("second", Side::Negative).unwrap();
    assert_eq!(next_seen(&mut server).await, Seen::Opened(2));
    assert_eq!(
        next_seen(&mut server).await,
        Seen::FirstMessage(2, "speech.update".to_string())
    );

    // Reset emits nothing; the next notification is the new turn.
    assert_eq!(
        next_event(&mut events).await,
        SpeechEvent::TurnStarted { side: Side::Negative }
    );
    service.shutdown().await;
}
