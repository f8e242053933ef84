//! Audio chunks and the sequential renderer.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::SpeechError;
use crate::side::Side;

/// Raw 16-bit signed little-endian PCM bytes as received from the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    bytes: Vec<u8>,
}

impl AudioChunk {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Decoded mono samples ready for a device.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioUnit {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioUnit {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Convert 16-bit LE PCM into samples normalized to [-1.0, 1.0).
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>, SpeechError> {
    if bytes.len() % 2 != 0 {
        return Err(SpeechError::DecodeError(format!(
            "PCM chunk has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect())
}

/// Identifies one `play` call so completions can be matched to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackToken(pub u64);

/// A sink that plays one unit at a time.
///
/// Implementations report completion asynchronously as
/// `SchedulerEvent::PlaybackFinished(token)`; they must never call back
/// into the scheduler from inside `play`.
pub trait AudioOutput: Send {
    fn play(&mut self, unit: AudioUnit, token: PlaybackToken) -> Result<(), SpeechError>;

    /// Halt current playback and discard anything queued on the device.
    fn stop(&mut self);
}

impl<O: AudioOutput + ?Sized> AudioOutput for Box<O> {
    fn play(&mut self, unit: AudioUnit, token: PlaybackToken) -> Result<(), SpeechError> {
        (**self).play(unit, token)
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

/// Outcome of a `play_next` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStep {
    /// A unit was handed to the device.
    Started(PlaybackToken),
    /// The queue was empty; nothing is playing.
    Drained,
}

/// Plays queued chunks in arrival order, one at a time.
pub struct AudioRenderer<O> {
    output: O,
    sample_rate: u32,
    current: Option<PlaybackToken>,
    next_token: u64,
}

impl<O: AudioOutput> AudioRenderer<O> {
    pub fn new(output: O, sample_rate: u32) -> Self {
        Self {
            output,
            sample_rate,
            current: None,
            next_token: 0,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.current.is_some()
    }

    /// Dequeue and play the front chunk of `queue`.
    ///
    /// Chunks that fail to decode or that the device rejects are skipped.
    pub fn play_next(&mut self, side: Side, queue: &mut VecDeque<AudioChunk>) -> RenderStep {
        while let Some(chunk) = queue.pop_front() {
            let samples = match decode_pcm16(chunk.as_bytes()) {
                Ok(samples) if samples.is_empty() => continue,
                Ok(samples) => samples,
                Err(e) => {
                    warn!(%side, error = %e, "Dropping undecodable chunk");
                    continue;
                }
            };

            let token = PlaybackToken(self.next_token);
            self.next_token += 1;

            let unit = AudioUnit {
                samples,
                sample_rate: self.sample_rate,
            };
            let duration_ms = unit.duration().as_millis() as u64;
            match self.output.play(unit, token) {
                Ok(()) => {
                    debug!(
                        %side,
                        token = token.0,
                        duration_ms,
                        remaining = queue.len(),
                        "Playing chunk"
                    );
                    self.current = Some(token);
                    return RenderStep::Started(token);
                }
                Err(e) => warn!(%side, error = %e, "Audio output rejected chunk"),
            }
        }

        self.current = None;
        RenderStep::Drained
    }

    /// Record that `token` finished. Returns false for stale tokens.
    pub fn finished(&mut self, token: PlaybackToken) -> bool {
        if self.current == Some(token) {
            self.current = None;
            true
        } else {
            false
        }
    }

    pub fn stop(&mut self) {
        self.output.stop();
        self.current = None;
    }
}
