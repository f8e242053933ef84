//! Audio outputs.
//!
//! The rodio output stream is not `Send` on every platform, so it lives on a
//! dedicated thread driven by commands. Finished units are reported back to
//! the scheduler as [`SchedulerEvent::PlaybackFinished`].
//!
//! The thread notices a drained sink on its next poll, so consecutive units
//! can be separated by up to `POLL_INTERVAL` plus one channel round trip.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
#[cfg(feature = "playback")]
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
#[cfg(feature = "playback")]
use std::thread;
#[cfg(feature = "playback")]
use std::time::Duration;

#[cfg(feature = "playback")]
use rodio::buffer::SamplesBuffer;
#[cfg(feature = "playback")]
use tracing::debug;
use tracing::{info, warn};

use crate::audio::{AudioOutput, AudioUnit, PlaybackToken};
use crate::error::SpeechError;
use crate::scheduler::{EventSender, SchedulerEvent};

/// How often the device thread checks whether the sink ran dry.
#[cfg(feature = "playback")]
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[cfg(feature = "playback")]
enum DeviceCommand {
    Play(AudioUnit, PlaybackToken),
    Stop,
}

/// Plays units on the default output device.
#[cfg(feature = "playback")]
pub struct RodioOutput {
    commands: Sender<DeviceCommand>,
}

#[cfg(feature = "playback")]
impl RodioOutput {
    /// Open the default device on a new thread.
    pub fn open(events: EventSender) -> Result<Self, SpeechError> {
        let (commands, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        thread::Builder::new()
            .name("debatevoice-audio".to_string())
            .spawn(move || run_device(command_rx, ready_tx, events))
            .map_err(|e| SpeechError::AudioError(format!("Failed to spawn audio thread: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| SpeechError::AudioError("Audio thread exited during startup".to_string()))??;

        Ok(Self { commands })
    }
}

#[cfg(feature = "playback")]
impl AudioOutput for RodioOutput {
    fn play(&mut self, unit: AudioUnit, token: PlaybackToken) -> Result<(), SpeechError> {
        self.commands
            .send(DeviceCommand::Play(unit, token))
            .map_err(|_| SpeechError::AudioError("Audio thread is gone".to_string()))
    }

    fn stop(&mut self) {
        let _ = self.commands.send(DeviceCommand::Stop);
    }
}

#[cfg(feature = "playback")]
fn run_device(
    commands: Receiver<DeviceCommand>,
    ready: Sender<Result<(), SpeechError>>,
    events: EventSender,
) {
    let stream = match rodio::OutputStreamBuilder::open_default_stream() {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(SpeechError::AudioError(format!(
                "Failed to open audio device: {}",
                e
            ))));
            return;
        }
    };
    let sink = rodio::Sink::connect_new(stream.mixer());
    let _ = ready.send(Ok(()));
    info!("Audio device opened");

    let mut current: Option<PlaybackToken> = None;
    loop {
        match commands.recv_timeout(POLL_INTERVAL) {
            Ok(DeviceCommand::Play(unit, token)) => {
                sink.append(SamplesBuffer::new(1, unit.sample_rate, unit.samples));
                current = Some(token);
            }
            Ok(DeviceCommand::Stop) => {
                sink.stop();
                current = None;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some(token) = current {
            if sink.empty() {
                current = None;
                if events.send(SchedulerEvent::PlaybackFinished(token)).is_err() {
                    break;
                }
            }
        }
    }
    debug!("Audio device closed");
}

/// Discards audio, reporting each unit finished as soon as it is queued.
pub struct NullOutput {
    events: EventSender,
}

impl NullOutput {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }
}

impl AudioOutput for NullOutput {
    fn play(&mut self, _unit: AudioUnit, token: PlaybackToken) -> Result<(), SpeechError> {
        self.events
            .send(SchedulerEvent::PlaybackFinished(token))
            .map_err(|_| SpeechError::AudioError("Scheduler is gone".to_string()))
    }

    fn stop(&mut self) {}
}

/// Writes every rendered unit to a 16-bit mono WAV file, then forwards it.
pub struct WavRecorder<O> {
    inner: O,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
}

impl<O: AudioOutput> WavRecorder<O> {
    pub fn create<P: AsRef<Path>>(path: P, sample_rate: u32, inner: O) -> Result<Self, SpeechError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path.as_ref(), spec)?;
        info!(path = %path.as_ref().display(), "Recording speech to WAV");

        Ok(Self {
            inner,
            writer: Some(writer),
        })
    }

    /// Flush and close the file.
    pub fn finalize(&mut self) -> Result<(), SpeechError> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }

    fn record(&mut self, unit: &AudioUnit) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let written = unit.samples.iter().try_for_each(|&sample| {
            writer.write_sample((sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        });
        if let Err(e) = written {
            warn!(error = %e, "Stopping WAV recording");
            self.writer = None;
        }
    }
}

impl<O: AudioOutput> AudioOutput for WavRecorder<O> {
    fn play(&mut self, unit: AudioUnit, token: PlaybackToken) -> Result<(), SpeechError> {
        self.record(&unit);
        self.inner.play(unit, token)
    }

    fn stop(&mut self) {
        self.inner.stop();
    }
}

impl<O> Drop for WavRecorder<O> {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                warn!(error = %e, "Failed to finalize WAV file");
            }
        }
    }
}
