//! Endpoint detector: the sliding-frame state machine that turns a
//! monotonically growing PCM buffer into utterance boundaries.
//!
//! Byte-offset bookkeeping (growing buffer + cursor + per-utterance start
//! offset) follows a counters-plus-`reset()` shape for session runtime
//! state.

use crate::transcriber::Transcriber;

/// Trailing silence (in frames) after which an utterance is considered
/// closed. 16 frames × 30 ms ≈ 480 ms. Load-bearing contract value, not
/// configuration.
const SILENCE_FRAMES_LIMIT: u32 = 16;

/// Maximum utterance length before it is force-flushed, in milliseconds.
/// Load-bearing contract value, not configuration.
const MAX_UTTERANCE_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpdPhase {
    Idle,
    InSpeech,
    JustClosed,
}

/// One detected utterance, ready to hand to the session/result framing.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub start_sec: f32,
    pub end_sec: f32,
    pub text: String,
}

/// Endpoint detector state, owned by one ASR worker and reset at the top
/// of every session.
pub struct EpdState {
    frame_size: usize,
    frame_duration_ms: u32,
    sample_rate: u32,

    pcm: Vec<u8>,
    vad_index: usize,
    triggered: bool,
    epd_start: usize,
    silence_cnt: u32,
    phase: EpdPhase,
}

impl EpdState {
    pub fn new(frame_size: usize, frame_duration_ms: u32, sample_rate: u32) -> Self {
        Self {
            frame_size,
            frame_duration_ms,
            sample_rate,
            pcm: Vec::new(),
            vad_index: 0,
            triggered: false,
            epd_start: 0,
            silence_cnt: 0,
            phase: EpdPhase::Idle,
        }
    }

    /// Reset all per-session fields.
    pub fn reset(&mut self) {
        self.pcm.clear();
        self.vad_index = 0;
        self.triggered = false;
        self.epd_start = 0;
        self.silence_cnt = 0;
        self.phase = EpdPhase::Idle;
    }

    pub fn phase(&self) -> EpdPhase {
        self.phase
    }

    pub fn vad_index(&self) -> usize {
        self.vad_index
    }

    /// Raw PCM accumulated since the last [`reset`](Self::reset), for the
    /// optional per-session PCM dump.
    pub fn pcm(&self) -> &[u8] {
        &self.pcm
    }

    fn frame_start_sec(&self, byte_offset: usize) -> f32 {
        (byte_offset / self.frame_size) as f32 * (self.frame_duration_ms as f32 / 1000.0)
    }

    fn utterance_ms(&self) -> u64 {
        let frames = ((self.vad_index - self.epd_start) / self.frame_size) as u64;
        frames * self.frame_duration_ms as u64
    }

    /// Append newly received audio and advance through every complete
    /// frame not yet classified, running the IDLE/IN_SPEECH/JUST_CLOSED
    /// state machine below. Returns every utterance flushed as a result of
    /// this call, in order.
    pub fn process_chunk(
        &mut self,
        chunk: &[u8],
        classifier: &dyn crate::vad::FrameClassifier,
        transcriber: &dyn Transcriber,
        language: &str,
    ) -> Vec<Utterance> {
        self.pcm.extend_from_slice(chunk);
        let mut out = Vec::new();

        while self.vad_index + self.frame_size <= self.pcm.len() {
            let frame_bytes = &self.pcm[self.vad_index..self.vad_index + self.frame_size];
            let frame_samples = bytes_to_i16(frame_bytes);
            let speech = classifier.is_speech(&frame_samples, self.sample_rate);

            match (self.triggered, speech) {
                (false, true) => {
                    self.triggered = true;
                    self.epd_start = self.vad_index;
                    self.silence_cnt = 0;
                    self.phase = EpdPhase::InSpeech;
                }
                (false, false) => {
                    self.silence_cnt += 1;
                }
                (true, true) => {
                    if self.utterance_ms() > MAX_UTTERANCE_MS {
                        if let Some(u) = self.flush(transcriber, language) {
                            out.push(u);
                        }
                        self.triggered = false;
                        self.phase = EpdPhase::Idle;
                    }
                }
                (true, false) => {
                    if self.silence_cnt <= SILENCE_FRAMES_LIMIT {
                        self.silence_cnt += 1;
                    } else {
                        if let Some(u) = self.flush(transcriber, language) {
                            out.push(u);
                        }
                        self.triggered = false;
                        self.phase = EpdPhase::Idle;
                    }
                }
            }

            self.vad_index += self.frame_size;
        }

        out
    }

    /// Flush whatever utterance remains open, used when `%f` arrives while
    /// `triggered` is still true.
    pub fn flush_tail(&mut self, transcriber: &dyn Transcriber, language: &str) -> Option<Utterance> {
        if !self.triggered {
            return None;
        }
        let result = self.flush_region(self.epd_start, self.pcm.len(), transcriber, language);
        self.triggered = false;
        self.silence_cnt = 0;
        self.phase = EpdPhase::Idle;
        result
    }

    fn flush(&mut self, transcriber: &dyn Transcriber, language: &str) -> Option<Utterance> {
        let end = (self.vad_index + self.frame_size + 1).min(self.pcm.len());
        let result = self.flush_region(self.epd_start, end, transcriber, language);
        self.silence_cnt = 0;
        result
    }

    fn flush_region(
        &self,
        start: usize,
        end: usize,
        transcriber: &dyn Transcriber,
        language: &str,
    ) -> Option<Utterance> {
        if start >= end {
            return None;
        }
        let region = &self.pcm[start..end];
        let samples = bytes_to_i16(region);
        let segments = transcriber.transcribe(&samples, self.sample_rate, language).ok()?;
        let text: String = segments
            .into_iter()
            .map(|s| s.text)
            .collect::<Vec<_>>()
            .join(" ");
        if text.is_empty() {
            return None;
        }
        Some(Utterance {
            start_sec: self.frame_start_sec(start),
            end_sec: self.frame_start_sec(end),
            text,
        })
    }
}

fn bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}
