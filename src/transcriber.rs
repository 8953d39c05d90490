//! Speech-to-text contract.
//!
//! Like [`crate::vad::FrameClassifier`], this is the external/swappable
//! boundary: the ASR worker owns one `Arc<dyn Transcriber>` per engine slot
//! and never inspects the model behind it. [`StubTranscriber`] is the
//! deterministic stand-in shipped here so the rest of the pipeline is
//! testable without model weights.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranscriberError {
    #[error("audio segment too short to transcribe ({0} samples)")]
    SegmentTooShort(usize),
    #[error("transcription backend failed: {0}")]
    Backend(String),
}

/// One recognized span of text within an utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Speech-to-text backend.
///
/// `transcribe` is synchronous and potentially slow (model inference); the
/// ASR worker runs it inside `tokio::task::spawn_blocking` rather than on
/// the async executor directly.
pub trait Transcriber: Send + Sync {
    fn transcribe(&self, pcm: &[i16], sample_rate: u32, language: &str) -> Result<Vec<Segment>, TranscriberError>;

    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Deterministic placeholder transcriber.
///
/// Returns one segment whose text is scaled to the input duration, exactly
/// the role a stub speech-to-text adapter plays when no model is wired up:
/// it exercises every caller of `Transcriber` (worker loop, session
/// relay, result framing) without needing real weights on disk.
pub struct StubTranscriber {
    min_audio_ms: u64,
}

impl StubTranscriber {
    pub fn new() -> Self {
        Self { min_audio_ms: 200 }
    }

    fn dummy_text(duration_ms: u64) -> String {
        match duration_ms {
            0..=999 => "test".to_string(),
            1000..=2999 => "test utterance".to_string(),
            _ => format!("test utterance of {duration_ms} milliseconds"),
        }
    }
}

impl Default for StubTranscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcriber for StubTranscriber {
    fn transcribe(&self, pcm: &[i16], sample_rate: u32, _language: &str) -> Result<Vec<Segment>, TranscriberError> {
        let duration_ms = (pcm.len() as u64 * 1000) / sample_rate.max(1) as u64;
        if duration_ms < self.min_audio_ms {
            return Err(TranscriberError::SegmentTooShort(pcm.len()));
        }
        Ok(vec![Segment {
            text: Self::dummy_text(duration_ms),
            start_ms: 0,
            end_ms: duration_ms,
        }])
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_of_duration_ms(ms: u64, sample_rate: u32) -> Vec<i16> {
        let n = (sample_rate as u64 * ms / 1000) as usize;
        vec![100i16; n]
    }

    #[test]
    fn short_segment_is_rejected() {
        let t = StubTranscriber::new();
        let pcm = pcm_of_duration_ms(50, 16000);
        let err = t.transcribe(&pcm, 16000, "en").unwrap_err();
        assert!(matches!(err, TranscriberError::SegmentTooShort(_)));
    }

    #[test]
    fn long_segment_produces_one_segment_scaled_to_duration() {
        let t = StubTranscriber::new();
        let pcm = pcm_of_duration_ms(2500, 16000);
        let segments = t.transcribe(&pcm, 16000, "en").unwrap();
        assert_eq!(segments.len(), 1);
        assert!(segments[0].end_ms >= 2400 && segments[0].end_ms <= 2600);
        assert_eq!(segments[0].text, "test utterance");
    }

    #[test]
    fn longer_duration_gets_longer_placeholder() {
        let t = StubTranscriber::new();
        let pcm = pcm_of_duration_ms(5000, 16000);
        let segments = t.transcribe(&pcm, 16000, "en").unwrap();
        assert!(segments[0].text.contains("milliseconds"));
    }
}
