//! Audio accumulation and normalization for the live transcription pipeline.
//!
//! [`AudioAccumulator`] buffers raw chunks from the ingest stream and decides
//! when enough audio exists to transcribe. Normalization converts whatever
//! container the client sends into 16 kHz mono 16-bit PCM WAV, which every
//! transcription provider accepts.

use std::io::Cursor;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;

use crate::config::AudioConfig;

/// Target sample rate for all provider-bound audio.
pub const SAMPLE_RATE: u32 = 16_000;

/// WAV payloads smaller than this are almost certainly silence or
/// encoder noise and are rejected before reaching any provider.
pub const MIN_WAV_BYTES: usize = 4_000;

/// EBML header that opens a WebM/Matroska stream.
const WEBM_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

// ── Audio accumulator ─────────────────────────────────────────────

/// Buffers raw audio chunks and signals when a transcription window is ready.
///
/// A window is ready only when all three thresholds hold at once: elapsed
/// time since the last flush, chunk count, and buffered byte size. There are
/// no partial or overlapping windows; each ready event consumes the entire
/// buffer, and callers must [`clear`](Self::clear) only after the data has
/// been dispatched successfully, otherwise the audio is lost.
#[derive(Debug)]
pub struct AudioAccumulator {
    buffer: Vec<u8>,
    chunk_count: u32,
    last_flush: Instant,
    interval: Duration,
    min_chunks: u32,
    min_bytes: usize,
}

impl AudioAccumulator {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            buffer: Vec::new(),
            chunk_count: 0,
            last_flush: Instant::now(),
            interval: Duration::from_secs_f64(config.interval_secs),
            min_chunks: config.min_chunks,
            min_bytes: config.min_bytes,
        }
    }

    /// Append a chunk. Returns true when the buffer is ready to transcribe.
    pub fn add_chunk(&mut self, chunk: &[u8]) -> bool {
        self.add_chunk_at(chunk, Instant::now())
    }

    fn add_chunk_at(&mut self, chunk: &[u8], now: Instant) -> bool {
        self.buffer.extend_from_slice(chunk);
        self.chunk_count += 1;

        let elapsed = now.saturating_duration_since(self.last_flush);
        let ready = elapsed >= self.interval
            && self.chunk_count >= self.min_chunks
            && self.buffer.len() >= self.min_bytes;

        if ready {
            tracing::info!(
                chunks = self.chunk_count,
                bytes = self.buffer.len(),
                elapsed_secs = elapsed.as_secs_f64(),
                "Audio buffer ready for transcription"
            );
        }

        ready
    }

    /// The buffered bytes, without clearing.
    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    /// Reset buffer, chunk counter, and flush timer together.
    pub fn clear(&mut self) {
        self.clear_at(Instant::now());
    }

    fn clear_at(&mut self, now: Instant) {
        self.buffer.clear();
        self.chunk_count = 0;
        self.last_flush = now;
    }

    pub fn has_data(&self) -> bool {
        self.chunk_count > 0
    }
}

// ── Normalization ─────────────────────────────────────────────────

/// Normalize arbitrary client audio into a WAV payload for providers.
///
/// WAV input passes through untouched. Anything else (WebM from browser
/// recorders, MP3, OGG, ...) is converted to 16 kHz mono s16le via ffmpeg;
/// if conversion fails the bytes are treated as raw PCM and wrapped in a
/// WAV container. Returns `None` when the result is too small to contain
/// real speech.
pub async fn normalize_to_wav(audio: &[u8]) -> Option<Vec<u8>> {
    if audio.len() < 4 {
        return None;
    }

    let wav = if audio.starts_with(b"RIFF") {
        audio.to_vec()
    } else {
        match convert_with_ffmpeg(audio).await {
            Some(converted) => converted,
            None => {
                tracing::warn!(
                    input_bytes = audio.len(),
                    webm = audio.starts_with(&WEBM_MAGIC),
                    "ffmpeg conversion failed, wrapping input as raw PCM"
                );
                wrap_pcm_as_wav(audio)
            }
        }
    };

    if wav.len() < MIN_WAV_BYTES {
        tracing::debug!(bytes = wav.len(), "Rejecting audio window as silence/noise");
        return None;
    }

    Some(wav)
}

/// Run ffmpeg over stdin/stdout to produce 16 kHz mono s16le WAV.
async fn convert_with_ffmpeg(audio: &[u8]) -> Option<Vec<u8>> {
    let mut child = tokio::process::Command::new("ffmpeg")
        .args([
            "-loglevel", "warning",
            "-err_detect", "ignore_err",
            "-fflags", "+genpts+igndts",
            "-i", "pipe:0",
            "-ar", "16000",
            "-ac", "1",
            "-acodec", "pcm_s16le",
            "-f", "wav",
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    if let Some(mut stdin) = child.stdin.take() {
        let input = audio.to_vec();
        // Writer runs concurrently with the output read so large inputs
        // don't deadlock on a full pipe.
        tokio::spawn(async move {
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        });
    }

    let output = child.wait_with_output().await.ok()?;
    if !output.status.success() || output.stdout.len() < 1_000 {
        return None;
    }
    Some(output.stdout)
}

/// Wrap raw 16 kHz mono s16le PCM bytes in a WAV container.
pub fn wrap_pcm_as_wav(pcm: &[u8]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        // Writing i16 samples to an in-memory cursor cannot fail.
        let mut writer = match hound::WavWriter::new(&mut cursor, spec) {
            Ok(w) => w,
            Err(_) => return Vec::new(),
        };
        for sample in pcm.chunks_exact(2) {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            if writer.write_sample(value).is_err() {
                break;
            }
        }
        let _ = writer.finalize();
    }
    cursor.into_inner()
}

/// A WAV payload split out of a larger recording, with its duration.
#[derive(Debug, Clone)]
pub struct WavChunk {
    pub wav: Vec<u8>,
    pub duration_secs: f64,
}

/// Split a WAV payload into at most `max_bytes`-sized sequential chunks.
///
/// Used by the transcription router when audio exceeds a provider's
/// maximum payload size. Each chunk is a standalone WAV file; durations
/// let the router offset segment timestamps by the cumulative length of
/// prior chunks.
pub fn split_wav(wav: &[u8], max_bytes: usize) -> Vec<WavChunk> {
    if wav.len() <= max_bytes {
        return vec![WavChunk {
            wav: wav.to_vec(),
            duration_secs: wav_duration_secs(wav).unwrap_or(0.0),
        }];
    }

    let mut reader = match hound::WavReader::new(Cursor::new(wav)) {
        Ok(r) => r,
        Err(_) => return Vec::new(),
    };
    let spec = reader.spec();
    let samples: Vec<i16> = reader.samples::<i16>().filter_map(Result::ok).collect();
    if samples.is_empty() {
        return Vec::new();
    }

    let num_chunks = wav.len().div_ceil(max_bytes);
    let samples_per_chunk = samples.len().div_ceil(num_chunks);
    let samples_per_sec = (spec.sample_rate as usize) * (spec.channels as usize);

    samples
        .chunks(samples_per_chunk)
        .map(|chunk| {
            let mut cursor = Cursor::new(Vec::new());
            {
                let mut writer = match hound::WavWriter::new(&mut cursor, spec) {
                    Ok(w) => w,
                    Err(_) => return WavChunk { wav: Vec::new(), duration_secs: 0.0 },
                };
                for &sample in chunk {
                    if writer.write_sample(sample).is_err() {
                        break;
                    }
                }
                let _ = writer.finalize();
            }
            WavChunk {
                wav: cursor.into_inner(),
                duration_secs: chunk.len() as f64 / samples_per_sec as f64,
            }
        })
        .collect()
}

/// Duration of a WAV payload in seconds, if it parses.
pub fn wav_duration_secs(wav: &[u8]) -> Option<f64> {
    let reader = hound::WavReader::new(Cursor::new(wav)).ok()?;
    let spec = reader.spec();
    Some(reader.duration() as f64 / spec.sample_rate as f64)
}

// ── Tests ─────────────────────────────────────────────────────────
