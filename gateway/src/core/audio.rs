//! PCM16 <-> WAV container conversion.
//!
//! The fallback transcription path uploads buffered microphone audio to a
//! REST transcription endpoint, which wants a self-describing container rather
//! than raw little-endian samples. These helpers are pure and stateless.

use std::io::Cursor;

use thiserror::Error;

/// Errors raised while converting audio buffers.
#[derive(Debug, Error)]
pub enum AudioError {
    /// Sample rate or channel count is unusable
    #[error("Invalid audio format: {0}")]
    InvalidFormat(String),

    /// Encoding or decoding failed inside the container codec
    #[error("Audio codec error: {0}")]
    Codec(#[from] hound::Error),
}

/// Decoded contents of a WAV container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPcm {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Wrap 16-bit PCM samples into an in-memory WAV file.
pub fn pcm16_to_container(
    samples: &[i16],
    sample_rate: u32,
    channels: u16,
) -> Result<Vec<u8>, AudioError> {
    if sample_rate == 0 {
        return Err(AudioError::InvalidFormat("sample rate must be > 0".into()));
    }
    if channels == 0 {
        return Err(AudioError::InvalidFormat("channel count must be > 0".into()));
    }

    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        let mut sample_writer = writer.get_i16_writer(samples.len() as u32);
        for sample in samples {
            sample_writer.write_sample(*sample);
        }
        sample_writer.flush()?;
        writer.finalize()?;
    }

    Ok(cursor.into_inner())
}

/// Parse a 16-bit integer WAV file back into samples.
pub fn container_to_pcm16(bytes: &[u8]) -> Result<DecodedPcm, AudioError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();

    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(AudioError::InvalidFormat(format!(
            "expected 16-bit integer PCM, got {:?} {}-bit",
            spec.sample_format, spec.bits_per_sample
        )));
    }

    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DecodedPcm {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// Interpret a little-endian byte buffer as PCM16 samples.
///
/// A trailing odd byte is ignored.
pub fn pcm16_bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Duration in milliseconds of a mono PCM16 byte buffer.
pub fn pcm16_duration_ms(byte_len: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    (byte_len as u64 / 2) * 1000 / sample_rate as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header_layout() {
        let samples = vec![0i16; 160];
        let wav = pcm16_to_container(&samples, 24000, 1).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + samples.len() * 2);
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 24000);
    }

    #[test]
    fn test_container_preserves_samples_and_format() {
        let samples: Vec<i16> = vec![i16::MIN, -1, 0, 1, i16::MAX, 1234];
        let wav = pcm16_to_container(&samples, 16000, 2).unwrap();
        let decoded = container_to_pcm16(&wav).unwrap();

        assert_eq!(decoded.samples, samples);
        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.channels, 2);
    }

    #[test]
    fn test_zero_sample_rate_rejected() {
        let result = pcm16_to_container(&[0, 0], 0, 1);
        assert!(matches!(result, Err(AudioError::InvalidFormat(_))));
    }

    #[test]
    fn test_garbage_container_is_an_error() {
        assert!(container_to_pcm16(b"definitely not a wav").is_err());
    }

    #[test]
    fn test_bytes_to_samples_little_endian() {
        let bytes = [0x01, 0x00, 0xff, 0xff, 0x00, 0x80, 0x7f];
        assert_eq!(pcm16_bytes_to_samples(&bytes), vec![1, -1, i16::MIN]);
    }

    #[test]
    fn test_duration() {
        assert_eq!(pcm16_duration_ms(48000, 24000), 1000);
        assert_eq!(pcm16_duration_ms(320, 16000), 10);
        assert_eq!(pcm16_duration_ms(100, 0), 0);
    }
}
