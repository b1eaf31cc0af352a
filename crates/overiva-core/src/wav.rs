//! WAV file reader/writer
//!
//! Pure Rust RIFF/WAVE I/O for the speech corpora and separated outputs.
//! Reads 8/16/24/32-bit PCM and 32-bit float with any channel count;
//! writes 16-bit PCM.
//!
//! ## Example
//!
//! ```rust,no_run
//! use overiva_core::wav::{WavReader, WavWriter};
//!
//! let tone: Vec<f64> = (0..16000).map(|i| 0.5 * (i as f64 * 0.1).sin()).collect();
//! let mut sink = WavWriter::create("/tmp/tone.wav", 16000, 1).unwrap();
//! sink.write_frames(&[tone]).unwrap();
//! sink.close().unwrap();
//!
//! let mut source = WavReader::open("/tmp/tone.wav").unwrap();
//! assert_eq!(source.sample_rate(), 16000);
//! let mono = source.read_mono().unwrap();
//! assert_eq!(mono.len(), 16000);
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::types::{BssError, BssResult};

/// WAV file reader.
#[derive(Debug)]
pub struct WavReader {
    reader: BufReader<File>,
    sample_rate: u32,
    channels: u16,
    bits_per_sample: u16,
    format_tag: u16,
    num_frames: u64,
}

impl WavReader {
    /// Open a WAV file and parse its header.
    pub fn open(path: impl AsRef<Path>) -> BssResult<Self> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut buf4 = [0u8; 4];
        let mut buf2 = [0u8; 2];

        reader.read_exact(&mut buf4)?;
        if &buf4 != b"RIFF" {
            return Err(BssError::Wav("not a RIFF file".into()));
        }
        reader.read_exact(&mut buf4)?; // file size - 8
        reader.read_exact(&mut buf4)?;
        if &buf4 != b"WAVE" {
            return Err(BssError::Wav("not a WAVE file".into()));
        }

        let mut sample_rate = 0u32;
        let mut channels = 0u16;
        let mut bits_per_sample = 0u16;
        let mut format_tag = 1u16;
        let mut data_size: Option<u32> = None;

        loop {
            if reader.read_exact(&mut buf4).is_err() {
                break;
            }
            let chunk_id = buf4;
            reader.read_exact(&mut buf4)?;
            let chunk_size = u32::from_le_bytes(buf4);

            if &chunk_id == b"fmt " {
                reader.read_exact(&mut buf2)?;
                format_tag = u16::from_le_bytes(buf2);
                reader.read_exact(&mut buf2)?;
                channels = u16::from_le_bytes(buf2);
                reader.read_exact(&mut buf4)?;
                sample_rate = u32::from_le_bytes(buf4);
                reader.read_exact(&mut buf4)?; // byte rate
                reader.read_exact(&mut buf2)?; // block align
                reader.read_exact(&mut buf2)?;
                bits_per_sample = u16::from_le_bytes(buf2);
                if chunk_size > 16 {
                    reader.seek(SeekFrom::Current(i64::from(chunk_size - 16)))?;
                }
                // WAVE_FORMAT_EXTENSIBLE carries the real tag in its sub-format
                if format_tag == 0xFFFE {
                    format_tag = if bits_per_sample == 32 { 3 } else { 1 };
                }
            } else if &chunk_id == b"data" {
                data_size = Some(chunk_size);
                break;
            } else {
                // chunks are word aligned
                let skip = i64::from(chunk_size) + i64::from(chunk_size & 1);
                reader.seek(SeekFrom::Current(skip))?;
            }
        }

        let data_size = data_size.ok_or_else(|| BssError::Wav("no data chunk found".into()))?;
        if channels == 0 || bits_per_sample == 0 {
            return Err(BssError::Wav("missing or empty fmt chunk".into()));
        }
        let bytes_per_frame = u64::from(bits_per_sample / 8) * u64::from(channels);
        let num_frames = if bytes_per_frame > 0 {
            u64::from(data_size) / bytes_per_frame
        } else {
            0
        };

        Ok(Self {
            reader,
            sample_rate,
            channels,
            bits_per_sample,
            format_tag,
            num_frames,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn num_frames(&self) -> u64 {
        self.num_frames
    }

    /// Read every channel, de-interleaved, as f64 in `[-1, 1)`.
    pub fn read_channels(&mut self) -> BssResult<Vec<Vec<f64>>> {
        let n_chan = self.channels as usize;
        let total = self.num_frames as usize * n_chan;
        let width = (self.bits_per_sample / 8) as usize;
        let mut raw = vec![0u8; total * width];
        self.reader.read_exact(&mut raw)?;

        let values: Vec<f64> = match (self.format_tag, self.bits_per_sample) {
            (1, 8) => raw.iter().map(|&b| (f64::from(b) - 128.0) / 128.0).collect(),
            (1, 16) => raw
                .chunks_exact(2)
                .map(|b| f64::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0)
                .collect(),
            (1, 24) => raw
                .chunks_exact(3)
                .map(|b| {
                    let v = (i32::from(b[2]) << 24 | i32::from(b[1]) << 16 | i32::from(b[0]) << 8) >> 8;
                    f64::from(v) / 8_388_608.0
                })
                .collect(),
            (1, 32) => raw
                .chunks_exact(4)
                .map(|b| f64::from(i32::from_le_bytes([b[0], b[1], b[2], b[3]])) / 2_147_483_648.0)
                .collect(),
            (3, 32) => raw
                .chunks_exact(4)
                .map(|b| f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]])))
                .collect(),
            (tag, bits) => {
                return Err(BssError::Wav(format!(
                    "unsupported WAV format: tag={}, bits={}",
                    tag, bits
                )))
            }
        };

        let mut out = vec![Vec::with_capacity(self.num_frames as usize); n_chan];
        for frame in values.chunks_exact(n_chan) {
            for (c, v) in frame.iter().enumerate() {
                out[c].push(*v);
            }
        }
        Ok(out)
    }

    /// Read the file as a single channel, averaging when it has several.
    pub fn read_mono(&mut self) -> BssResult<Vec<f64>> {
        let channels = self.read_channels()?;
        if channels.len() == 1 {
            return Ok(channels.into_iter().next().unwrap_or_default());
        }
        let n = channels.first().map_or(0, |c| c.len());
        let scale = 1.0 / channels.len() as f64;
        Ok((0..n)
            .map(|i| channels.iter().map(|c| c[i]).sum::<f64>() * scale)
            .collect())
    }
}

/// Read a mono signal and its sample rate.
pub fn read_wav_mono(path: impl AsRef<Path>) -> BssResult<(u32, Vec<f64>)> {
    let mut reader = WavReader::open(path)?;
    let fs = reader.sample_rate();
    Ok((fs, reader.read_mono()?))
}

/// 16-bit PCM WAV writer.
#[derive(Debug)]
pub struct WavWriter {
    writer: BufWriter<File>,
    sample_rate: u32,
    channels: u16,
    frames_written: u64,
}

impl WavWriter {
    const HEADER_LEN: u64 = 44;

    pub fn create(path: impl AsRef<Path>, sample_rate: u32, channels: u16) -> BssResult<Self> {
        if channels == 0 {
            return Err(BssError::Wav("cannot write a WAV file without channels".into()));
        }
        let mut writer = BufWriter::new(File::create(path)?);
        let block_align = channels * 2;
        let byte_rate = sample_rate * u32::from(block_align);

        writer.write_all(b"RIFF")?;
        writer.write_all(&0u32.to_le_bytes())?; // patched on close
        writer.write_all(b"WAVE")?;
        writer.write_all(b"fmt ")?;
        writer.write_all(&16u32.to_le_bytes())?;
        writer.write_all(&1u16.to_le_bytes())?;
        writer.write_all(&channels.to_le_bytes())?;
        writer.write_all(&sample_rate.to_le_bytes())?;
        writer.write_all(&byte_rate.to_le_bytes())?;
        writer.write_all(&block_align.to_le_bytes())?;
        writer.write_all(&16u16.to_le_bytes())?;
        writer.write_all(b"data")?;
        writer.write_all(&0u32.to_le_bytes())?; // patched on close

        Ok(Self {
            writer,
            sample_rate,
            channels,
            frames_written: 0,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Write channel-major samples in `[-1, 1]`; values outside are clipped.
    pub fn write_frames(&mut self, channels: &[Vec<f64>]) -> BssResult<()> {
        if channels.len() != self.channels as usize {
            return Err(BssError::DimensionMismatch {
                expected: self.channels as usize,
                actual: channels.len(),
            });
        }
        let n = channels.first().map_or(0, |c| c.len());
        if channels.iter().any(|c| c.len() != n) {
            return Err(BssError::Wav("channels have different lengths".into()));
        }
        let mut buf = Vec::with_capacity(n * channels.len() * 2);
        for i in 0..n {
            for ch in channels {
                let v = (ch[i].clamp(-1.0, 1.0) * 32767.0).round() as i16;
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        self.writer.write_all(&buf)?;
        self.frames_written += n as u64;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Patch the chunk sizes and flush.
    pub fn close(mut self) -> BssResult<()> {
        let data_size = self.frames_written * u64::from(self.channels) * 2;
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(Self::HEADER_LEN - 4))?;
        file.write_all(&(data_size as u32).to_le_bytes())?;
        file.seek(SeekFrom::Start(4))?;
        file.write_all(&((Self::HEADER_LEN - 8 + data_size) as u32).to_le_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// Scale a signal to unit peak; with `bits`, scale further to the signed
/// integer range of that width (`2^(bits-1) - 1`).
pub fn normalize(signal: &[f64], bits: Option<u32>) -> Vec<f64> {
    let peak = signal.iter().fold(0.0f64, |m, x| m.max(x.abs()));
    if peak == 0.0 {
        return signal.to_vec();
    }
    let target = match bits {
        Some(b) if b > 1 => f64::from((1u32 << (b - 1)) - 1),
        _ => 1.0,
    };
    signal.iter().map(|x| x / peak * target).collect()
}

/// Peak-normalise each channel and write them as one 16-bit file.
pub fn write_wav_normalized(
    path: impl AsRef<Path>,
    sample_rate: u32,
    channels: &[Vec<f64>],
) -> BssResult<()> {
    let normalized: Vec<Vec<f64>> = channels.iter().map(|c| normalize(c, None)).collect();
    let mut writer = WavWriter::create(path, sample_rate, channels.len() as u16)?;
    writer.write_frames(&normalized)?;
    writer.close()
}
