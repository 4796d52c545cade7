//! H.264 chunk files in an MP4 container.
//!
//! Frames arrive as length-prefixed NAL units (the AVC sample format), so
//! they are stored as MP4 samples without touching the bitstream. The
//! sample durations come from the presentation times of consecutive frames.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use mp4::{
    AvcConfig, FourCC, MediaConfig, Mp4Config, Mp4Sample, Mp4Writer, TrackConfig, TrackType,
};

use super::{Frame, FrameSink, Geometry, SinkFactory};

/// Media timescale of the video track (ticks per second).
pub const TIMESCALE: u32 = 90_000;

const VIDEO_TRACK: u32 = 1;

fn brand(tag: &[u8; 4]) -> FourCC {
    FourCC::from(u32::from_be_bytes(*tag))
}

fn mp4_error(e: mp4::Error) -> io::Error {
    io::Error::other(e)
}

fn ticks(at: Duration) -> u64 {
    let ticks = at.as_nanos() * u128::from(TIMESCALE) / 1_000_000_000;
    u64::try_from(ticks).unwrap_or(u64::MAX)
}

/// First SPS and PPS of an `AVCDecoderConfigurationRecord`.
pub fn parameter_sets(record: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    // version, profile, compatibility, level, NAL length size
    let mut pos = 5;

    let take_sets = |pos: &mut usize, count: usize| -> Option<Option<Vec<u8>>> {
        let mut first = None;
        for _ in 0..count {
            let len = usize::from(u16::from_be_bytes([
                *record.get(*pos)?,
                *record.get(*pos + 1)?,
            ]));
            *pos += 2;
            let unit = record.get(*pos..*pos + len)?;
            first.get_or_insert_with(|| unit.to_vec());
            *pos += len;
        }
        Some(first)
    };

    let sps_count = usize::from(*record.get(pos)? & 0x1f);
    pos += 1;
    let sps = take_sets(&mut pos, sps_count)?;

    let pps_count = usize::from(*record.get(pos)?);
    pos += 1;
    let pps = take_sets(&mut pos, pps_count)?;

    Some((sps?, pps?))
}

/// Writes one MP4 chunk with a single H.264 track.
pub struct Mp4ChunkWriter {
    writer: Mp4Writer<BufWriter<File>>,
    /// Held back until the next frame gives its duration.
    pending: Option<Mp4Sample>,
    frame_ticks: u32,
}

impl Mp4ChunkWriter {
    pub fn create(path: &Path, geometry: &Geometry) -> io::Result<Self> {
        let invalid = |message: &str| io::Error::new(io::ErrorKind::InvalidData, message);

        let (sps, pps) = geometry
            .decoder_config
            .as_deref()
            .and_then(parameter_sets)
            .ok_or_else(|| invalid("stream has no H.264 parameter sets"))?;
        if sps.len() < 4 {
            return Err(invalid("truncated H.264 sequence parameter set"));
        }
        let width = u16::try_from(geometry.width).map_err(|_| invalid("frame too wide"))?;
        let height = u16::try_from(geometry.height).map_err(|_| invalid("frame too tall"))?;

        let config = Mp4Config {
            major_brand: brand(b"isom"),
            minor_version: 512,
            compatible_brands: [b"isom", b"iso2", b"avc1", b"mp41"]
                .into_iter()
                .map(brand)
                .collect(),
            timescale: 1000,
        };
        let file = BufWriter::new(File::create(path)?);
        let mut writer = Mp4Writer::write_start(file, &config).map_err(mp4_error)?;
        writer
            .add_track(&TrackConfig {
                track_type: TrackType::Video,
                timescale: TIMESCALE,
                language: "und".to_string(),
                media_conf: MediaConfig::AvcConfig(AvcConfig {
                    width,
                    height,
                    seq_param_set: sps,
                    pic_param_set: pps,
                }),
            })
            .map_err(mp4_error)?;

        let frame_ticks = (f64::from(TIMESCALE) / geometry.fps).round().max(1.0) as u32;
        Ok(Self {
            writer,
            pending: None,
            frame_ticks,
        })
    }

    fn flush_pending(&mut self, next_start: Option<u64>) -> io::Result<()> {
        let Some(mut sample) = self.pending.take() else {
            return Ok(());
        };
        sample.duration = match next_start {
            Some(next) if next > sample.start_time => {
                u32::try_from(next - sample.start_time).unwrap_or(u32::MAX)
            }
            _ => self.frame_ticks,
        };
        self.writer
            .write_sample(VIDEO_TRACK, &sample)
            .map_err(mp4_error)
    }
}

impl FrameSink for Mp4ChunkWriter {
    fn write_frame(&mut self, frame: &Frame, at: Duration) -> io::Result<()> {
        let start_time = ticks(at);
        self.flush_pending(Some(start_time))?;
        self.pending = Some(Mp4Sample {
            start_time,
            duration: self.frame_ticks,
            rendering_offset: 0,
            is_sync: frame.key,
            bytes: Bytes::copy_from_slice(&frame.data),
        });
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.flush_pending(None)?;
        self.writer.write_end().map_err(mp4_error)?;
        let mut file = self.writer.into_writer();
        file.flush()?;
        file.get_ref().sync_all()
    }
}

/// [`SinkFactory`] producing `.mp4` chunk files.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mp4SinkFactory;

impl SinkFactory for Mp4SinkFactory {
    fn extension(&self) -> &str {
        "mp4"
    }

    fn create(&self, path: &Path, geometry: &Geometry) -> io::Result<Box<dyn FrameSink>> {
        Ok(Box::new(Mp4ChunkWriter::create(path, geometry)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1e, 0xd9, 0x00, 0xa0, 0x47, 0xfe, 0xc8];
    const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];

    fn avcc() -> Vec<u8> {
        let mut record = vec![0x01, SPS[1], SPS[2], SPS[3], 0xff, 0xe1];
        record.extend_from_slice(&(SPS.len() as u16).to_be_bytes());
        record.extend_from_slice(SPS);
        record.push(0x01);
        record.extend_from_slice(&(PPS.len() as u16).to_be_bytes());
        record.extend_from_slice(PPS);
        record
    }

    fn geometry(decoder_config: Option<Vec<u8>>) -> Geometry {
        Geometry {
            width: 320,
            height: 240,
            fps: 25.0,
            chroma: None,
            decoder_config,
        }
    }

    fn sample(key: bool) -> Frame {
        // One length-prefixed NAL unit.
        let nal: &[u8] = if key { &[0x65, 0x88, 0x84] } else { &[0x41, 0x9a, 0x02] };
        let mut data = (nal.len() as u32).to_be_bytes().to_vec();
        data.extend_from_slice(nal);
        Frame {
            data,
            pts: Duration::ZERO,
            key,
        }
    }

    #[test]
    fn test_parameter_sets() {
        let (sps, pps) = parameter_sets(&avcc()).unwrap();
        assert_eq!(sps, SPS);
        assert_eq!(pps, PPS);

        let record = avcc();
        assert!(parameter_sets(&record[..record.len() - 1]).is_none());
        assert!(parameter_sets(&[0x01, 0x42]).is_none());
    }

    #[test]
    fn test_ticks() {
        assert_eq!(ticks(Duration::ZERO), 0);
        assert_eq!(ticks(Duration::from_millis(40)), 3_600);
        assert_eq!(ticks(Duration::from_secs(600)), 54_000_000);
    }

    #[test]
    fn test_writes_playable_container() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("chunk.mp4");

        let mut sink = Mp4SinkFactory.create(&path, &geometry(Some(avcc()))).unwrap();
        sink.write_frame(&sample(true), Duration::ZERO).unwrap();
        sink.write_frame(&sample(false), Duration::from_millis(40)).unwrap();
        sink.write_frame(&sample(false), Duration::from_millis(80)).unwrap();
        sink.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[4..8], b"ftyp");
        let contains = |tag: &[u8]| bytes.windows(4).any(|w| w == tag);
        assert!(contains(b"moov"));
        assert!(contains(b"mdat"));
        assert!(contains(b"avcC"));
    }

    #[test]
    fn test_missing_parameter_sets_is_an_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("chunk.mp4");
        let err = Mp4SinkFactory.create(&path, &geometry(None)).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
