//! YUV4MPEG2 (Y4M) frame source and writer.
//!
//! Y4M is an uncompressed stream format: a single header line followed by
//! `FRAME` markers, each with one raw planar frame. Sources may be files
//! (`/path`, `file:///path`) or TCP streams (`tcp://host:port`).

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use super::{
    DEFAULT_FPS, Frame, FrameSink, FrameSource, Geometry, MAX_DIMENSION, SinkFactory,
    SourceOpener,
};
use crate::{Error, Result};

const MAGIC: &str = "YUV4MPEG2";
const FRAME_MARKER: &str = "FRAME";

/// Header fields of a Y4M stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Y4mHeader {
    pub width: u32,
    pub height: u32,
    pub fps: Option<f64>,
    pub chroma: Option<String>,
}

impl Y4mHeader {
    /// Parse a header line (without the trailing newline).
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_ascii_whitespace();
        if tokens.next() != Some(MAGIC) {
            return Err(Error::StreamGeometry("not a YUV4MPEG2 stream".to_string()));
        }

        let mut width = None;
        let mut height = None;
        let mut fps = None;
        let mut chroma = None;

        for token in tokens {
            let mut chars = token.chars();
            let tag = chars.next();
            let value = chars.as_str();
            match tag {
                Some('W') => width = value.parse::<u32>().ok(),
                Some('H') => height = value.parse::<u32>().ok(),
                Some('F') => fps = parse_ratio(value),
                Some('C') => chroma = Some(value.to_string()),
                _ => {}
            }
        }

        let (Some(width), Some(height)) = (width, height) else {
            return Err(Error::StreamGeometry(format!(
                "Y4M header lacks frame size: {line}"
            )));
        };
        if width == 0 || height == 0 || width > MAX_DIMENSION || height > MAX_DIMENSION {
            return Err(Error::StreamGeometry(format!(
                "unsupported Y4M frame size {width}x{height}"
            )));
        }

        Ok(Self {
            width,
            height,
            fps,
            chroma,
        })
    }

    /// Size in bytes of one frame payload, `None` if it does not fit in memory.
    pub fn frame_size(&self) -> Option<usize> {
        frame_size(self.width, self.height, self.chroma.as_deref())
    }

    fn geometry(&self) -> Geometry {
        Geometry {
            width: self.width,
            height: self.height,
            fps: self.fps.unwrap_or(0.0),
            chroma: self.chroma.clone(),
            decoder_config: None,
        }
    }
}

fn parse_ratio(value: &str) -> Option<f64> {
    let (num, den) = value.split_once(':')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    (den > 0.0).then(|| num / den)
}

fn frame_size(width: u32, height: u32, chroma: Option<&str>) -> Option<usize> {
    let luma = usize::try_from(width)
        .ok()?
        .checked_mul(usize::try_from(height).ok()?)?;
    match chroma {
        Some(c) if c.starts_with("mono") => Some(luma),
        Some(c) if c.starts_with("444alpha") => luma.checked_mul(4),
        Some(c) if c.starts_with("444") => luma.checked_mul(3),
        Some(c) if c.starts_with("422") => luma.checked_mul(2),
        _ => luma.checked_mul(3).map(|n| n / 2),
    }
}

/// Reads frames from any Y4M byte stream.
pub struct Y4mSource<R> {
    reader: R,
    header: Y4mHeader,
    frame_size: usize,
    frame_interval: Duration,
    frames_read: u32,
}

impl<R: BufRead> Y4mSource<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let mut line = String::new();
        let read = reader.read_line(&mut line)?;
        if read == 0 {
            return Err(Error::StreamGeometry("empty Y4M stream".to_string()));
        }
        let header = Y4mHeader::parse(line.trim_end())?;
        let frame_size = header.frame_size().ok_or_else(|| {
            Error::StreamGeometry(format!(
                "Y4M frame size {}x{} is too large",
                header.width, header.height
            ))
        })?;
        let fps = header.fps.filter(|fps| *fps > 0.0).unwrap_or(DEFAULT_FPS);
        Ok(Self {
            reader,
            header,
            frame_size,
            frame_interval: Duration::from_secs_f64(1.0 / fps),
            frames_read: 0,
        })
    }

    pub fn header(&self) -> &Y4mHeader {
        &self.header
    }
}

impl<R: BufRead + Send> FrameSource for Y4mSource<R> {
    fn geometry(&self) -> Option<Geometry> {
        Some(self.header.geometry())
    }

    fn read_frame(&mut self) -> io::Result<Option<Frame>> {
        let mut marker = Vec::new();
        let read = self.reader.read_until(b'\n', &mut marker)?;
        if read == 0 {
            return Ok(None);
        }
        if !marker.starts_with(FRAME_MARKER.as_bytes()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "missing FRAME marker",
            ));
        }

        let mut data = vec![0u8; self.frame_size];
        match self.reader.read_exact(&mut data) {
            Ok(()) => {
                let pts = self.frame_interval * self.frames_read;
                self.frames_read = self.frames_read.saturating_add(1);
                Ok(Some(Frame::raw(data, pts)))
            }
            // A torn final frame is treated like the end of the stream.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Where a Y4M URI points.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Y4mLocation {
    File(PathBuf),
    Tcp(String),
}

fn locate(uri: &str) -> Option<Y4mLocation> {
    match Url::parse(uri) {
        Ok(url) if url.scheme() == "file" => url.to_file_path().ok().map(Y4mLocation::File),
        Ok(url) if url.scheme() == "tcp" => {
            let host = url.host_str()?;
            let port = url.port()?;
            Some(Y4mLocation::Tcp(format!("{host}:{port}")))
        }
        // Windows drive letters parse as a one-letter scheme.
        Ok(url) if url.scheme().len() > 1 => None,
        _ => Some(Y4mLocation::File(PathBuf::from(uri))),
    }
}

/// Opens Y4M files and TCP streams.
#[derive(Debug, Clone)]
pub struct Y4mOpener {
    /// Connect and per-read timeout for TCP sources.
    pub io_timeout: Duration,
}

impl Default for Y4mOpener {
    fn default() -> Self {
        Self {
            io_timeout: Duration::from_secs(15),
        }
    }
}

impl SourceOpener for Y4mOpener {
    fn can_open(&self, uri: &str) -> bool {
        match locate(uri) {
            Some(Y4mLocation::Tcp(_)) => true,
            Some(Y4mLocation::File(path)) => path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("y4m")),
            None => false,
        }
    }

    fn open(&self, uri: &str) -> Result<Box<dyn FrameSource>> {
        match locate(uri) {
            Some(Y4mLocation::File(path)) => {
                let file = File::open(&path).map_err(|e| Error::io_path("opening", &path, e))?;
                Ok(Box::new(Y4mSource::new(BufReader::new(file))?))
            }
            Some(Y4mLocation::Tcp(addr)) => {
                let socket_addr = addr
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| Error::Other(format!("cannot resolve {addr}")))?;
                let stream = TcpStream::connect_timeout(&socket_addr, self.io_timeout)?;
                stream.set_read_timeout(Some(self.io_timeout))?;
                Ok(Box::new(Y4mSource::new(BufReader::new(stream))?))
            }
            None => Err(Error::validation(format!("unsupported Y4M source: {uri}"))),
        }
    }

    fn sinks(&self) -> Arc<dyn SinkFactory> {
        Arc::new(Y4mSinkFactory)
    }
}

/// Writes one Y4M chunk file.
pub struct Y4mWriter {
    writer: BufWriter<File>,
}

impl Y4mWriter {
    pub fn create(path: &Path, geometry: &Geometry) -> io::Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        let rate = (geometry.fps * 1000.0).round().max(1.0) as u64;
        write!(
            writer,
            "{MAGIC} W{} H{} F{}:1000 Ip A1:1",
            geometry.width, geometry.height, rate
        )?;
        if let Some(chroma) = &geometry.chroma {
            write!(writer, " C{chroma}")?;
        }
        writer.write_all(b"\n")?;
        Ok(Self { writer })
    }
}

impl FrameSink for Y4mWriter {
    fn write_frame(&mut self, frame: &Frame, _at: Duration) -> io::Result<()> {
        self.writer.write_all(FRAME_MARKER.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.write_all(&frame.data)
    }

    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }
}

/// [`SinkFactory`] producing `.y4m` chunk files.
#[derive(Debug, Default, Clone, Copy)]
pub struct Y4mSinkFactory;

impl SinkFactory for Y4mSinkFactory {
    fn extension(&self) -> &str {
        "y4m"
    }

    fn create(&self, path: &Path, geometry: &Geometry) -> io::Result<Box<dyn FrameSink>> {
        Ok(Box::new(Y4mWriter::create(path, geometry)?))
    }
}
