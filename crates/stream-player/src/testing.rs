//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::codec::{Codec, CodecError, CodecFactory, DecodedFrame, StageInput};
use crate::error::StageError;
use crate::info::StreamInfo;
use crate::output::{AudioSink, OutputFactory};
use crate::ring_buffer::Marker;
use crate::source::{OpenedSource, SourceError, SourceOpener};
use crate::stage::{Element, Flow, Input, StageContext, StageRole};

// ---------------------------------------------------------------------------
// Sources

#[derive(Clone)]
enum Body {
    Bytes(Vec<u8>),
    /// `head`, then zeros forever.
    Endless(Vec<u8>),
    /// Opens, then never delivers a byte.
    Stalled,
}

#[derive(Clone)]
struct Resource {
    body: Body,
    /// Break the transfer after this many bytes, for the next `n` opens.
    fail_after: Option<(u64, u32)>,
}

#[derive(Clone, Default)]
pub struct FakeOpener {
    resources: Arc<Mutex<HashMap<String, Resource>>>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(self, uri: &str, body: Body) -> Self {
        self.resources.lock().unwrap().insert(
            uri.to_string(),
            Resource {
                body,
                fail_after: None,
            },
        );
        self
    }

    pub fn with(self, uri: &str, bytes: Vec<u8>) -> Self {
        self.insert(uri, Body::Bytes(bytes))
    }

    pub fn endless(self, uri: &str, head: Vec<u8>) -> Self {
        self.insert(uri, Body::Endless(head))
    }

    pub fn stalled(self, uri: &str) -> Self {
        self.insert(uri, Body::Stalled)
    }

    /// The next `times` opens of `uri` break with a reset after `after` bytes.
    pub fn failing_after(self, uri: &str, after: u64, times: u32) -> Self {
        if let Some(res) = self.resources.lock().unwrap().get_mut(uri) {
            res.fail_after = Some((after, times));
        }
        self
    }
}

impl SourceOpener for FakeOpener {
    fn open(&self, uri: &str, offset: u64) -> Result<OpenedSource, SourceError> {
        let mut resources = self.resources.lock().unwrap();
        let Some(res) = resources.get_mut(uri) else {
            return Err(SourceError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such resource: {uri}"),
            )));
        };
        let fail_at = match &mut res.fail_after {
            Some((after, times)) if *times > 0 => {
                *times -= 1;
                Some(*after)
            }
            _ => None,
        };
        let (content_length, reader): (Option<u64>, Box<dyn Read + Send>) = match &res.body {
            Body::Bytes(bytes) => (
                Some(bytes.len() as u64),
                Box::new(FakeReader {
                    data: bytes.clone(),
                    pos: offset,
                    fail_at,
                }),
            ),
            Body::Endless(head) => (
                None,
                Box::new(EndlessReader {
                    head: head.clone(),
                    pos: offset,
                }),
            ),
            Body::Stalled => (None, Box::new(StalledReader)),
        };
        Ok(OpenedSource {
            reader,
            content_length,
        })
    }
}

struct FakeReader {
    data: Vec<u8>,
    pos: u64,
    fail_at: Option<u64>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut end = self.data.len() as u64;
        if let Some(at) = self.fail_at {
            if self.pos >= at {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
            }
            end = end.min(at);
        }
        let n = (end.saturating_sub(self.pos) as usize).min(buf.len());
        if n == 0 {
            return Ok(0);
        }
        let start = self.pos as usize;
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

struct EndlessReader {
    head: Vec<u8>,
    pos: u64,
}

impl Read for EndlessReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let head_left = (self.head.len() as u64).saturating_sub(self.pos) as usize;
        let n = if head_left > 0 {
            let n = head_left.min(buf.len());
            let start = self.pos as usize;
            buf[..n].copy_from_slice(&self.head[start..start + n]);
            n
        } else {
            buf.fill(0);
            buf.len()
        };
        self.pos += n as u64;
        Ok(n)
    }
}

struct StalledReader;

impl Read for StalledReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        thread::sleep(Duration::from_secs(5));
        Err(io::Error::new(io::ErrorKind::TimedOut, "stalled"))
    }
}

// ---------------------------------------------------------------------------
// Codec

const RAW_MAGIC: &[u8; 4] = b"RAW1";
const RAW_HEADER: usize = 10;

/// A track for [`RawCodecFactory`]: magic, rate (u32 LE), bits, channels, PCM.
pub fn raw_track(rate: u32, bits: u8, channels: u8, pcm: &[u8]) -> Vec<u8> {
    let mut out = raw_header(rate, bits, channels);
    out.extend_from_slice(pcm);
    out
}

pub fn raw_header(rate: u32, bits: u8, channels: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(RAW_HEADER);
    out.extend_from_slice(RAW_MAGIC);
    out.extend_from_slice(&rate.to_le_bytes());
    out.push(bits);
    out.push(channels);
    out
}

/// Passes PCM through after a tiny header carrying its format.
#[derive(Clone, Copy, Debug, Default)]
pub struct RawCodecFactory;

impl CodecFactory for RawCodecFactory {
    fn formats(&self) -> &'static str {
        "raw"
    }

    fn open(&self, mut input: StageInput, uri: &str) -> Result<Box<dyn Codec>, CodecError> {
        let mut header = [0u8; RAW_HEADER];
        input.read_exact(&mut header).map_err(|e| match e.kind() {
            io::ErrorKind::ConnectionAborted => CodecError::Aborted,
            io::ErrorKind::UnexpectedEof => CodecError::Malformed("short header".to_string()),
            _ => CodecError::Io(e),
        })?;
        if &header[..4] != RAW_MAGIC {
            return Err(CodecError::Malformed("bad magic".to_string()));
        }
        let rate = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let info = StreamInfo::new(rate, header[8] as u16, header[9] as u16).with_source(uri);
        Ok(Box::new(RawCodec { input, info }))
    }
}

struct RawCodec {
    input: StageInput,
    info: StreamInfo,
}

impl Codec for RawCodec {
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, CodecError> {
        let mut pcm = vec![0u8; 4096];
        let n = self.input.read(&mut pcm).map_err(|e| match e.kind() {
            io::ErrorKind::ConnectionAborted => CodecError::Aborted,
            _ => CodecError::Io(e),
        })?;
        if n == 0 {
            return Ok(None);
        }
        pcm.truncate(n);
        Ok(Some(DecodedFrame {
            info: self.info.clone(),
            pcm,
        }))
    }
}

// ---------------------------------------------------------------------------
// Output

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkCall {
    Configure(StreamInfo),
    Write(usize),
    Drain,
    Closed,
}

impl SinkCall {
    /// Total bytes written across `calls`.
    pub fn written(calls: &[SinkCall]) -> usize {
        calls
            .iter()
            .map(|c| match c {
                SinkCall::Write(n) => *n,
                _ => 0,
            })
            .sum()
    }
}

#[derive(Clone, Default)]
pub struct SinkLog(Arc<Mutex<Vec<SinkCall>>>);

impl SinkLog {
    fn push(&self, call: SinkCall) {
        self.0.lock().unwrap().push(call);
    }

    pub fn take(&self) -> Vec<SinkCall> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn snapshot(&self) -> Vec<SinkCall> {
        self.0.lock().unwrap().clone()
    }
}

pub struct RecordingSink {
    log: SinkLog,
    open: Option<Arc<AtomicUsize>>,
    fail_configure: bool,
    pace: Duration,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            log: SinkLog::default(),
            open: None,
            fail_configure: false,
            pace: Duration::ZERO,
        }
    }

    pub fn calls(&self) -> SinkLog {
        self.log.clone()
    }

    pub fn failing_configure(mut self) -> Self {
        self.fail_configure = true;
        self
    }
}

impl AudioSink for RecordingSink {
    fn configure(&mut self, info: &StreamInfo) -> Result<()> {
        if self.fail_configure {
            return Err(anyhow!("codec rejected {} Hz", info.sample_rate));
        }
        self.log.push(SinkCall::Configure(info.clone()));
        Ok(())
    }

    fn write(&mut self, pcm: &[u8], _timeout: Duration) -> Result<usize> {
        if !self.pace.is_zero() {
            thread::sleep(self.pace);
        }
        self.log.push(SinkCall::Write(pcm.len()));
        Ok(pcm.len())
    }

    fn drain(&mut self, _timeout: Duration) -> Result<bool> {
        self.log.push(SinkCall::Drain);
        Ok(true)
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        if let Some(open) = &self.open {
            self.log.push(SinkCall::Closed);
            open.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Hands out [`RecordingSink`]s sharing one log; flags overlapping use.
#[derive(Clone, Default)]
pub struct RecordingOutput {
    log: SinkLog,
    open: Arc<AtomicUsize>,
    overlap: Arc<AtomicBool>,
    fail_open: bool,
    pace: Duration,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Sleep this long in every write, standing in for a real-time device.
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    pub fn log(&self) -> SinkLog {
        self.log.clone()
    }

    /// Two sinks were ever open at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlap.load(Ordering::Acquire)
    }
}

impl OutputFactory for RecordingOutput {
    fn open(&self) -> Result<Box<dyn AudioSink>> {
        if self.fail_open {
            return Err(anyhow!("no i2s device"));
        }
        if self.open.fetch_add(1, Ordering::AcqRel) > 0 {
            self.overlap.store(true, Ordering::Release);
        }
        Ok(Box::new(RecordingSink {
            log: self.log.clone(),
            open: Some(self.open.clone()),
            fail_configure: false,
            pace: self.pace,
        }))
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

// ---------------------------------------------------------------------------
// Stage elements

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Seen {
    Bytes(Vec<u8>),
    Marker(Marker),
    End,
}

impl Seen {
    /// Every byte in `seen`, concatenated.
    pub fn bytes(seen: &[Seen]) -> Vec<u8> {
        seen.iter()
            .filter_map(|s| match s {
                Seen::Bytes(b) => Some(b.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }
}

/// Reader-role element writing a fixed script, then finishing.
pub struct Feeder {
    items: std::vec::IntoIter<Seen>,
}

impl Feeder {
    pub fn new(items: Vec<Seen>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl Element for Feeder {
    fn role(&self) -> StageRole {
        StageRole::Reader
    }

    fn process(&mut self, ctx: &StageContext) -> Result<Flow, StageError> {
        match self.items.next() {
            Some(Seen::Bytes(b)) => ctx.write_all(&b)?,
            Some(Seen::Marker(m)) => ctx.write_marker(m)?,
            Some(Seen::End) | None => return Ok(Flow::Finished),
        }
        Ok(Flow::Continue)
    }
}

#[derive(Clone, Default)]
pub struct SeenLog(Arc<Mutex<Vec<Seen>>>);

impl SeenLog {
    pub fn take(&self) -> Vec<Seen> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// Writer-role element recording everything it reads. Adjacent byte reads
/// are merged.
pub struct Collector {
    log: SeenLog,
}

impl Collector {
    pub fn new() -> Self {
        Self {
            log: SeenLog::default(),
        }
    }

    pub fn log(&self) -> SeenLog {
        self.log.clone()
    }
}

impl Element for Collector {
    fn role(&self) -> StageRole {
        StageRole::Writer
    }

    fn process(&mut self, ctx: &StageContext) -> Result<Flow, StageError> {
        let mut buf = [0u8; 256];
        let input = ctx.read(&mut buf)?;
        let mut log = self.log.0.lock().unwrap();
        match input {
            Input::Data(n) => match log.last_mut() {
                Some(Seen::Bytes(prev)) => prev.extend_from_slice(&buf[..n]),
                _ => log.push(Seen::Bytes(buf[..n].to_vec())),
            },
            Input::Marker(m) => log.push(Seen::Marker(m)),
            Input::End => {
                log.push(Seen::End);
                return Ok(Flow::Finished);
            }
        }
        Ok(Flow::Continue)
    }
}
