//! Blocking byte source over the decoder's input ring.
//!
//! Lets symphonia probe and decode a stream that is still arriving. The
//! source ends at the next track marker, so each codec only ever sees one
//! track. Stop requests surface as `ConnectionAborted` reads.

use std::io::{self, Read, Seek, SeekFrom};

use symphonia::core::io::MediaSource;

use crate::error::StageError;
use crate::stage::InputPort;

pub struct StageInput {
    port: InputPort,
    pos: u64,
}

impl StageInput {
    pub fn new(port: InputPort) -> Self {
        Self { port, pos: 0 }
    }
}

impl Read for StageInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read_bytes(buf) {
            Ok(n) => {
                self.pos += n as u64;
                Ok(n)
            }
            Err(StageError::Aborted) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "decoder input aborted",
            )),
            Err(e) => Err(io::Error::other(e.to_string())),
        }
    }
}

impl Seek for StageInput {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.pos),
            SeekFrom::Start(x) if x == self.pos => Ok(self.pos),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stream input is not seekable",
            )),
        }
    }
}

impl MediaSource for StageInput {
    fn is_seekable(&self) -> bool {
        false
    }

    fn byte_len(&self) -> Option<u64> {
        None
    }
}
