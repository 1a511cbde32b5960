//! Transfer threads.
//!
//! Opening and reading a network resource can block far longer than a stage
//! may go without checking for stop requests. Each transfer therefore runs on
//! its own thread and hands chunks over a bounded channel, which the reader
//! stage polls in `io_timeout` slices. On cancel the thread is left to exit at
//! its next chunk boundary; nothing waits for it.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, bounded};

use super::{SourceError, SourceOpener, read_capped};

const CHANNEL_CHUNKS: usize = 4;

#[derive(Debug)]
pub enum FetchMsg {
    Opened { content_length: Option<u64> },
    Data(Vec<u8>),
    Eof,
    Failed(SourceError),
}

/// One resource being transferred in the background.
pub struct Fetch {
    rx: Receiver<FetchMsg>,
    cancel: Arc<AtomicBool>,
}

impl Fetch {
    pub fn start(
        opener: Arc<dyn SourceOpener>,
        uri: String,
        offset: u64,
        chunk_bytes: usize,
    ) -> Result<Self, SourceError> {
        let (tx, rx) = bounded(CHANNEL_CHUNKS);
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_thread = cancel.clone();
        let chunk_bytes = chunk_bytes.max(1);

        thread::Builder::new()
            .name("fetch".to_string())
            .spawn(move || {
                let mut source = match opener.open(&uri, offset) {
                    Ok(source) => source,
                    Err(e) => {
                        let _ = tx.send(FetchMsg::Failed(e));
                        return;
                    }
                };
                if tx
                    .send(FetchMsg::Opened {
                        content_length: source.content_length,
                    })
                    .is_err()
                {
                    return;
                }
                loop {
                    if cancel_thread.load(Ordering::Relaxed) {
                        return;
                    }
                    let mut buf = vec![0u8; chunk_bytes];
                    let msg = match source.reader.read(&mut buf) {
                        Ok(0) => FetchMsg::Eof,
                        Ok(n) => {
                            buf.truncate(n);
                            FetchMsg::Data(buf)
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => FetchMsg::Failed(SourceError::Io(e)),
                    };
                    let last = !matches!(msg, FetchMsg::Data(_));
                    if tx.send(msg).is_err() || last {
                        return;
                    }
                }
            })?;

        Ok(Self { rx, cancel })
    }

    pub fn receiver(&self) -> &Receiver<FetchMsg> {
        &self.rx
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }
}

impl Drop for Fetch {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Fetch a playlist body in the background.
pub fn fetch_text(
    opener: Arc<dyn SourceOpener>,
    uri: String,
    cap: usize,
) -> Result<Receiver<Result<String, SourceError>>, SourceError> {
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name("fetch-list".to_string())
        .spawn(move || {
            let _ = tx.send(read_capped(opener.as_ref(), &uri, cap));
        })?;
    Ok(rx)
}
