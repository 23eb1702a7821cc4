//! Acquisition-process source
//!
//! The board driver runs as a separate process and writes one frame per line
//! (see `parse_frame`) to our stdin or to a file / FIFO. A reader thread turns
//! lines into samples and hands them over a bounded channel so pulls can time
//! out independently of the blocking read.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{parse_frame, Source, SourceEvent};
use crate::error::{FocusError, FocusResult};
use crate::types::Sample;

/// Frames buffered between the reader thread and the pipeline
const FRAME_BUFFER: usize = 1024;

type Frame = FocusResult<Sample>;

pub struct HardwareSource {
    name: String,
    path: Option<PathBuf>,
    frames: Receiver<Frame>,
}

impl HardwareSource {
    /// Read frames from stdin
    pub fn stdin() -> Self {
        Self {
            name: "stdin".to_string(),
            path: None,
            frames: spawn_reader(io::stdin(), Instant::now()),
        }
    }

    /// Read frames from a file, FIFO or character device
    pub fn open(path: &Path) -> FocusResult<Self> {
        let file = File::open(path)
            .map_err(|e| FocusError::SourceInit(format!("{}: {e}", path.display())))?;
        Ok(Self {
            name: path.display().to_string(),
            path: Some(path.to_path_buf()),
            frames: spawn_reader(file, Instant::now()),
        })
    }

    /// Read frames from any reader; used for embedding and tests
    pub fn from_reader<R: Read + Send + 'static>(name: &str, reader: R) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            frames: spawn_reader(reader, Instant::now()),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, started: Instant) -> Receiver<Frame> {
    let (tx, rx) = mpsc::sync_channel(FRAME_BUFFER);
    thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            let frame = match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => parse_frame(&line, started.elapsed().as_secs_f64()),
                Err(e) => {
                    warn!(error = %e, "upstream read failed");
                    break;
                }
            };
            if tx.send(frame).is_err() {
                break;
            }
        }
        debug!("upstream reader finished");
    });
    rx
}

impl Source for HardwareSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn next_sample(&mut self, timeout: Duration) -> FocusResult<SourceEvent> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => frame.map(SourceEvent::Sample),
            Err(RecvTimeoutError::Timeout) => Ok(SourceEvent::Timeout),
            Err(RecvTimeoutError::Disconnected) => Ok(SourceEvent::EndOfStream),
        }
    }

    fn reconnect(&mut self) -> FocusResult<()> {
        // stdin cannot be reopened; a file or FIFO can
        if let Some(path) = &self.path {
            let file = File::open(path).map_err(|e| {
                FocusError::UpstreamDisconnected(format!("{}: {e}", path.display()))
            })?;
            self.frames = spawn_reader(file, Instant::now());
        }
        Ok(())
    }
}
