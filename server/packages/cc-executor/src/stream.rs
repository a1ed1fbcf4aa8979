use std::io;
use std::time::Duration;

use cc_executor_protocol::{OutputParams, StreamType};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const CHANNEL_CAPACITY: usize = 256;

/// One emitted unit of child output. `data` is a whole line (newline
/// included) unless the line outgrew the size limit, in which case it is one
/// fragment of that line and `fragment` holds its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamType,
    pub data: Vec<u8>,
    pub truncated: bool,
    pub fragment: Option<u32>,
}

impl OutputChunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn to_params(&self) -> OutputParams {
        OutputParams {
            stream: self.stream,
            data: String::from_utf8_lossy(&self.data).into_owned(),
            truncated: self.truncated,
            chunk_index: self.fragment,
        }
    }
}

/// Splits a byte stream into newline-terminated chunks of at most
/// `max_line` bytes of content.
pub struct LineReader<R> {
    reader: R,
    stream: StreamType,
    max_line: usize,
    pending: Vec<u8>,
    next_fragment: Option<u32>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(reader: R, stream: StreamType, max_line: usize) -> Self {
        Self {
            reader,
            stream,
            max_line: max_line.max(1),
            pending: Vec::new(),
            next_fragment: None,
        }
    }

    /// Returns the next chunk, or `None` once the stream is exhausted and
    /// every buffered byte has been emitted.
    pub async fn next_chunk(&mut self) -> io::Result<Option<OutputChunk>> {
        loop {
            let (consumed, line_complete) = {
                let available = match self.reader.fill_buf().await {
                    Ok(available) => available,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err),
                };
                if available.is_empty() {
                    return Ok(self.flush());
                }

                // A newline right at the limit still closes the line.
                let room = self.max_line - self.pending.len();
                let window = &available[..available.len().min(room + 1)];
                match window.iter().position(|byte| *byte == b'\n') {
                    Some(pos) => {
                        self.pending.extend_from_slice(&window[..=pos]);
                        (pos + 1, true)
                    }
                    None => {
                        let take = available.len().min(room);
                        self.pending.extend_from_slice(&available[..take]);
                        (take, false)
                    }
                }
            };
            self.reader.consume(consumed);

            if line_complete {
                return Ok(Some(self.finish_line()));
            }
            if self.pending.len() >= self.max_line {
                return Ok(Some(self.cut_fragment()));
            }
        }
    }

    fn flush(&mut self) -> Option<OutputChunk> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.finish_line())
        }
    }

    fn finish_line(&mut self) -> OutputChunk {
        let data = std::mem::take(&mut self.pending);
        match self.next_fragment.take() {
            Some(index) => self.chunk(data, true, Some(index)),
            None => self.chunk(data, false, None),
        }
    }

    fn cut_fragment(&mut self) -> OutputChunk {
        let mut cut = utf8_boundary(&self.pending);
        if cut == 0 {
            cut = self.pending.len();
        }
        let rest = self.pending.split_off(cut);
        let data = std::mem::replace(&mut self.pending, rest);
        let index = self.next_fragment.unwrap_or(0);
        self.next_fragment = Some(index + 1);
        self.chunk(data, true, Some(index))
    }

    fn chunk(&self, data: Vec<u8>, truncated: bool, fragment: Option<u32>) -> OutputChunk {
        OutputChunk {
            stream: self.stream,
            data,
            truncated,
            fragment,
        }
    }
}

/// Length of the longest prefix of `buf` that does not end inside a
/// multi-byte UTF-8 sequence.
fn utf8_boundary(buf: &[u8]) -> usize {
    let len = buf.len();
    for index in (len.saturating_sub(3)..len).rev() {
        let byte = buf[index];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0x00..=0x7f => 1,
            0xc0..=0xdf => 2,
            0xe0..=0xef => 3,
            0xf0..=0xf7 => 4,
            _ => 1,
        };
        return if index + width > len { index } else { len };
    }
    len
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaderStats {
    pub chunks: u64,
    pub bytes: u64,
    pub truncated_chunks: u64,
}

/// Receiving side of both output readers of one process.
pub struct OutputStream {
    rx: mpsc::Receiver<OutputChunk>,
    readers: Vec<JoinHandle<ReaderStats>>,
}

impl OutputStream {
    /// Starts one reader per pipe. Chunks of a single pipe arrive in the
    /// order they were written; the two pipes interleave freely.
    pub fn start<O, E>(stdout: O, stderr: E, max_line: usize) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let readers = vec![
            spawn_reader(stdout, StreamType::Stdout, max_line, tx.clone()),
            spawn_reader(stderr, StreamType::Stderr, max_line, tx),
        ];
        Self { rx, readers }
    }

    /// `None` once both readers have finished and every chunk was received.
    pub async fn recv(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }

    /// Stops readers that are still blocked, e.g. on a pipe held open by an
    /// orphaned grandchild.
    pub fn abort(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
        self.rx.close();
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

fn spawn_reader<R>(
    pipe: R,
    stream: StreamType,
    max_line: usize,
    tx: mpsc::Sender<OutputChunk>,
) -> JoinHandle<ReaderStats>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let started = Instant::now();
        let mut reader = LineReader::new(
            BufReader::with_capacity(READ_BUFFER_SIZE, pipe),
            stream,
            max_line,
        );
        let mut stats = ReaderStats::default();

        loop {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => {
                    stats.chunks += 1;
                    stats.bytes += chunk.len() as u64;
                    if chunk.truncated {
                        stats.truncated_chunks += 1;
                    }
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(stream = stream.as_str(), error = %err, "output read failed");
                    break;
                }
            }
        }

        tracing::debug!(
            stream = stream.as_str(),
            chunks = stats.chunks,
            bytes = stats.bytes,
            truncated_chunks = stats.truncated_chunks,
            age_ms = started.elapsed().as_millis() as u64,
            "output stream ended"
        );
        stats
    })
}

/// Tracks time since the last output while the process is running.
#[derive(Debug)]
pub struct StallDetector {
    threshold: Duration,
    last_activity: Instant,
    paused: bool,
    reported: bool,
}

impl StallDetector {
    pub fn new(threshold: Duration, now: Instant) -> Self {
        Self {
            threshold,
            last_activity: now,
            paused: false,
            reported: false,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
        self.reported = false;
    }

    pub fn set_paused(&mut self, paused: bool, now: Instant) {
        if self.paused && !paused {
            self.record_activity(now);
        }
        self.paused = paused;
    }

    /// Reports the silence duration once per stall.
    pub fn check(&mut self, now: Instant) -> Option<Duration> {
        if self.paused || self.reported {
            return None;
        }
        let silent = now.saturating_duration_since(self.last_activity);
        if silent >= self.threshold {
            self.reported = true;
            Some(silent)
        } else {
            None
        }
    }

    /// How often the owner should call [`StallDetector::check`].
    pub fn poll_interval(&self) -> Duration {
        (self.threshold / 4).clamp(Duration::from_millis(10), Duration::from_secs(1))
    }
}
