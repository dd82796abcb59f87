//! Transports
//!
//! A `Connection` is a frame reader plus a frame writer over any byte stream
//! pair: stdio for a sandbox process, an in-memory duplex for tests and
//! in-process embedding.

use tokio::io::{self, AsyncBufRead, AsyncWrite, BufReader, DuplexStream, ReadHalf, WriteHalf};

use crate::codec::{FrameReader, FrameWriter};

pub const DEFAULT_DUPLEX_BUFFER: usize = 64 * 1024;

pub struct Connection<R, W> {
    pub reader: FrameReader<R>,
    pub writer: FrameWriter<W>,
}

impl<R: AsyncBufRead + Unpin, W: AsyncWrite + Unpin> Connection<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
        }
    }

    pub fn split(self) -> (FrameReader<R>, FrameWriter<W>) {
        (self.reader, self.writer)
    }
}

pub type DuplexConnection = Connection<BufReader<ReadHalf<DuplexStream>>, WriteHalf<DuplexStream>>;

/// Two connected in-memory endpoints: what one writes, the other reads.
pub fn duplex(buffer: usize) -> (DuplexConnection, DuplexConnection) {
    let (left, right) = io::duplex(buffer);
    (endpoint(left), endpoint(right))
}

fn endpoint(stream: DuplexStream) -> DuplexConnection {
    let (read, write) = io::split(stream);
    Connection::new(BufReader::new(read), write)
}

pub type StdioConnection = Connection<BufReader<io::Stdin>, io::Stdout>;

/// The sandbox side of a process boundary: frames in on stdin, out on stdout.
pub fn stdio() -> StdioConnection {
    Connection::new(BufReader::new(io::stdin()), io::stdout())
}
