//! Buffered line I/O for the worker channel.
//!
//! Both ends of the channel speak newline-delimited JSON, so the transport
//! only needs "read one line" and "write one line and flush".

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::net::UnixStream;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Buffered line reader.
pub struct LineReader<R> {
    reader: BufReader<R>,
    line_buffer: String,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, inner),
            line_buffer: String::with_capacity(4096),
        }
    }

    pub fn get_ref(&self) -> &R {
        self.reader.get_ref()
    }

    /// Next line without its terminator, borrowed from the internal buffer.
    /// `None` at end of stream.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        self.line_buffer.clear();
        if self.reader.read_line(&mut self.line_buffer)? == 0 {
            return Ok(None);
        }
        let len = self.line_buffer.trim_end_matches(['\n', '\r']).len();
        self.line_buffer.truncate(len);
        Ok(Some(&self.line_buffer))
    }
}

/// Buffered line writer.
pub struct LineWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> LineWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, inner),
        }
    }

    /// Write a line (appends newline if not present) and flush.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()
    }

    /// Flush and unwrap the underlying writer.
    pub fn into_inner(self) -> io::Result<W> {
        self.writer.into_inner().map_err(|e| e.into_error())
    }
}

/// Split a connected socket into a reader/writer pair.
pub fn split_stream(
    stream: UnixStream,
) -> io::Result<(LineReader<UnixStream>, LineWriter<UnixStream>)> {
    let read_half = stream.try_clone()?;
    Ok((LineReader::new(read_half), LineWriter::new(stream)))
}
