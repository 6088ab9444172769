//! Ordered, thread-safe writer for streamed responses.
//!
//! Scanner drivers report progress from their own callback threads while the
//! request thread is blocked inside the driver. Every producer pushes into one
//! queue; a single consumer thread owns the channel writer and flushes items
//! strictly in enqueue order.

use super::ipc::LineWriter;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::warn;

struct Queue<T> {
    /// `None` once sealed.
    sender: Mutex<Option<Sender<T>>>,
}

impl<T> Queue<T> {
    fn push(&self, item: T) -> bool {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    fn push_final(&self, item: T) -> bool {
        let mut guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(tx) => tx.send(item).is_ok(),
            None => false,
        }
    }

    fn seal(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Producer handle, cheap to clone into driver callbacks.
pub struct SequencedHandle<T> {
    queue: Arc<Queue<T>>,
}

impl<T> Clone for SequencedHandle<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T> SequencedHandle<T> {
    /// Enqueue an item. Returns false if the writer has been sealed.
    pub fn write(&self, item: T) -> bool {
        self.queue.push(item)
    }

    /// Enqueue a terminal item and seal the writer.
    pub fn write_final(&self, item: T) -> bool {
        self.queue.push_final(item)
    }
}

type Flushed<W> = (LineWriter<W>, Option<io::Error>);

/// Owner of the consumer thread.
pub struct SequencedWriter<T, W: Write> {
    handle: SequencedHandle<T>,
    consumer: JoinHandle<Flushed<W>>,
}

impl<T, W> SequencedWriter<T, W>
where
    T: Serialize + Send + 'static,
    W: Write + Send + 'static,
{
    /// Take ownership of `writer` and start the consumer thread.
    pub fn start(writer: LineWriter<W>) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<T>();
        let consumer = thread::Builder::new()
            .name("sequenced-writer".to_string())
            .spawn(move || {
                let mut writer = writer;
                let mut error = None;
                for item in rx {
                    // After the first failure keep draining so producers never block
                    if error.is_some() {
                        continue;
                    }
                    let result = serde_json::to_string(&item)
                        .map_err(io::Error::from)
                        .and_then(|line| writer.write_line(&line));
                    if let Err(e) = result {
                        warn!(error = %e, "Stream write failed; discarding remaining items");
                        error = Some(e);
                    }
                }
                (writer, error)
            })?;

        Ok(Self {
            handle: SequencedHandle {
                queue: Arc::new(Queue {
                    sender: Mutex::new(Some(tx)),
                }),
            },
            consumer,
        })
    }

    pub fn handle(&self) -> SequencedHandle<T> {
        self.handle.clone()
    }

    pub fn write(&self, item: T) -> bool {
        self.handle.write(item)
    }

    pub fn write_final(&self, item: T) -> bool {
        self.handle.write_final(item)
    }

    /// Seal the writer, wait until everything enqueued has been flushed, and
    /// hand back the underlying writer. Fails with the first write error.
    pub fn wait_for_completion(self) -> io::Result<LineWriter<W>> {
        self.handle.queue.seal();
        let (writer, error) = self
            .consumer
            .join()
            .map_err(|_| io::Error::other("sequenced writer thread panicked"))?;
        match error {
            Some(e) => Err(e),
            None => Ok(writer),
        }
    }
}
