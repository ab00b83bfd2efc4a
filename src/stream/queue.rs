use crate::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use opencv::core::Mat;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

enum Message {
    Frame(Mat),
    End,
}

struct Shared {
    total_expected: AtomicUsize,
    produced: AtomicUsize,
    finished: AtomicBool,
    cancelled: AtomicBool,
    error: Mutex<Option<Error>>,
}

/// Unbounded FIFO of generated frames shared by one producer and its consumer.
///
/// Frames arrive in production order. The producer marks the stream finished
/// (optionally with an error); the consumer may cancel at any time, after which
/// `push` fails with `Cancelled`.
#[derive(Clone)]
pub struct OutputQueue {
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    shared: Arc<Shared>,
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputQueue {
    /// Create an empty queue with no expected total
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            shared: Arc::new(Shared {
                total_expected: AtomicUsize::new(0),
                produced: AtomicUsize::new(0),
                finished: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                error: Mutex::new(None),
            }),
        }
    }

    /// Announce how many frames the producer will emit
    pub fn set_total_expected(&self, total: usize) {
        self.shared.total_expected.store(total, Ordering::SeqCst);
    }

    /// Announced frame count, zero when unknown
    #[must_use]
    pub fn total_expected(&self) -> usize {
        self.shared.total_expected.load(Ordering::SeqCst)
    }

    /// Frames pushed so far
    #[must_use]
    pub fn produced(&self) -> usize {
        self.shared.produced.load(Ordering::SeqCst)
    }

    /// Append a frame
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` once the consumer cancelled, `InvalidInput` after `finish`
    pub fn push(&self, frame: Mat) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.is_finished() {
            return Err(Error::InvalidInput("Frame pushed after the stream finished".to_string()));
        }
        self.sender
            .send(Message::Frame(frame))
            .map_err(|_| Error::Cancelled)?;
        self.shared.produced.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Mark the stream complete; later calls are ignored
    pub fn finish(&self) {
        if !self.shared.finished.swap(true, Ordering::SeqCst) {
            // The receiver lives in `self`, so this cannot fail
            let _ = self.sender.send(Message::End);
        }
    }

    /// Finish the stream with an error the consumer can collect
    pub fn fail(&self, error: Error) {
        log::error!("Stream failed: {error}");
        *self.shared.error.lock() = Some(error);
        self.finish();
    }

    /// Whether the producer is done
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    /// Stop the producer at its next frame
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether the consumer cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Take the terminal error, if the stream failed
    #[must_use]
    pub fn take_error(&self) -> Option<Error> {
        self.shared.error.lock().take()
    }

    /// Next frame without waiting
    #[must_use]
    pub fn try_pop(&self) -> Option<Mat> {
        match self.receiver.try_recv() {
            Ok(Message::Frame(frame)) => Some(frame),
            Ok(Message::End) => {
                self.requeue_end();
                None
            }
            Err(_) => None,
        }
    }

    /// Wait for the next frame; `None` once the stream has ended and is drained
    #[must_use]
    pub fn recv(&self) -> Option<Mat> {
        match self.receiver.recv() {
            Ok(Message::Frame(frame)) => Some(frame),
            Ok(Message::End) => {
                self.requeue_end();
                None
            }
            Err(_) => None,
        }
    }

    /// Wait up to `timeout` for the next frame
    ///
    /// # Errors
    ///
    /// Returns `Ok(None)` on timeout, `Ok(None)` after the end as well; check `is_finished`
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Mat>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(Message::Frame(frame)) => Ok(Some(frame)),
            Ok(Message::End) => {
                self.requeue_end();
                Ok(None)
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Cancelled),
        }
    }

    /// Blocking iterator over the remaining frames
    pub fn iter(&self) -> impl Iterator<Item = Mat> + '_ {
        std::iter::from_fn(move || self.recv())
    }

    /// Keep the end marker visible to later readers
    fn requeue_end(&self) {
        let _ = self.sender.send(Message::End);
    }
}
