use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::time::{Instant, Sleep, sleep_until};

/// A point in time after which pending I/O in one direction fails with
/// [`io::ErrorKind::TimedOut`]. Must be set from within a tokio runtime.
#[derive(Debug, Default)]
pub(crate) struct Deadline {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    pub(crate) fn set(&mut self, at: Option<Instant>) {
        self.sleep = at.map(|at| Box::pin(sleep_until(at)));
    }

    /// Wrap the result of polling the guarded operation: a pending
    /// operation turns into an error once the deadline has passed.
    pub(crate) fn guard<T>(&mut self, cx: &mut Context<'_>, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        match (poll, self.sleep.as_mut()) {
            (Poll::Pending, Some(sleep)) => match sleep.as_mut().poll(cx) {
                Poll::Ready(()) => Poll::Ready(Err(io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded"))),
                Poll::Pending => Poll::Pending,
            },
            (poll, _) => poll,
        }
    }
}
