//! Primitives for racing futures against each other.
//!
//! [`race`] and [`race_ok`] drive a number of futures concurrently and resolve with the first
//! (successful) one, dropping all the others. [`announce`] implements the inverse: a spawned
//! computation that can hand out a value early while it keeps running to completion.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, select_all, select_ok};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Resolves with the output of whichever of the `racers` completes first.
///
/// All remaining racers are dropped, which cancels them.
///
/// # Panics
///
/// Panics if `racers` is empty.
pub async fn race<'a, T>(racers: impl IntoIterator<Item = BoxFuture<'a, T>>) -> T {
    let racers: Vec<_> = racers.into_iter().collect();
    assert!(!racers.is_empty(), "`race` needs at least one racer");

    let (output, _index, _remaining) = select_all(racers).await;
    output
}

/// Resolves with the first `Ok` result of the `racers`.
///
/// Failed racers are discarded as they complete. If every racer fails, the error of the last
/// one to fail is returned. Racers that are still running when a winner is found are dropped.
///
/// # Panics
///
/// Panics if `racers` is empty.
pub async fn race_ok<'a, T, E>(
    racers: impl IntoIterator<Item = BoxFuture<'a, Result<T, E>>>,
) -> Result<T, E> {
    let racers: Vec<_> = racers.into_iter().collect();
    assert!(!racers.is_empty(), "`race_ok` needs at least one racer");

    let (output, _remaining) = select_ok(racers).await?;
    Ok(output)
}

/// The sending half handed to the body of an [`announce`] call.
#[derive(Debug)]
pub struct Announcer<T> {
    sender: Option<oneshot::Sender<T>>,
}

impl<T> Announcer<T> {
    /// Publishes `value` to the corresponding [`Announcement`].
    ///
    /// Only the first announcement is delivered. Returns `false` if a value was announced
    /// before, or if nobody is listening anymore.
    pub fn announce(&mut self, value: T) -> bool {
        match self.sender.take() {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }

    /// Whether a value has already been announced.
    pub fn is_announced(&self) -> bool {
        self.sender.is_none()
    }
}

/// A future resolving to the value that was announced from within an [`announce`] body.
///
/// Resolves to `None` if the body completed (or panicked) without announcing anything.
/// Dropping an `Announcement` does not cancel the body.
#[derive(Debug)]
#[must_use = "an `Announcement` does nothing unless polled, but the body keeps running anyway"]
pub struct Announcement<T> {
    receiver: oneshot::Receiver<T>,
    body: JoinHandle<()>,
}

impl<T> Announcement<T> {
    /// Waits for the body to run to completion, discarding the announcement.
    ///
    /// Returns `false` if the body panicked.
    pub async fn finished(self) -> bool {
        self.body.await.is_ok()
    }
}

impl<T> Future for Announcement<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.receiver.poll_unpin(cx).map(Result::ok)
    }
}

/// Spawns `body` on `runtime` and returns an [`Announcement`] of the value it publishes.
///
/// The body is a detached task: it always runs to completion, no matter if the returned
/// [`Announcement`] is awaited, dropped, or loses some race. This makes it suitable for
/// work that has to signal progress to a waiter early, but must not be interrupted half-way.
pub fn announce<T, F, Fut>(runtime: &Handle, body: F) -> Announcement<T>
where
    T: Send + 'static,
    F: FnOnce(Announcer<T>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let announcer = Announcer {
        sender: Some(sender),
    };
    let body = runtime.spawn(body(announcer));

    Announcement { receiver, body }
}
