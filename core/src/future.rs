//! Composable single-fire asynchronous values.
//!
//! A [`Future`] delivers exactly one [`FutureEvent`] and is completed through its
//! [`Promise`]. Every variant is the same state machine, configured at construction:
//!
//! - plain futures dispatch their event once; subscribing after that yields
//!   `Failed(AlreadyCompleted)`,
//! - replaying futures ([`Promise::replaying`], [`Future::ready`]) hand the cached
//!   event to every subscriber, late ones included,
//! - forwarding futures ([`Future::forwarding`]) start their producer on the first
//!   subscription.

mod event;

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub use self::event::FutureEvent;

use crate::sync::BlockingCell;
use crate::Error;

type Callback<T> = Box<dyn FnOnce(FutureEvent<T>) + Send>;
type Producer<T> = Box<dyn FnOnce(Promise<T>) + Send>;
type CancelHook = Box<dyn FnOnce(bool) + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum State<T> {
    Pending(Vec<(u64, Callback<T>)>),
    Done {
        event: FutureEvent<T>,
        dispatched: bool,
    },
}

struct Shared<T> {
    state: Mutex<State<T>>,
    replay: bool,
    next_key: AtomicU64,
    producer: Mutex<Option<Producer<T>>>,
    on_cancel: Mutex<Option<CancelHook>>,
}

impl<T> Shared<T>
where
    T: Clone + Send + 'static,
{
    fn new(state: State<T>, replay: bool, producer: Option<Producer<T>>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            replay,
            next_key: AtomicU64::new(0),
            producer: Mutex::new(producer),
            on_cancel: Mutex::new(None),
        })
    }

    fn is_done(&self) -> bool {
        matches!(*lock(&self.state), State::Done { .. })
    }

    fn is_cancelled(&self) -> bool {
        matches!(
            *lock(&self.state),
            State::Done {
                event: FutureEvent::Cancelled,
                ..
            }
        )
    }

    fn event(&self) -> Option<FutureEvent<T>> {
        match &*lock(&self.state) {
            State::Done { event, .. } => Some(event.clone()),
            State::Pending(_) => None,
        }
    }

    /// Moves to the terminal state; returns the subscribers to notify or `None` when already done.
    fn finish(&self, event: &FutureEvent<T>) -> Option<Vec<Callback<T>>> {
        let mut state = lock(&self.state);
        let subscribers = match &mut *state {
            State::Pending(subscribers) => mem::take(subscribers)
                .into_iter()
                .map(|(_, callback)| callback)
                .collect::<Vec<_>>(),
            State::Done { .. } => return None,
        };

        *state = State::Done {
            event: event.clone(),
            dispatched: !subscribers.is_empty(),
        };

        Some(subscribers)
    }

    fn complete(self: &Arc<Self>, event: FutureEvent<T>) -> bool {
        match self.finish(&event) {
            Some(subscribers) => {
                self.on_cancel_take();
                dispatch(subscribers, event);
                true
            }
            None => false,
        }
    }

    fn cancel(self: &Arc<Self>, may_interrupt: bool) -> bool {
        let event = FutureEvent::Cancelled;
        let Some(subscribers) = self.finish(&event) else {
            return false;
        };

        lock(&self.producer).take();
        if let Some(hook) = self.on_cancel_take() {
            hook(may_interrupt);
        }
        dispatch(subscribers, event);

        true
    }

    fn on_cancel_take(&self) -> Option<CancelHook> {
        lock(&self.on_cancel).take()
    }

    /// Returns the key of the subscription while the future is pending.
    fn subscribe(self: &Arc<Self>, callback: Callback<T>) -> Option<u64> {
        let late = {
            let mut state = lock(&self.state);
            match &mut *state {
                State::Pending(subscribers) => {
                    let key = self.next_key.fetch_add(1, Ordering::Relaxed);
                    subscribers.push((key, callback));
                    Err(key)
                }
                State::Done { event, dispatched } => {
                    let late = if self.replay || !*dispatched {
                        event.clone()
                    } else {
                        FutureEvent::failed(Error::AlreadyCompleted)
                    };
                    *dispatched = true;

                    Ok((callback, late))
                }
            }
        };

        match late {
            Ok((callback, event)) => {
                callback(event);
                None
            }
            Err(key) => {
                let producer = lock(&self.producer).take();
                if let Some(producer) = producer {
                    producer(Promise {
                        shared: Arc::clone(self),
                    });
                }
                Some(key)
            }
        }
    }

    /// Withdraws a pending subscription. Returns `false` when it was already dispatched.
    fn unsubscribe(&self, key: u64) -> bool {
        match &mut *lock(&self.state) {
            State::Pending(subscribers) => {
                let before = subscribers.len();
                subscribers.retain(|(k, _)| *k != key);
                subscribers.len() != before
            }
            State::Done { .. } => false,
        }
    }
}

fn dispatch<T: Clone>(subscribers: Vec<Callback<T>>, event: FutureEvent<T>) {
    for callback in subscribers {
        callback(event.clone());
    }
}

/// An observable, single-fire and cancellable computation.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    /// A replaying future that is already done with the event.
    pub fn ready(event: FutureEvent<T>) -> Self {
        Self {
            shared: Shared::new(
                State::Done {
                    event,
                    dispatched: false,
                },
                true,
                None,
            ),
        }
    }

    /// A replaying future completed with the value.
    pub fn value(value: T) -> Self {
        Self::ready(FutureEvent::Completed(value))
    }

    pub fn cancelled() -> Self {
        Self::ready(FutureEvent::Cancelled)
    }

    pub fn failed(error: Error) -> Self {
        Self::ready(FutureEvent::failed(error))
    }

    /// A future whose producer runs once, on the first subscription.
    /// The producer completes the future through the given promise; once the future
    /// has been cancelled, the producer's completion is ignored.
    pub fn forwarding<P>(producer: P) -> Self
    where
        P: FnOnce(Promise<T>) + Send + 'static,
    {
        Self {
            shared: Shared::new(State::Pending(vec![]), false, Some(Box::new(producer))),
        }
    }

    /// Registers a callback for the terminal event.
    /// It runs immediately when the future is already done, on the completing thread otherwise.
    pub fn on<F>(&self, callback: F)
    where
        F: FnOnce(FutureEvent<T>) + Send + 'static,
    {
        self.shared.subscribe(Box::new(callback));
    }

    /// Requests cancellation. Returns `false` when the future is already done.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.shared.cancel(may_interrupt)
    }

    /// Whether the future reached its terminal state.
    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }

    /// Blocks the current thread until the event is available.
    ///
    /// # Panics
    /// When called on a [`DispatchContext`](crate::sync::DispatchContext) before the
    /// future is done.
    pub fn wait(&self) -> FutureEvent<T> {
        self.bridge().0.get()
    }

    /// Blocks the current thread until the event is available or the timeout elapsed,
    /// in which case `TimedOut` is returned and the future stays untouched.
    pub fn wait_timeout(&self, timeout: Duration) -> FutureEvent<T> {
        let (cell, key) = self.bridge();
        if let Some(event) = cell.get_timeout(timeout) {
            return event;
        }

        match key {
            Some(key) if self.shared.unsubscribe(key) => FutureEvent::TimedOut,
            // Completed while timing out; the bridge has taken the event.
            _ => self.shared.event().unwrap_or(FutureEvent::TimedOut),
        }
    }

    fn bridge(&self) -> (Arc<BlockingCell<FutureEvent<T>>>, Option<u64>) {
        let cell = Arc::new(BlockingCell::new());
        let writer = Arc::clone(&cell);
        let key = self
            .shared
            .subscribe(Box::new(move |event| writer.set(event)));

        (cell, key)
    }

    /// Transforms the completed value.
    pub fn map<B, F>(&self, f: F) -> Future<B>
    where
        B: Clone + Send + 'static,
        F: FnOnce(T) -> B + Send + 'static,
    {
        self.try_map(move |value| Ok(f(value)))
    }

    /// Transforms the completed value with a fallible function; an error fails the future.
    pub fn try_map<B, F>(&self, f: F) -> Future<B>
    where
        B: Clone + Send + 'static,
        F: FnOnce(T) -> crate::Result<B> + Send + 'static,
    {
        let upstream = self.clone();
        let derived = Future::forwarding(move |promise: Promise<B>| {
            upstream.on(move |event| {
                let event = match event.split() {
                    Ok(value) => match f(value) {
                        Ok(value) => FutureEvent::Completed(value),
                        Err(error) => FutureEvent::failed(error),
                    },
                    Err(event) => event,
                };
                promise.complete(event);
            });
        });

        let upstream = self.clone();
        derived.set_cancel_hook(move |may_interrupt| {
            upstream.cancel(may_interrupt);
        });

        derived
    }

    /// Chains the future returned by `f` for the completed value.
    pub fn flat_map<B, F>(&self, f: F) -> Future<B>
    where
        B: Clone + Send + 'static,
        F: FnOnce(T) -> Future<B> + Send + 'static,
    {
        let inner: Arc<Mutex<Option<Future<B>>>> = Arc::new(Mutex::new(None));

        let upstream = self.clone();
        let slot = Arc::clone(&inner);
        let derived = Future::forwarding(move |promise: Promise<B>| {
            upstream.on(move |event| match event.split() {
                Ok(value) => {
                    let future = f(value);
                    *lock(&slot) = Some(future.clone());

                    if promise.is_cancelled() {
                        future.cancel(false);
                        return;
                    }
                    future.on(move |event| {
                        promise.complete(event);
                    });
                }
                Err(event) => {
                    promise.complete(event);
                }
            });
        });

        let upstream = self.clone();
        derived.set_cancel_hook(move |may_interrupt| {
            upstream.cancel(may_interrupt);
            let future = lock(&inner).take();
            if let Some(future) = future {
                future.cancel(may_interrupt);
            }
        });

        derived
    }

    fn set_cancel_hook<F>(&self, hook: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        *lock(&self.shared.on_cancel) = Some(Box::new(hook));
    }
}

/// The producing side of a [`Future`].
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    /// A promise whose future dispatches its event once.
    pub fn new() -> Self {
        Self {
            shared: Shared::new(State::Pending(vec![]), false, None),
        }
    }

    /// A promise whose future replays its event to every subscriber.
    pub fn replaying() -> Self {
        Self {
            shared: Shared::new(State::Pending(vec![]), true, None),
        }
    }

    pub fn future(&self) -> Future<T> {
        Future {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Completes the future. Returns `false` when it was already done (e.g. cancelled).
    pub fn complete(&self, event: FutureEvent<T>) -> bool {
        self.shared.complete(event)
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(FutureEvent::Completed(value))
    }

    pub fn fail(&self, error: Error) -> bool {
        self.complete(FutureEvent::failed(error))
    }

    /// Registers the action run when the future gets cancelled while pending.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        self.future().set_cancel_hook(hook)
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.shared.is_done()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    fn collect<T>(future: &Future<T>) -> Arc<Mutex<Vec<FutureEvent<T>>>>
    where
        T: Clone + Send + 'static,
    {
        let events = Arc::new(Mutex::new(vec![]));
        let sink = Arc::clone(&events);
        future.on(move |event| sink.lock().unwrap().push(event));

        events
    }

    #[test]
    fn test_unit_future() {
        let future = Future::value("String");

        assert_eq!(Some("String"), future.wait().into_value());
        assert!(future.is_done());
    }

    #[test]
    fn test_cancelled_and_failed_units() {
        assert!(Future::<u8>::cancelled().wait().is_cancelled());
        assert!(matches!(
            Future::<u8>::failed(Error::NotRunning).wait().error(),
            Some(Error::NotRunning)
        ));
    }

    #[test]
    fn test_event_delivered_exactly_once() {
        let promise = Promise::new();
        let future = promise.future();
        let events = collect(&future);

        assert!(promise.succeed(1));
        assert!(!promise.succeed(2));

        let events = events.lock().unwrap();
        assert_eq!(1, events.len());
        assert_eq!(Some(&1), events[0].value());
    }

    #[test]
    fn test_plain_future_rejects_late_subscriber() {
        let promise = Promise::new();
        let future = promise.future();
        let first = collect(&future);

        promise.succeed("done");
        let second = collect(&future);

        assert_eq!(Some(&"done"), first.lock().unwrap()[0].value());
        assert!(matches!(
            second.lock().unwrap()[0].error(),
            Some(Error::AlreadyCompleted)
        ));
    }

    #[test]
    fn test_plain_future_hands_undispatched_event_to_first_subscriber() {
        let promise = Promise::new();
        promise.succeed(3);
        let future = promise.future();

        assert_eq!(Some(3), future.wait().into_value());
        assert!(matches!(
            future.wait().error(),
            Some(Error::AlreadyCompleted)
        ));
    }

    #[test]
    fn test_replay_future_replays_to_every_subscriber() {
        let promise = Promise::replaying();
        let future = promise.future();
        let early = collect(&future);

        promise.succeed(9000u16);
        let late = collect(&future);

        assert_eq!(Some(&9000), early.lock().unwrap()[0].value());
        assert_eq!(Some(&9000), late.lock().unwrap()[0].value());
        assert_eq!(Some(9000), future.wait().into_value());
    }

    #[test]
    fn test_cancel_pending_future() {
        let promise = Promise::<u8>::new();
        let future = promise.future();
        let events = collect(&future);

        assert!(future.cancel(false));
        assert!(promise.is_cancelled());
        assert!(!promise.succeed(1));
        assert!(events.lock().unwrap()[0].is_cancelled());
    }

    #[test]
    fn test_cancel_after_completion_is_rejected() {
        let promise = Promise::replaying();
        let future = promise.future();
        promise.succeed(1);

        assert!(!future.cancel(true));
        assert_eq!(Some(1), future.wait().into_value());
    }

    #[test]
    fn test_cancel_runs_hook() {
        let interrupted = Arc::new(AtomicUsize::new(0));
        let promise = Promise::<u8>::new();
        let flag = Arc::clone(&interrupted);
        promise.on_cancel(move |may_interrupt| {
            if may_interrupt {
                flag.fetch_add(1, Ordering::SeqCst);
            }
        });

        assert!(promise.future().cancel(true));
        assert_eq!(1, interrupted.load(Ordering::SeqCst));
    }

    #[test]
    fn test_forwarding_future_starts_lazily_once() {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        let future = Future::forwarding(move |promise| {
            counter.fetch_add(1, Ordering::SeqCst);
            promise.succeed("produced");
        });

        assert_eq!(0, starts.load(Ordering::SeqCst));
        assert_eq!(Some("produced"), future.wait().into_value());
        future.on(|_| {});
        assert_eq!(1, starts.load(Ordering::SeqCst));
    }

    #[test]
    fn test_forwarding_future_ignores_completion_after_cancel() {
        let slot: Arc<Mutex<Option<Promise<u8>>>> = Arc::new(Mutex::new(None));
        let keep = Arc::clone(&slot);
        let future = Future::forwarding(move |promise| {
            *keep.lock().unwrap() = Some(promise);
        });
        let events = collect(&future);

        assert!(future.cancel(false));
        let promise = slot.lock().unwrap().take().unwrap();
        assert!(!promise.succeed(1));

        let events = events.lock().unwrap();
        assert_eq!(1, events.len());
        assert!(events[0].is_cancelled());
    }

    #[test]
    fn test_map() {
        let future = Future::value(100).map(|v| v.to_string());

        assert_eq!(Some("100".to_string()), future.wait().into_value());
    }

    #[test]
    fn test_try_map_failure() {
        let future = Future::value(100).try_map(|_| -> crate::Result<String> {
            Err(Error::Unsupported("mapping"))
        });

        let event = future.wait();
        assert!(event.value().is_none());
        assert!(matches!(event.error(), Some(Error::Unsupported(_))));
    }

    #[test]
    fn test_map_propagates_cancellation() {
        let future = Future::<u8>::cancelled().map(|v| v + 1);

        assert!(future.wait().is_cancelled());
    }

    #[test]
    fn test_flat_map() {
        let future = Future::value(100).flat_map(|v| Future::value(format!("value {v}")));

        assert_eq!(Some("value 100".to_string()), future.wait().into_value());
    }

    #[test]
    fn test_flat_map_across_threads() {
        let promise = Promise::new();
        let future = promise
            .future()
            .flat_map(|v: u32| {
                let inner = Promise::new();
                let producer = inner.clone();
                thread::spawn(move || producer.succeed(v * 2));
                inner.future()
            })
            .map(|v| v + 1);

        let producer = promise.clone();
        thread::spawn(move || producer.succeed(20));

        assert_eq!(Some(41), future.wait().into_value());
    }

    #[test]
    fn test_cancel_derived_cancels_upstream() {
        let promise = Promise::<u8>::new();
        let upstream = promise.future();
        let derived = upstream.map(|v| v * 2);
        let events = collect(&derived);

        assert!(derived.cancel(false));
        assert!(promise.is_cancelled());
        assert!(!promise.succeed(1));
        assert!(events.lock().unwrap()[0].is_cancelled());
        assert!(!derived.cancel(false));
    }

    #[test]
    fn test_wait_timeout() {
        let promise = Promise::<u8>::new();

        assert!(promise
            .future()
            .wait_timeout(Duration::from_millis(20))
            .is_timed_out());
        assert!(!promise.is_done());
    }

    #[test]
    fn test_timed_out_wait_leaves_event_to_next_subscriber() {
        let promise = Promise::new();
        let future = promise.future();

        assert!(future.wait_timeout(Duration::from_millis(10)).is_timed_out());
        promise.succeed(7);
        let events = collect(&future);

        let events = events.lock().unwrap();
        assert_eq!(1, events.len());
        assert_eq!(Some(&7), events[0].value());
    }
}
