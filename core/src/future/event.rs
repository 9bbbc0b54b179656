use std::sync::Arc;

use crate::Error;

/// The terminal event of a [`Future`](super::Future).
#[derive(Debug, Clone)]
pub enum FutureEvent<T> {
    Completed(T),
    Cancelled,
    TimedOut,
    Failed(Arc<Error>),
}

impl<T> FutureEvent<T> {
    /// Shorthand for a failed event.
    pub fn failed(error: Error) -> Self {
        Self::Failed(Arc::new(error))
    }

    /// Transforms the completed value; other events are forwarded untouched.
    pub fn map<B, F>(self, f: F) -> FutureEvent<B>
    where
        F: FnOnce(T) -> B,
    {
        match self.split() {
            Ok(value) => FutureEvent::Completed(f(value)),
            Err(event) => event,
        }
    }

    /// Splits the completed value from the events that carry none.
    pub(crate) fn split<B>(self) -> Result<T, FutureEvent<B>> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Cancelled => Err(FutureEvent::Cancelled),
            Self::TimedOut => Err(FutureEvent::TimedOut),
            Self::Failed(error) => Err(FutureEvent::Failed(error)),
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        self.split::<()>().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }

    /// Converts into a result, turning cancellation and timeouts into errors.
    pub fn into_result(self) -> Result<T, Arc<Error>> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Cancelled => Err(Arc::new(Error::Cancelled)),
            Self::TimedOut => Err(Arc::new(Error::Timeout)),
            Self::Failed(error) => Err(error),
        }
    }
}
