//! Per-operation progress reporting

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::storage::{TransferObserver, TransferState};

/// Forwards progress to an optional observer, never going backwards
pub(crate) struct Progress {
    observer: Option<Arc<dyn TransferObserver>>,
    percent: AtomicU8,
}

impl Progress {
    pub(crate) fn new(observer: Option<Arc<dyn TransferObserver>>) -> Self {
        Self {
            observer,
            percent: AtomicU8::new(0),
        }
    }

    pub(crate) fn state(&self, state: TransferState) {
        if let Some(observer) = &self.observer {
            observer.progress_with_state(self.percent.load(Ordering::SeqCst), state);
        }
    }

    /// Report `percent` if it is ahead of what was reported
    pub(crate) fn advance(&self, percent: u8, state: TransferState) {
        let percent = percent.min(100);
        let previous = self.percent.fetch_max(percent, Ordering::SeqCst);
        if percent > previous {
            if let Some(observer) = &self.observer {
                observer.progress_with_state(percent, state);
            }
        }
    }

    /// Report the terminal state of an operation
    pub(crate) fn finish<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => {
                self.percent.store(100, Ordering::SeqCst);
                if let Some(observer) = &self.observer {
                    observer.progress_made(100);
                    observer.progress_with_state(100, TransferState::Complete);
                }
            }
            Err(e) if e.is_path_error() => self.state(TransferState::ErrorPath),
            Err(_) => self.state(TransferState::Error),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::recorder::Recorder;
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_never_goes_back() {
        let recorder = Arc::new(Recorder::default());
        let progress = Progress::new(Some(recorder.clone()));
        progress.state(TransferState::Initializing);
        progress.advance(40, TransferState::Active);
        progress.advance(20, TransferState::Active);
        progress.advance(60, TransferState::IntermediateResult);
        progress.finish::<()>(&Ok(()));

        assert!(recorder.is_monotonic());
        assert_eq!(recorder.events.lock().len(), 5);
        assert_eq!(recorder.last_state(), Some(TransferState::Complete));
    }

    #[test]
    fn test_error_states() {
        let recorder = Arc::new(Recorder::default());
        let progress = Progress::new(Some(recorder.clone()));
        progress.finish::<()>(&Err(Error::PathNotFound("/x".into())));
        assert_eq!(recorder.last_state(), Some(TransferState::ErrorPath));

        progress.finish::<()>(&Err(Error::Timeout("slow".into())));
        assert_eq!(recorder.last_state(), Some(TransferState::Error));
    }
}
