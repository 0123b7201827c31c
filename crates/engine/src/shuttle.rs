//! Fan-in barrier collecting one response per partition (fork side) or
//! per node (originator side), firing a completion callback exactly once.

use parking_lot::Mutex;

use evq_common::EvqError;

/// One deposited response. Cells report either a payload or an in-band
/// error; the completion callback inspects all of them.
#[derive(Debug)]
pub struct CellResponse<T> {
    /// Originating cell instance number, for diagnostics.
    pub instance: usize,
    /// Payload on success.
    pub data: Option<T>,
    /// In-band error; the callback reports the first one it finds.
    pub error: Option<EvqError>,
}

impl<T> CellResponse<T> {
    /// Successful response.
    pub fn ok(instance: usize, data: T) -> Self {
        Self {
            instance,
            data: Some(data),
            error: None,
        }
    }

    /// Error response.
    pub fn err(instance: usize, error: EvqError) -> Self {
        Self {
            instance,
            data: None,
            error: Some(error),
        }
    }
}

type Completion<T> = Box<dyn FnOnce(Vec<CellResponse<T>>) + Send>;

struct ShuttleInner<T> {
    expected: usize,
    responses: Vec<CellResponse<T>>,
    completion: Option<Completion<T>>,
}

/// Collects `expected` responses and invokes the completion callback on
/// the thread that deposits the final one.
///
/// Even when a response carries an error the shuttle keeps waiting for
/// the remaining arrivals, so every participant's buffers are released
/// before the (single) error reply goes out. Exactly-once completion is
/// enforced by taking the callback out of an `Option`.
pub struct Shuttle<T> {
    inner: Mutex<ShuttleInner<T>>,
}

impl<T> Shuttle<T> {
    /// Barrier for `expected` arrivals; `expected` must be non-zero
    /// (callers with nothing to wait for skip the shuttle entirely).
    pub fn new(expected: usize, completion: impl FnOnce(Vec<CellResponse<T>>) + Send + 'static) -> Self {
        debug_assert!(expected > 0, "shuttle with nothing to wait for");
        Self {
            inner: Mutex::new(ShuttleInner {
                expected,
                responses: Vec::with_capacity(expected),
                completion: Some(Box::new(completion)),
            }),
        }
    }

    /// Deposit one response; thread-safe. Fires the completion callback
    /// when the final expected response lands. Late arrivals past the
    /// expected count are dropped.
    pub fn arrive(&self, response: CellResponse<T>) {
        let fire = {
            let mut inner = self.inner.lock();
            if inner.completion.is_none() {
                return;
            }
            inner.responses.push(response);
            if inner.responses.len() >= inner.expected {
                let completion = inner.completion.take();
                let responses = std::mem::take(&mut inner.responses);
                completion.map(|cb| (cb, responses))
            } else {
                None
            }
        };
        if let Some((cb, responses)) = fire {
            cb(responses);
        }
    }

    /// True once the completion callback has fired.
    pub fn completed(&self) -> bool {
        self.inner.lock().completion.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fires_exactly_once_at_full_count() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = Arc::clone(&fired);
        let shuttle = Arc::new(Shuttle::new(3, move |responses| {
            assert_eq!(responses.len(), 3);
            fired_in.fetch_add(1, Ordering::SeqCst);
        }));
        for i in 0..3 {
            shuttle.arrive(CellResponse::ok(i, i));
        }
        // late arrival must not re-fire
        shuttle.arrive(CellResponse::ok(9, 9));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(shuttle.completed());
    }

    #[test]
    fn waits_for_stragglers_after_an_error() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = Arc::clone(&fired);
        let shuttle = Shuttle::new(2, move |responses: Vec<CellResponse<()>>| {
            assert!(responses.iter().any(|r| r.error.is_some()));
            fired_in.fetch_add(1, Ordering::SeqCst);
        });
        shuttle.arrive(CellResponse::err(0, evq_common::EvqError::route()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        shuttle.arrive(CellResponse::ok(1, ()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_arrivals_complete_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in = Arc::clone(&fired);
        let shuttle = Arc::new(Shuttle::new(16, move |_| {
            fired_in.fetch_add(1, Ordering::SeqCst);
        }));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let s = Arc::clone(&shuttle);
                std::thread::spawn(move || s.arrive(CellResponse::ok(i, i)))
            })
            .collect();
        for h in handles {
            h.join().expect("arrival thread");
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
