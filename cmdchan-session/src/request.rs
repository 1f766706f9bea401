//! `RequestState`: the future-like handle a caller waits on between
//! `ask` and a matching response arriving on the reader thread.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use cmdchan_wire::Table;

use crate::error::SessionError;

struct Inner {
    done: bool,
    response: Option<Table>,
    exception: Option<SessionError>,
}

/// Shared state for one outstanding request: the reader thread completes
/// it (with a response or an error) and the calling thread waits on it in
/// [`get_response`](Self::get_response).
pub struct RequestState {
    inner: Mutex<Inner>,
    done_cv: Condvar,
    raise_error: bool,
    sequence_ok: bool,
}

impl RequestState {
    pub fn new(raise_error: bool, sequence_ok: bool) -> Self {
        RequestState {
            inner: Mutex::new(Inner {
                done: false,
                response: None,
                exception: None,
            }),
            done_cv: Condvar::new(),
            raise_error,
            sequence_ok,
        }
    }

    /// Deliver a response and wake whoever is waiting on it. A no-op if
    /// the state was already completed (e.g. closed out from under a late
    /// response).
    pub fn complete(&self, response: Table) {
        let mut inner = self.inner.lock().unwrap();
        if inner.done {
            return;
        }
        inner.response = Some(response);
        inner.done = true;
        self.done_cv.notify_all();
    }

    /// Fail the request with `error` (e.g. `Closing` on session shutdown).
    pub fn return_exception(&self, error: SessionError) {
        let mut inner = self.inner.lock().unwrap();
        if inner.done {
            return;
        }
        inner.exception = Some(error);
        inner.done = true;
        self.done_cv.notify_all();
    }

    /// True once the reader has delivered a response or error.
    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    /// Block until the request completes (or `timeout` elapses), then
    /// apply `raise_error`/`sequence_ok` policy to the raw response.
    ///
    /// A timeout does not cancel the outstanding entry: the reader may
    /// still deliver a response later, at which point `complete` finds
    /// nothing waiting and simply discards it.
    pub fn get_response(&self, timeout: Option<Duration>) -> Result<Table, SessionError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.done {
            inner = match timeout {
                Some(t) => {
                    let (guard, _) = self
                        .done_cv
                        .wait_timeout_while(inner, t, |i| !i.done)
                        .unwrap();
                    if !guard.done {
                        return Err(SessionError::Timeout);
                    }
                    guard
                }
                None => self.done_cv.wait_while(inner, |i| !i.done).unwrap(),
            };
        }

        if let Some(e) = inner.exception.take() {
            return Err(e);
        }
        let response = inner.response.take().expect("done implies a response or an exception");

        if self.raise_error {
            if let Some(err) = response.get_table("_data").and_then(|d| d.get_str("err")) {
                return Err(SessionError::Error(err.to_string()));
            }
        }

        if !self.sequence_ok {
            let has_seq = response.get_table("_ctrl").map(|c| c.contains_key("_seq")).unwrap_or(false);
            if has_seq {
                return Err(SessionError::UnexpectedSequence);
            }
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn completes_and_returns_response() {
        let state = Arc::new(RequestState::new(true, false));
        let mut response = Table::new();
        response.insert("_ctrl", Table::new());
        response.insert("_data", Table::new());
        state.complete(response.clone());
        assert_eq!(state.get_response(None).unwrap(), response);
    }

    #[test]
    fn raise_error_surfaces_data_err() {
        let state = RequestState::new(true, false);
        let mut data = Table::new();
        data.insert("err", "no such zone");
        let mut response = Table::new();
        response.insert("_ctrl", Table::new());
        response.insert("_data", data);
        state.complete(response);
        match state.get_response(None) {
            Err(SessionError::Error(msg)) => assert_eq!(msg, "no such zone"),
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn unexpected_sequence_when_not_opted_in() {
        let state = RequestState::new(true, false);
        let mut ctrl = Table::new();
        ctrl.insert("_seq", "7");
        let mut response = Table::new();
        response.insert("_ctrl", ctrl);
        response.insert("_data", Table::new());
        state.complete(response);
        assert!(matches!(
            state.get_response(None),
            Err(SessionError::UnexpectedSequence)
        ));
    }

    #[test]
    fn timeout_without_response() {
        let state = RequestState::new(true, false);
        let result = state.get_response(Some(Duration::from_millis(20)));
        assert!(matches!(result, Err(SessionError::Timeout)));
    }
}
