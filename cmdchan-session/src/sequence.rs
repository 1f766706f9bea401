//! Multi-part reply streams ("sequences"): the client-side iterator and
//! the server-side trait a dispatcher-registered producer implements.

use std::sync::Arc;
use std::time::Duration;

use cmdchan_wire::Table;

use crate::error::SessionError;
use crate::session::Session;

/// Client side of a sequence: an iterator over the `_data` table of each
/// part. The first call sends the original request (optionally declaring
/// a batch size via `_ctrl._num`); follow-ups send `{_ctrl:{_seq:id},
/// _data:{type:"next"}}` until a response arrives without `_ctrl._more`.
pub struct Reader {
    session: Arc<Session>,
    initial: Option<Table>,
    seq_id: Option<String>,
    batch_size: u32,
    /// Whether the server's first response advertised `_ctrl._batch` *and*
    /// the caller asked for a batch size > 0; only then do follow-up
    /// requests carry `_ctrl._num`.
    batch: bool,
    batched: std::collections::VecDeque<Table>,
    done: bool,
    timeout: Option<Duration>,
}

impl Reader {
    /// `initial` is the fully-formed first request (`{_ctrl:{}, _data:{...}}`),
    /// as built by [`Session::sequence`].
    pub(crate) fn new(session: Arc<Session>, initial: Table, batch_size: u32, timeout: Option<Duration>) -> Self {
        Reader {
            session,
            initial: Some(initial),
            seq_id: None,
            batch_size,
            batch: false,
            batched: std::collections::VecDeque::new(),
            done: false,
            timeout,
        }
    }

    fn handle_first_response(&mut self, response: Table) -> Result<Option<Table>, SessionError> {
        let ctrl = response.get_table("_ctrl");
        let more = ctrl.map(|c| c.contains_key("_more")).unwrap_or(false);
        let seq_id = ctrl.and_then(|c| c.get_str("_seq")).map(str::to_string);
        self.batch = ctrl.map(|c| c.contains_key("_batch")).unwrap_or(false) && self.batch_size > 0;

        if !more {
            self.done = true;
            return self.finish_data(response);
        }

        let seq_id = seq_id.ok_or_else(|| {
            SessionError::BadSequence("_ctrl._more without _ctrl._seq".to_string())
        })?;
        self.seq_id = Some(seq_id);

        self.finish_data(response)
    }

    fn handle_followup_response(&mut self, response: Table) -> Result<Option<Table>, SessionError> {
        let ctrl = response.get_table("_ctrl");
        let more = ctrl.map(|c| c.contains_key("_more")).unwrap_or(false);
        if !more {
            self.done = true;
        }
        self.finish_data(response)
    }

    /// Extract `_data` as the yielded item, honoring the suppression rule:
    /// once `done`, a single-key `_data` (just the echoed `type`) is
    /// treated as "no more data" rather than a real item.
    fn finish_data(&mut self, response: Table) -> Result<Option<Table>, SessionError> {
        if let Some(list) = response
            .get_table("_data")
            .and_then(|d| d.get("list"))
            .and_then(cmdchan_wire::Value::as_list)
        {
            for item in list {
                if let Some(table) = item.as_table() {
                    self.batched.push_back(table.clone());
                }
            }
            return self.next_batched().transpose();
        }

        let data = response.get_table("_data").cloned().unwrap_or_default();
        if self.done && data.len() <= 1 {
            return Ok(None);
        }
        check_err(&data)?;
        Ok(Some(data))
    }

    /// Pop the next batched item, applying the same `err` check single
    /// items get.
    fn next_batched(&mut self) -> Option<Result<Table, SessionError>> {
        let item = self.batched.pop_front()?;
        match check_err(&item) {
            Ok(()) => Some(Ok(item)),
            Err(e) => Some(Err(e)),
        }
    }

    fn send_followup(&mut self) -> Result<Table, SessionError> {
        let seq_id = self.seq_id.clone().expect("follow-up requires a _seq id");
        let mut ctrl = Table::new();
        ctrl.insert("_seq", seq_id);
        if self.batch {
            ctrl.insert("_num", self.batch_size.to_string());
        }
        let mut data = Table::new();
        data.insert("type", "next");
        let mut message = Table::new();
        message.insert("_ctrl", ctrl);
        message.insert("_data", data);
        self.session.tell_raw(message, true, true, self.timeout)
    }

    /// Cancel an in-progress sequence by sending a `next` with `_end = 1`.
    /// Safe to call more than once; a no-op once the sequence is done.
    pub fn close(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(seq_id) = self.seq_id.clone() {
            let mut ctrl = Table::new();
            ctrl.insert("_seq", seq_id);
            ctrl.insert("_end", "1");
            let mut data = Table::new();
            data.insert("type", "next");
            let mut message = Table::new();
            message.insert("_ctrl", ctrl);
            message.insert("_data", data);
            let _ = self.session.tell_raw(message, false, true, self.timeout);
        }
    }
}

impl Iterator for Reader {
    type Item = Result<Table, SessionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.next_batched() {
            if item.is_err() {
                self.done = true;
            }
            return Some(item);
        }
        if self.done {
            return None;
        }

        let result = if let Some(request) = self.initial.take() {
            self.session
                .tell_raw(request, true, true, self.timeout)
                .and_then(|resp| self.handle_first_response(resp))
        } else {
            self.send_followup().and_then(|resp| self.handle_followup_response(resp))
        };

        match result {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Raise `Error` if `data` carries an `err` field; every part of a
/// sequence opts into `raise_error`, so this applies uniformly whether the
/// part came from a non-batched response or a batched `list` entry.
fn check_err(data: &Table) -> Result<(), SessionError> {
    if let Some(err) = data.get_str("err") {
        return Err(SessionError::Error(err.to_string()));
    }
    Ok(())
}

/// Server side of a sequence: a producer registered with
/// [`Session::add_sequence`] and driven by the session's built-in
/// `type:"next"` routing.
pub trait Sequence {
    /// Produce the next part in response to a `next` request, and whether
    /// this was the final part (no `_ctrl._more` on the reply).
    fn next_message(&mut self, request: &Table) -> (Table, bool);

    /// Called when the sequence is removed, whether by completion,
    /// client cancellation (`_ctrl._end`), or session close.
    fn close(&mut self) {}
}
