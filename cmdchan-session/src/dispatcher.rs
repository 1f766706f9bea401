//! Routes inbound requests and events to registered handlers.
//!
//! Matching falls through, in order: exact `type`, predicate, field
//! matchers, then a catch-all. A request shaped `object.method` that no
//! handler claims gets a synthesized "unknown command"/"unknown object"
//! error reply instead of being silently dropped.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use cmdchan_wire::Table;

use crate::error::SessionError;
use crate::session::Session;

/// The three message shapes a selector can be scoped to, plus `Any` for
/// handlers willing to see everything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
    Event,
    Any,
}

impl Kind {
    fn matches(self, actual: cmdchan_proto::Kind) -> bool {
        match (self, actual) {
            (Kind::Any, _) => true,
            (Kind::Request, cmdchan_proto::Kind::Request) => true,
            (Kind::Response, cmdchan_proto::Kind::Response) => true,
            (Kind::Event, cmdchan_proto::Kind::Event) => true,
            _ => false,
        }
    }
}

/// How a single field of `_data` must compare for a [`Selector::Fields`]
/// entry to match.
pub enum FieldMatch {
    Exact(String),
    Predicate(Box<dyn Fn(&str) -> bool + Send + Sync>),
}

/// What a handler is registered against.
pub enum Selector {
    /// `_data.type == ty`.
    Type(String),
    /// An arbitrary predicate over the whole message.
    Predicate(Box<dyn Fn(&Table) -> bool + Send + Sync>),
    /// Every named field of `_data` must be present and match.
    Fields(Vec<(String, FieldMatch)>),
    /// Matches every message of the entry's `Kind`.
    All,
}

impl Selector {
    fn matches(&self, message: &Table) -> bool {
        match self {
            Selector::Type(ty) => {
                message.get_table("_data").and_then(|d| d.get_str("type")) == Some(ty.as_str())
            }
            Selector::Predicate(f) => f(message),
            Selector::Fields(fields) => {
                let Some(data) = message.get_table("_data") else {
                    return false;
                };
                fields.iter().all(|(key, matcher)| match data.get_str(key) {
                    None => false,
                    Some(actual) => match matcher {
                        FieldMatch::Exact(expected) => actual == expected,
                        FieldMatch::Predicate(f) => f(actual),
                    },
                })
            }
            Selector::All => true,
        }
    }
}

/// A registered handler: returns `Ok(true)` if it claimed the message,
/// `Ok(false)` to let dispatch keep looking, or an error to report back
/// on the reader thread.
pub type HandlerFn = dyn Fn(&Arc<Session>, &Table, Kind) -> Result<bool, SessionError> + Send + Sync;

struct Entry {
    kind: Kind,
    selector: Selector,
    handler: Box<HandlerFn>,
}

/// Registry of message handlers plus the object-prefix bookkeeping needed
/// to synthesize "unknown command"/"unknown object" replies.
pub struct Dispatcher {
    entries: Mutex<Vec<Entry>>,
    /// Every `object` prefix that has at least one `Selector::Type`
    /// handler registered for `object.*`, used to pick between the two
    /// synthesized error messages.
    known_objects: Mutex<HashSet<String>>,
    fallback: Mutex<Option<Box<HandlerFn>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher {
            entries: Mutex::new(Vec::new()),
            known_objects: Mutex::new(HashSet::new()),
            fallback: Mutex::new(None),
        }
    }

    /// Register a handler for `selector` scoped to `kind`.
    pub fn on(
        &self,
        kind: Kind,
        selector: Selector,
        handler: impl Fn(&Arc<Session>, &Table, Kind) -> Result<bool, SessionError> + Send + Sync + 'static,
    ) {
        if let Selector::Type(ty) = &selector {
            if let Some((object, _method)) = ty.split_once('.') {
                self.known_objects.lock().unwrap().insert(object.to_string());
            }
        }
        self.entries.lock().unwrap().push(Entry {
            kind,
            selector,
            handler: Box::new(handler),
        });
    }

    /// Register the handler run when nothing else claims a message.
    pub fn set_fallback(
        &self,
        handler: impl Fn(&Arc<Session>, &Table, Kind) -> Result<bool, SessionError> + Send + Sync + 'static,
    ) {
        *self.fallback.lock().unwrap() = Some(Box::new(handler));
    }

    /// Run every registered handler in registration order, scoped to
    /// `kind`; order among matching handlers is not guaranteed to mean
    /// anything, and every one that matches runs, not just the first. If
    /// none claims the message and it is an `object.method` request,
    /// synthesize the unknown-command/unknown-object reply and ask the
    /// session to send it as an error response to `message`.
    pub fn dispatch(
        &self,
        session: &Arc<Session>,
        message: &Table,
        kind: Kind,
    ) -> Result<bool, SessionError> {
        let mut handled = false;
        let entries = self.entries.lock().unwrap();
        for entry in entries.iter() {
            if !entry.kind.matches(to_proto_kind(kind)) {
                continue;
            }
            if !entry.selector.matches(message) {
                continue;
            }
            if (entry.handler)(session, message, kind)? {
                handled = true;
            }
        }
        drop(entries);

        if handled {
            return Ok(true);
        }

        if let Some(fallback) = self.fallback.lock().unwrap().as_ref() {
            if fallback(session, message, kind)? {
                return Ok(true);
            }
        }

        if kind == Kind::Request {
            if let Some(ty) = message.get_table("_data").and_then(|d| d.get_str("type")) {
                if let Some((object, method)) = ty.split_once('.') {
                    let detail = if self.known_objects.lock().unwrap().contains(object) {
                        format!("unknown command '{method}' on object '{object}'")
                    } else {
                        format!("unknown object '{object}'")
                    };
                    session.reply_error(message, detail)?;
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn to_proto_kind(kind: Kind) -> cmdchan_proto::Kind {
    match kind {
        Kind::Request | Kind::Any => cmdchan_proto::Kind::Request,
        Kind::Response => cmdchan_proto::Kind::Response,
        Kind::Event => cmdchan_proto::Kind::Event,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_type(ty: &str) -> Table {
        let mut data = Table::new();
        data.insert("type", ty);
        let mut ctrl = Table::new();
        ctrl.insert("_sseq", "1");
        let mut message = Table::new();
        message.insert("_ctrl", ctrl);
        message.insert("_data", data);
        message
    }

    #[test]
    fn field_selector_requires_every_field() {
        let mut data = Table::new();
        data.insert("type", "zone.list");
        data.insert("domain", "example.com");
        let mut message = Table::new();
        message.insert("_data", data);

        let selector = Selector::Fields(vec![
            ("type".into(), FieldMatch::Exact("zone.list".into())),
            ("domain".into(), FieldMatch::Exact("example.com".into())),
        ]);
        assert!(selector.matches(&message));

        let selector = Selector::Fields(vec![(
            "domain".into(),
            FieldMatch::Exact("other.com".into()),
        )]);
        assert!(!selector.matches(&message));
    }

    #[test]
    fn known_object_tracked_from_type_selector() {
        let dispatcher = Dispatcher::new();
        dispatcher.on(Kind::Request, Selector::Type("zone.list".into()), |_, _, _| Ok(true));
        assert!(dispatcher.known_objects.lock().unwrap().contains("zone"));
        let _ = request_with_type("zone.list");
    }
}
