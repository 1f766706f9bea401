//! Constructors and predicates for the three message kinds: request,
//! response, event.

use cmdchan_wire::{Table, Value};

/// The implicit kind of a message, derived from its `_ctrl` table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
    Event,
}

/// Classify `message` by its `_ctrl` table: a response if `_rpl` is
/// present, else an event if `_evt` is present, else a request.
pub fn kind(message: &Table) -> Kind {
    let Some(ctrl) = message.get_table("_ctrl") else {
        return Kind::Request;
    };
    if ctrl.contains_key("_rpl") {
        Kind::Response
    } else if ctrl.contains_key("_evt") {
        Kind::Event
    } else {
        Kind::Request
    }
}

/// True if `message` is a response (`_ctrl._rpl` present).
pub fn is_reply(message: &Table) -> bool {
    kind(message) == Kind::Response
}

/// True if `message` is an unsolicited event (`_ctrl._evt` present).
pub fn is_event(message: &Table) -> bool {
    kind(message) == Kind::Event
}

/// True if `message` is a request (neither a response nor an event).
pub fn is_request(message: &Table) -> bool {
    kind(message) == Kind::Request
}

/// Build a bare request message: `{_ctrl: {}, _data: content}`.
pub fn request(content: Table) -> Table {
    let mut message = Table::new();
    message.insert("_ctrl", Table::new());
    message.insert("_data", content);
    message
}

/// Build an unsolicited event message: `{_ctrl: {_evt: "1"}, _data: content}`.
pub fn event(content: Table) -> Table {
    let mut ctrl = Table::new();
    ctrl.insert("_evt", "1");
    let mut message = Table::new();
    message.insert("_ctrl", ctrl);
    message.insert("_data", content);
    message
}

/// Build a response to `request`, with `_data.type` defaulting to the
/// request's own `type` when `request_type` is not given. Carries over
/// the request's `_seq` (if any), for sequence streams.
pub fn reply_to(request: &Table, request_type: Option<&str>) -> Table {
    let mut ctrl = Table::new();
    let mut data = Table::new();

    let ty = request_type
        .map(str::to_string)
        .or_else(|| {
            request
                .get_table("_data")
                .and_then(|d| d.get_str("type"))
                .map(str::to_string)
        });
    if let Some(ty) = ty {
        data.insert("type", ty);
    }

    ctrl.insert("_rpl", "1");
    if let Some(rseq) = request.get_table("_ctrl").and_then(|c| c.get_str("_sseq")) {
        ctrl.insert("_rseq", rseq.to_string());
    }
    if let Some(seq) = request.get_table("_ctrl").and_then(|c| c.get_str("_seq")) {
        ctrl.insert("_seq", seq.to_string());
    }

    let mut message = Table::new();
    message.insert("_ctrl", ctrl);
    message.insert("_data", data);
    message
}

/// Build an error response to `request` carrying `_data.err = detail`.
pub fn error(request: &Table, detail: impl Into<String>, request_type: Option<&str>) -> Table {
    let mut response = reply_to(request, request_type);
    if let Some(Value::Table(data)) = response.get_mut("_data") {
        data.insert("err", detail.into());
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Table {
        let mut ctrl = Table::new();
        ctrl.insert("_sseq", "5");
        let mut data = Table::new();
        data.insert("type", "zone.list");
        let mut message = Table::new();
        message.insert("_ctrl", ctrl);
        message.insert("_data", data);
        message
    }

    #[test]
    fn kind_classifies_all_three() {
        let req = sample_request();
        assert_eq!(kind(&req), Kind::Request);
        assert!(is_request(&req));

        let rsp = reply_to(&req, None);
        assert_eq!(kind(&rsp), Kind::Response);
        assert!(is_reply(&rsp));

        let mut data = Table::new();
        data.insert("type", "zone.changed");
        let evt = event(data);
        assert_eq!(kind(&evt), Kind::Event);
        assert!(is_event(&evt));
    }

    #[test]
    fn reply_to_carries_rseq_and_type() {
        let req = sample_request();
        let rsp = reply_to(&req, None);
        assert_eq!(rsp.get_table("_ctrl").unwrap().get_str("_rseq"), Some("5"));
        assert_eq!(
            rsp.get_table("_data").unwrap().get_str("type"),
            Some("zone.list")
        );
    }

    #[test]
    fn error_sets_err_field() {
        let req = sample_request();
        let rsp = error(&req, "no such zone", None);
        assert_eq!(
            rsp.get_table("_data").unwrap().get_str("err"),
            Some("no such zone")
        );
    }
}
