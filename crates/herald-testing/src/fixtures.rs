//! Event fixtures with deterministic identities.

use herald_core::{Event, EventBuilder};
use serde_json::{json, Value};

/// Source attribute of fixture events.
pub const FIXTURE_SOURCE: &str = "/herald/tests";

/// Builder preloaded with fixture defaults: id `evt-1`, the fixture
/// source, type `dev.herald.test`, and a small JSON payload.
pub fn event_builder() -> EventBuilder {
    Event::builder()
        .id("evt-1")
        .source(FIXTURE_SOURCE)
        .ty("dev.herald.test")
        .json_data(&json!({"message": "hello"}))
}

/// A fixture event.
pub fn event() -> Event {
    event_builder().build().expect("fixture event is valid")
}

/// A fixture event with the given id and JSON payload.
pub fn event_with(id: &str, data: &Value) -> Event {
    event_builder().id(id).json_data(data).build().expect("fixture event is valid")
}

/// An event a destination answers with.
pub fn reply_event() -> Event {
    Event::builder()
        .id("reply-1")
        .source("/herald/tests/destination")
        .ty("dev.herald.reply")
        .json_data(&json!({"reply": true}))
        .build()
        .expect("fixture reply is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_are_distinct() {
        assert_eq!(event().id(), "evt-1");
        assert_eq!(event_with("evt-2", &json!(1)).id(), "evt-2");
        assert_ne!(event().ty(), reply_event().ty());
    }
}
