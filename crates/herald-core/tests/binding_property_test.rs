//! Property-based tests for the CloudEvents HTTP binding.
//!
//! Whatever the attributes, writing an event and reading the message back
//! must recover the same event in both encodings, and arbitrary bytes fed to
//! the decoder must never panic.

use bytes::Bytes;
use herald_core::{
    binding::{from_structured_json, read_event, write_message, Encoding},
    event::validate_extension_name,
    Event,
};
use http::{HeaderMap, HeaderValue};
use proptest::prelude::*;

fn extension_strategy() -> impl Strategy<Value = (String, String)> {
    ("[a-z][a-z0-9]{0,12}", "\\PC{0,24}")
        .prop_filter("reserved attribute name", |(name, _)| validate_extension_name(name).is_ok())
}

/// Strategy for generating events with string extensions and binary payloads.
fn event_strategy() -> impl Strategy<Value = Event> {
    (
        "[a-zA-Z0-9-]{1,40}",                          // id
        "/[a-z0-9/]{0,30}",                            // source
        "[a-z][a-z.]{0,30}",                           // type
        proptest::option::of("\\PC{0,40}"),            // subject
        prop::collection::vec(any::<u8>(), 0..512),    // data
        prop::collection::vec(extension_strategy(), 0..4),
    )
        .prop_map(|(id, source, ty, subject, data, extensions)| {
            let mut builder = Event::builder()
                .id(id)
                .source(source)
                .ty(ty)
                .data("application/octet-stream", data);
            if let Some(subject) = subject {
                builder = builder.subject(subject);
            }
            for (name, value) in extensions {
                builder = builder.extension(name, value);
            }
            builder.build().unwrap()
        })
}

/// Compact JSON objects with unsorted keys and integers beyond 64 bits.
fn json_payload_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(("[a-z]{1,8}", "[1-9][0-9]{0,30}"), 1..6).prop_map(|fields| {
        let mut seen = std::collections::HashSet::new();
        let members: Vec<String> = fields
            .into_iter()
            .rev()
            .filter(|(key, _)| seen.insert(key.clone()))
            .map(|(key, number)| format!("\"{key}\":{number}"))
            .collect();
        format!("{{{}}}", members.join(","))
    })
}

proptest! {
    #[test]
    fn binary_encoding_round_trips(event in event_strategy()) {
        let message = write_message(&event, Encoding::Binary).unwrap();
        let decoded = read_event(&message.headers, message.body).unwrap();
        prop_assert_eq!(decoded, Some(event));
    }

    #[test]
    fn structured_encoding_round_trips(event in event_strategy()) {
        let message = write_message(&event, Encoding::Structured).unwrap();
        let decoded = read_event(&message.headers, message.body).unwrap();
        prop_assert_eq!(decoded, Some(event));
    }

    #[test]
    fn structured_encoding_keeps_json_payload_bytes(payload in json_payload_strategy()) {
        let event = Event::builder()
            .id("json")
            .source("/props")
            .ty("dev.herald.props")
            .data("application/json", payload.clone())
            .build()
            .unwrap();

        let message = write_message(&event, Encoding::Structured).unwrap();
        let decoded = read_event(&message.headers, message.body).unwrap().unwrap();
        prop_assert_eq!(decoded.data().as_ref(), payload.as_bytes());
    }

    #[test]
    fn structured_decoder_never_panics(body in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = from_structured_json(&body);
    }

    #[test]
    fn binary_decoder_never_panics(
        id in "\\PC{0,16}",
        time in "\\PC{0,32}",
        body in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut headers = HeaderMap::new();
        headers.insert("ce-specversion", HeaderValue::from_static("1.0"));
        headers.insert("ce-source", HeaderValue::from_static("/fuzz"));
        headers.insert("ce-type", HeaderValue::from_static("fuzz"));
        if let Ok(value) = HeaderValue::from_str(&id) {
            headers.insert("ce-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&time) {
            headers.insert("ce-time", value);
        }
        let _ = read_event(&headers, Bytes::from(body));
    }
}
