#![no_main]

//! Fuzz target for inbound event decoding.
//!
//! Reply bodies and headers come from arbitrary receivers. Decoding must
//! reject malformed input with an error and never panic.

use bytes::Bytes;
use herald_core::{binding::from_structured_json, read_event, write_message, Encoding};
use http::{header::CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    fuzz_structured(data);
    fuzz_binary(data);
});

/// Structured mode: the whole input is the JSON document.
fn fuzz_structured(data: &[u8]) {
    if let Ok(event) = from_structured_json(data) {
        // Whatever decodes must encode again.
        let _ = write_message(&event, Encoding::Structured).expect("decoded event re-encodes");
    }
}

/// Binary mode: the input is split into `ce-` header lines and a body.
fn fuzz_binary(data: &[u8]) {
    let (head, body) = match data.iter().position(|&b| b == 0) {
        Some(split) => (&data[..split], &data[split + 1..]),
        None => (data, &[][..]),
    };

    let mut headers = HeaderMap::new();
    headers.insert("ce-specversion", HeaderValue::from_static("1.0"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    for line in head.split(|&b| b == b'\n') {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = [b"ce-".as_slice(), &line[..colon]].concat();
        let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(&name), HeaderValue::from_bytes(&line[colon + 1..]))
        else {
            continue;
        };
        headers.append(name, value);
    }

    let _ = read_event(&headers, Bytes::copy_from_slice(body));
}
