#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use shiguredo_transport::{
    ConnectionScheme, ReceiveState, Reply, RequestDescriptor, TransportLimits,
};

#[derive(Arbitrary, Debug)]
enum FuzzContentType {
    None,
    Multipart,
    UrlEncoded,
    Other(String),
}

#[derive(Arbitrary, Debug)]
struct FuzzRequest {
    post: bool,
    content_type: FuzzContentType,
    declared: Option<u16>,
    max_request_size: u16,
    query: String,
    chunks: Vec<Vec<u8>>,
    fail: bool,
}

fuzz_target!(|input: FuzzRequest| {
    let method = if input.post { "POST" } else { "PUT" };
    let mut request = RequestDescriptor::new(method, "/").query_string(&input.query);
    request = match &input.content_type {
        FuzzContentType::None => request,
        FuzzContentType::Multipart => request.content_type("multipart/form-data; boundary=b"),
        FuzzContentType::UrlEncoded => request.content_type("application/x-www-form-urlencoded"),
        FuzzContentType::Other(ct) => request.content_type(ct),
    };
    if let Some(declared) = input.declared {
        request = request.content_length(declared as u64);
    }

    let limits = TransportLimits::default()
        .max_memory_request_size(256)
        .max_request_size(input.max_request_size as u64);
    let mut reply = Reply::new(request, limits, ConnectionScheme::Http);

    // パニックしなければ OK
    for chunk in &input.chunks {
        reply.consume_body(chunk, ReceiveState::Partial);
    }
    let last = if input.fail {
        ReceiveState::Error
    } else {
        ReceiveState::Complete
    };
    reply.consume_body(&[], last);
    while let Some(action) = reply.poll_action() {
        if let Some(action) = action.run_notification() {
            let _ = format!("{action:?}");
        }
    }
    reply.reset(RequestDescriptor::new("GET", "/"));
});
