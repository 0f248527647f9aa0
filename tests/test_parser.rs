use neptune_proxy::http::parser::{
    ChunkedDecoder, Framing, MAX_BODY_BYTES, ParseError, RequestDecoder, decode_chunked,
    parse_http_request, parse_response_head, response_framing,
};
use neptune_proxy::http::request::Method;
use neptune_proxy::http::response::StatusCode;

#[test]
fn test_parse_simple_get_request() {
    let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::GET);
    assert_eq!(parsed.target.path, "/");
    assert_eq!(parsed.version, "HTTP/1.1");
    assert_eq!(parsed.headers.get("Host").unwrap(), "example.com");
    assert_eq!(consumed, req.len());
}

#[test]
fn test_parse_post_request_with_body() {
    let req = b"POST /gremlin HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
    let (parsed, consumed) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::POST);
    assert_eq!(parsed.target.path, "/gremlin");
    assert_eq!(parsed.body.as_bytes().unwrap().as_ref(), b"hello");
    assert_eq!(consumed, req.len());
}

#[test]
fn test_parse_pipelined_requests() {
    let req = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
    let (first, consumed) = parse_http_request(req).unwrap();
    let (second, _) = parse_http_request(&req[consumed..]).unwrap();

    assert_eq!(first.target.path, "/a");
    assert_eq!(second.target.path, "/b");
}

#[test]
fn test_parse_multiple_headers() {
    let req = b"GET /path HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test-client\r\nAccept: */*\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.headers.get("Host").unwrap(), "example.com");
    assert_eq!(parsed.headers.get("User-Agent").unwrap(), "test-client");
    assert_eq!(parsed.headers.get("Accept").unwrap(), "*/*");
}

#[test]
fn test_parse_repeated_header_keeps_every_value() {
    let req = b"GET / HTTP/1.1\r\nX-Forwarded-For: 10.0.0.1\r\nX-Forwarded-For: 10.0.0.2\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    let values: Vec<&str> = parsed.headers.get_all("x-forwarded-for").collect();
    assert_eq!(values, vec!["10.0.0.1", "10.0.0.2"]);
}

#[test]
fn test_parse_request_with_path_and_query_string() {
    let req = b"GET /sparql?query=SELECT%20*&a=1 HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.target.path, "/sparql");
    assert_eq!(parsed.target.query.as_deref(), Some("query=SELECT%20*&a=1"));
    assert_eq!(parsed.target.path_and_query(), "/sparql?query=SELECT%20*&a=1");
}

#[test]
fn test_parse_incomplete_request_missing_blank_line() {
    let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n";
    let result = parse_http_request(req);

    assert!(matches!(result, Err(ParseError::Incomplete)));
}

#[test]
fn test_parse_incomplete_request_partial_body() {
    let req = b"POST /api HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello";
    let result = parse_http_request(req);

    assert!(matches!(result, Err(ParseError::Incomplete)));
}

#[test]
fn test_parse_invalid_http_method() {
    let req = b"G(T / HTTP/1.1\r\n\r\n";
    let result = parse_http_request(req);

    assert!(matches!(result, Err(ParseError::InvalidMethod)));
}

#[test]
fn test_parse_extension_method_is_kept() {
    let req = b"PROPFIND / HTTP/1.1\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.method, Method::Extension("PROPFIND".to_string()));
}

#[test]
fn test_parse_malformed_header() {
    let req = b"GET / HTTP/1.1\r\nBrokenHeader\r\n\r\n";
    let result = parse_http_request(req);

    assert!(matches!(result, Err(ParseError::InvalidHeader)));
}

#[test]
fn test_parse_various_http_methods() {
    let methods = vec![
        ("GET", Method::GET),
        ("POST", Method::POST),
        ("PUT", Method::PUT),
        ("DELETE", Method::DELETE),
        ("HEAD", Method::HEAD),
        ("OPTIONS", Method::OPTIONS),
        ("PATCH", Method::PATCH),
    ];

    for (method_str, expected_method) in methods {
        let req = format!("{} / HTTP/1.1\r\n\r\n", method_str);
        let (parsed, _) = parse_http_request(req.as_bytes()).unwrap();
        assert_eq!(parsed.method, expected_method);
    }
}

#[test]
fn test_parse_request_with_empty_body() {
    let req = b"POST /api HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert!(parsed.body.is_empty());
}

#[test]
fn test_parse_request_with_binary_body() {
    let req = b"POST /upload HTTP/1.1\r\nContent-Length: 4\r\n\r\n\x00\x01\x02\x03";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.body.as_bytes().unwrap().as_ref(), &[0, 1, 2, 3]);
}

#[test]
fn test_parse_invalid_content_length() {
    let req = b"POST /api HTTP/1.1\r\nContent-Length: lots\r\n\r\n";
    assert!(matches!(
        parse_http_request(req),
        Err(ParseError::InvalidContentLength)
    ));
}

#[test]
fn test_parse_header_case_preservation() {
    let req = b"GET / HTTP/1.1\r\nContent-Type: application/json\r\n\r\n";
    let (parsed, _) = parse_http_request(req).unwrap();

    assert_eq!(parsed.headers.iter().next(), Some(("Content-Type", "application/json")));
    assert!(parsed.headers.contains("content-type"));
}

#[test]
fn test_parse_response_head() {
    let res = b"HTTP/1.1 403 Forbidden\r\nContent-Length: 2\r\n\r\n{}";
    let (status, reason, headers, head_len) = parse_response_head(res).unwrap();

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(reason, "Forbidden");
    assert_eq!(headers.get("Content-Length"), Some("2"));
    assert_eq!(&res[head_len..], b"{}");
}

#[test]
fn test_response_framing() {
    let (_, _, headers, _) =
        parse_response_head(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
    assert_eq!(response_framing(&headers, false), Ok(Framing::Chunked));

    let (_, _, headers, _) = parse_response_head(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
    assert_eq!(response_framing(&headers, false), Ok(Framing::UntilClose));
    assert_eq!(response_framing(&headers, true), Ok(Framing::Length(0)));
}

#[test]
fn test_decode_chunked_body() {
    let (body, consumed) = decode_chunked(b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\nrest").unwrap();

    assert_eq!(&body[..], b"Wikipedia");
    assert_eq!(consumed, 30);
    assert!(matches!(decode_chunked(b"4\r\nWi"), Err(ParseError::Incomplete)));
}

#[test]
fn test_decode_chunked_rejects_size_past_address_space() {
    assert_eq!(
        decode_chunked(b"ffffffffffffffff\r\nabc\r\n"),
        Err(ParseError::InvalidChunk)
    );
    assert_eq!(
        decode_chunked(b"fffffffffffffffe\r\nabc\r\n"),
        Err(ParseError::InvalidChunk)
    );
}

#[test]
fn test_chunked_request_with_huge_size_is_rejected() {
    let req = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nfffffffffffffffe\r\nabc\r\n";
    assert!(matches!(parse_http_request(req), Err(ParseError::BodyTooLarge)));
}

#[test]
fn test_declared_length_over_limit_is_rejected_before_body_arrives() {
    let req = format!(
        "POST /gremlin HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
        MAX_BODY_BYTES + 1
    );
    assert!(matches!(
        parse_http_request(req.as_bytes()),
        Err(ParseError::BodyTooLarge)
    ));
}

#[test]
fn test_chunked_body_over_limit_is_rejected() {
    let mut decoder = RequestDecoder::new(8);
    let req = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n";
    assert!(matches!(decoder.decode(req), Err(ParseError::BodyTooLarge)));
}

#[test]
fn test_request_decoder_resumes_across_reads() {
    let full = b"POST /sparql HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nGET";
    let mut decoder = RequestDecoder::default();

    // Feed a growing prefix, the way a connection's buffer grows.
    let mut result = None;
    for end in 1..=full.len() {
        if let Some(done) = decoder.decode(&full[..end]).unwrap() {
            result = Some((done, end));
            break;
        }
    }

    let ((request, consumed), end) = result.expect("request should complete");
    assert_eq!(request.method, Method::POST);
    assert_eq!(request.body.as_bytes().unwrap().as_ref(), b"Wikipedia");
    assert_eq!(consumed, full.len() - 3);
    assert_eq!(end, consumed);

    // The decoder is ready for the next request.
    let next = b"GET /status HTTP/1.1\r\n\r\n";
    let (request, _) = decoder.decode(next).unwrap().unwrap();
    assert_eq!(request.target.path, "/status");
}

#[test]
fn test_chunked_decoder_waits_for_whole_chunk() {
    let mut decoder = ChunkedDecoder::with_limit(usize::MAX);
    let body = b"3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n";

    assert_eq!(decoder.decode(&body[..10]).unwrap(), None);
    assert_eq!(decoder.decode(&body[..14]).unwrap(), None);
    let (decoded, consumed) = decoder.decode(body).unwrap().unwrap();

    assert_eq!(&decoded[..], b"abcdef");
    assert_eq!(consumed, body.len());
}
