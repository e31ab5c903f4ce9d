//! Segmentation properties of the request parser
//!
//! However the network slices the byte stream, the parser must produce
//! the same heads and the same body bytes.

use bytes::BytesMut;
use halley::http::parser::{ParseYield, RequestParser};
use proptest::prelude::*;

const REQUESTS: &[&[u8]] = &[
    b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n",
    b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world",
    b"POST /upload HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n4\r\ndefg\r\n0\r\n\r\n",
    b"GET /a?q=1 HTTP/1.0\r\nConnection: keep-alive\r\nAccept: */*\r\n\r\n",
];

#[derive(Debug, PartialEq)]
struct Digest {
    heads: Vec<(String, String)>,
    body: Vec<u8>,
    saw_last: bool,
}

fn digest(input: &[u8], cuts: &[usize]) -> Digest {
    let mut parser = RequestParser::new(65_536);
    let mut buf = BytesMut::new();
    let mut heads = Vec::new();
    let mut body = Vec::new();
    let mut saw_last = false;

    let mut feed = |parser: &mut RequestParser, buf: &mut BytesMut| {
        // Drain everything currently parseable, crossing request
        // boundaries the way the reader does after each response.
        loop {
            let yields = parser.feed(buf).expect("valid corpus");
            if yields.is_empty() {
                break;
            }
            for item in yields {
                match item {
                    ParseYield::Head(req) => {
                        heads.push((req.method.as_str().to_string(), req.target.clone()));
                    }
                    ParseYield::BodyChunk { data, is_last } => {
                        body.extend_from_slice(&data);
                        saw_last |= is_last;
                    }
                }
            }
        }
    };

    let mut start = 0;
    for &cut in cuts {
        let cut = cut.min(input.len());
        if cut > start {
            buf.extend_from_slice(&input[start..cut]);
            feed(&mut parser, &mut buf);
            start = cut;
        }
    }
    if start < input.len() {
        buf.extend_from_slice(&input[start..]);
        feed(&mut parser, &mut buf);
    }

    Digest {
        heads,
        body,
        saw_last,
    }
}

proptest! {
    #[test]
    fn any_segmentation_parses_identically(
        request_index in 0..REQUESTS.len(),
        mut cuts in proptest::collection::vec(0usize..80, 0..12),
    ) {
        let input = REQUESTS[request_index];
        cuts.sort_unstable();

        let whole = digest(input, &[]);
        let sliced = digest(input, &cuts);
        prop_assert_eq!(whole, sliced);
    }

    #[test]
    fn one_byte_trickle_parses_identically(request_index in 0..REQUESTS.len()) {
        let input = REQUESTS[request_index];
        let cuts: Vec<usize> = (1..input.len()).collect();

        let whole = digest(input, &[]);
        let trickle = digest(input, &cuts);
        prop_assert_eq!(whole.heads, trickle.heads);
        prop_assert_eq!(whole.body, trickle.body);
        prop_assert_eq!(whole.saw_last, trickle.saw_last);
    }
}
