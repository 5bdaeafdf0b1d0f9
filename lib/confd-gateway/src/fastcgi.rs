//! FastCGI record encoding and framing.
//!
//! Only the subset needed for a single responder request per connection is implemented: the client side of
//! `BEGIN_REQUEST`, `PARAMS` and `STDIN`, and the server side of `STDOUT`, `STDERR` and `END_REQUEST`.

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use snafu::Snafu;
use tracing::trace;

const VERSION_1: u8 = 1;
const HEADER_LEN: usize = 8;
const MAX_CONTENT_LEN: usize = u16::MAX as usize;

/// Request ID used for the single request carried by each connection.
pub const REQUEST_ID: u16 = 1;

const ROLE_RESPONDER: u16 = 1;
const PROTOCOL_STATUS_REQUEST_COMPLETE: u8 = 0;

const TYPE_BEGIN_REQUEST: u8 = 1;
const TYPE_END_REQUEST: u8 = 3;
const TYPE_PARAMS: u8 = 4;
const TYPE_STDIN: u8 = 5;
const TYPE_STDOUT: u8 = 6;
const TYPE_STDERR: u8 = 7;

/// A framing error.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(context(suffix(false)))]
pub enum ProtocolError {
    #[snafu(display("unsupported record version {}", version))]
    UnsupportedVersion { version: u8 },

    #[snafu(display("connection closed mid-record with {} bytes buffered", buffer_len))]
    Truncated { buffer_len: usize },

    #[snafu(display("connection closed before the request ended"))]
    MissingEndRequest,

    #[snafu(display("unexpected record type {}", record_type))]
    UnexpectedRecord { record_type: u8 },

    #[snafu(display("malformed END_REQUEST record of {} bytes", content_len))]
    MalformedEndRequest { content_len: usize },

    #[snafu(display("request not completed (protocol status {}, app status {})", protocol_status, app_status))]
    NotCompleted { protocol_status: u8, app_status: u32 },
}

/// A single record read from the upstream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub record_type: u8,
    pub request_id: u16,
    pub content: Bytes,
}

/// Encodes a complete responder request: begin, parameters, and standard input, each stream terminated by an empty
/// record.
pub fn encode_request(params: &[(String, String)], stdin: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();

    let mut begin = [0u8; 8];
    begin[0..2].copy_from_slice(&ROLE_RESPONDER.to_be_bytes());
    // flags: 0, the upstream closes the connection once the request ends.
    encode_record(&mut buf, TYPE_BEGIN_REQUEST, &begin);

    let mut encoded_params = BytesMut::new();
    for (name, value) in params {
        encode_name_value(&mut encoded_params, name.as_bytes(), value.as_bytes());
    }
    encode_stream(&mut buf, TYPE_PARAMS, &encoded_params);
    encode_stream(&mut buf, TYPE_STDIN, stdin);

    buf
}

fn encode_stream(buf: &mut BytesMut, record_type: u8, content: &[u8]) {
    for chunk in content.chunks(MAX_CONTENT_LEN) {
        encode_record(buf, record_type, chunk);
    }
    encode_record(buf, record_type, &[]);
}

fn encode_record(buf: &mut BytesMut, record_type: u8, content: &[u8]) {
    let padding_len = (8 - content.len() % 8) % 8;

    buf.reserve(HEADER_LEN + content.len() + padding_len);
    buf.put_u8(VERSION_1);
    buf.put_u8(record_type);
    buf.put_u16(REQUEST_ID);
    buf.put_u16(content.len() as u16);
    buf.put_u8(padding_len as u8);
    buf.put_u8(0);
    buf.put_slice(content);
    buf.put_bytes(0, padding_len);
}

fn encode_name_value(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    encode_length(buf, name.len());
    encode_length(buf, value.len());
    buf.put_slice(name);
    buf.put_slice(value);
}

fn encode_length(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32(len as u32 | 0x8000_0000);
    }
}

/// Splits the next complete record off the front of `buf`.
///
/// Returns `Ok(None)` when more data is needed. At end of stream, a partial record left in the buffer is an error.
///
/// # Errors
///
/// If the record header is not a version 1 header, or the stream ends mid-record, an error is returned.
pub fn next_record(buf: &mut BytesMut, is_eof: bool) -> Result<Option<Record>, ProtocolError> {
    if buf.is_empty() {
        return Ok(None);
    }

    if buf.len() < HEADER_LEN {
        return if is_eof {
            Err(ProtocolError::Truncated { buffer_len: buf.len() })
        } else {
            Ok(None)
        };
    }

    let version = buf[0];
    if version != VERSION_1 {
        return Err(ProtocolError::UnsupportedVersion { version });
    }

    let content_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let padding_len = buf[6] as usize;
    let record_len = HEADER_LEN + content_len + padding_len;
    if buf.len() < record_len {
        return if is_eof {
            Err(ProtocolError::Truncated { buffer_len: buf.len() })
        } else {
            Ok(None)
        };
    }

    let mut record = buf.split_to(record_len);
    let record_type = record[1];
    let request_id = u16::from_be_bytes([record[2], record[3]]);
    record.advance(HEADER_LEN);
    record.truncate(content_len);

    trace!(record_type, request_id, content_len, "Read FastCGI record.");

    Ok(Some(Record {
        record_type,
        request_id,
        content: record.freeze(),
    }))
}

/// Accumulates the records of one response until the request ends.
#[derive(Debug, Default)]
pub struct ResponseCollector {
    stdout: BytesMut,
    stderr: BytesMut,
}

impl ResponseCollector {
    /// Adds a record to the response.
    ///
    /// Returns `true` once the `END_REQUEST` record has been seen.
    ///
    /// # Errors
    ///
    /// If the record is not part of a responder's reply, or the request ended unsuccessfully, an error is returned.
    pub fn push(&mut self, record: Record) -> Result<bool, ProtocolError> {
        match record.record_type {
            TYPE_STDOUT => self.stdout.extend_from_slice(&record.content),
            TYPE_STDERR => self.stderr.extend_from_slice(&record.content),
            TYPE_END_REQUEST => {
                let content = &record.content;
                if content.len() < 8 {
                    return Err(ProtocolError::MalformedEndRequest {
                        content_len: content.len(),
                    });
                }

                let app_status = u32::from_be_bytes([content[0], content[1], content[2], content[3]]);
                let protocol_status = content[4];
                if protocol_status != PROTOCOL_STATUS_REQUEST_COMPLETE {
                    return Err(ProtocolError::NotCompleted {
                        protocol_status,
                        app_status,
                    });
                }
                return Ok(true);
            }
            record_type => return Err(ProtocolError::UnexpectedRecord { record_type }),
        }

        Ok(false)
    }

    /// Returns whatever the upstream wrote to its error stream.
    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    /// Consumes the collector, returning the response body with CGI headers removed.
    pub fn into_body(self) -> Bytes {
        strip_cgi_headers(self.stdout.freeze())
    }
}

/// Removes the CGI header block, which ends at the first blank line.
///
/// Output without a blank line is returned unchanged.
pub fn strip_cgi_headers(stdout: Bytes) -> Bytes {
    let crlf = find(&stdout, b"\r\n\r\n").map(|pos| pos + 4);
    let lf = find(&stdout, b"\n\n").map(|pos| pos + 2);

    let body_start = match (crlf, lf) {
        (Some(a), Some(b)) => a.min(b),
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return stdout,
    };

    stdout.slice(body_start..)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(record_type: u8, content: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_record(&mut buf, record_type, content);
        buf
    }

    fn end_request(app_status: u32, protocol_status: u8) -> BytesMut {
        let mut content = [0u8; 8];
        content[0..4].copy_from_slice(&app_status.to_be_bytes());
        content[4] = protocol_status;
        record(TYPE_END_REQUEST, &content)
    }

    #[test]
    fn records_are_padded_to_eight_bytes() {
        let buf = record(TYPE_STDIN, b"json=1");
        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[..8], &[1, TYPE_STDIN, 0, 1, 0, 6, 2, 0]);
        assert_eq!(&buf[8..14], b"json=1");
        assert_eq!(&buf[14..], &[0, 0]);
    }

    #[test]
    fn short_and_long_param_lengths() {
        let mut buf = BytesMut::new();
        encode_name_value(&mut buf, b"SCRIPT_NAME", b"/web/internal/ping");
        assert_eq!(buf[0], 11);
        assert_eq!(buf[1], 18);
        assert_eq!(&buf[2..13], b"SCRIPT_NAME");

        let long_value = vec![b'x'; 200];
        let mut buf = BytesMut::new();
        encode_name_value(&mut buf, b"QUERY_STRING", &long_value);
        assert_eq!(buf[0], 12);
        assert_eq!(&buf[1..5], &[0x80, 0, 0, 200]);
        assert_eq!(buf.len(), 1 + 4 + 12 + 200);
    }

    #[test]
    fn request_layout() {
        let params = vec![("REQUEST_METHOD".to_string(), "GET".to_string())];
        let mut buf = encode_request(&params, b"");

        let mut types = Vec::new();
        while let Some(record) = next_record(&mut buf, true).unwrap() {
            assert_eq!(record.request_id, REQUEST_ID);
            types.push((record.record_type, record.content.len()));
        }

        assert_eq!(
            types,
            vec![
                (TYPE_BEGIN_REQUEST, 8),
                (TYPE_PARAMS, 2 + 14 + 3),
                (TYPE_PARAMS, 0),
                (TYPE_STDIN, 0),
            ]
        );
    }

    #[test]
    fn partial_record_waits_for_more_data() {
        let full = record(TYPE_STDOUT, b"pong");
        let mut buf = BytesMut::from(&full[..10]);

        assert_eq!(next_record(&mut buf, false), Ok(None));
        assert_eq!(next_record(&mut buf, true), Err(ProtocolError::Truncated { buffer_len: 10 }));

        buf.extend_from_slice(&full[10..]);
        let record = next_record(&mut buf, false).unwrap().unwrap();
        assert_eq!(record.content, Bytes::from_static(b"pong"));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buf = record(TYPE_STDOUT, b"pong");
        buf[0] = 2;
        assert_eq!(
            next_record(&mut buf, false),
            Err(ProtocolError::UnsupportedVersion { version: 2 })
        );
    }

    #[test]
    fn collects_stdout_until_end_request() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&record(TYPE_STDOUT, b"Content-type: text/plain\r\n\r\npo"));
        buf.extend_from_slice(&record(TYPE_STDERR, b"slow request"));
        buf.extend_from_slice(&record(TYPE_STDOUT, b"ng"));
        buf.extend_from_slice(&end_request(0, 0));

        let mut collector = ResponseCollector::default();
        let mut ended = false;
        while let Some(record) = next_record(&mut buf, true).unwrap() {
            ended = collector.push(record).unwrap();
        }

        assert!(ended);
        assert_eq!(collector.stderr(), b"slow request");
        assert_eq!(collector.into_body(), Bytes::from_static(b"pong"));
    }

    #[test]
    fn unsuccessful_end_request() {
        let mut buf = end_request(0, 3);
        let record = next_record(&mut buf, true).unwrap().unwrap();

        let mut collector = ResponseCollector::default();
        assert_eq!(
            collector.push(record),
            Err(ProtocolError::NotCompleted {
                protocol_status: 3,
                app_status: 0
            })
        );
    }

    #[test]
    fn header_stripping() {
        assert_eq!(
            strip_cgi_headers(Bytes::from_static(b"X-Powered-By: PHP\nContent-type: text/plain\n\npong")),
            Bytes::from_static(b"pong")
        );
        assert_eq!(
            strip_cgi_headers(Bytes::from_static(b"Content-type: application/json\r\n\r\n{\"pool\":\"www\"}")),
            Bytes::from_static(b"{\"pool\":\"www\"}")
        );
        assert_eq!(strip_cgi_headers(Bytes::from_static(b"pong")), Bytes::from_static(b"pong"));
    }
}
