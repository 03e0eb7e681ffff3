//! Frame encoding.
//!
//! Requests are JSON `{"method", "args"}`. When the op carries a byte
//! buffer the frame is `[u32 LE json_len][json][bytes]` so the bytes never
//! pass through JSON. Responses are JSON, except file bytes which travel
//! raw. ERROR frames hold a JSON [`WireError`].

use strata_types::{Op, Reply, VfsError, VfsResult, WireError};

/// Request without a byte argument.
pub const REQUEST_PLAIN: u8 = 0;
/// Request with a byte argument after the JSON.
pub const REQUEST_BINARY: u8 = 1;
/// JSON response.
pub const RESPONSE_JSON: u8 = 0;
/// Raw file bytes.
pub const RESPONSE_RAW: u8 = 1;

const SUB_HEADER_LEN: usize = 4;

pub fn encode_request(mut op: Op) -> VfsResult<(u8, Vec<u8>)> {
    let binary = op.take_binary();
    let json = serde_json::to_vec(&op).map_err(|e| VfsError::invalid_argument(e.to_string()))?;
    match binary {
        None => Ok((REQUEST_PLAIN, json)),
        Some(bytes) => {
            let json_len = u32::try_from(json.len())
                .map_err(|_| VfsError::invalid_argument("request arguments too large"))?;
            let mut frame = Vec::with_capacity(SUB_HEADER_LEN + json.len() + bytes.len());
            frame.extend_from_slice(&json_len.to_le_bytes());
            frame.extend_from_slice(&json);
            frame.extend_from_slice(&bytes);
            Ok((REQUEST_BINARY, frame))
        }
    }
}

pub fn decode_request(kind: u8, frame: &[u8]) -> VfsResult<Op> {
    match kind {
        REQUEST_PLAIN => parse(frame),
        REQUEST_BINARY => {
            let Some((header, rest)) = frame.split_first_chunk::<SUB_HEADER_LEN>() else {
                return Err(VfsError::corruption("binary request shorter than its sub-header"));
            };
            let json_len = u32::from_le_bytes(*header) as usize;
            if json_len > rest.len() {
                return Err(VfsError::corruption(format!(
                    "binary request json length {json_len} exceeds frame of {}",
                    rest.len()
                )));
            }
            let (json, bytes) = rest.split_at(json_len);
            let mut op: Op = parse(json)?;
            if !op.splice_binary(bytes.to_vec()) {
                return Err(VfsError::corruption(format!(
                    "{} takes no byte argument",
                    op.method()
                )));
            }
            Ok(op)
        }
        other => Err(VfsError::corruption(format!("unknown request kind {other}"))),
    }
}

pub fn encode_reply(reply: Reply) -> VfsResult<(u8, Vec<u8>)> {
    match reply {
        Reply::Bytes(bytes) => Ok((RESPONSE_RAW, bytes)),
        other => {
            let json = serde_json::to_vec(&other).map_err(|e| VfsError::other(e.to_string()))?;
            Ok((RESPONSE_JSON, json))
        }
    }
}

pub fn decode_reply(kind: u8, frame: Vec<u8>) -> VfsResult<Reply> {
    match kind {
        RESPONSE_RAW => Ok(Reply::Bytes(frame)),
        RESPONSE_JSON => parse(&frame),
        other => Err(VfsError::corruption(format!("unknown response kind {other}"))),
    }
}

pub fn encode_error(error: &WireError) -> Vec<u8> {
    // A WireError is plain strings and an enum; serializing it cannot fail.
    serde_json::to_vec(error).unwrap_or_default()
}

pub fn decode_error(frame: &[u8]) -> VfsResult<WireError> {
    parse(frame)
}

fn parse<T: serde::de::DeserializeOwned>(json: &[u8]) -> VfsResult<T> {
    serde_json::from_slice(json).map_err(|e| VfsError::corruption(format!("unparsable frame: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::ErrorCode;

    #[test]
    fn test_binary_request_keeps_bytes_out_of_json() {
        let payload = vec![0u8, 255, 10, 13];
        let (kind, frame) = encode_request(Op::write("/bin", payload.clone())).unwrap();
        assert_eq!(kind, REQUEST_BINARY);

        let json_len = u32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        let json = std::str::from_utf8(&frame[4..4 + json_len]).unwrap();
        assert!(json.contains("\"method\":\"write\""));
        assert_eq!(&frame[4 + json_len..], &payload[..]);

        assert_eq!(decode_request(kind, &frame).unwrap(), Op::write("/bin", payload));
    }

    #[test]
    fn test_plain_request() {
        let (kind, frame) = encode_request(Op::stat("/x")).unwrap();
        assert_eq!(kind, REQUEST_PLAIN);
        assert_eq!(decode_request(kind, &frame).unwrap(), Op::stat("/x"));
    }

    #[test]
    fn test_malformed_requests_are_corruption() {
        let cases: [(u8, &[u8]); 4] = [
            (REQUEST_PLAIN, b"{not json"),
            (REQUEST_BINARY, b"\x01\x00"),
            (REQUEST_BINARY, b"\xff\x00\x00\x00{}"),
            (9, b"{}"),
        ];
        for (kind, frame) in cases {
            let err = decode_request(kind, frame).unwrap_err();
            assert_eq!(err.code(), ErrorCode::Ebadmsg, "kind {kind}");
        }

        // A byte payload spliced into an opcode without a byte slot.
        let (_, json) = encode_request(Op::stat("/x")).unwrap();
        let mut frame = (json.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&json);
        frame.extend_from_slice(b"extra");
        assert!(decode_request(REQUEST_BINARY, &frame).is_err());
    }

    #[test]
    fn test_replies() {
        let (kind, frame) = encode_reply(Reply::Bytes(b"raw".to_vec())).unwrap();
        assert_eq!((kind, frame.as_slice()), (RESPONSE_RAW, &b"raw"[..]));

        let (kind, frame) = encode_reply(Reply::Count(5)).unwrap();
        assert_eq!(kind, RESPONSE_JSON);
        assert_eq!(decode_reply(kind, frame).unwrap(), Reply::Count(5));
    }

    #[test]
    fn test_error_frames() {
        let wire = WireError::new(&VfsError::not_found("/nope"), "read", Some("/nope".into()));
        let decoded = decode_error(&encode_error(&wire)).unwrap();
        assert_eq!(decoded, wire);
        let call = decoded.into_call_error();
        assert_eq!(call.code(), ErrorCode::Enoent);
        assert_eq!(call.syscall, "read");
    }
}
