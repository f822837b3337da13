//! The request/response wire format.
//!
//! A request frame is `L "#" pid "#" op "#" target [ "#" ... ]`, where `L` is
//! the ASCII decimal byte count from the delimiting `#` (inclusive) to the
//! end of the frame — i.e. `1 + ` the byte length of `pid#op#target...`.
//! Extra `#`-separated fields beyond `target` are accepted and ignored. A
//! response is the bare 4-byte token with no framing at all.

use crate::{Error, Result};

/// The operation a worker is requesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Writ,
    Done,
}

impl Op {
    fn from_bytes(b: &[u8]) -> Option<Op> {
        match b {
            b"READ" => Some(Op::Read),
            b"WRIT" => Some(Op::Writ),
            b"DONE" => Some(Op::Done),
            _ => None,
        }
    }
}

/// A single parsed request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub pid: u64,
    pub op: Op,
    pub target: String,
}

/// The four tokens the coordinator ever sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Read,
    Writ,
    Wait,
    Exit,
}

impl Response {
    pub fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            Response::Read => b"READ",
            Response::Writ => b"WRIT",
            Response::Wait => b"WAIT",
            Response::Exit => b"EXIT",
        }
    }
}

/// Scans `buf` for a decodable length prefix and returns the total number of
/// bytes the frame occupies once the whole frame is present.
///
/// `L` counts its own delimiting `#` as the first of its bytes, so the frame
/// is `digits(L) + L` bytes long in total (not `digits(L) + 1 + L`) — that is
/// the byte count the wire format's own worked examples use, e.g. `9#7#WRIT#a`
/// is a complete 10-byte frame, not an 11-byte one.
///
/// Returns `Err(Error::IncompleteFrame)` if `buf` does not yet hold a full
/// frame, and `Err(Error::Protocol(_))` if `buf` cannot begin a valid frame
/// at all (no decodable decimal length prefix).
fn frame_len(buf: &[u8]) -> Result<usize> {
    let hash_pos = buf.iter().position(|&b| b == b'#');
    let Some(hash_pos) = hash_pos else {
        if buf.len() > 20 {
            // No reasonable length prefix could still be arriving; anything
            // legitimate fits in far fewer digits than this.
            return Err(Error::Protocol("missing length prefix".into()));
        }
        return Err(Error::IncompleteFrame);
    };

    if hash_pos == 0 {
        return Err(Error::Protocol("empty length prefix".into()));
    }

    let len: usize = atoi::atoi(&buf[..hash_pos])
        .ok_or_else(|| Error::Protocol("non-decimal length prefix".into()))?;

    if len == 0 {
        return Err(Error::Protocol("zero length prefix".into()));
    }

    let total = hash_pos + len;
    if buf.len() < total {
        return Err(Error::IncompleteFrame);
    }
    Ok(total)
}

/// Attempts to parse a single request frame from the front of `buf`.
///
/// On success, returns the parsed `Request` and the number of bytes consumed
/// from `buf`. Returns `Ok(None)` if `buf` does not yet hold a complete
/// frame. Any other parse failure is a protocol error, per the caller's
/// contract of closing the connection.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Request, usize)>> {
    let total = match frame_len(buf) {
        Ok(total) => total,
        Err(Error::IncompleteFrame) => return Ok(None),
        Err(e) => return Err(e),
    };

    let hash_pos = buf.iter().position(|&b| b == b'#').unwrap();
    let payload = &buf[hash_pos + 1..total];

    let mut fields = payload.split(|&b| b == b'#');
    let pid_field = fields.next().ok_or_else(|| Error::Protocol("missing pid field".into()))?;
    let op_field = fields.next().ok_or_else(|| Error::Protocol("missing op field".into()))?;
    let target_field = fields
        .next()
        .ok_or_else(|| Error::Protocol("missing target field".into()))?;

    let pid: u64 =
        atoi::atoi(pid_field).ok_or_else(|| Error::Protocol("non-decimal pid".into()))?;
    let op = Op::from_bytes(op_field)
        .ok_or_else(|| Error::Protocol(format!("unknown op {:?}", String::from_utf8_lossy(op_field))))?;
    let target = std::str::from_utf8(target_field)
        .map_err(|e| Error::Protocol(format!("target not utf-8: {e}")))?
        .to_string();

    Ok(Some((Request { pid, op, target }, total)))
}

/// Parses every complete frame at the front of `buf`, in order, and returns
/// them along with the number of leading bytes that were consumed. Any
/// trailing partial frame is left in place for the caller to carry over.
pub fn parse_requests(buf: &[u8]) -> Result<(Vec<Request>, usize)> {
    let mut requests = Vec::new();
    let mut consumed = 0;

    loop {
        match parse_request(&buf[consumed..])? {
            Some((req, n)) => {
                requests.push(req);
                consumed += n;
            }
            None => break,
        }
    }

    Ok((requests, consumed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_frame() {
        let (req, n) = parse_request(b"9#7#WRIT#a").unwrap().unwrap();
        assert_eq!(n, 10);
        assert_eq!(req, Request { pid: 7, op: Op::Writ, target: "a".into() });
    }

    #[test]
    fn reports_incomplete_frame() {
        assert!(parse_request(b"9#7#WRIT#").unwrap().is_none());
        assert!(parse_request(b"9#7#W").unwrap().is_none());
        assert!(parse_request(b"").unwrap().is_none());
    }

    #[test]
    fn ignores_extra_fields() {
        let (req, n) = parse_request(b"15#7#READ#a#extra").unwrap().unwrap();
        assert_eq!(n, 17);
        assert_eq!(req.target, "a");
    }

    #[test]
    fn rejects_non_decimal_length() {
        assert!(matches!(parse_request(b"x#7#READ#a"), Err(Error::Protocol(_))));
    }

    #[test]
    fn rejects_unknown_op() {
        assert!(matches!(parse_request(b"8#7#NOPE#a"), Err(Error::Protocol(_))));
    }

    #[test]
    fn batched_frames_in_one_segment() {
        let batch = b"9#1#WRIT#e9#1#DONE#e9#2#READ#e";
        let (reqs, consumed) = parse_requests(batch).unwrap();
        assert_eq!(consumed, batch.len());
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].op, Op::Writ);
        assert_eq!(reqs[1].op, Op::Done);
        assert_eq!(reqs[2].op, Op::Read);
    }

    #[test]
    fn residual_bytes_are_reported() {
        let batch = b"9#1#WRIT#e9#1#DO";
        let (reqs, consumed) = parse_requests(batch).unwrap();
        assert_eq!(reqs.len(), 1);
        assert_eq!(consumed, 10);
        assert_eq!(&batch[consumed..], b"9#1#DO");
    }

    #[test]
    fn response_tokens_round_trip() {
        assert_eq!(Response::Read.as_bytes(), b"READ");
        assert_eq!(Response::Writ.as_bytes(), b"WRIT");
        assert_eq!(Response::Wait.as_bytes(), b"WAIT");
        assert_eq!(Response::Exit.as_bytes(), b"EXIT");
    }
}
