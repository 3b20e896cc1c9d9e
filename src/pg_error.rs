//! The synthesized `ErrorResponse` sent to a client when no primary is
//! currently available, byte-for-byte matching the frame the original
//! source emits: SQLSTATE `08006` (connection failure), a fixed
//! message, and the three-field (`S`/`C`/`M`) layout the teacher's own
//! `ErrorResponse` type frames before the terminating zero byte.

const SQLSTATE_CONNECTION_FAILURE: &str = "08006";
const SEVERITY: &str = "FATAL";
const MESSAGE: &str = "no healthy PostgreSQL primary available";

/// Build the raw bytes of an `ErrorResponse` message ready to write to
/// a client socket: `'E'`, a big-endian length, then `S`/`C`/`M`
/// fields each as `<tag><text>\0`, terminated by a final `\0`.
pub fn no_primary_available() -> Vec<u8> {
    build(SEVERITY, SQLSTATE_CONNECTION_FAILURE, MESSAGE)
}

fn build(severity: &str, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (tag, value) in [(b'S', severity), (b'C', sqlstate), (b'M', message)] {
        body.push(tag);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);

    let len = (body.len() + 4) as i32;
    let mut frame = Vec::with_capacity(body.len() + 5);
    frame.push(b'E');
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_no_primary_available_frame_shape() {
        let frame = no_primary_available();
        assert_eq!(frame[0], b'E');
        let len = i32::from_be_bytes(frame[1..5].try_into().unwrap());
        assert_eq!(len as usize, frame.len() - 1);
        assert_eq!(*frame.last().unwrap(), 0);
    }

    /// Hand-assembled expected byte stream, built independently of
    /// `build()`, so a regression in either the message text or the
    /// framing logic is caught rather than a tautological check
    /// against the same constant the implementation uses.
    #[test]
    fn test_no_primary_available_matches_exact_byte_sequence() {
        let mut expected = Vec::new();
        expected.push(b'E');

        let mut body = Vec::new();
        body.push(b'S');
        body.extend_from_slice(b"FATAL");
        body.push(0);
        body.push(b'C');
        body.extend_from_slice(b"08006");
        body.push(0);
        body.push(b'M');
        body.extend_from_slice(b"no healthy PostgreSQL primary available");
        body.push(0);
        body.push(0);

        let len = (body.len() + 4) as i32;
        expected.extend_from_slice(&len.to_be_bytes());
        expected.extend_from_slice(&body);

        assert_eq!(no_primary_available(), expected);
        assert_eq!(expected.len(), 61); // 1 (tag) + 4 (len) + 56 (body)
    }
}
