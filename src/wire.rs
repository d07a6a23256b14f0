/*
src/wire.rs

Framing layer for the network. Every exchange is a single connection: the
initiator sends one framed message, reads one response to end-of-stream, and
closes. A frame is the ASCII decimal byte length of the payload, a single
space, then the payload itself.
*/

use crate::protocol::{Action, Message, BUFF_SIZE};
use bytes::{BufMut, BytesMut};
use log::debug;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use serde_json::Value;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;

/// How long one request/response exchange may take before we give up.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Framing(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Frame a payload as `<decimal-length> <payload>`.
pub fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(payload.len() + 12);
    frame.put_slice(payload.len().to_string().as_bytes());
    frame.put_u8(b' ');
    frame.put_slice(payload);
    frame
}

/// Split a received message into its payload. `Ok(None)` means the stream
/// closed before any request arrived.
pub fn decode_frame(message: &[u8]) -> Result<Option<&[u8]>, WireError> {
    if message.is_empty() {
        return Ok(None);
    }
    let mut length: usize = 0;
    let mut digits = 0;
    let mut body = None;
    for (i, &byte) in message.iter().enumerate() {
        match byte {
            b'0'..=b'9' => {
                length = length
                    .checked_mul(10)
                    .and_then(|l| l.checked_add((byte - b'0') as usize))
                    .ok_or(WireError::Framing("declared length overflows"))?;
                digits += 1;
            }
            b' ' => {
                body = Some(&message[i + 1..]);
                break;
            }
            _ => {
                return Err(WireError::Framing(
                    "incorrect separator between length and body",
                ))
            }
        }
    }
    if digits == 0 {
        return Err(WireError::Framing("missing length digits"));
    }
    let body = body.ok_or(WireError::Framing("missing length separator"))?;
    if body.len() != length {
        return Err(WireError::Framing("declared length does not match body"));
    }
    Ok(Some(body))
}

/// Accumulate a request in `BUFF_SIZE` increments; a read shorter than the
/// buffer ends the message.
pub fn recv_all<R: Read>(stream: &mut R) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buf = [0u8; BUFF_SIZE];
    loop {
        let n = stream.read(&mut buf)?;
        data.extend_from_slice(&buf[..n]);
        if n < BUFF_SIZE {
            break;
        }
    }
    Ok(data)
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    format!("{}:{}", host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("cannot resolve {}:{}", host, port),
            )
        })
}

/// One framed exchange with a node: connect, send the message, read the
/// response to end-of-stream. The caller's own address is stamped into
/// `args` so the receiver knows who is calling.
pub fn request(
    host: &str,
    port: u16,
    from: &str,
    action: Action,
    mut args: Value,
) -> Result<Vec<u8>, WireError> {
    if let Value::Object(map) = &mut args {
        map.insert("address".to_string(), Value::String(from.to_string()));
    }
    let message = Message {
        action: action.name().to_string(),
        args,
    };
    let payload = serde_json::to_vec(&message)?;
    let frame = encode_frame(&payload);

    let addr = resolve(host, port)?;
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(8);
    let mut stream = TcpStream::connect(addr)?;
    let token = Token(0);
    poll.registry()
        .register(&mut stream, token, Interest::WRITABLE)?;

    debug!("{} request to {}", action.name(), addr);

    let mut response = Vec::new();
    let mut sent = false;
    loop {
        poll.poll(&mut events, Some(EXCHANGE_TIMEOUT))?;
        if events.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "node did not answer in time",
            )
            .into());
        }
        for event in events.iter() {
            if event.token() != token {
                continue;
            }
            if event.is_writable() && !sent {
                stream.write_all(&frame)?;
                sent = true;
                poll.registry()
                    .reregister(&mut stream, token, Interest::READABLE)?;
            }
            if event.is_readable() {
                let mut buf = [0u8; BUFF_SIZE];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => return Ok(response),
                        Ok(n) => response.extend_from_slice(&buf[..n]),
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
    }
}

/// Framed-JSON request: like [`request`], with the response unframed and
/// parsed.
pub fn request_json(
    host: &str,
    port: u16,
    from: &str,
    action: Action,
    args: Value,
) -> Result<Value, WireError> {
    let raw = request(host, port, from, action, args)?;
    let body = decode_frame(&raw)?.ok_or(WireError::Framing("empty response"))?;
    Ok(serde_json::from_slice(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_frame_round_trip() {
        let frame = encode_frame(b"hello");
        assert_eq!(&frame[..], b"5 hello");
        let body = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_empty_message_is_no_request() {
        assert!(decode_frame(b"").unwrap().is_none());
    }

    #[test]
    fn test_zero_length_frame() {
        let body = decode_frame(b"0 ").unwrap().unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_bad_separator_is_rejected() {
        assert!(matches!(
            decode_frame(b"5xhello"),
            Err(WireError::Framing(_))
        ));
    }

    #[test]
    fn test_missing_digits_is_rejected() {
        assert!(matches!(decode_frame(b" hello"), Err(WireError::Framing(_))));
    }

    #[test]
    fn test_length_body_mismatch_is_rejected() {
        assert!(matches!(decode_frame(b"9 abc"), Err(WireError::Framing(_))));
        assert!(matches!(decode_frame(b"2 abc"), Err(WireError::Framing(_))));
    }

    #[test]
    fn test_recv_all_spans_buffer_increments() {
        let data = vec![7u8; BUFF_SIZE + 123];
        let mut cursor = Cursor::new(data.clone());
        assert_eq!(recv_all(&mut cursor).unwrap(), data);

        let exact = vec![7u8; BUFF_SIZE];
        let mut cursor = Cursor::new(exact.clone());
        assert_eq!(recv_all(&mut cursor).unwrap(), exact);
    }

    #[test]
    fn test_request_json_injects_address() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let raw = recv_all(&mut stream).unwrap();
            let body = decode_frame(&raw).unwrap().unwrap();
            let message: Message = serde_json::from_slice(body).unwrap();
            assert_eq!(message.action, "list");
            assert_eq!(message.args["address"], "127.0.0.1:7001");
            let reply = serde_json::to_vec(&json!({ "count": 0, "result": [] })).unwrap();
            stream.write_all(&encode_frame(&reply)).unwrap();
        });

        let reply = request_json(
            &addr.ip().to_string(),
            addr.port(),
            "127.0.0.1:7001",
            Action::List,
            json!({}),
        )
        .unwrap();
        assert_eq!(reply["count"], 0);
    }
}
