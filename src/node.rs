use crate::protocol::{Action, Message, Role};
use crate::wire;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::fmt;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

/// What a handler hands back to the connection loop.
pub enum Reply {
    Json(Value),
    Bytes(Vec<u8>),
}

/// A node that serves protocol actions for its role.
pub trait Dispatch: Send + Sync + 'static {
    fn role(&self) -> Role;
    fn handle(&self, action: Action, args: Value) -> Result<Reply>;
}

/// Bind `addr` and serve forever.
pub fn listen<N: Dispatch>(addr: &str, node: Arc<N>) -> Result<()> {
    let listener = TcpListener::bind(addr).with_context(|| format!("cannot bind {}", addr))?;
    info!("{:?} listening on {}", node.role(), listener.local_addr()?);
    serve(listener, node)
}

/// Accept loop over an already-bound listener: one handler thread per
/// connection, so a slow handler never blocks the next accept.
pub fn serve<N: Dispatch>(listener: TcpListener, node: Arc<N>) -> Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, remote)) => {
                let node = Arc::clone(&node);
                thread::spawn(move || {
                    if let Err(err) = handle_client(stream, node.as_ref()) {
                        error!("connection from {} dropped: {:#}", remote, err);
                    }
                });
            }
            Err(err) => error!("accept failed: {}", err),
        }
    }
}

fn handle_client<N: Dispatch>(mut stream: TcpStream, node: &N) -> Result<()> {
    let raw = wire::recv_all(&mut stream)?;
    let Some(body) = wire::decode_frame(&raw)? else {
        return Ok(());
    };
    let message: Message = serde_json::from_slice(body)?;
    debug!("request received: {}", message.action);

    let action = match Action::from_name(&message.action) {
        Some(action) if action.spec().served_by.contains(&node.role()) => action,
        _ => {
            warn!("no handler available for action {:?}", message.action);
            let body = serde_json::to_vec(&json!({ "status": 404 }))?;
            stream.write_all(&wire::encode_frame(&body))?;
            return Ok(());
        }
    };
    match node.handle(action, message.args) {
        Ok(Reply::Json(value)) => {
            let body = serde_json::to_vec(&value)?;
            stream.write_all(&wire::encode_frame(&body))?;
        }
        Ok(Reply::Bytes(bytes)) => stream.write_all(&bytes)?,
        // a failed handler closes the socket with no response at all
        Err(err) => error!("handler for {} failed: {:#}", action.name(), err),
    }
    Ok(())
}

/// Split a `host:port` address into its parts.
pub fn split_address(address: &str) -> Result<(&str, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .with_context(|| format!("address {} is missing a port", address))?;
    let port = port
        .parse()
        .with_context(|| format!("bad port in address {}", address))?;
    Ok((host, port))
}

/// Dynamic port range `low-high` carried in node configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<PortRange, String> {
        let (low, high) = s
            .split_once('-')
            .ok_or_else(|| format!("expected low-high, got {}", s))?;
        let low = low.parse().map_err(|_| format!("bad low port in {}", s))?;
        let high = high.parse().map_err(|_| format!("bad high port in {}", s))?;
        if low > high {
            return Err(format!("empty port range {}", s));
        }
        Ok(PortRange { low, high })
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}
