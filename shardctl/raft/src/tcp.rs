//! Length-prefixed TCP transport.
//!
//! Frames are a 4-byte big-endian length followed by a bincode payload.
//! Each outbound call opens a connection, writes one request frame and
//! waits for one reply frame; the listener side answers one request per
//! connection handler thread.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::TransportError;
use crate::message::RaftRequest;
use crate::transport::{RaftService, Transport};

const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub fn write_frame<T: Serialize>(stream: &mut impl Write, value: &T) -> Result<(), TransportError> {
    let payload = bincode::serialize(value)?;
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(&payload)?;
    stream.flush()?;
    Ok(())
}

pub fn read_frame<T: DeserializeOwned>(stream: &mut impl Read) -> Result<T, TransportError> {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        )));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(bincode::deserialize(&payload)?)
}

/// Outbound endpoint over real sockets. `addrs[i]` is peer i's RPC address.
pub struct TcpTransport {
    addrs: Vec<String>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(addrs: Vec<String>) -> Self {
        TcpTransport {
            addrs,
            timeout: Duration::from_millis(500),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Transport for TcpTransport {
    fn call(
        &self,
        to: usize,
        request: RaftRequest,
    ) -> Result<crate::message::RaftReply, TransportError> {
        let addr = self.addrs.get(to).ok_or(TransportError::Unreachable(to))?;
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        write_frame(&mut stream, &request)?;
        read_frame(&mut stream)
    }
}

/// Accepts peer connections and dispatches them to the engine. Runs until
/// the listener socket is closed or the process exits.
pub fn serve(service: Arc<dyn RaftService>, listener: TcpListener) -> JoinHandle<()> {
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("rpc accept failed: {}", e);
                    continue;
                }
            };
            let service = Arc::clone(&service);
            thread::spawn(move || {
                if let Err(e) = answer(service.as_ref(), &mut stream) {
                    debug!("rpc connection closed: {}", e);
                }
            });
        }
    })
}

fn answer(service: &dyn RaftService, stream: &mut TcpStream) -> Result<(), TransportError> {
    let request: RaftRequest = read_frame(stream)?;
    let reply = service.handle(request);
    write_frame(stream, &reply)
}
