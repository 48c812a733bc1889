// hci-transport Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! A debugging aid that lets local tools push raw HCI packets to the
//! controller over TCP.
//!
//! Clients send frames of `[type:u8][length:u16 LE][payload]`, where type is
//! the H4 indicator of a command, ACL or SCO packet. Each frame is handed to
//! the engine as if the upper stack had transmitted it.

use crate::engine::EngineHandle;
use crate::protocol::{Packet, PacketKind};
use crate::Result;
use log::{debug, error, info, warn};
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const FRAME_HEADER_SIZE: usize = 3;
/// Largest frame plus its header.
const CLIENT_BUFFER_SIZE: usize = 65536 + FRAME_HEADER_SIZE;
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const CLIENT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Removes the first complete frame from `buffer`, returning its type byte
/// and payload.
pub fn take_frame(buffer: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
    let [packet_type, lo, hi, ..] = buffer[..] else {
        return None;
    };
    let frame_len = FRAME_HEADER_SIZE + u16::from_le_bytes([lo, hi]) as usize;
    if buffer.len() < frame_len {
        return None;
    }
    let payload = buffer[FRAME_HEADER_SIZE..frame_len].to_vec();
    buffer.drain(..frame_len);
    Some((packet_type, payload))
}

fn frame_to_packet(packet_type: u8, payload: Vec<u8>) -> Option<Packet> {
    match PacketKind::from_h4(packet_type) {
        Some(kind @ (PacketKind::Command | PacketKind::Acl | PacketKind::Sco)) => {
            Some(Packet::new(kind, payload))
        }
        _ => {
            error!("Unsupported injected packet type: {}", packet_type);
            None
        }
    }
}

pub struct HciInjector {
    local_addr: SocketAddr,
    should_stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl HciInjector {
    pub fn open<A: ToSocketAddrs>(addr: A, engine: EngineHandle) -> Result<HciInjector> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let should_stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let should_stop = should_stop.clone();
            thread::Builder::new()
                .name("hci_inject".to_string())
                .spawn(move || accept_clients(listener, engine, should_stop))?
        };
        info!("HCI inject server listening on {}", local_addr);

        Ok(HciInjector {
            local_addr,
            should_stop,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Disconnects every client and stops listening.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.should_stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("HCI inject thread panicked");
            }
            debug!("HCI inject server on {} closed", self.local_addr);
        }
    }
}

impl Drop for HciInjector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HciInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HciInjector")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

fn accept_clients(listener: TcpListener, engine: EngineHandle, should_stop: Arc<AtomicBool>) {
    let mut clients: Vec<JoinHandle<()>> = vec![];
    while !should_stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                info!("HCI inject client connected from {}", peer);
                let engine = engine.clone();
                let should_stop = should_stop.clone();
                match thread::Builder::new()
                    .name("hci_inject_client".to_string())
                    .spawn(move || serve_client(stream, engine, should_stop))
                {
                    Ok(client) => clients.push(client),
                    Err(e) => error!("Unable to serve HCI inject client: {}", e),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) => {
                warn!("HCI inject accept failed: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
        clients.retain(|client| !client.is_finished());
    }

    for client in clients {
        let _ = client.join();
    }
}

fn serve_client(mut stream: TcpStream, engine: EngineHandle, should_stop: Arc<AtomicBool>) {
    if let Err(e) = stream
        .set_nonblocking(false)
        .and_then(|_| stream.set_read_timeout(Some(CLIENT_READ_TIMEOUT)))
    {
        error!("Unable to configure HCI inject client: {}", e);
        return;
    }

    let mut buffer = Vec::with_capacity(CLIENT_BUFFER_SIZE);
    let mut chunk = [0u8; 4096];
    while !should_stop.load(Ordering::Relaxed) {
        let room = chunk.len().min(CLIENT_BUFFER_SIZE - buffer.len());
        match stream.read(&mut chunk[..room]) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                while let Some((packet_type, payload)) = take_frame(&mut buffer) {
                    let Some(packet) = frame_to_packet(packet_type, payload) else {
                        continue;
                    };
                    if let Err(e) = engine.transmit(packet) {
                        debug!("Dropping injected packet: {}", e);
                    }
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                debug!("HCI inject client read failed: {}", e);
                break;
            }
        }
    }
    debug!("HCI inject client disconnected");
}
