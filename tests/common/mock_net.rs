// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scripted in-memory master sockets.
//!
//! Each master endpoint (keyed by port) has a shared [`MasterScript`] the
//! test drives: how connects behave, which bytes the master "sends", and a
//! record of every byte the slave wrote and whether the socket was closed.

use bytes::BytesMut;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use table_replication::protocol::{
    Frame, FrameReader, StartOfReplicationStream, TableInfo,
};
use table_replication::{
    BoxedSocket, ConnectStatus, Connector, MasterEndpoint, ReplicationSocket, SocketId,
};

/// How `poll_connect` behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Connected on first poll.
    Immediate,
    /// In progress forever.
    Pending,
    /// In progress for this many polls, then connected.
    AfterPolls(usize),
    /// Poll returns this OS error every time.
    Errno(i32),
    /// `Connector::open` itself fails.
    Refuse,
}

#[derive(Debug)]
pub struct MasterState {
    pub connect: ConnectBehavior,
    pub connect_polls: usize,
    pub inbound: VecDeque<u8>,
    pub outbound: Vec<u8>,
    pub eof: bool,
    pub nodelay: bool,
    pub opened: usize,
    pub closed: usize,
    pub socket_ids: Vec<SocketId>,
    /// Max bytes accepted per `try_write`, after which the next write
    /// blocks once. `None` means unlimited.
    pub write_chunk: Option<usize>,
    pub write_blocked: bool,
}

impl Default for MasterState {
    fn default() -> Self {
        Self {
            connect: ConnectBehavior::Immediate,
            connect_polls: 0,
            inbound: VecDeque::new(),
            outbound: Vec::new(),
            eof: false,
            nodelay: false,
            opened: 0,
            closed: 0,
            socket_ids: Vec::new(),
            write_chunk: None,
            write_blocked: false,
        }
    }
}

/// Test-side handle to one scripted master.
#[derive(Debug, Clone)]
pub struct MasterScript {
    state: Arc<Mutex<MasterState>>,
}

impl MasterScript {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MasterState::default())),
        }
    }

    pub fn set_connect(&self, behavior: ConnectBehavior) {
        self.state.lock().unwrap().connect = behavior;
    }

    /// Accept `chunk` bytes per flush, blocking in between.
    pub fn set_write_chunk(&self, chunk: usize) {
        self.state.lock().unwrap().write_chunk = Some(chunk);
    }

    /// Queue a frame for the slave to read.
    pub fn send(&self, frame: &Frame) {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        self.send_raw(&buf);
    }

    pub fn send_raw(&self, bytes: &[u8]) {
        self.state.lock().unwrap().inbound.extend(bytes.iter().copied());
    }

    pub fn send_table_info(&self, master_table_id: u32, row_count: u64, structure_version: u64, name: &str) {
        self.send(&Frame::TableInfo(TableInfo {
            master_table_id,
            row_count,
            structure_version,
            table_name: name.to_string(),
        }));
    }

    pub fn send_stream_start(&self, master_table_id: u32, metadata: &'static [u8], symbols: &'static [u8]) {
        self.send(&Frame::StartOfReplicationStream(StartOfReplicationStream {
            master_table_id,
            metadata: bytes::Bytes::from_static(metadata),
            symbols: bytes::Bytes::from_static(symbols),
        }));
    }

    /// Make reads return end-of-stream once the inbound bytes are consumed.
    pub fn hang_up(&self) {
        self.state.lock().unwrap().eof = true;
    }

    /// Every frame the slave has written so far.
    pub fn received(&self) -> Vec<Frame> {
        let outbound = self.state.lock().unwrap().outbound.clone();
        let mut reader = FrameReader::new(outbound.len().max(64));
        reader
            .fill(|buf, _| {
                buf.extend_from_slice(&outbound);
                Ok(outbound.len())
            })
            .unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = reader.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    pub fn received_bytes(&self) -> usize {
        self.state.lock().unwrap().outbound.len()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    /// Sockets dropped by whoever owned them.
    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn nodelay(&self) -> bool {
        self.state.lock().unwrap().nodelay
    }

    pub fn socket_ids(&self) -> Vec<SocketId> {
        self.state.lock().unwrap().socket_ids.clone()
    }
}

#[derive(Debug)]
pub struct MockSocket {
    id: SocketId,
    state: Arc<Mutex<MasterState>>,
}

impl ReplicationSocket for MockSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn poll_connect(&mut self) -> io::Result<ConnectStatus> {
        let mut state = self.state.lock().unwrap();
        state.connect_polls += 1;
        match state.connect {
            ConnectBehavior::Immediate => Ok(ConnectStatus::Connected),
            ConnectBehavior::Pending => Ok(ConnectStatus::InProgress),
            ConnectBehavior::AfterPolls(n) if state.connect_polls > n => Ok(ConnectStatus::Connected),
            ConnectBehavior::AfterPolls(_) => Ok(ConnectStatus::InProgress),
            ConnectBehavior::Errno(errno) => Err(io::Error::from_raw_os_error(errno)),
            ConnectBehavior::Refuse => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
        }
    }

    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()> {
        self.state.lock().unwrap().nodelay = nodelay;
        Ok(())
    }

    fn try_read(&mut self, buf: &mut BytesMut, max: usize) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.inbound.is_empty() {
            return if state.eof {
                Ok(0)
            } else {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            };
        }
        let n = state.inbound.len().min(max);
        let chunk: Vec<u8> = state.inbound.drain(..n).collect();
        buf.extend_from_slice(&chunk);
        Ok(n)
    }

    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let Some(chunk) = state.write_chunk else {
            state.outbound.extend_from_slice(data);
            return Ok(data.len());
        };
        if state.write_blocked {
            state.write_blocked = false;
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        state.write_blocked = true;
        let n = chunk.min(data.len());
        state.outbound.extend_from_slice(&data[..n]);
        Ok(n)
    }
}

impl Drop for MockSocket {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed += 1;
        }
    }
}

/// [`Connector`] handing out [`MockSocket`]s, one script per port.
#[derive(Debug, Default)]
pub struct MockConnector {
    masters: Mutex<HashMap<u16, MasterScript>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script for the master on `port`, created on first use.
    pub fn master(&self, port: u16) -> MasterScript {
        self.masters
            .lock()
            .unwrap()
            .entry(port)
            .or_insert_with(MasterScript::new)
            .clone()
    }
}

impl Connector for MockConnector {
    fn open(&self, endpoint: &MasterEndpoint) -> io::Result<BoxedSocket> {
        let script = self.master(endpoint.port);
        let mut state = script.state.lock().unwrap();
        if state.connect == ConnectBehavior::Refuse {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        let id = SocketId::next();
        state.opened += 1;
        state.socket_ids.push(id);
        drop(state);
        Ok(Box::new(MockSocket {
            id,
            state: script.state.clone(),
        }))
    }
}
