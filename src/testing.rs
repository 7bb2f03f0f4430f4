//! Scripted in-memory GDB server used by the crate's tests.
//!
//! Implements just enough of the server side of RSP to exercise the real
//! session, memory and target-control state machines: acknowledgements,
//! `qSupported`, `QStartNoAckMode`, `m` / `M` against a flat memory image,
//! and optional canned replies for arbitrary commands.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use crate::conn::{Connection, RecvStatus};
use crate::error::Result;
use crate::protocol::hex;
use crate::protocol::packet;

pub(crate) struct MockServer {
    /// Address the memory image is mapped at.
    pub base: u32,
    /// Flat target memory, shared so tests can inspect it after the
    /// session takes ownership of the server.
    pub mem: Rc<RefCell<Vec<u8>>>,
    /// Every decoded command payload, in arrival order.
    pub commands: Rc<RefCell<Vec<String>>>,
    /// Every `M` write as `(address, bytes)`, in arrival order.
    pub writes: Rc<RefCell<Vec<(u32, Vec<u8>)>>>,
    /// `qSupported` reply payload.
    pub features: String,
    /// Scripted reply frames for specific commands.
    pub canned: HashMap<String, Vec<Vec<u8>>>,
    ack_mode: bool,
    inbox: VecDeque<u8>,
    rx: Vec<u8>,
}

impl MockServer {
    pub fn new(base: u32, mem: Vec<u8>) -> MockServer {
        MockServer {
            base,
            mem: Rc::new(RefCell::new(mem)),
            commands: Rc::new(RefCell::new(Vec::new())),
            writes: Rc::new(RefCell::new(Vec::new())),
            features: "PacketSize=3fff;QStartNoAckMode+".into(),
            canned: HashMap::new(),
            ack_mode: true,
            inbox: VecDeque::new(),
            rx: Vec::new(),
        }
    }

    fn handle(&mut self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).into_owned();
        self.commands.borrow_mut().push(text.clone());

        let was_ack_mode = self.ack_mode;
        let replies: Vec<Vec<u8>> = if let Some(scripted) = self.canned.get(&text) {
            scripted.clone()
        } else if text == "qSupported" {
            vec![self.features.clone().into_bytes()]
        } else if text == "QStartNoAckMode" {
            self.ack_mode = false;
            vec![b"OK".to_vec()]
        } else if text == "D" {
            vec![b"OK".to_vec()]
        } else if let Some(rest) = text.strip_prefix('m') {
            vec![self.read_mem(rest)]
        } else if let Some(rest) = text.strip_prefix('M') {
            vec![self.write_mem(rest)]
        } else {
            vec![Vec::new()]
        };

        if was_ack_mode {
            self.inbox.push_back(b'+');
        }
        for reply in replies {
            self.inbox.extend(packet::encode(&reply));
        }
    }

    fn read_mem(&mut self, args: &str) -> Vec<u8> {
        let parsed = args.split_once(',').and_then(|(addr, len)| {
            let addr = u32::from_str_radix(addr, 16).ok()?;
            let len = usize::from_str_radix(len, 16).ok()?;
            Some((addr, len))
        });
        let Some((addr, len)) = parsed else {
            return b"E02".to_vec();
        };

        let mem = self.mem.borrow();
        let start = addr.wrapping_sub(self.base) as usize;
        match mem.get(start..start + len) {
            Some(bytes) => bytes
                .iter()
                .flat_map(|b| format!("{:02x}", b).into_bytes())
                .collect(),
            None => b"E01".to_vec(),
        }
    }

    fn write_mem(&mut self, args: &str) -> Vec<u8> {
        let parsed = args.split_once(':').and_then(|(head, data)| {
            let (addr, len) = head.split_once(',')?;
            let addr = u32::from_str_radix(addr, 16).ok()?;
            let len = usize::from_str_radix(len, 16).ok()?;
            if data.len() != len * 2 {
                return None;
            }
            let mut bytes = vec![0u8; len];
            hex::decode_hex_buf(data.as_bytes(), &mut bytes).ok()?;
            Some((addr, bytes))
        });
        let Some((addr, bytes)) = parsed else {
            return b"E02".to_vec();
        };

        self.writes.borrow_mut().push((addr, bytes.clone()));

        let start = addr.wrapping_sub(self.base) as usize;
        let mut mem = self.mem.borrow_mut();
        match mem.get_mut(start..start + bytes.len()) {
            Some(slice) => {
                slice.copy_from_slice(&bytes);
                b"OK".to_vec()
            }
            None => b"E01".to_vec(),
        }
    }
}

impl Connection for MockServer {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        for &byte in buf {
            // Client-side acknowledgements arrive outside frames.
            if self.rx.is_empty() && (byte == b'+' || byte == b'-') {
                continue;
            }
            self.rx.push(byte);
            let n = self.rx.len();
            if n >= 4 && self.rx[n - 3] == b'#' {
                let payload = self.rx[1..n - 3].to_vec();
                self.rx.clear();
                self.handle(&payload);
            }
        }
        Ok(())
    }

    fn recv_some(&mut self, buf: &mut [u8]) -> Result<RecvStatus> {
        if self.inbox.is_empty() {
            return Ok(RecvStatus::WouldBlock);
        }
        let mut n = 0;
        while n < buf.len() {
            match self.inbox.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(RecvStatus::Data(n))
    }
}
