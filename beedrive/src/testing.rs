//! Scripted printer used by the unit tests.
//!
//! `FakePrinter` implements [`BulkPort`] and answers the way the firmware
//! and bootloader do: command lines get their textual replies, block data
//! is acknowledged with `tog`, firmware chunks are echoed back. Faults are
//! injected per message index.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::time::Duration;

use crate::device::PrinterIdentity;
use crate::error::{Error, Result};
use crate::mode::PrinterMode;
use crate::port::BulkPort;

/// One recorded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Written {
    Command(String),
    Data(Vec<u8>),
    Clean,
}

struct FakeState {
    mode: PrinterMode,
    pending_mode: Option<PrinterMode>,
    open: bool,
    unplugged: bool,
    reconnects: u32,
    writes: Vec<Written>,
    primes: usize,
    reads: usize,
    inbox: VecDeque<u8>,
    status_code: u32,
    temperature: String,
    firmware_version: String,
    garbage_probes: u32,
    desync: bool,
    block_remaining: usize,
    data_messages: usize,
    dropped_acks: HashSet<usize>,
    short_writes: HashSet<usize>,
    firmware_remaining: usize,
    firmware_chunks: usize,
    corrupt_chunk: Option<usize>,
    received: Vec<u8>,
    sd_files: Vec<String>,
    gate: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
}

/// Handle on a held block-open write.
pub(crate) struct BlockGate {
    reached: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl BlockGate {
    /// Block until the transfer thread is parked on the gate.
    pub(crate) fn wait_reached(&self) {
        let _ = self.reached.recv();
    }

    /// Let the held write complete.
    pub(crate) fn release(&self) {
        let _ = self.release.send(());
    }
}

/// Simulated printer shared between the port and the test body.
#[derive(Clone)]
pub(crate) struct FakePrinter {
    state: Arc<Mutex<FakeState>>,
    identity: PrinterIdentity,
}

impl FakePrinter {
    fn new(mode: PrinterMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                mode,
                pending_mode: None,
                open: true,
                unplugged: false,
                reconnects: 0,
                writes: Vec::new(),
                primes: 0,
                reads: 0,
                inbox: VecDeque::new(),
                status_code: 3,
                temperature: "21.5".to_string(),
                firmware_version: "10.4.8".to_string(),
                garbage_probes: 0,
                desync: false,
                block_remaining: 0,
                data_messages: 0,
                dropped_acks: HashSet::new(),
                short_writes: HashSet::new(),
                firmware_remaining: 0,
                firmware_chunks: 0,
                corrupt_chunk: None,
                received: Vec::new(),
                sd_files: vec!["FIRMWARE.BIN".to_string(), "CONFIG.TXT".to_string()],
                gate: None,
            })),
            identity: PrinterIdentity::new(0x29C9, 0x0001).with_serial_number("FAKE0001"),
        }
    }

    /// Printer running its main firmware.
    pub(crate) fn firmware() -> Self {
        Self::new(PrinterMode::Firmware)
    }

    /// Printer sitting in the bootloader.
    pub(crate) fn bootloader() -> Self {
        Self::new(PrinterMode::Bootloader)
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_temperature(&self, literal: &str) {
        self.lock().temperature = literal.to_string();
    }

    pub(crate) fn set_status_code(&self, code: u32) {
        self.lock().status_code = code;
    }

    /// Answer the next `n` mode probes with noise.
    pub(crate) fn set_garbage_probes(&self, n: u32) {
        self.lock().garbage_probes = n;
    }

    /// Never answer the clean sentinel.
    pub(crate) fn set_desync(&self, desync: bool) {
        self.lock().desync = desync;
    }

    pub(crate) fn set_unplugged(&self, unplugged: bool) {
        self.lock().unplugged = unplugged;
    }

    /// Swallow the acknowledgment of the n-th data message (0-based, counted
    /// across the whole session, re-sends included).
    pub(crate) fn drop_ack(&self, message: usize) {
        self.lock().dropped_acks.insert(message);
    }

    /// Report one byte less than written for the n-th data message.
    pub(crate) fn short_write(&self, message: usize) {
        self.lock().short_writes.insert(message);
    }

    /// Flip a byte in the echo of the n-th firmware chunk.
    pub(crate) fn corrupt_echo(&self, chunk: usize) {
        self.lock().corrupt_chunk = Some(chunk);
    }

    /// Hold the next block-open write until the returned gate is released.
    pub(crate) fn gate_block_open(&self) -> BlockGate {
        let (reached_tx, reached) = mpsc::channel();
        let (release, release_rx) = mpsc::channel();
        self.lock().gate = Some((reached_tx, release_rx));
        BlockGate { reached, release }
    }

    /// Queue raw bytes for the host to read.
    pub(crate) fn push_reply(&self, data: &[u8]) {
        self.lock().inbox.extend(data);
    }

    /// Zero-length writes seen.
    pub(crate) fn prime_writes(&self) -> usize {
        self.lock().primes
    }

    /// Bulk reads performed.
    pub(crate) fn reads(&self) -> usize {
        self.lock().reads
    }

    pub(crate) fn writes(&self) -> Vec<Written> {
        self.lock().writes.clone()
    }

    /// Command lines written, without the trailing newline.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.lock()
            .writes
            .iter()
            .filter_map(|w| match w {
                Written::Command(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Data messages written, in order.
    pub(crate) fn data_messages(&self) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .filter_map(|w| match w {
                Written::Data(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn clean_writes(&self) -> usize {
        self.lock()
            .writes
            .iter()
            .filter(|w| **w == Written::Clean)
            .count()
    }

    pub(crate) fn reconnects(&self) -> u32 {
        self.lock().reconnects
    }

    pub(crate) fn mode(&self) -> PrinterMode {
        self.lock().mode
    }

    /// Payload bytes the printer accepted.
    pub(crate) fn received(&self) -> Vec<u8> {
        self.lock().received.clone()
    }

    pub(crate) fn sd_files(&self) -> Vec<String> {
        self.lock().sd_files.clone()
    }

    pub(crate) fn firmware_version(&self) -> String {
        self.lock().firmware_version.clone()
    }

    pub(crate) fn status_code(&self) -> u32 {
        self.lock().status_code
    }
}

impl FakeState {
    fn reply(&mut self, text: &str) {
        self.inbox.extend(text.as_bytes());
    }

    fn accept_data(&mut self, data: &[u8]) -> usize {
        let index = self.data_messages;
        self.data_messages += 1;
        self.writes.push(Written::Data(data.to_vec()));

        if self.short_writes.remove(&index) {
            return data.len() - 1;
        }
        if self.dropped_acks.remove(&index) {
            return data.len();
        }

        self.block_remaining = self.block_remaining.saturating_sub(data.len());
        self.received.extend_from_slice(data);
        self.reply("tog\n");
        data.len()
    }

    fn accept_firmware(&mut self, data: &[u8]) -> usize {
        let index = self.firmware_chunks;
        self.firmware_chunks += 1;
        self.writes.push(Written::Data(data.to_vec()));
        self.firmware_remaining = self.firmware_remaining.saturating_sub(data.len());
        self.received.extend_from_slice(data);

        let mut echo = data.to_vec();
        if self.corrupt_chunk == Some(index) {
            echo[0] ^= 0xFF;
        }
        self.inbox.extend(echo);
        data.len()
    }

    fn handle_command(&mut self, line: &str) {
        self.writes.push(Written::Command(line.to_string()));
        let (code, arg) = line
            .split_once(' ')
            .unwrap_or((line, ""));
        let firmware = self.mode == PrinterMode::Firmware;

        match code {
            "M625" if self.garbage_probes > 0 => {
                self.garbage_probes -= 1;
                self.reply("aaaa\n");
            },
            "M625" if firmware => {
                let status = format!("S:{}\nok Q:0\n", self.status_code);
                self.reply(&status);
            },
            "M625" => self.reply("Bad M-code 625\nok\n"),
            "M630" => {
                self.pending_mode = Some(PrinterMode::Firmware);
                self.reply("ok\n");
            },
            "M609" => {
                self.pending_mode = Some(PrinterMode::Bootloader);
                self.reply("ok\n");
            },
            "M105" => {
                let temp = format!("T:{} B:0\nok Q:0\n", self.temperature);
                self.reply(&temp);
            },
            "M115" => {
                let version = format!("{}\nok Q:0\n", self.firmware_version);
                self.reply(&version);
            },
            "M114" => {
                self.firmware_version = arg.trim_start_matches('A').to_string();
                self.reply("ok\n");
            },
            "M32" => self.reply("A95 B1800000 C20000 D5000\nok Q:0\n"),
            "M21" => self.reply("SD card ok\nok\n"),
            "M20" => {
                let mut listing = String::from("Begin file list\n");
                for name in &self.sd_files {
                    listing.push_str(&format!("/{name}\r\n"));
                }
                listing.push_str("End file list\nok\n");
                self.reply(&listing);
            },
            "M30" => {
                self.sd_files.push(arg.to_string());
                self.reply("file created\nok\n");
            },
            "M23" if self.sd_files.iter().any(|f| f == arg) => self.reply("file opened\nok\n"),
            "M23" => self.reply("error opening file\n"),
            "M33" => {
                self.status_code = 5;
                self.reply("ok\n");
            },
            "M28" => {
                let mut end = 0;
                let mut start = 0;
                for field in arg.split_whitespace() {
                    if let Some(v) = field.strip_prefix('D') {
                        end = v.parse().unwrap_or(0);
                    } else if let Some(v) = field.strip_prefix('A') {
                        start = v.parse().unwrap_or(0);
                    }
                }
                self.block_remaining = end + 1 - start;
                self.reply("ok q:0\n");
            },
            "M650" => {
                self.firmware_remaining = arg
                    .trim_start_matches('A')
                    .parse()
                    .unwrap_or(0);
                self.reply("ok\n");
            },
            "M703" | "M643" | "M505" | "M112" => {
                self.status_code = 3;
                self.reply("ok Q:0\n");
            },
            "M640" => {
                self.status_code = 7;
                self.reply("ok Q:0\n");
            },
            "M36" => {
                self.status_code = 9;
                self.reply("ok Q:0\n");
            },
            _ => self.reply("ok Q:0\n"),
        }
    }
}

impl BulkPort for FakePrinter {
    fn write_bulk(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.lock();
        if !state.open {
            return Err(Error::NotConnected);
        }
        if data.is_empty() {
            state.primes += 1;
            return Ok(0);
        }

        if data.starts_with(b"M625;") {
            state.writes.push(Written::Clean);
            if !state.desync {
                state.reply("ok Q:0\n");
            }
            return Ok(data.len());
        }
        if state.firmware_remaining > 0 {
            return Ok(state.accept_firmware(data));
        }
        if state.block_remaining > 0 {
            return Ok(state.accept_data(data));
        }

        let line = String::from_utf8_lossy(data)
            .trim_end()
            .to_string();
        let gated = line.starts_with("M28 ") && state.gate.is_some();
        state.handle_command(&line);

        if gated {
            let gate = state.gate.take();
            drop(state);
            if let Some((reached, release)) = gate {
                let _ = reached.send(());
                let _ = release.recv();
            }
        }
        Ok(data.len())
    }

    fn read_bulk(&mut self, max_len: usize, _timeout: Duration) -> Result<Vec<u8>> {
        let mut state = self.lock();
        if !state.open {
            return Err(Error::NotConnected);
        }
        state.reads += 1;
        let n = max_len.min(state.inbox.len());
        Ok(state.inbox.drain(..n).collect())
    }

    fn close(&mut self) -> Result<()> {
        self.lock().open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn reopen(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.unplugged {
            return Err(Error::DeviceNotFound);
        }
        state.open = true;
        state.reconnects += 1;
        state.inbox.clear();
        if let Some(mode) = state.pending_mode.take() {
            state.mode = mode;
        }
        Ok(())
    }

    fn identity(&self) -> &PrinterIdentity {
        &self.identity
    }
}
