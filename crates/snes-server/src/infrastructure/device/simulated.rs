//! In-memory SD2SNES stand-in that speaks the packet protocol byte for byte.
//!
//! [`SimulatedDevice`] holds the console memory and an SD card filesystem.
//! [`SimulatedLink`] is its [`DeviceLink`]: written bytes are parsed as
//! command packets and data phases, answers are queued for `read_exact`.
//!
//! The firmware quirks that clients depend on are reproduced:
//!
//! - WRAM is read-only through SNES space; writes there are dropped.  The
//!   CMD window at `0x2C00` executes uploaded programs when its first byte
//!   becomes non-zero, and their stores land in WRAM.
//! - `MKDIR` on an existing directory, and `LS`/`GET` on a missing path,
//!   answer with an error RESPONSE.
//! - Writing `1` to the save (or load) byte of the savestate interface
//!   snapshots WRAM into the savestate area (or restores it) and clears the
//!   byte again.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use snes_core::domain::address::{
    bus_to_wram, interpret_cmd_program, is_wram, CMD_SPACE_ADDRESS, CMD_SPACE_SIZE, WRAM_SIZE, WRAM_START,
};
use snes_core::domain::device::SAVESTATE_DATA_ADDRESS;
use snes_core::protocol::listing::encode_listing;
use snes_core::protocol::packet::{
    encode_info, pad_to_blocks, padded_len, DeviceCommand, DeviceSpace, ResponseHeader, BLOCK_SIZE, PACKET_SIZE,
    SMALL_BLOCK_SIZE,
};
use snes_core::{DirEntry, FirmwareGeneration};
use tracing::{debug, warn};

use super::{DeviceError, DeviceLink};
use crate::domain::identity::DeviceIdentity;
use crate::infrastructure::device::DeviceConnector;

const PAGE_SIZE: u32 = 0x1000;
const MENU_ROM: &str = "/sd2snes/m3nu.bin";
/// Feature bitmap reported by INFO: MSU1 and CMD unlock.
const FEATURES: u8 = 0b0010_1000;

/// Lazily allocated byte space; untouched bytes read as zero.
#[derive(Debug, Default)]
struct SparseMemory {
    pages: HashMap<u32, Box<[u8]>>,
}

impl SparseMemory {
    fn read(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| {
                let at = address.wrapping_add(i);
                self.pages
                    .get(&(at / PAGE_SIZE))
                    .map_or(0, |page| page[(at % PAGE_SIZE) as usize])
            })
            .collect()
    }

    fn write_byte(&mut self, address: u32, byte: u8) {
        let page = self
            .pages
            .entry(address / PAGE_SIZE)
            .or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
        page[(address % PAGE_SIZE) as usize] = byte;
    }

    fn write(&mut self, address: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            self.write_byte(address.wrapping_add(i as u32), byte);
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Vec<u8>),
}

/// Result of executing one command packet.
struct Execution {
    output: Vec<u8>,
    /// The command's outbound data phase should be collected.
    accepts_data: bool,
}

impl Execution {
    fn respond(header: ResponseHeader) -> Self {
        Self {
            output: header.encode().to_vec(),
            accepts_data: false,
        }
    }

    fn with_data(header: ResponseHeader, data: &[u8], block: usize) -> Self {
        let mut output = header.encode().to_vec();
        output.extend(pad_to_blocks(data, block));
        Self {
            output,
            accepts_data: false,
        }
    }

    fn silent() -> Self {
        Self {
            output: Vec::new(),
            accepts_data: false,
        }
    }
}

pub struct SimulatedDevice {
    name: String,
    firmware: String,
    rom_running: String,
    memory: HashMap<DeviceSpace, SparseMemory>,
    files: BTreeMap<String, Node>,
}

impl SimulatedDevice {
    pub fn new(name: impl Into<String>, firmware: impl Into<String>) -> Self {
        let mut files = BTreeMap::new();
        files.insert("/".to_string(), Node::Dir);
        Self {
            name: name.into(),
            firmware: firmware.into(),
            rom_running: MENU_ROM.to_string(),
            memory: HashMap::new(),
            files,
        }
    }

    pub fn shared(name: impl Into<String>, firmware: impl Into<String>) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(name, firmware)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rom_running(&self) -> &str {
        &self.rom_running
    }

    /// Reads memory the way a test would peek at the console.
    pub fn peek(&self, space: DeviceSpace, address: u32, len: usize) -> Vec<u8> {
        self.memory
            .get(&space)
            .map_or_else(|| vec![0; len], |memory| memory.read(address, len))
    }

    /// Writes memory directly, bypassing the WRAM restriction.
    pub fn poke(&mut self, space: DeviceSpace, address: u32, data: &[u8]) {
        self.memory.entry(space).or_default().write(address, data);
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        match self.files.get(path) {
            Some(Node::File(data)) => Some(data),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(self.files.get(path), Some(Node::Dir))
    }

    // ── Command execution ─────────────────────────────────────────────────────

    fn execute(&mut self, command: &DeviceCommand) -> Execution {
        match command {
            DeviceCommand::Info => Execution {
                output: encode_info(&self.rom_running, 0x0B, &self.firmware, FEATURES).to_vec(),
                accepts_data: false,
            },
            DeviceCommand::Get { space, address, size } => {
                let data = self.peek(*space, *address, *size as usize);
                Execution::with_data(ResponseHeader::ok(*size), &data, BLOCK_SIZE)
            }
            DeviceCommand::VGet { space, regions } => {
                let data: Vec<u8> = regions
                    .iter()
                    .flat_map(|&(address, size)| self.peek(*space, address, size as usize))
                    .collect();
                Execution::with_data(ResponseHeader::ok(data.len() as u32), &data, SMALL_BLOCK_SIZE)
            }
            DeviceCommand::Put { .. } | DeviceCommand::VPut { .. } => Execution {
                output: ResponseHeader::ok(0).encode().to_vec(),
                accepts_data: true,
            },
            DeviceCommand::GetFile { path } => match self.files.get(path) {
                Some(Node::File(data)) => {
                    Execution::with_data(ResponseHeader::ok(data.len() as u32), data, BLOCK_SIZE)
                }
                _ => Execution::respond(ResponseHeader::failed()),
            },
            DeviceCommand::PutFile { path, size } => {
                if self.is_dir(parent(path)) && !self.is_dir(path) {
                    if *size == 0 {
                        self.files.insert(path.clone(), Node::File(Vec::new()));
                    }
                    Execution {
                        output: ResponseHeader::ok(0).encode().to_vec(),
                        accepts_data: true,
                    }
                } else {
                    Execution::respond(ResponseHeader::failed())
                }
            }
            DeviceCommand::List { path } => match self.listing(path) {
                Some(entries) => Execution::with_data(ResponseHeader::ok(0), &encode_listing(&entries), BLOCK_SIZE),
                None => Execution::respond(ResponseHeader::failed()),
            },
            DeviceCommand::MakeDir { path } => {
                let ok = self.is_dir(parent(path)) && !self.files.contains_key(path.as_str());
                if ok {
                    self.files.insert(path.clone(), Node::Dir);
                }
                Execution::respond(outcome(ok))
            }
            DeviceCommand::Remove { path } => Execution::respond(outcome(self.remove(path))),
            DeviceCommand::Rename { from, to } => Execution::respond(outcome(self.rename(from, to))),
            DeviceCommand::Boot { path } => {
                if self.file(path).is_some() {
                    self.rom_running = path.clone();
                } else {
                    debug!("{}: BOOT of missing {path} ignored", self.name);
                }
                Execution::silent()
            }
            DeviceCommand::MenuReset => {
                self.rom_running = MENU_ROM.to_string();
                Execution::silent()
            }
            DeviceCommand::Reset | DeviceCommand::PowerCycle => Execution::silent(),
            DeviceCommand::Stream => Execution::respond(ResponseHeader::failed()),
        }
    }

    /// Applies the data phase of a `PUT`/`VPUT`/file `PUT`.
    fn accept_data(&mut self, command: &DeviceCommand, data: &[u8]) {
        match command {
            DeviceCommand::Put { space, address, .. } => self.write_memory(*space, *address, data),
            DeviceCommand::VPut { space, regions } => {
                let mut offset = 0;
                for &(address, size) in regions {
                    let end = offset + size as usize;
                    self.write_memory(*space, address, &data[offset..end]);
                    offset = end;
                }
            }
            DeviceCommand::PutFile { path, .. } => {
                self.files.insert(path.clone(), Node::File(data.to_vec()));
            }
            _ => {}
        }
    }

    fn write_memory(&mut self, space: DeviceSpace, address: u32, data: &[u8]) {
        match space {
            DeviceSpace::Snes => {
                let memory = self.memory.entry(space).or_default();
                for (i, &byte) in data.iter().enumerate() {
                    let at = address + i as u32;
                    if !is_wram(at, 1) {
                        memory.write_byte(at, byte);
                    }
                }
                self.service_savestate(address, data.len());
            }
            DeviceSpace::Cmd => {
                self.poke(space, address, data);
                let covers_trigger = (address..address + data.len() as u32).contains(&CMD_SPACE_ADDRESS);
                if covers_trigger && self.peek(space, CMD_SPACE_ADDRESS, 1)[0] != 0 {
                    self.run_cmd_program();
                }
            }
            _ => self.poke(space, address, data),
        }
    }

    fn run_cmd_program(&mut self) {
        let code = self.peek(DeviceSpace::Cmd, CMD_SPACE_ADDRESS, CMD_SPACE_SIZE);
        match interpret_cmd_program(&code) {
            Ok(stores) => {
                for (bus, byte) in stores {
                    if let Some(address) = bus_to_wram(bus) {
                        self.poke(DeviceSpace::Snes, address, &[byte]);
                    } else if bus == CMD_SPACE_ADDRESS {
                        self.poke(DeviceSpace::Cmd, bus, &[byte]);
                    }
                }
            }
            Err(e) => {
                warn!("{}: CMD program rejected: {e}", self.name);
                self.poke(DeviceSpace::Cmd, CMD_SPACE_ADDRESS, &[0]);
            }
        }
    }

    fn service_savestate(&mut self, address: u32, len: usize) {
        let interface = FirmwareGeneration::from_firmware(&self.firmware).savestate_interface();
        if address > interface + 1 || address + len as u32 <= interface {
            return;
        }
        let control = self.peek(DeviceSpace::Snes, interface, 2);
        if control[0] != 0 {
            let wram = self.peek(DeviceSpace::Snes, WRAM_START, WRAM_SIZE as usize);
            self.poke(DeviceSpace::Snes, SAVESTATE_DATA_ADDRESS, &wram);
        } else if control[1] != 0 {
            let state = self.peek(DeviceSpace::Snes, SAVESTATE_DATA_ADDRESS, WRAM_SIZE as usize);
            self.poke(DeviceSpace::Snes, WRAM_START, &state);
        } else {
            return;
        }
        self.poke(DeviceSpace::Snes, interface, &[0, 0]);
    }

    // ── Filesystem ────────────────────────────────────────────────────────────

    fn children(&self, dir: &str) -> impl Iterator<Item = (&String, &Node)> + '_ {
        let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
        self.files
            .iter()
            .filter(move |(path, _)| {
                path.len() > prefix.len() && path.starts_with(&prefix) && !path[prefix.len()..].contains('/')
            })
    }

    fn listing(&self, path: &str) -> Option<Vec<DirEntry>> {
        if !self.is_dir(path) {
            return None;
        }
        let mut entries = vec![DirEntry::directory("."), DirEntry::directory("..")];
        entries.extend(self.children(path).map(|(child, node)| {
            let name = child.rsplit('/').next().unwrap_or_default();
            match node {
                Node::Dir => DirEntry::directory(name),
                Node::File(_) => DirEntry::file(name),
            }
        }));
        Some(entries)
    }

    fn remove(&mut self, path: &str) -> bool {
        let removable = match self.files.get(path) {
            Some(Node::File(_)) => true,
            Some(Node::Dir) => path != "/" && self.children(path).next().is_none(),
            None => false,
        };
        if removable {
            self.files.remove(path);
        }
        removable
    }

    fn rename(&mut self, from: &str, to: &str) -> bool {
        let target = if to.starts_with('/') {
            to.to_string()
        } else {
            join(parent(from), to)
        };
        if from == "/" || !self.files.contains_key(from) || self.files.contains_key(&target) || !self.is_dir(parent(&target)) {
            return false;
        }
        let nested = format!("{from}/");
        let moved: Vec<String> = self
            .files
            .keys()
            .filter(|path| path.as_str() == from || path.starts_with(&nested))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = self.files.remove(&old) {
                let new = format!("{target}{}", &old[from.len()..]);
                self.files.insert(new, node);
            }
        }
        true
    }
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn outcome(ok: bool) -> ResponseHeader {
    if ok {
        ResponseHeader::ok(0)
    } else {
        ResponseHeader::failed()
    }
}

// ── Link ──────────────────────────────────────────────────────────────────────

/// Byte-level link to a [`SimulatedDevice`].
pub struct SimulatedLink {
    device: Arc<Mutex<SimulatedDevice>>,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    /// Command whose data phase is being collected, with its padded length.
    awaiting: Option<(DeviceCommand, usize)>,
    open_links: Option<Arc<AtomicUsize>>,
}

impl SimulatedLink {
    pub fn new(device: Arc<Mutex<SimulatedDevice>>) -> Self {
        Self {
            device,
            inbox: Vec::new(),
            outbox: VecDeque::new(),
            awaiting: None,
            open_links: None,
        }
    }

    fn pump(&mut self) -> Result<(), DeviceError> {
        loop {
            if let Some((command, needed)) = &self.awaiting {
                if self.inbox.len() < *needed {
                    return Ok(());
                }
                let phase: Vec<u8> = self.inbox.drain(..*needed).collect();
                let len = command.outbound_len();
                self.device
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .accept_data(command, &phase[..len]);
                self.awaiting = None;
                continue;
            }

            if self.inbox.len() < PACKET_SIZE {
                return Ok(());
            }
            let packet: Vec<u8> = self.inbox.drain(..PACKET_SIZE).collect();
            let command = DeviceCommand::decode(&packet)?;
            let execution = self
                .device
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .execute(&command);
            self.outbox.extend(execution.output);

            let len = command.outbound_len();
            if execution.accepts_data && len > 0 {
                let padded = padded_len(len, command.block_size());
                self.awaiting = Some((command, padded));
            }
        }
    }
}

#[async_trait]
impl DeviceLink for SimulatedLink {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        self.inbox.extend_from_slice(data);
        self.pump()
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        let n = buf.len();
        if self.outbox.len() < n {
            return Err(DeviceError::Timeout);
        }
        for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(())
    }
}

impl Drop for SimulatedLink {
    fn drop(&mut self) {
        if let Some(open) = &self.open_links {
            open.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

// ── Connector ─────────────────────────────────────────────────────────────────

/// Offers one simulated device and counts the links opened to it.
#[derive(Clone)]
pub struct SimulatedConnector {
    device: Arc<Mutex<SimulatedDevice>>,
    opened: Arc<AtomicUsize>,
    open_links: Arc<AtomicUsize>,
}

impl SimulatedConnector {
    pub fn new(name: impl Into<String>, firmware: impl Into<String>) -> Self {
        Self::with_device(SimulatedDevice::shared(name, firmware))
    }

    pub fn with_device(device: Arc<Mutex<SimulatedDevice>>) -> Self {
        Self {
            device,
            opened: Arc::new(AtomicUsize::new(0)),
            open_links: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn device(&self) -> Arc<Mutex<SimulatedDevice>> {
        Arc::clone(&self.device)
    }

    /// Links opened over the connector's lifetime.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    /// Links currently open.
    pub fn open_links(&self) -> usize {
        self.open_links.load(Ordering::Acquire)
    }

    fn identity(&self) -> DeviceIdentity {
        let name = self.device.lock().unwrap_or_else(PoisonError::into_inner).name().to_string();
        DeviceIdentity::Simulated(name)
    }
}

impl DeviceConnector for SimulatedConnector {
    fn discover(&self) -> Result<Vec<DeviceIdentity>, DeviceError> {
        Ok(vec![self.identity()])
    }

    fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn DeviceLink>, DeviceError> {
        if *identity != self.identity() {
            return Err(DeviceError::NotFound(identity.device_name()));
        }
        self.opened.fetch_add(1, Ordering::AcqRel);
        self.open_links.fetch_add(1, Ordering::AcqRel);
        let mut link = SimulatedLink::new(Arc::clone(&self.device));
        link.open_links = Some(Arc::clone(&self.open_links));
        Ok(Box::new(link))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use snes_core::domain::address::assemble_wram_writes;
    use snes_core::domain::device::SAVESTATE_INTERFACE_CURRENT;

    fn run(device: &mut SimulatedDevice, command: DeviceCommand, data: &[u8]) -> Vec<u8> {
        let execution = device.execute(&command);
        if execution.accepts_data {
            device.accept_data(&command, data);
        }
        execution.output
    }

    fn is_error(output: &[u8]) -> bool {
        ResponseHeader::decode(output).unwrap().error
    }

    #[test]
    fn test_direct_wram_writes_are_dropped() {
        let mut device = SimulatedDevice::new("SIM", "1.11.0");
        let command = DeviceCommand::Put {
            space: DeviceSpace::Snes,
            address: 0xF50000,
            size: 2,
        };
        run(&mut device, command, &[1, 2]);
        assert_eq!(device.peek(DeviceSpace::Snes, 0xF50000, 2), vec![0, 0]);
    }

    #[test]
    fn test_cmd_program_writes_wram_and_clears_trigger() {
        // Arrange
        let mut device = SimulatedDevice::new("SIM", "1.11.0");
        let program = &assemble_wram_writes(&[(0xF50020, vec![0xDE, 0xAD])]).unwrap()[0];
        let body_len = program.code.len() - 1;

        // Act: body first, then the final byte onto the trigger
        run(
            &mut device,
            DeviceCommand::Put {
                space: DeviceSpace::Cmd,
                address: CMD_SPACE_ADDRESS,
                size: body_len as u32,
            },
            &program.code[..body_len],
        );
        run(
            &mut device,
            DeviceCommand::Put {
                space: DeviceSpace::Cmd,
                address: CMD_SPACE_ADDRESS,
                size: 1,
            },
            &program.code[body_len..],
        );

        // Assert
        assert_eq!(device.peek(DeviceSpace::Snes, 0xF50020, 2), vec![0xDE, 0xAD]);
        assert_eq!(device.peek(DeviceSpace::Cmd, CMD_SPACE_ADDRESS, 1), vec![0]);
    }

    #[test]
    fn test_mkdir_on_existing_directory_fails() {
        let mut device = SimulatedDevice::new("SIM", "1.11.0");
        let mkdir = DeviceCommand::MakeDir { path: "/a".into() };
        assert!(!is_error(&run(&mut device, mkdir.clone(), &[])));
        assert!(is_error(&run(&mut device, mkdir, &[])));
    }

    #[test]
    fn test_listing_and_get_of_missing_paths_fail() {
        let mut device = SimulatedDevice::new("SIM", "1.11.0");
        assert!(is_error(&run(&mut device, DeviceCommand::List { path: "/nope".into() }, &[])));
        assert!(is_error(&run(&mut device, DeviceCommand::GetFile { path: "/nope".into() }, &[])));
    }

    #[test]
    fn test_rename_moves_nested_entries() {
        // Arrange
        let mut device = SimulatedDevice::new("SIM", "1.11.0");
        run(&mut device, DeviceCommand::MakeDir { path: "/a".into() }, &[]);
        run(
            &mut device,
            DeviceCommand::PutFile {
                path: "/a/f.bin".into(),
                size: 1,
            },
            &[5],
        );

        // Act
        let output = run(
            &mut device,
            DeviceCommand::Rename {
                from: "/a".into(),
                to: "/b".into(),
            },
            &[],
        );

        // Assert
        assert!(!is_error(&output));
        assert_eq!(device.file("/b/f.bin"), Some(&[5u8][..]));
        assert!(!device.is_dir("/a"));
    }

    #[test]
    fn test_remove_refuses_non_empty_directories() {
        let mut device = SimulatedDevice::new("SIM", "1.11.0");
        run(&mut device, DeviceCommand::MakeDir { path: "/a".into() }, &[]);
        run(&mut device, DeviceCommand::MakeDir { path: "/a/b".into() }, &[]);
        assert!(is_error(&run(&mut device, DeviceCommand::Remove { path: "/a".into() }, &[])));
        assert!(!is_error(&run(&mut device, DeviceCommand::Remove { path: "/a/b".into() }, &[])));
    }

    #[test]
    fn test_savestate_trigger_snapshots_wram_and_clears() {
        // Arrange
        let mut device = SimulatedDevice::new("SIM", "1.11.0");
        device.poke(DeviceSpace::Snes, WRAM_START + 5, &[0x77]);

        // Act
        run(
            &mut device,
            DeviceCommand::Put {
                space: DeviceSpace::Snes,
                address: SAVESTATE_INTERFACE_CURRENT,
                size: 2,
            },
            &[1, 0],
        );

        // Assert
        assert_eq!(device.peek(DeviceSpace::Snes, SAVESTATE_DATA_ADDRESS + 5, 1), vec![0x77]);
        assert_eq!(device.peek(DeviceSpace::Snes, SAVESTATE_INTERFACE_CURRENT, 2), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_link_waits_for_the_whole_data_phase() {
        // Arrange
        let device = SimulatedDevice::shared("SIM", "1.11.0");
        let mut link = SimulatedLink::new(Arc::clone(&device));
        let put = DeviceCommand::Put {
            space: DeviceSpace::Snes,
            address: 0xE00000,
            size: 3,
        };

        // Act: command, then the padded block in two halves
        link.write_all(&put.encode().unwrap()).await.unwrap();
        let block = pad_to_blocks(&[1, 2, 3], BLOCK_SIZE);
        link.write_all(&block[..100]).await.unwrap();
        let mid = device.lock().unwrap().peek(DeviceSpace::Snes, 0xE00000, 3);
        link.write_all(&block[100..]).await.unwrap();

        // Assert
        assert_eq!(mid, vec![0, 0, 0]);
        assert_eq!(device.lock().unwrap().peek(DeviceSpace::Snes, 0xE00000, 3), vec![1, 2, 3]);
        let mut response = [0u8; PACKET_SIZE];
        link.read_exact(&mut response).await.unwrap();
        assert!(!ResponseHeader::decode(&response).unwrap().error);
    }

    #[test]
    fn test_connector_counts_open_links() {
        let connector = SimulatedConnector::new("SD2SNES SIM", "1.11.0");
        let identity = connector.discover().unwrap().remove(0);
        let first = connector.open(&identity).unwrap();
        let second = connector.open(&identity).unwrap();
        assert_eq!(connector.open_links(), 2);
        drop(first);
        drop(second);
        assert_eq!(connector.open_links(), 0);
        assert_eq!(connector.opened(), 2);
    }
}
