//! Device metadata shared by both ends of the protocol.

/// Size of the savestate blob the firmware exchanges.
pub const SAVESTATE_SIZE: usize = 320 * 1024;
/// Where the savestate blob lives in the external address space.
pub const SAVESTATE_DATA_ADDRESS: u32 = 0xF00000;
/// Savestate control bytes on firmware before generation 11.
pub const SAVESTATE_INTERFACE_LEGACY: u32 = 0xFC2000;
/// Savestate control bytes on firmware generation 11 and later.
pub const SAVESTATE_INTERFACE_CURRENT: u32 = 0xFE1000;

/// Answer to `Info`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub firmware_version: String,
    pub version_string: String,
    pub rom_running: String,
    pub features: Vec<String>,
}

impl DeviceInfo {
    /// Wire form: `[firmware, version, rom, feature...]`.
    pub fn to_results(&self) -> Vec<String> {
        let mut results = vec![
            self.firmware_version.clone(),
            self.version_string.clone(),
            self.rom_running.clone(),
        ];
        results.extend(self.features.iter().cloned());
        results
    }

    /// Parses the wire form; missing trailing fields become empty.
    pub fn from_results(results: &[String]) -> Self {
        let field = |i: usize| results.get(i).cloned().unwrap_or_default();
        Self {
            firmware_version: field(0),
            version_string: field(1),
            rom_running: field(2),
            features: results.iter().skip(3).cloned().collect(),
        }
    }

    pub fn generation(&self) -> FirmwareGeneration {
        FirmwareGeneration::from_firmware(&self.firmware_version)
    }
}

/// Firmware families that place the savestate interface differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareGeneration {
    Legacy,
    Current,
}

impl FirmwareGeneration {
    /// Picks the generation from a firmware string such as `"1.11.0"` or `"11"`.
    ///
    /// `1.x` strings are versioned by their second component.
    pub fn from_firmware(firmware: &str) -> Self {
        let numbers: Vec<u32> = firmware
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect();
        let major = match numbers.as_slice() {
            [1, minor, ..] => *minor,
            [first, ..] => *first,
            [] => 0,
        };
        if major >= 11 {
            Self::Current
        } else {
            Self::Legacy
        }
    }

    pub fn savestate_interface(self) -> u32 {
        match self {
            Self::Legacy => SAVESTATE_INTERFACE_LEGACY,
            Self::Current => SAVESTATE_INTERFACE_CURRENT,
        }
    }
}

/// Kind byte of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryKind {
    Directory = 0,
    File = 1,
}

/// One entry of a device directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirEntry {
    pub kind: EntryKind,
    pub name: String,
}

impl DirEntry {
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Directory,
            name: name.into(),
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::File,
            name: name.into(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
