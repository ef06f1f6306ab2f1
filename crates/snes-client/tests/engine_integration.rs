//! Integration tests for the protocol engine against an in-process server.
//!
//! # Purpose
//!
//! Each test runs a [`ProtocolEngine`] over the embedded transport: the real
//! server session loop and device handler, backed by the simulated SD2SNES.
//! Nothing is mocked between the operation contract and the 512-byte packet
//! codec, so these tests verify:
//!
//! - The connect / list / attach lifecycle and the state gating around it.
//! - Memory reads and writes, including WRAM writes routed through CMD
//!   programs and batched reads.
//! - Chunked file transfers at the chunk-size boundaries.
//! - Directory handling that never triggers the firmware's connection-drop
//!   quirks.
//! - Savestates, IPS patches, the memory watcher, and the transport selector.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use snes_client::domain::config::DEFAULT_CHUNK_SIZE;
use snes_client::{
    EngineConfig, MemoryChange, OperationContract, ProtocolEngine, TransferOptions, TransportKind,
    TransportSelector, WatchExt, WatchOptions, WatchTarget,
};
use snes_core::domain::device::SAVESTATE_SIZE;
use snes_core::protocol::ips::{encode_ips, IpsRecord};
use snes_core::protocol::packet::DeviceSpace;
use snes_core::retry::{Backoff, RetryPolicy};
use snes_core::{ConnectionState, ContractError, DirEntry};
use snes_server::infrastructure::device::SimulatedConnector;
use snes_server::EmbeddedConnector;

const DEVICE: &str = "SD2SNES SIM";
const SRAM: u32 = 0xE00000;
const WRAM: u32 = 0xF50000;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn test_config() -> EngineConfig {
    EngineConfig {
        request_timeout: Duration::from_secs(2),
        keepalive_interval: None,
        verification: RetryPolicy::new(3, Duration::from_millis(10), Backoff::Linear),
        directory_check: RetryPolicy::new(3, Duration::from_millis(10), Backoff::Linear),
        ..EngineConfig::default()
    }
}

/// An engine attached to a fresh simulated device.
async fn attached_engine() -> (ProtocolEngine, SimulatedConnector) {
    let device = SimulatedConnector::new(DEVICE, "1.11.0");
    let connector = EmbeddedConnector::simulated(device.clone());
    let engine = ProtocolEngine::new(Arc::new(connector), test_config());
    engine.connect("embedded").await.unwrap();
    engine.attach(DEVICE).await.unwrap();
    (engine, device)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn names(entries: &[DirEntry]) -> Vec<&str> {
    entries.iter().map(|e| e.name.as_str()).collect()
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_list_attach_round_trip() {
    // Arrange
    let connector = EmbeddedConnector::simulated(SimulatedConnector::new(DEVICE, "1.11.0"));
    let engine = ProtocolEngine::new(Arc::new(connector), test_config());

    // Act
    engine.connect("embedded").await.unwrap();
    let devices = engine.list_devices().await.unwrap();
    engine.attach(&devices[0]).await.unwrap();
    let info = engine.get_info().await.unwrap();
    let version = engine.app_version().await.unwrap();

    // Assert
    assert_eq!(devices, vec![DEVICE.to_string()]);
    assert_eq!(engine.state(), ConnectionState::Attached);
    assert_eq!(info.firmware_version, "1.11.0");
    assert_eq!(info.rom_running, "/sd2snes/m3nu.bin");
    assert!(version.starts_with("snes-server-"));

    engine.disconnect().await.unwrap();
    assert_eq!(engine.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_memory_access_requires_attach() {
    let connector = EmbeddedConnector::simulated(SimulatedConnector::new(DEVICE, "1.11.0"));
    let engine = ProtocolEngine::new(Arc::new(connector), test_config());
    engine.connect("embedded").await.unwrap();

    let result = engine.read_memory(SRAM, 4).await;

    assert!(matches!(result, Err(ContractError::NotReady { .. })));
    assert_eq!(engine.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_console_control_before_attach_keeps_the_session() {
    // Arrange
    let connector = EmbeddedConnector::simulated(SimulatedConnector::new(DEVICE, "1.11.0"));
    let engine = ProtocolEngine::new(Arc::new(connector), test_config());
    tokio_test::assert_ok!(engine.connect("embedded").await);

    // Act
    let reset = engine.reset().await;
    let devices = engine.list_devices().await;

    // Assert
    assert!(matches!(reset, Err(ContractError::NoDeviceAttached)));
    assert_eq!(tokio_test::assert_ok!(devices), vec![DEVICE.to_string()]);
    assert_eq!(engine.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_attach_to_unknown_device_is_not_found() {
    let connector = EmbeddedConnector::simulated(SimulatedConnector::new(DEVICE, "1.11.0"));
    let engine = ProtocolEngine::new(Arc::new(connector), test_config());
    tokio_test::assert_ok!(engine.connect("embedded").await);

    let result = engine.attach("SD2SNES COM7").await;

    assert!(matches!(result, Err(ContractError::NotFound(_))));
    assert_eq!(engine.state(), ConnectionState::Connected);
    tokio_test::assert_ok!(engine.attach(DEVICE).await);
}

#[tokio::test]
async fn test_disconnect_releases_the_device() {
    let (engine, device) = attached_engine().await;
    assert_eq!(device.open_links(), 1);

    engine.disconnect().await.unwrap();

    for _ in 0..100 {
        if device.open_links() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("device link still open after disconnect");
}

// ── Memory ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_write_then_read_sram() {
    let (engine, _device) = attached_engine().await;

    engine.write_memory(&[(SRAM + 0x10, vec![1, 2, 3, 4])]).await.unwrap();

    assert_eq!(engine.read_memory(SRAM + 0x10, 4).await.unwrap(), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_wram_writes_go_through_cmd_programs() {
    // Arrange
    let (engine, device) = attached_engine().await;
    let data = pattern(40);

    // Act
    engine.write_memory(&[(WRAM + 0x100, data.clone())]).await.unwrap();

    // Assert: the bytes landed in WRAM and the CMD window was used
    assert_eq!(engine.read_memory(WRAM + 0x100, 40).await.unwrap(), data);
    let trigger = device
        .device()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .peek(DeviceSpace::Cmd, 0x2C00, 1);
    assert_eq!(trigger, vec![0]);
}

#[tokio::test]
async fn test_wram_write_past_the_end_is_rejected() {
    let (engine, _device) = attached_engine().await;

    let result = engine.write_memory(&[(WRAM + 0x1FFFF, vec![1, 2])]).await;

    assert!(matches!(result, Err(ContractError::InvalidArgument(_))));
}

#[tokio::test]
async fn test_batch_read_matches_individual_reads() {
    // Arrange
    let (engine, _device) = attached_engine().await;
    engine.write_memory(&[(SRAM, pattern(600))]).await.unwrap();
    let regions = [(SRAM, 16), (SRAM + 0x40, 0), (SRAM + 0x20, 300), (SRAM + 2, 1)];

    // Act
    let batch = engine.read_memory_batch(&regions).await.unwrap();
    let mut single = Vec::new();
    for &(address, size) in &regions {
        single.push(engine.read_memory(address, size).await.unwrap());
    }

    // Assert
    assert_eq!(batch, single);
    assert_eq!(batch[1], Vec::<u8>::new());
    assert_eq!(batch[2].len(), 300);
}

#[tokio::test]
async fn test_ips_patch_is_applied() {
    let (engine, _device) = attached_engine().await;
    let patch = encode_ips(&[IpsRecord {
        offset: SRAM + 0x300,
        data: vec![0xDE, 0xAD],
    }]);

    engine.apply_patch(&patch).await.unwrap();

    assert_eq!(engine.read_memory(SRAM + 0x300, 2).await.unwrap(), vec![0xDE, 0xAD]);
}

#[tokio::test]
async fn test_empty_patch_is_rejected() {
    let (engine, _device) = attached_engine().await;
    assert!(matches!(
        engine.apply_patch(&[]).await,
        Err(ContractError::InvalidArgument(_))
    ));
}

// ── Savestates ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_save_and_load_state_restore_wram() {
    // Arrange
    let (engine, _device) = attached_engine().await;
    engine.write_memory(&[(WRAM, vec![0x11, 0x22, 0x33])]).await.unwrap();

    // Act
    let state = engine.save_state().await.unwrap();
    engine.write_memory(&[(WRAM, vec![0, 0, 0])]).await.unwrap();
    engine.load_state(&state).await.unwrap();

    // Assert
    assert_eq!(state.len(), SAVESTATE_SIZE);
    assert_eq!(&state[..3], &[0x11, 0x22, 0x33]);
    assert_eq!(engine.read_memory(WRAM, 3).await.unwrap(), vec![0x11, 0x22, 0x33]);
}

#[tokio::test]
async fn test_load_state_rejects_wrong_size() {
    let (engine, _device) = attached_engine().await;
    let result = engine.load_state(&[0; 16]).await;
    assert!(matches!(result, Err(ContractError::SizeMismatch { actual: 16, .. })));
}

// ── Files ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_upload_download_round_trip_at_chunk_boundaries() {
    let (engine, device) = attached_engine().await;
    let c = DEFAULT_CHUNK_SIZE;

    for size in [0, 1, c - 1, c, c + 1, 10 * c] {
        // Arrange
        let data = pattern(size);
        let path = format!("/roms/test-{size}.bin");
        let progress = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&progress);
        let options = TransferOptions::default().with_progress(move |p| sink.lock().unwrap().push(p.transferred));

        // Act
        let report = engine.upload_bytes(&data, &path, options).await.unwrap();
        let back = engine.download_file(&path, TransferOptions::default()).await.unwrap();

        // Assert
        assert_eq!(report.bytes, size as u64, "size {size}");
        assert_eq!(report.chunks, size.div_ceil(c), "size {size}");
        assert!(report.verified);
        assert_eq!(back, data, "size {size}");
        assert_eq!(progress.lock().unwrap().last().copied().unwrap_or(0), size as u64);
        assert_eq!(
            device.device().lock().unwrap_or_else(PoisonError::into_inner).file(&path),
            Some(data.as_slice())
        );
    }
}

#[tokio::test]
async fn test_download_of_missing_file_keeps_the_session() {
    let (engine, _device) = attached_engine().await;

    let result = engine.download_file("/nope/missing.sfc", TransferOptions::default()).await;

    assert!(matches!(result, Err(ContractError::NotFound(_))));
    assert_eq!(engine.state(), ConnectionState::Attached);
    assert!(engine.get_info().await.is_ok());
}

#[tokio::test]
async fn test_make_directory_is_idempotent() {
    // Arrange
    let (engine, device) = attached_engine().await;

    // Act: twice on this engine, then again from a second engine
    engine.make_directory("/a/b/c").await.unwrap();
    engine.make_directory("/a/b/c").await.unwrap();
    let second = ProtocolEngine::new(
        Arc::new(EmbeddedConnector::simulated(device.clone())),
        test_config(),
    );
    second.connect("embedded").await.unwrap();
    second.attach(DEVICE).await.unwrap();
    second.make_directory("/a/b/c/").await.unwrap();

    // Assert
    assert_eq!(names(&engine.list_directory("/a/b").await.unwrap()), vec!["c"]);
    assert_eq!(second.state(), ConnectionState::Attached);
    assert!(device.device().lock().unwrap_or_else(PoisonError::into_inner).is_dir("/a/b/c"));
}

#[tokio::test]
async fn test_list_directory_excludes_dot_entries() {
    let (engine, _device) = attached_engine().await;
    engine.upload_bytes(&[1, 2, 3], "/games/smw.sfc", TransferOptions::default()).await.unwrap();
    engine.make_directory("/games/saves").await.unwrap();

    let entries = engine.list_directory("/games").await.unwrap();

    assert_eq!(entries.len(), 2);
    assert!(entries.contains(&DirEntry::file("smw.sfc")));
    assert!(entries.contains(&DirEntry::directory("saves")));
}

#[tokio::test]
async fn test_remove_and_rename() {
    // Arrange
    let (engine, _device) = attached_engine().await;
    engine.upload_bytes(&[1], "/data/old.bin", TransferOptions::default()).await.unwrap();
    engine.upload_bytes(&[2], "/data/gone.bin", TransferOptions::default()).await.unwrap();

    // Act
    engine.rename("/data/old.bin", "/data/new.bin").await.unwrap();
    engine.remove("/data/gone.bin").await.unwrap();
    let missing = engine.remove("/data/gone.bin").await;

    // Assert
    let mut listed = names(&engine.list_directory("/data").await.unwrap())
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    listed.sort();
    assert_eq!(listed, vec!["new.bin".to_string()]);
    assert!(matches!(missing, Err(ContractError::NotFound(_))));
    assert_eq!(engine.state(), ConnectionState::Attached);
}

#[tokio::test]
async fn test_relative_paths_are_rejected() {
    let (engine, _device) = attached_engine().await;
    assert!(matches!(
        engine.list_directory("roms").await,
        Err(ContractError::InvalidArgument(_))
    ));
    assert!(matches!(
        engine.make_directory("/roms/../x").await,
        Err(ContractError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_boot_and_menu() {
    let (engine, _device) = attached_engine().await;
    engine.upload_bytes(&pattern(2048), "/roms/game.sfc", TransferOptions::default()).await.unwrap();

    engine.boot("/roms/game.sfc").await.unwrap();
    let booted = engine.get_info().await.unwrap().rom_running;
    engine.menu().await.unwrap();
    let after_menu = engine.get_info().await.unwrap().rom_running;

    assert_eq!(booted, "/roms/game.sfc");
    assert_eq!(after_menu, "/sd2snes/m3nu.bin");
}

// ── Watching ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_watch_for_value_returns_once_memory_matches() {
    // Arrange
    let (engine, _device) = attached_engine().await;
    let writer = engine.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.write_memory(&[(SRAM + 0x500, vec![0x42])]).await.unwrap();
    });
    let options = WatchOptions {
        timeout: Duration::from_secs(3),
        poll_interval: Duration::from_millis(20),
    };

    // Act
    let value = engine
        .watch_for_value(SRAM + 0x500, 1, WatchTarget::Byte(0x42), options)
        .await
        .unwrap();

    // Assert
    assert_eq!(value, vec![0x42]);
}

#[tokio::test]
async fn test_watch_for_value_resolves_without_waiting_when_already_matching() {
    // Arrange
    let (engine, _device) = attached_engine().await;
    engine.write_memory(&[(SRAM + 0x510, vec![0x00])]).await.unwrap();
    let options = WatchOptions {
        timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(100),
    };

    // Act
    let started = std::time::Instant::now();
    let value = engine
        .watch_for_value(SRAM + 0x510, 1, WatchTarget::Byte(0x00), options)
        .await
        .unwrap();

    // Assert
    assert_eq!(value, vec![0x00]);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_watch_for_value_times_out() {
    let (engine, _device) = attached_engine().await;
    let options = WatchOptions {
        timeout: Duration::from_millis(150),
        poll_interval: Duration::from_millis(20),
    };

    let result = engine
        .watch_for_value(SRAM, 1, WatchTarget::Byte(0xFF), options)
        .await;

    assert!(matches!(result, Err(ContractError::Timeout { .. })));
}

#[tokio::test]
async fn test_memory_watcher_reports_wram_change_within_one_interval() {
    // Arrange: watch two WRAM regions on the SD2SNES at 100 ms
    let (engine, _device) = attached_engine().await;
    tokio_test::assert_ok!(engine.write_memory(&[(WRAM + 0x700, vec![0x5A])]).await);
    let contract: Arc<dyn OperationContract> = Arc::new(engine.clone());
    let seen: Arc<Mutex<Vec<(Instant, MemoryChange)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let interval = Duration::from_millis(100);
    let mut watcher = tokio_test::assert_ok!(contract.create_memory_watcher(
        vec![(WRAM + 0x600, 2), (WRAM + 0x700, 1)],
        interval,
        move |changes| {
            let now = Instant::now();
            let mut seen = sink.lock().unwrap();
            seen.extend(changes.iter().cloned().map(|change| (now, change)));
        },
    ));
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Act: the write goes through a CMD program
    tokio_test::assert_ok!(engine.write_memory(&[(WRAM + 0x700, vec![0x00])]).await);
    let written = Instant::now();
    for _ in 0..100 {
        if !seen.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    watcher.stop();
    let options = WatchOptions {
        timeout: Duration::from_secs(10),
        poll_interval: interval,
    };
    let matched = engine.watch_for_value(WRAM + 0x700, 1, WatchTarget::Byte(0x00), options);
    let matched = tokio_test::assert_ok!(tokio::time::timeout(interval, matched).await);

    // Assert
    let changes = seen.lock().unwrap().clone();
    assert_eq!(changes.len(), 1);
    let (at, change) = &changes[0];
    assert_eq!(change.index, 1);
    assert_eq!(change.address, WRAM + 0x700);
    assert_eq!(change.old, vec![0x5A]);
    assert_eq!(change.new, vec![0x00]);
    assert!(at.duration_since(written) <= interval * 2);
    assert!(!watcher.is_running());
    assert_eq!(tokio_test::assert_ok!(matched), vec![0x00]);
}

// ── Transport selection ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_selector_runs_the_embedded_transport() {
    // Arrange
    let device = SimulatedConnector::new(DEVICE, "1.11.0");
    let mut selector = TransportSelector::new();
    selector.register(TransportKind::Embedded, move || -> Arc<dyn OperationContract> {
        let connector = EmbeddedConnector::simulated(device.clone());
        Arc::new(ProtocolEngine::new(Arc::new(connector), test_config()))
    });

    // Act
    selector.select(TransportKind::Embedded).unwrap();
    selector.connect("embedded").await.unwrap();
    selector.attach(DEVICE).await.unwrap();
    selector.write_memory(&[(SRAM, vec![5, 6])]).await.unwrap();
    let read = selector.read_memory(SRAM, 2).await.unwrap();
    let switch = selector.select(TransportKind::Usb2Snes);

    // Assert
    assert_eq!(selector.active_kind(), Some(TransportKind::Embedded));
    assert_eq!(read, vec![5, 6]);
    assert!(matches!(switch, Err(ContractError::SwitchWhileConnected(_))));
}
