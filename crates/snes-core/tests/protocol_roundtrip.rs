//! Integration tests for the snes-core protocol layer.
//!
//! These exercise the public API the way the server's device handler and
//! the client engine use it together: wire envelopes in, device packets out,
//! and device replies back into wire results.

use snes_core::domain::address::{assemble_wram_writes, bus_to_wram, interpret_cmd_program};
use snes_core::domain::device::DirEntry;
use snes_core::protocol::listing::{decode_listing, encode_listing, entries_to_results, results_to_entries};
use snes_core::protocol::packet::{decode_info, encode_info, DeviceCommand, DeviceSpace};
use snes_core::{DeviceInfo, Opcode, Space, WireReply, WireRequest};

#[test]
fn test_get_address_request_maps_to_device_get_packets() {
    // Arrange
    let json = r#"{"Opcode":"GetAddress","Space":"SNES","Flags":null,"Operands":["F50010","2","E00000","10"]}"#;

    // Act
    let req = WireRequest::from_json(json).unwrap();
    let packets: Vec<[u8; 512]> = req
        .address_pairs()
        .unwrap()
        .into_iter()
        .map(|(address, size)| {
            DeviceCommand::Get {
                space: DeviceSpace::from(req.space),
                address,
                size,
            }
            .encode()
            .unwrap()
        })
        .collect();

    // Assert
    assert_eq!(req.opcode, Opcode::GetAddress);
    assert_eq!(packets.len(), 2);
    assert_eq!(&packets[0][256..260], &[0x00, 0xF5, 0x00, 0x10]);
    assert_eq!(&packets[1][252..256], &[0x00, 0x00, 0x00, 0x10]);
}

#[test]
fn test_device_listing_becomes_wire_results_and_back() {
    let entries = vec![
        DirEntry::directory("."),
        DirEntry::directory(".."),
        DirEntry::directory("saves"),
        DirEntry::file("smw.sfc"),
    ];
    let progress = decode_listing(&encode_listing(&entries)).unwrap();
    let reply = WireReply::new(entries_to_results(&progress.entries));
    let parsed = WireReply::from_json(&reply.to_json().unwrap()).unwrap();

    assert_eq!(
        results_to_entries(&parsed.results).unwrap(),
        vec![DirEntry::directory("saves"), DirEntry::file("smw.sfc")]
    );
}

#[test]
fn test_info_packet_becomes_wire_results() {
    let packet = encode_info("/roms/smw.sfc", 0, "1.11.0", 0b1000_0000);
    let info = decode_info(&packet).unwrap();
    let results = info.to_results();

    assert_eq!(results, vec!["1.11.0", "", "/roms/smw.sfc", "FEAT_DMA1"]);
    assert_eq!(DeviceInfo::from_results(&results), info);
}

#[test]
fn test_cmd_program_request_writes_expected_wram() {
    // Arrange: what the client puts on the wire for a WRAM write
    let writes = vec![(0xF50019u32, vec![0x00, 0x7F])];
    let program = assemble_wram_writes(&writes).unwrap().remove(0);
    let req = WireRequest::new(Opcode::PutAddress)
        .with_space(Space::Cmd)
        .with_operands(program.operands());

    // Act: replay the two puts in order against a CMD buffer
    let pairs = req.address_pairs().unwrap();
    let mut buffer = vec![0u8; 0x400];
    let mut offset = 0;
    for (address, size) in pairs {
        let start = (address - 0x2C00) as usize;
        let size = size as usize;
        buffer[start..start + size].copy_from_slice(&program.code[offset..offset + size]);
        offset += size;
    }
    let body_len = program.code.len() - 1;
    let stores = interpret_cmd_program(&buffer[..body_len]).unwrap();

    // Assert
    let wram: Vec<(u32, u8)> = stores
        .into_iter()
        .filter_map(|(bus, byte)| bus_to_wram(bus).map(|a| (a, byte)))
        .collect();
    assert_eq!(wram, vec![(0xF50019, 0x00), (0xF5001A, 0x7F)]);
}
