//! Memory reads and writes, IPS patches, and savestates.

use std::time::Duration;

use snes_core::domain::address::{assemble_wram_writes, is_wram, WRAM_SIZE, WRAM_START};
use snes_core::domain::device::{SAVESTATE_DATA_ADDRESS, SAVESTATE_SIZE};
use snes_core::protocol::hex_operand;
use snes_core::{ContractError, FirmwareGeneration, Opcode, Operation, Space, WireRequest};
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::{EngineInner, Expect, Wire};

/// Savestate control flags are polled this often.
const SAVESTATE_POLL: Duration = Duration::from_millis(30);
/// Pause between triggering a savestate and polling for completion.
const SAVESTATE_SETTLE: Duration = Duration::from_millis(100);

impl EngineInner {
    pub(crate) async fn read_memory_batch(
        &self,
        regions: &[(u32, u32)],
    ) -> Result<Vec<Vec<u8>>, ContractError> {
        self.gate(Operation::ReadMemory)?;

        // Zero-sized regions are answered locally; the rest go out in one request.
        let requested: Vec<(u32, u32)> = regions.iter().copied().filter(|&(_, size)| size > 0).collect();
        let total: usize = requested.iter().map(|&(_, size)| size as usize).sum();
        if requested.is_empty() {
            return Ok(vec![Vec::new(); regions.len()]);
        }

        let mut wire = self.wire.lock().await;
        let request = WireRequest::new(Opcode::GetAddress)
            .with_space(Space::Snes)
            .with_address_pairs(&requested);
        let data = self
            .exchange(&mut wire, Operation::ReadMemory, request, &[], Expect::Binary(total))
            .await?
            .into_data()?
            .into_bytes()?;
        drop(wire);

        let mut offset = 0;
        Ok(regions
            .iter()
            .map(|&(_, size)| {
                let end = offset + size as usize;
                let slice = data[offset..end].to_vec();
                offset = end;
                slice
            })
            .collect())
    }

    pub(crate) async fn write_memory(&self, writes: &[(u32, Vec<u8>)]) -> Result<(), ContractError> {
        self.gate(Operation::WriteMemory)?;
        let mut wire = self.wire.lock().await;
        self.write_locked(&mut wire, writes).await
    }

    /// Routes WRAM writes on SD2SNES-class devices through CMD programs and
    /// everything else straight to SNES space.
    async fn write_locked(&self, wire: &mut Wire, writes: &[(u32, Vec<u8>)]) -> Result<(), ContractError> {
        let mut via_cmd = Vec::new();
        let mut direct = Vec::new();
        for (address, data) in writes.iter().filter(|(_, data)| !data.is_empty()) {
            let starts_in_wram = (WRAM_START..WRAM_START + WRAM_SIZE).contains(address);
            if wire.sd2snes && starts_in_wram {
                if !is_wram(*address, data.len()) {
                    return Err(ContractError::InvalidArgument(format!(
                        "write of {} bytes at {address:#08x} runs past the end of WRAM",
                        data.len()
                    )));
                }
                via_cmd.push((*address, data.clone()));
            } else {
                direct.push((*address, data));
            }
        }

        if !via_cmd.is_empty() {
            let programs = assemble_wram_writes(&via_cmd)
                .map_err(|e| ContractError::InvalidArgument(e.to_string()))?;
            debug!("writing {} WRAM regions via {} CMD programs", via_cmd.len(), programs.len());
            for program in programs {
                let request = WireRequest::new(Opcode::PutAddress)
                    .with_space(Space::Cmd)
                    .with_operands(program.operands());
                self.exchange(wire, Operation::WriteMemory, request, &program.code, Expect::Nothing)
                    .await?
                    .into_ack()?;
            }
        }

        for (address, data) in direct {
            let request = WireRequest::new(Opcode::PutAddress)
                .with_space(Space::Snes)
                .with_operands([hex_operand(address), hex_operand(data.len() as u32)]);
            self.exchange(wire, Operation::WriteMemory, request, data, Expect::Nothing)
                .await?
                .into_ack()?;
        }
        Ok(())
    }

    pub(crate) async fn apply_patch(&self, patch: &[u8]) -> Result<(), ContractError> {
        self.gate(Operation::ApplyPatch)?;
        if patch.is_empty() {
            return Err(ContractError::InvalidArgument("empty IPS patch".into()));
        }
        let mut wire = self.wire.lock().await;
        let request = WireRequest::new(Opcode::PutIps)
            .with_space(Space::Snes)
            .with_operands(["hook".to_string(), hex_operand(patch.len() as u32)]);
        self.exchange(&mut wire, Operation::ApplyPatch, request, patch, Expect::Nothing)
            .await?
            .into_ack()
    }

    // ── Savestate ────────────────────────────────────────────────────────────

    /// Generation captured at the last `Info`, fetching it if unknown.
    async fn firmware_generation(&self) -> Result<FirmwareGeneration, ContractError> {
        let mut wire = self.wire.lock().await;
        match wire.generation {
            Some(generation) => Ok(generation),
            None => Ok(self.info_locked(&mut wire).await?.generation()),
        }
    }

    /// Polls the two control bytes at `interface` until both are clear.
    async fn wait_until_idle(
        &self,
        interface: u32,
        operation: Operation,
        limit: Duration,
    ) -> Result<(), ContractError> {
        let deadline = Instant::now() + limit;
        loop {
            let flags = self.read_memory_batch(&[(interface, 2)]).await?;
            if flags.iter().flatten().all(|&b| b == 0) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ContractError::Timeout {
                    operation,
                    after: limit,
                });
            }
            sleep(SAVESTATE_POLL).await;
        }
    }

    pub(crate) async fn save_state(&self) -> Result<Vec<u8>, ContractError> {
        self.gate(Operation::SaveState)?;
        let interface = self.firmware_generation().await?.savestate_interface();

        self.wait_until_idle(interface, Operation::SaveState, self.config.savestate_wait)
            .await?;
        self.write_memory(&[(interface, vec![1, 0])]).await?;
        sleep(SAVESTATE_SETTLE).await;
        self.wait_until_idle(interface, Operation::SaveState, self.config.savestate_settle_wait)
            .await?;

        let mut state = self
            .read_memory_batch(&[(SAVESTATE_DATA_ADDRESS, SAVESTATE_SIZE as u32)])
            .await?;
        state
            .pop()
            .ok_or_else(|| ContractError::Protocol("empty savestate read".into()))
    }

    pub(crate) async fn load_state(&self, data: &[u8]) -> Result<(), ContractError> {
        self.gate(Operation::LoadState)?;
        if data.len() != SAVESTATE_SIZE {
            return Err(ContractError::SizeMismatch {
                expected: SAVESTATE_SIZE as u64,
                actual: data.len() as u64,
            });
        }
        let interface = self.firmware_generation().await?.savestate_interface();

        self.wait_until_idle(interface, Operation::LoadState, self.config.savestate_wait)
            .await?;
        self.write_memory(&[(SAVESTATE_DATA_ADDRESS, data.to_vec())]).await?;
        self.write_memory(&[(interface + 1, vec![1])]).await?;
        sleep(SAVESTATE_SETTLE).await;
        self.wait_until_idle(interface, Operation::LoadState, self.config.savestate_settle_wait)
            .await
    }
}
