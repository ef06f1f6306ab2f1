//! Session loop: frames in, frames out, strictly in request order.

use std::sync::Arc;

use anyhow::Context;
use snes_core::protocol::hex_operand;
use snes_core::{Frame, FrameTransport, OperationOutcome, WireReply, WireRequest};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::dispatch::{Reply, Session, SessionError};
use crate::infrastructure::pool::DevicePool;

/// Largest binary frame the server sends.
pub const REPLY_CHUNK_SIZE: usize = 1024;

/// Entry point of each per-session task; logs how the session ended.
pub async fn handle_session(transport: Box<dyn FrameTransport>, pool: Arc<DevicePool>) {
    let id = Uuid::new_v4();
    match run_session(transport, pool, id).await {
        Ok(()) => info!("session {id} closed normally"),
        Err(e) => warn!("session {id} closed with error: {e:#}"),
    }
}

/// Serves requests until the client disconnects or a request fails.
///
/// # Errors
///
/// Returns the failure that ended the session; the transport is closed
/// either way.
pub async fn run_session(
    mut transport: Box<dyn FrameTransport>,
    pool: Arc<DevicePool>,
    id: Uuid,
) -> anyhow::Result<()> {
    let mut session = Session::new(id, pool);
    let result = serve(&mut session, transport.as_mut()).await;
    transport.close().await;
    result
}

async fn serve(session: &mut Session, transport: &mut dyn FrameTransport) -> anyhow::Result<()> {
    while let Some(frame) = transport.recv().await {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(_) => return Err(SessionError::UnexpectedBinary.into()),
        };
        let request = WireRequest::from_json(&text)
            .map_err(SessionError::from)
            .with_context(|| format!("session {}: bad request {text:?}", session.id()))?;
        debug!("session {}: {:?} {:?}", session.id(), request.opcode, request.operands);

        let payload = if request.opcode.carries_payload() {
            let expected = Session::payload_len(&request)?;
            collect_payload(transport, expected).await?
        } else {
            Vec::new()
        };

        let outcome = session
            .dispatch(&request, payload)
            .await
            .with_context(|| format!("session {}: {:?} failed", session.id(), request.opcode))?;
        match outcome {
            OperationOutcome::Acknowledged => {}
            OperationOutcome::Result(reply) => send_reply(transport, reply).await?,
            OperationOutcome::ConnectionClosed => {
                info!("session {}: closing after {:?}", session.id(), request.opcode);
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Reads binary frames until exactly `expected` bytes have arrived.
///
/// The buffer grows with the data actually received, never with the size
/// the client declared.
async fn collect_payload(transport: &mut dyn FrameTransport, expected: usize) -> Result<Vec<u8>, SessionError> {
    let mut payload = Vec::new();
    while payload.len() < expected {
        match transport.recv().await {
            Some(Frame::Binary(data)) => payload.extend_from_slice(&data),
            Some(Frame::Text(_)) => return Err(SessionError::UnexpectedText),
            None => return Err(SessionError::PeerClosed),
        }
    }
    if payload.len() > expected {
        return Err(SessionError::PayloadOverflow {
            expected,
            received: payload.len(),
        });
    }
    Ok(payload)
}

async fn send_reply(transport: &mut dyn FrameTransport, reply: Reply) -> anyhow::Result<()> {
    let data = match reply {
        Reply::Results(results) => {
            transport.send(Frame::Text(WireReply::new(results).to_json()?)).await?;
            return Ok(());
        }
        Reply::Binary(data) => data,
        Reply::SizedBinary(data) => {
            let size = WireReply::new([hex_operand(data.len() as u32)]);
            transport.send(Frame::Text(size.to_json()?)).await?;
            data
        }
    };
    for chunk in data.chunks(REPLY_CHUNK_SIZE) {
        transport.send(Frame::Binary(chunk.to_vec())).await?;
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use snes_core::transport::ChannelTransport;
    use snes_core::Opcode;

    use crate::infrastructure::device::SimulatedConnector;

    fn spawn_session() -> (ChannelTransport, SimulatedConnector) {
        let connector = SimulatedConnector::new("SD2SNES SIM", "1.11.0");
        let pool = DevicePool::new(Arc::new(connector.clone()));
        let (client, server) = ChannelTransport::pair();
        tokio::spawn(handle_session(Box::new(server), pool));
        (client, connector)
    }

    async fn send(client: &mut ChannelTransport, request: WireRequest) {
        client.send(Frame::Text(request.to_json().unwrap())).await.unwrap();
    }

    #[tokio::test]
    async fn test_large_reads_are_split_into_chunks() {
        // Arrange
        let (mut client, _) = spawn_session();
        send(&mut client, WireRequest::new(Opcode::Attach).with_operands(["SD2SNES SIM"])).await;

        // Act
        send(&mut client, WireRequest::new(Opcode::GetAddress).with_address_pairs(&[(0, 2500)])).await;

        // Assert
        let mut sizes = Vec::new();
        while sizes.iter().sum::<usize>() < 2500 {
            match client.recv().await {
                Some(Frame::Binary(data)) => sizes.push(data.len()),
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert_eq!(sizes, vec![1024, 1024, 452]);
    }

    #[tokio::test]
    async fn test_payload_split_across_frames_is_reassembled() {
        // Arrange
        let (mut client, connector) = spawn_session();
        send(&mut client, WireRequest::new(Opcode::Attach).with_operands(["SD2SNES SIM"])).await;

        // Act
        send(&mut client, WireRequest::new(Opcode::PutAddress).with_address_pairs(&[(0xE00000, 4)])).await;
        client.send(Frame::Binary(vec![1, 2])).await.unwrap();
        client.send(Frame::Binary(vec![3, 4])).await.unwrap();
        send(&mut client, WireRequest::new(Opcode::GetAddress).with_address_pairs(&[(0xE00000, 4)])).await;

        // Assert
        assert_eq!(client.recv().await, Some(Frame::Binary(vec![1, 2, 3, 4])));
        drop(connector);
    }

    #[tokio::test]
    async fn test_failed_request_closes_the_session() {
        // Arrange
        let (mut client, _) = spawn_session();
        send(&mut client, WireRequest::new(Opcode::Attach).with_operands(["SD2SNES SIM"])).await;
        let mkdir = WireRequest::new(Opcode::MakeDir).with_operands(["/dup"]);

        // Act
        send(&mut client, mkdir.clone()).await;
        send(&mut client, mkdir).await;

        // Assert
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn test_oversized_payload_ends_only_that_session() {
        // Arrange: two sessions on one pool
        let connector = SimulatedConnector::new("SD2SNES SIM", "1.11.0");
        let pool = DevicePool::new(Arc::new(connector.clone()));
        let (mut greedy, server) = ChannelTransport::pair();
        tokio::spawn(handle_session(Box::new(server), Arc::clone(&pool)));
        let (mut other, server) = ChannelTransport::pair();
        tokio::spawn(handle_session(Box::new(server), pool));
        send(&mut greedy, WireRequest::new(Opcode::Attach).with_operands(["SD2SNES SIM"])).await;
        let pairs: Vec<(u32, u32)> = (0..4000).map(|i| (i, u32::MAX)).collect();

        // Act
        send(&mut greedy, WireRequest::new(Opcode::PutAddress).with_address_pairs(&pairs)).await;
        send(&mut other, WireRequest::new(Opcode::DeviceList)).await;

        // Assert
        assert_eq!(greedy.recv().await, None);
        match other.recv().await {
            Some(Frame::Text(text)) => {
                assert_eq!(WireReply::from_json(&text).unwrap().results, vec!["SD2SNES SIM"]);
            }
            frame => panic!("unexpected frame {frame:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_read_closes_the_session() {
        let (mut client, _) = spawn_session();
        send(&mut client, WireRequest::new(Opcode::Attach).with_operands(["SD2SNES SIM"])).await;

        send(
            &mut client,
            WireRequest::new(Opcode::GetAddress).with_address_pairs(&[(0, u32::MAX), (0, u32::MAX)]),
        )
        .await;

        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn test_session_close_releases_the_device() {
        let (mut client, connector) = spawn_session();
        send(&mut client, WireRequest::new(Opcode::Attach).with_operands(["SD2SNES SIM"])).await;
        send(&mut client, WireRequest::new(Opcode::Info)).await;
        assert!(matches!(client.recv().await, Some(Frame::Text(_))));
        assert_eq!(connector.open_links(), 1);

        client.close().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(connector.open_links(), 0);
    }
}
