use std::fmt::Write as _;

use bytes::Bytes;

use crate::{CloseCode, Connection, ConnectionId, Handler, Result};

/// Logs every event and relays each text message to all other connections.
#[derive(Debug, Clone)]
pub struct BroadcastLogger {
    id: ConnectionId,
}

impl BroadcastLogger {
    pub fn new(id: ConnectionId) -> Self {
        Self { id }
    }
}

impl Handler for BroadcastLogger {
    async fn on_text(&mut self, conn: &Connection, text: String) -> Result<()> {
        log::info!("{}: {}", self.id, text);
        let delivered = conn.registry().broadcast_except(self.id, text).await;
        log::debug!("{}: relayed to {} peers", self.id, delivered);
        Ok(())
    }

    async fn on_binary(&mut self, _conn: &Connection, data: Bytes) -> Result<()> {
        log::info!("{}: {}", self.id, hex(&data));
        Ok(())
    }

    async fn on_close(
        &mut self,
        _conn: &Connection,
        code: Option<CloseCode>,
        _payload: Bytes,
    ) -> Result<()> {
        log::info!("{}: closed by peer ({:?})", self.id, code);
        Ok(())
    }

    async fn on_ping(&mut self, _conn: &Connection) -> Result<()> {
        log::info!("{}: ping", self.id);
        Ok(())
    }

    async fn on_pong(&mut self, _conn: &Connection) -> Result<()> {
        log::info!("{}: pong", self.id);
        Ok(())
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().fold(String::with_capacity(data.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}
