use bytes::Bytes;

use crate::{CloseCode, Connection, ConnectionId, Handler, Result};

/// Field separator of the signaling grammar.
pub const SEPARATOR: &str = "::::";

/// Relays WebRTC signaling messages between peers.
///
/// Text messages are `verb::::peer::::payload` commands. The relay keeps no state besides its
/// own id, which it substitutes for `peer` before forwarding:
///
/// | received                        | sent                                  | to           |
/// |---------------------------------|---------------------------------------|--------------|
/// | `join`                          | `add_peer::::<self>`                  | everyone else|
/// | `<verb>::::<peer>`              | `remove_peer::::<self>`               | `peer`       |
/// | `offer::::<peer>::::<sdp>`      | `get_offer::::<self>::::<sdp>`        | `peer`       |
/// | `answer::::<peer>::::<sdp>`     | `get_answer::::<self>::::<sdp>`       | `peer`       |
/// | `candidate::::<peer>::::<ice>`  | `candidate::::<self>::::<ice>`        | `peer`       |
///
/// When the peer closes, `remove_peer::::<self>` goes to everyone else. Anything else is logged
/// and dropped.
#[derive(Debug, Clone)]
pub struct SignalingRelay {
    id: ConnectionId,
    add_peer: String,
    remove_peer: String,
}

impl SignalingRelay {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            add_peer: format!("add_peer{SEPARATOR}{id}"),
            remove_peer: format!("remove_peer{SEPARATOR}{id}"),
        }
    }
}

impl Handler for SignalingRelay {
    async fn on_text(&mut self, conn: &Connection, text: String) -> Result<()> {
        let registry = conn.registry();

        // The payload is the last field and may itself contain the separator.
        let mut fields = text.splitn(3, SEPARATOR);
        let verb = fields.next().unwrap_or_default();

        if verb == "join" {
            let notified = registry.broadcast_except(self.id, self.add_peer.as_str()).await;
            log::info!("{}: joined, {} peers notified", self.id, notified);
            return Ok(());
        }

        let Some(peer) = fields.next() else {
            log::debug!("{}: ignoring '{}'", self.id, verb);
            return Ok(());
        };
        let peer: ConnectionId = match peer.parse() {
            Ok(peer) => peer,
            Err(err) => {
                log::warn!("{}: bad peer id '{}': {}", self.id, peer, err);
                return Ok(());
            }
        };

        let message = match (verb, fields.next()) {
            (_, None) => self.remove_peer.clone(),
            ("offer", Some(payload)) => forward("get_offer", self.id, payload),
            ("answer", Some(payload)) => forward("get_answer", self.id, payload),
            ("candidate", Some(payload)) => forward("candidate", self.id, payload),
            (verb, Some(_)) => {
                log::warn!("{}: unknown event '{}'", self.id, verb);
                return Ok(());
            }
        };

        if !registry.send_to(peer, message).await {
            log::debug!("{}: peer {} is gone", self.id, peer);
        }
        Ok(())
    }

    async fn on_close(
        &mut self,
        conn: &Connection,
        _code: Option<CloseCode>,
        _payload: Bytes,
    ) -> Result<()> {
        conn.registry()
            .broadcast_except(self.id, self.remove_peer.as_str())
            .await;
        log::info!("{}: disconnected", self.id);
        Ok(())
    }
}

fn forward(verb: &str, from: ConnectionId, payload: &str) -> String {
    format!("{verb}{SEPARATOR}{from}{SEPARATOR}{payload}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_util::CaptureWriter, OpCode, Registry};
    use std::sync::Arc;

    struct Peers {
        registry: Registry,
        conns: Vec<Arc<Connection>>,
        writers: Vec<CaptureWriter>,
    }

    impl Peers {
        fn new(count: u128) -> Self {
            let registry = Registry::new();
            let mut conns = Vec::new();
            let mut writers = Vec::new();
            for n in 1..=count {
                let writer = CaptureWriter::default();
                let conn = Arc::new(Connection::new(
                    ConnectionId::from_u128(n),
                    writer.clone(),
                    registry.clone(),
                ));
                registry.register(conn.clone());
                conns.push(conn);
                writers.push(writer);
            }
            Self {
                registry,
                conns,
                writers,
            }
        }

        async fn say(&self, from: usize, text: &str) {
            let conn = &self.conns[from];
            SignalingRelay::new(conn.id())
                .on_text(conn, text.to_owned())
                .await
                .unwrap();
        }

        fn received(&self, who: usize) -> Vec<String> {
            self.writers[who]
                .frames()
                .iter()
                .filter(|f| f.opcode == OpCode::Text)
                .map(|f| String::from_utf8(f.payload.to_vec()).unwrap())
                .collect()
        }

        fn id(&self, who: usize) -> ConnectionId {
            self.conns[who].id()
        }
    }

    #[tokio::test]
    async fn test_join_announces_to_others() {
        let peers = Peers::new(3);
        peers.say(0, "join").await;

        let expected = format!("add_peer::::{}", peers.id(0));
        assert!(peers.received(0).is_empty());
        assert_eq!(peers.received(1), vec![expected.clone()]);
        assert_eq!(peers.received(2), vec![expected]);
    }

    #[tokio::test]
    async fn test_offer_is_readdressed() {
        let peers = Peers::new(3);
        peers
            .say(0, &format!("offer::::{}::::v=0 o=- 1 2 IN IP4 0.0.0.0", peers.id(1)))
            .await;

        assert_eq!(
            peers.received(1),
            vec![format!("get_offer::::{}::::v=0 o=- 1 2 IN IP4 0.0.0.0", peers.id(0))]
        );
        assert!(peers.received(2).is_empty());
    }

    #[tokio::test]
    async fn test_answer_and_candidate() {
        let peers = Peers::new(2);
        peers
            .say(1, &format!("answer::::{}::::sdp", peers.id(0)))
            .await;
        peers
            .say(1, &format!("candidate::::{}::::ice", peers.id(0)))
            .await;

        assert_eq!(
            peers.received(0),
            vec![
                format!("get_answer::::{}::::sdp", peers.id(1)),
                format!("candidate::::{}::::ice", peers.id(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_payload_keeps_separators() {
        let peers = Peers::new(2);
        peers
            .say(0, &format!("candidate::::{}::::a::::b", peers.id(1)))
            .await;

        assert_eq!(
            peers.received(1),
            vec![format!("candidate::::{}::::a::::b", peers.id(0))]
        );
    }

    #[tokio::test]
    async fn test_two_fields_remove_peer() {
        let peers = Peers::new(2);
        peers.say(0, &format!("leave::::{}", peers.id(1))).await;

        assert_eq!(
            peers.received(1),
            vec![format!("remove_peer::::{}", peers.id(0))]
        );
    }

    #[tokio::test]
    async fn test_malformed_commands_are_ignored() {
        let peers = Peers::new(2);
        peers.say(0, "hello").await;
        peers.say(0, "offer::::not-a-uuid::::sdp").await;
        peers
            .say(0, &format!("bogus::::{}::::data", peers.id(1)))
            .await;
        peers
            .say(0, &format!("offer::::{}::::sdp", ConnectionId::from_u128(99)))
            .await;

        assert!(peers.received(0).is_empty());
        assert!(peers.received(1).is_empty());
    }

    #[tokio::test]
    async fn test_close_announces_removal() {
        let peers = Peers::new(3);
        let conn = &peers.conns[2];
        SignalingRelay::new(conn.id())
            .on_close(conn, Some(CloseCode::Normal), Bytes::new())
            .await
            .unwrap();

        let expected = format!("remove_peer::::{}", peers.id(2));
        assert_eq!(peers.received(0), vec![expected.clone()]);
        assert_eq!(peers.received(1), vec![expected]);
        assert!(peers.received(2).is_empty());
        assert_eq!(peers.registry.len(), 3);
    }
}
