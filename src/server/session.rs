//! Per-session frame handling on the receiving side

use bytes::BytesMut;
use tracing::{debug, trace, warn};

use super::Server;
use crate::message::Message;
use crate::postoffice::RouteResult;
use crate::protocol::{Frame, ProtocolError, WireMessage, BRIDGE_PROTOCOL_VERSION};

/// What the transport should do after a frame was handled
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send this frame back to the peer
    Reply(Frame),
    /// Nothing to send
    Ignore,
    /// Peer closed the session
    Close,
}

/// Large message being reassembled
struct LargeMessage {
    message: WireMessage,
    body_size: u64,
    body: BytesMut,
}

/// State of one inbound bridge session
pub struct ServerSession {
    id: u64,
    producer_created: bool,
    large: Option<LargeMessage>,
    routed: u64,
    duplicates: u64,
}

impl ServerSession {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            producer_created: false,
            large: None,
            routed: 0,
            duplicates: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Messages routed through this session
    pub fn routed(&self) -> u64 {
        self.routed
    }

    /// Messages rejected as duplicates
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Handle one inbound frame
    pub fn handle(&mut self, server: &Server, frame: Frame) -> Result<Action, ProtocolError> {
        if !server.intercept(&frame) {
            trace!(
                "Server '{}': session {} interceptor dropped {}",
                server.name(),
                self.id,
                frame.type_name()
            );
            return Ok(Action::Ignore);
        }

        match frame {
            Frame::CreateProducer { version } => {
                if version != BRIDGE_PROTOCOL_VERSION {
                    return Err(ProtocolError::VersionMismatch(version));
                }
                self.producer_created = true;
                debug!("Server '{}': session {} producer created", server.name(), self.id);
                Ok(Action::Reply(Frame::ProducerCreated {
                    version: BRIDGE_PROTOCOL_VERSION,
                }))
            }
            Frame::Send {
                sequence_id,
                message,
            } => {
                self.require_producer()?;
                self.route(server, message);
                Ok(Action::Reply(Frame::Confirm { sequence_id }))
            }
            Frame::SendLarge {
                sequence_id,
                message,
                body_size,
            } => {
                self.require_producer()?;
                if self.large.is_some() {
                    warn!(
                        "Server '{}': session {} abandoning incomplete large message",
                        server.name(),
                        self.id
                    );
                }
                self.large = Some(LargeMessage {
                    message,
                    body_size,
                    body: BytesMut::with_capacity(body_size.min(16 * 1024 * 1024) as usize),
                });
                Ok(Action::Reply(Frame::Confirm { sequence_id }))
            }
            Frame::Continuation {
                sequence_id,
                chunk,
                last,
            } => {
                self.require_producer()?;
                let Some(large) = self.large.as_mut() else {
                    // Header was lost; leave it unconfirmed so the sender resends
                    warn!(
                        "Server '{}': session {} continuation {} without a large message",
                        server.name(),
                        self.id,
                        sequence_id
                    );
                    return Ok(Action::Ignore);
                };
                large.body.extend_from_slice(&chunk);
                if large.body.len() as u64 > large.body_size {
                    self.large = None;
                    return Err(ProtocolError::Unexpected("large message body overflow"));
                }
                if last {
                    if let Some(large) = self.large.take() {
                        if large.body.len() as u64 != large.body_size {
                            return Err(ProtocolError::Unexpected("large message body truncated"));
                        }
                        let mut message = large.message.into_message();
                        message.body = large.body.freeze();
                        self.route_message(server, message);
                    }
                }
                Ok(Action::Reply(Frame::Confirm { sequence_id }))
            }
            Frame::Close => Ok(Action::Close),
            Frame::ProducerCreated { .. } => Err(ProtocolError::Unexpected("ProducerCreated")),
            Frame::Confirm { .. } => Err(ProtocolError::Unexpected("Confirm")),
        }
    }

    fn require_producer(&self) -> Result<(), ProtocolError> {
        if self.producer_created {
            Ok(())
        } else {
            Err(ProtocolError::Unexpected("message before CreateProducer"))
        }
    }

    fn route(&mut self, server: &Server, message: WireMessage) {
        self.route_message(server, message.into_message());
    }

    /// Routed messages get a fresh local id; a bridge downstream of this node
    /// fingerprints them with it
    fn route_message(&mut self, server: &Server, mut message: Message) {
        message.id = server.post_office().next_message_id();
        match server.post_office().route(message) {
            RouteResult::Routed(_) | RouteResult::NoBinding => self.routed += 1,
            RouteResult::DuplicateRejected => self.duplicates += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::postoffice::PostOffice;

    fn server() -> Arc<Server> {
        let po = Arc::new(PostOffice::default());
        po.create_queue("q", "addr").unwrap();
        Server::new("test", po)
    }

    fn open(server: &Server, session: &mut ServerSession) {
        let action = session
            .handle(server, Frame::CreateProducer { version: BRIDGE_PROTOCOL_VERSION })
            .unwrap();
        assert_eq!(
            action,
            Action::Reply(Frame::ProducerCreated { version: BRIDGE_PROTOCOL_VERSION })
        );
    }

    #[test]
    fn test_send_is_routed_and_confirmed() {
        let server = server();
        let mut session = ServerSession::new(1);
        open(&server, &mut session);
        let msg = Message::new(1, "addr", Bytes::from_static(b"hi"));
        let action = session
            .handle(&server, Frame::Send { sequence_id: 5, message: WireMessage::from(&msg) })
            .unwrap();
        assert_eq!(action, Action::Reply(Frame::Confirm { sequence_id: 5 }));
        assert_eq!(server.post_office().queue("q").unwrap().message_count(), 1);
    }

    #[test]
    fn test_send_before_producer_is_rejected() {
        let server = server();
        let mut session = ServerSession::new(1);
        let msg = Message::new(1, "addr", Bytes::new());
        assert!(session
            .handle(&server, Frame::Send { sequence_id: 0, message: WireMessage::from(&msg) })
            .is_err());
    }

    #[test]
    fn test_version_mismatch() {
        let server = server();
        let mut session = ServerSession::new(1);
        assert!(matches!(
            session.handle(&server, Frame::CreateProducer { version: 99 }),
            Err(ProtocolError::VersionMismatch(99))
        ));
    }

    #[test]
    fn test_large_message_reassembly() {
        let server = server();
        let mut session = ServerSession::new(1);
        open(&server, &mut session);

        let body: Vec<u8> = (0..250u32).map(|i| i as u8).collect();
        let msg = Message::new(1, "addr", Bytes::from(body.clone()));
        session
            .handle(
                &server,
                Frame::SendLarge {
                    sequence_id: 1,
                    message: WireMessage::with_body(&msg, Vec::new()),
                    body_size: 250,
                },
            )
            .unwrap();
        for (i, chunk) in body.chunks(100).enumerate() {
            let action = session
                .handle(
                    &server,
                    Frame::Continuation {
                        sequence_id: 2 + i as u64,
                        chunk: chunk.to_vec(),
                        last: i == 2,
                    },
                )
                .unwrap();
            assert_eq!(action, Action::Reply(Frame::Confirm { sequence_id: 2 + i as u64 }));
        }

        let queue = server.post_office().queue("q").unwrap();
        let stored = queue.browse();
        assert_eq!(stored.len(), 1);
        assert_eq!(&stored[0].body[..], &body[..]);
    }

    #[test]
    fn test_orphan_continuation_is_not_confirmed() {
        let server = server();
        let mut session = ServerSession::new(1);
        open(&server, &mut session);
        let action = session
            .handle(
                &server,
                Frame::Continuation { sequence_id: 3, chunk: vec![1], last: true },
            )
            .unwrap();
        assert_eq!(action, Action::Ignore);
    }

    #[test]
    fn test_close() {
        let server = server();
        let mut session = ServerSession::new(1);
        assert_eq!(session.handle(&server, Frame::Close).unwrap(), Action::Close);
    }
}
