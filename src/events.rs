//! Realtime event vocabulary and router.
//!
//! Inbound and outbound events are closed tagged enums; the router interprets
//! one inbound event at a time against the storage and presence layers and
//! pushes outbound events through connection handles. It knows nothing about
//! the transport, which keeps the whole dispatch path testable with plain
//! channels.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::logging;
use crate::plog;
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::storage::{Storage, StorageError};

/// Client-supplied message payload. `temp_id` is an optional client-side
/// identifier echoed back in the acknowledgment so the client can reconcile
/// an optimistic message with its durable id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

/// Events a client may send over the realtime connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Bind this connection to a user identity.
    UserConnected { user_id: String },
    PrivateMessage {
        recipient_id: String,
        message: MessageEnvelope,
    },
    JoinGroup { group_id: String },
    LeaveGroup { group_id: String },
    GroupMessage {
        group_id: String,
        message: MessageEnvelope,
    },
    Typing {
        recipient_id: String,
        is_typing: bool,
    },
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// A direct message addressed to this connection's user.
    ReceiveMessage {
        message_id: String,
        conversation_id: String,
        sender_id: String,
        content: String,
        created_at: u64,
    },
    /// Acknowledgment to the originator: success for a private message,
    /// failure for either message kind.
    MessageSent {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A message broadcast to a group scope.
    ReceiveGroupMessage {
        message_id: String,
        group_id: String,
        sender_id: String,
        content: String,
        created_at: u64,
    },
    /// Typing-state relay. Best effort, never persisted.
    UserTyping {
        from_user_id: String,
        is_typing: bool,
    },
}

impl ServerEvent {
    fn ack_ok(message_id: String, temp_id: Option<String>) -> Self {
        ServerEvent::MessageSent {
            success: true,
            message_id: Some(message_id),
            temp_id,
            error: None,
        }
    }

    fn ack_err(temp_id: Option<String>, error: String) -> Self {
        ServerEvent::MessageSent {
            success: false,
            message_id: None,
            temp_id,
            error: Some(error),
        }
    }
}

/// Per-process event router shared by every realtime connection.
#[derive(Clone)]
pub struct EventRouter {
    storage: Arc<Mutex<Storage>>,
    presence: PresenceRegistry,
}

impl EventRouter {
    pub fn new(storage: Arc<Mutex<Storage>>, presence: PresenceRegistry) -> Self {
        Self { storage, presence }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Handle one inbound event for one connection. `user` is the identity
    /// bound to this connection so far; `UserConnected` sets it. Failures are
    /// reported back over the same connection as acknowledgment events, never
    /// as a transport error.
    pub async fn dispatch(
        &self,
        conn: &ConnectionHandle,
        user: &mut Option<String>,
        event: ClientEvent,
    ) {
        match event {
            ClientEvent::UserConnected { user_id } => {
                self.presence.register(&user_id, conn.clone());
                *user = Some(user_id.clone());
                let storage = self.storage.lock().await;
                if let Err(e) = storage.set_online(&user_id, true) {
                    plog!("ws: failed to mark {} online: {e}", logging::user_id(&user_id));
                }
                plog!(
                    "ws: {} identified ({} online)",
                    logging::user_id(&user_id),
                    self.presence.online_count()
                );
            }
            ClientEvent::PrivateMessage {
                recipient_id,
                message,
            } => {
                let sender_id = match user {
                    Some(id) => id.clone(),
                    None => {
                        conn.send(ServerEvent::ack_err(
                            message.temp_id,
                            "connection not identified".to_string(),
                        ));
                        return;
                    }
                };
                let persisted = {
                    let storage = self.storage.lock().await;
                    self.persist_direct(&storage, &sender_id, &recipient_id, &message.content)
                };
                match persisted {
                    Ok((conversation_id, message_id, created_at)) => {
                        if let Some(handle) = self.presence.lookup(&recipient_id) {
                            handle.send(ServerEvent::ReceiveMessage {
                                message_id: message_id.clone(),
                                conversation_id,
                                sender_id: sender_id.clone(),
                                content: message.content,
                                created_at,
                            });
                        }
                        plog!(
                            "ws: {} -> {} message {}",
                            logging::user_id(&sender_id),
                            logging::user_id(&recipient_id),
                            logging::msg_id(&message_id)
                        );
                        conn.send(ServerEvent::ack_ok(message_id, message.temp_id));
                    }
                    Err(e) => {
                        plog!("ws: private message from {} failed: {e}", logging::user_id(&sender_id));
                        conn.send(ServerEvent::ack_err(message.temp_id, e.to_string()));
                    }
                }
            }
            ClientEvent::JoinGroup { group_id } => {
                self.presence.join_group(&group_id, conn.clone());
                plog!("ws: conn {} joined {}", conn.conn_id, logging::conv_id(&group_id));
            }
            ClientEvent::LeaveGroup { group_id } => {
                self.presence.leave_group(&group_id, conn.conn_id);
                plog!("ws: conn {} left {}", conn.conn_id, logging::conv_id(&group_id));
            }
            ClientEvent::GroupMessage { group_id, message } => {
                let sender_id = match user {
                    Some(id) => id.clone(),
                    None => {
                        conn.send(ServerEvent::ack_err(
                            message.temp_id,
                            "connection not identified".to_string(),
                        ));
                        return;
                    }
                };
                let persisted = {
                    let storage = self.storage.lock().await;
                    storage.append_message(&group_id, &sender_id, &message.content)
                };
                match persisted {
                    Ok((message_id, created_at)) => {
                        // The scope includes the originating connection, so
                        // the sender sees the broadcast like everyone else.
                        let event = ServerEvent::ReceiveGroupMessage {
                            message_id: message_id.clone(),
                            group_id: group_id.clone(),
                            sender_id: sender_id.clone(),
                            content: message.content,
                            created_at,
                        };
                        for handle in self.presence.group_handles(&group_id) {
                            handle.send(event.clone());
                        }
                        plog!(
                            "ws: {} broadcast {} to {}",
                            logging::user_id(&sender_id),
                            logging::msg_id(&message_id),
                            logging::conv_id(&group_id)
                        );
                    }
                    Err(e) => {
                        plog!("ws: group message from {} failed: {e}", logging::user_id(&sender_id));
                        conn.send(ServerEvent::ack_err(message.temp_id, e.to_string()));
                    }
                }
            }
            ClientEvent::Typing {
                recipient_id,
                is_typing,
            } => {
                // Lossy: unidentified senders and offline recipients drop it.
                if let Some(sender_id) = user {
                    if let Some(handle) = self.presence.lookup(&recipient_id) {
                        handle.send(ServerEvent::UserTyping {
                            from_user_id: sender_id.clone(),
                            is_typing,
                        });
                    }
                }
            }
        }
    }

    /// Connection teardown. Clears the registry binding (guarded, so a stale
    /// handle cannot evict a newer connection) and, when this connection was
    /// still the live one, reconciles the persisted online flag.
    pub async fn disconnect(&self, conn_id: u64) {
        if let Some(user_id) = self.presence.unregister(conn_id) {
            let storage = self.storage.lock().await;
            if let Err(e) = storage.set_online(&user_id, false) {
                plog!("ws: failed to mark {} offline: {e}", logging::user_id(&user_id));
            }
            plog!("ws: {} disconnected", logging::user_id(&user_id));
        }
    }

    fn persist_direct(
        &self,
        storage: &Storage,
        sender_id: &str,
        recipient_id: &str,
        content: &str,
    ) -> Result<(String, String, u64), StorageError> {
        let conversation_id = storage.find_or_create_direct_conversation(sender_id, recipient_id)?;
        let (message_id, created_at) =
            storage.append_message(&conversation_id, sender_id, content)?;
        Ok((conversation_id, message_id, created_at))
    }
}
