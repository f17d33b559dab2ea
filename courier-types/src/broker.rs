//! Broker protocol messages.
//!
//! Argument and result payloads for the RPC methods the push client
//! exchanges with the notification broker.

use serde::{Deserialize, Serialize};

use crate::{Category, Item, ItemId};

/// Argument for `broker.sync`: replay items missed since a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncArgs {
    /// Last item id the client has acknowledged, if any.
    pub checkpoint: Option<ItemId>,
}

/// Result of `broker.sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRes {
    /// Items missed since the checkpoint, oldest first.
    pub items: Vec<Item>,
}

/// Argument for `broker.injectItem`: synthesize and store a new item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectArgs {
    /// Category of the synthetic item.
    pub category: Category,
    /// Opaque payload.
    pub body: Vec<u8>,
}

/// Result of `broker.injectItem`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectRes {
    /// Broker-assigned id of the stored item.
    pub id: ItemId,
}

/// Argument for `broker.dismissItem`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DismissArgs {
    /// Id to remove from future replay.
    pub id: ItemId,
}

/// Argument for `remote.post`: deliver one sealed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostArgs {
    /// Target conversation.
    pub conversation: crate::ConversationId,
    /// Sealed message payload.
    pub payload: Vec<u8>,
}

/// Argument for the `broker.oobm` notification (out-of-band message).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OobmArgs {
    /// Target system name, e.g. `kbfs.favorites`.
    pub system: String,
    /// Opaque payload.
    pub body: Vec<u8>,
}
