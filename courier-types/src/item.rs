//! Broker-delivered state-change items.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ItemId;

/// The closed set of item categories the broker delivers.
///
/// Each subsystem interested in broker state registers for one or more of
/// these at startup; the set is fixed at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Unread-count / attention state changed.
    Badge,
    /// A device or folder needs a rekey.
    Rekey,
    /// A tracked user's sigchain changed.
    UserChanged,
    /// New chat activity invalidating the local cache.
    ChatActivity,
    /// Client-originated marker used to delimit a sync pass.
    SyncMarker,
}

impl Category {
    /// All categories, in a fixed order.
    pub const ALL: [Category; 5] = [
        Category::Badge,
        Category::Rekey,
        Category::UserChanged,
        Category::ChatActivity,
        Category::SyncMarker,
    ];

    /// The wire name of this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Badge => "badge",
            Category::Rekey => "rekey",
            Category::UserChanged => "user_changed",
            Category::ChatActivity => "chat_activity",
            Category::SyncMarker => "sync_marker",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of broker-delivered state.
///
/// Dismissing an item's id removes it from future replay; dismissal is
/// idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Broker-assigned identifier.
    pub id: ItemId,
    /// Which subsystem the item is for.
    pub category: Category,
    /// Opaque payload; the interested handler decodes it.
    pub body: Vec<u8>,
}

impl Item {
    /// Create a new item with a fresh id.
    pub fn new(category: Category, body: Vec<u8>) -> Self {
        Self {
            id: ItemId::new(),
            category,
            body,
        }
    }
}
