use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(MessageId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
}

/// Composite conversation identity. Direct-contact ids and group ids live in
/// separate id spaces; keying by the bare integer is unrepresentable here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ConversationKey {
    Direct(UserId),
    Group(GroupId),
}

impl ConversationKey {
    pub fn kind(&self) -> ConversationKind {
        match self {
            Self::Direct(_) => ConversationKind::Direct,
            Self::Group(_) => ConversationKind::Group,
        }
    }

    pub fn raw_id(&self) -> i64 {
        match self {
            Self::Direct(user_id) => user_id.0,
            Self::Group(group_id) => group_id.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Text,
    Image,
    File,
}

impl ContentKind {
    /// Classification used by the attachment flow: anything the sender
    /// declares as `image/*` renders inline, the rest is a plain file.
    pub fn for_mime_type(mime_type: Option<&str>) -> Self {
        match mime_type {
            Some(mime) if mime.starts_with("image/") => Self::Image,
            _ => Self::File,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}
