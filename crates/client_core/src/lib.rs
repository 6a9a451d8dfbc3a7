pub mod api;
pub mod composer;
pub mod connection;
pub mod error;
pub mod presence;
pub mod settings;
pub mod store;
pub mod sync;
pub mod types;

pub use api::{AttachmentUpload, ChatApi, HttpChatApi};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionStatus, ReconnectPolicy};
pub use error::ClientError;
pub use settings::{load_settings, ClientSettings};
pub use store::{ConversationStore, ConversationTimeline, MergeResult};
pub use sync::{ActiveSelection, ClientEvent, SyncEngine, SyncState};
pub use types::{DeliveryState, Message, Session};
