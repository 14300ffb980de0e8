pub mod error;
pub mod fields;
pub mod frame;
pub mod id;
pub mod metadata;
pub mod patch;
pub mod reconnect;

pub use error::{ErrorCode, WireError};
pub use fields::FieldSelector;
pub use frame::{ClientFrame, ServerFrame};
pub use id::{CallId, CollectionId, ConnectionId, EntityId, EntityKey, ReconnectId};
pub use metadata::{Metadata, OperationMeta, OperationType};
pub use patch::{apply_patch, Patch, PatchOp};
pub use reconnect::{ReconnectResult, ReconnectStatus, ReconnectSubscription};
