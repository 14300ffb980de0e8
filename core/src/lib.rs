pub mod config;
pub mod context;
pub mod engine;
pub mod entity;
pub mod error;
pub mod fields;
pub mod observable;
pub mod oplog;
pub mod patch_derive;
pub mod plugin;
pub mod router;
pub mod selection;

pub use config::LensConfig;
pub use context::Context;
pub use engine::{Engine, EntityChange, OperationOutcome};
pub use entity::{EntityDef, EntitySet, FieldKind, PureFieldResolver, SubscribeFieldResolver};
pub use fields::{apply_field_selection, filter_patch_fields};
pub use error::{sanitize_for_wire, EngineError, LogError, SubscriptionError};
pub use observable::{first_value_from, Observable, Observer, ObserverBuilder, Subscription};
pub use oplog::{InMemoryLog, OperationLog, PatchWindow};
pub use plugin::{
    BroadcastHook, BroadcastInput, BroadcastOutcome, ConnectHook, OpLogBroadcastHook, OpLogReconnectHook, Plugins, ReconnectContext,
    ReconnectHook, SendHook, SubscribeContext, SubscriptionHook,
};
pub use router::{once, reactive, stream, Operation, OperationKind, Router, RouterBuilder, RouterError};
pub use selection::{Selection, SelectionField};
