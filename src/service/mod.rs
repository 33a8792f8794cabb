//! Messaging engine
//!
//! Contains business logic separated from HTTP and WebSocket handlers.
//! Services validate membership and invariants, then mutate the store;
//! deciding who hears about a change is left to `realtime::Notifier`.

mod conversation;
mod message;
mod policy;
mod projection;
pub mod validation;

pub use conversation::{ConversationService, CreateOutcome, MarkReadOutcome};
pub use message::{
    DeletedMessage, MessagePage, MessageService, NewMessage, ReactionOutcome, SendOutcome,
};
pub use policy::{ConversationPolicy, FriendsOnlyPolicy, OpenPolicy, policy_from_config};
pub use projection::{
    ConversationView, MessageSummary, MessageView, ParticipantView, Projector, UserSummary,
};
