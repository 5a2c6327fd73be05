pub mod audio;
pub mod conversation;
pub mod events;
pub mod realtime;

pub use conversation::ConversationSession;
pub use events::{
    BridgeEvent, BridgeEventKind, EventRegistry, SubscriptionId, Transcript, TranscriptRole,
};
pub use realtime::{ControllerState, ModelSessionController, TurnState};
