pub mod codec;
pub mod dispatch;
pub mod events;
pub mod quota;
pub mod server;
pub mod state;
pub mod token;

pub use dispatch::{DispatchEngine, DispatchError};
pub use events::{StreamEvent, ToolCall};
pub use state::CoreServices;
pub use token::TokenManager;
