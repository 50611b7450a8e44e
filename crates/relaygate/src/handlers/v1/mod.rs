//! V1 API handlers.

mod advise;
mod chat;
mod providers;
mod status;

pub use advise::advise;
pub use chat::chat;
pub use providers::list_providers;
pub use status::status;
