pub mod chat;
pub mod feedback;
pub mod health;
pub mod identity;

pub use identity::{Identity, IdentityResolver};
