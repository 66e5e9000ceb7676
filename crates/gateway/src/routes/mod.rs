pub mod chat;
pub mod keys;
pub mod media;
pub mod notifications;
