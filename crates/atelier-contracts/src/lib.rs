pub mod chat;
pub mod curation;
pub mod events;
pub mod models;
pub mod sessions;
pub mod wardrobe;
