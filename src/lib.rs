pub mod chat;
pub mod comment;
pub mod config;
pub mod content;
pub mod continuity;
pub mod controller;
pub mod scheduler;
pub mod transport;
