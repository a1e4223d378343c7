pub mod api;
pub mod client;
pub mod config;
pub mod derive;
pub mod error;
pub mod event;
pub mod extract;
pub mod markup;
pub mod mutate;
pub mod reconcile;
pub mod sync;
pub mod vocabulary;
