pub mod config;
pub mod detection;
pub mod error;
pub mod events;
pub mod index;
pub mod permission;
pub mod state;
pub mod processing {
    pub mod layout;
}
pub mod tasks {
    pub mod loader;
    pub mod manager;
    pub mod pages;
    pub mod pipeline;
}
