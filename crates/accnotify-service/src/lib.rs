pub mod capability;
pub mod connection;
pub mod delivery;
pub mod keepalive;
pub mod network;
pub mod registration;
pub mod retention;
pub mod service_state;
pub mod status;
