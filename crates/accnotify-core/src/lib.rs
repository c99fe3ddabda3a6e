pub mod crypto;
pub mod device_state;
pub mod envelope;
pub mod keys;
pub mod message;
pub mod paths;
pub mod secure_storage;
pub mod settings;
pub mod storage;
pub mod store;
