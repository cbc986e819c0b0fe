pub mod backup;
pub mod chunkstore;
pub mod codec;
pub mod crypto;
pub mod download;
pub mod error;
pub mod extract;
pub mod fsutil;
pub mod hash;
pub mod manifest;
pub mod pack;
pub mod path_safety;
pub mod progress;
pub mod session;
pub mod store;
pub mod validate;
