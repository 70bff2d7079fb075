pub mod auth;
pub mod digest;
pub mod pairing;
pub mod storage;
pub mod traits;
