pub mod at;
pub mod cmd;
pub mod host;
pub mod luks2;
pub mod mount;
pub mod resolve;
