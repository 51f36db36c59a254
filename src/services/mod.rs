pub mod classifier;
pub mod source;
pub mod storage;
