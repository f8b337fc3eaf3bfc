pub mod api;
pub mod audit;
pub mod codec;
pub mod contracts;
pub mod metrics;
pub mod sequencer;
pub mod storage;
