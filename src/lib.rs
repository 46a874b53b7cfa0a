#[macro_use]
extern crate log;

#[macro_use]
extern crate serde;

pub mod aggregator;
pub mod common;
pub mod coordinator;
pub mod discovery;
pub mod protocol;
pub mod settings;
pub mod storage;
