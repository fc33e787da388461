pub mod db;
pub mod domain;
pub mod stream;

pub use domain::{DailyAggregate, Device, DevicePatch, DeviceStatus, Reading, ReadingBatch, StreamMessage, VoltageRange};
pub use stream::{ClientState, StreamClient, StreamClientConfig, StreamObserver};
