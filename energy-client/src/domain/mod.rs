pub mod daily_aggregate;
pub mod device;
pub mod message;
pub mod reading;

pub use daily_aggregate::DailyAggregate;
pub use device::{Device, DevicePatch, DeviceStatus, VoltageRange};
pub use message::{ReadingBatch, StreamMessage};
pub use reading::Reading;
