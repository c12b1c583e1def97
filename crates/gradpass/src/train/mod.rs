pub mod conf;
pub mod schedule;

pub use conf::{
    ClipConf, IndexedSlicesOptimizerConf, ModelUpdateConf, OptimizerConf, RegularizerConf,
    TrainConf,
};
pub use schedule::{LrSchedule, LrScheduleConf};
