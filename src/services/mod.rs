pub mod intake;
pub mod notifier;
pub mod queue;
pub mod retry;
pub mod status;
pub mod storage;
pub mod transforms;
pub mod worker;
