mod adapter;
mod set;

pub use adapter::{TopicSocketAdapter, VerifyKind};
pub use set::{BatchReport, TopicOpOptions, TopicStatus, Topics, TopicsConfig, VerifyLevel, WaitFor};
