pub mod broker;
pub mod lifecycle;
pub mod matching;
pub mod reaper;
