pub mod fleet;
pub mod matching;
pub mod order;
