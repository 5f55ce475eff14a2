pub mod candidates;
pub mod dispatch;
pub mod instant;
pub mod ledger;
pub mod scoring;
pub mod timers;
