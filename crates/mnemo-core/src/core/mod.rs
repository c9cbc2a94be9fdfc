pub mod agent;
pub mod aggregator;
pub mod events;
pub mod interrupt;
pub mod logging;
pub mod memory;
pub mod prompt;
