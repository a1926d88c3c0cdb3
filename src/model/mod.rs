pub mod architecture;
pub mod constants;
pub mod data;
pub mod penalty;
pub mod report;
pub mod training;
pub mod updater;
