pub mod engine;
pub mod updater;
