pub mod error;
pub mod eval;
pub mod providers;
pub mod settings;
