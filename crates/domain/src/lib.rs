pub mod catalog;
pub mod coordinator;
pub mod dispatcher;
pub mod runs;
pub mod sync;
pub mod tracking;
