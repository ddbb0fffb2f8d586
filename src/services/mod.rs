pub mod dispatcher;
pub mod executor;
pub mod monitor;
pub mod renderer;
pub mod sweep;
