pub mod engine;
pub mod error;
pub mod scheduler;

pub use engine::EngineFacade;
pub use error::EngineError;
pub use scheduler::Scheduler;
