pub mod orchestrator;

pub use orchestrator::SagaOrchestrator;
