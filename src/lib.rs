// src/lib.rs

// Import the top-level `cloudllm` module.
pub mod cloudllm;

// The multi-agent coordination engine: blackboard, stages, protocols, run
// controller. Built on top of `cloudllm`'s provider clients.
pub mod engine;

// If you want to provide direct access (without having to navigate through the whole hierarchy) to certain types or functionalities at the crate level, you can use re-exports:

// Re-exporting key items for easier external access.
pub use cloudllm::client_wrapper::{ClientWrapper, Message, Role};
// If you wish, you can also re-export specific clients or functionalities from the `clients` submodule:
// pub use cloudllm::clients::openai;

pub use engine::orchestrator::{Orchestrator, ProtocolDef, ProtocolResult, StageDescriptor};
pub use engine::run_controller::RunController;
