pub mod affinity;
pub mod announcer;
pub mod character;
pub mod config;
pub mod event;
pub mod history;
pub mod http_client;
pub mod llm_client;
pub mod memory;
pub mod orchestrator;
pub mod prompt;
pub mod runtime;
pub mod store;
pub mod vision;

#[cfg(test)]
pub mod testing;
