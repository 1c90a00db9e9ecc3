pub mod fetch_service;
pub mod handle_cache;
pub mod remote_source;
pub mod resume;
pub mod scheduler;
pub mod state_store;
pub mod supervisor;

#[cfg(test)]
pub mod testing;
