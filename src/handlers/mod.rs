pub mod actor_middleware;
pub mod file_handlers;
pub mod health_handlers;
