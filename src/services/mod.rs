pub mod actor_resolver;
pub mod bucket_policy;
pub mod file_service;
pub mod metadata_store;
pub mod object_store;
