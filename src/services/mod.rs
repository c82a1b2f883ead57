pub mod metadata_store;
pub mod object_store;
pub mod staging;
pub mod transfer;
pub mod transfer_queue;
pub mod upload_service;
