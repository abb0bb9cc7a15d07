pub mod common;
mod job_queue_tests;
mod result_store_tests;
