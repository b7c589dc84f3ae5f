//! Integration tests for the archive pipeline and the crawl scheduler

mod helpers;
mod pipeline_tests;
mod scheduler_tests;
