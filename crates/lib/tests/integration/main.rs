mod common;

mod cache_tests;
mod cancel_tests;
mod export_tests;
mod scenario_tests;
