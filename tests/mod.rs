mod api_tests;
mod executor_tests;
mod support;
