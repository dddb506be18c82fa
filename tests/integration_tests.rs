//! Driver for the `tests/integration/` suite.

#[path = "integration/tcp_proxy_tests.rs"]
mod tcp_proxy_tests;
