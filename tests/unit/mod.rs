//! Unit tests for flowheal modules
//!
//! These tests cover individual components without network I/O. Time is
//! driven by `ManualClock` wherever the code under test sleeps.

mod helpers;
mod test_circuit_breaker;
mod test_classifier;
mod test_config;
mod test_controller;
mod test_healing_engine;
