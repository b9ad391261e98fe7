//! Integration test suite for foreman.
//!
//! These tests drive a `MonitorContext` end to end over a temporary project
//! directory. Terminal sessions and branch state come from the in-memory
//! backends, so no tmux server or git repository is needed.
//!
//! # Test Categories
//!
//! - `approval_flow`: Prompt detection, keystroke injection and alerts
//! - `completion_flow`: Signals, consensus modes and phase archival
//! - `monitor_loop`: Timeouts, shutdown and restart

mod fixtures;

mod approval_flow;
mod completion_flow;
mod monitor_loop;
