//! Side-effecting collaborators: configuration, the chat provider,
//! subprocesses and transcript persistence. Isolated to enable mocking in
//! tests.

pub mod client;
pub mod config;
pub mod process;
pub mod transcript;
