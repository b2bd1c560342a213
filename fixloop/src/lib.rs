//! Execution-and-recovery engine for model-generated code.
//!
//! Fragments extracted from model output are executed in isolated child
//! processes, and failures are fed back to the model for a fix under a growing
//! timeout budget. Fragments that start servers are launched detached and
//! tracked so they can later be terminated safely. The architecture enforces
//! a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (language tags, fence extraction,
//!   timeout policy, ownership verdicts). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (processes, ports, device bridge,
//!   deployments, history files, model client). Isolated to enable fakes in tests.
//!
//! Orchestration modules ([`dispatch`], [`retry`]) coordinate core logic with
//! I/O to implement the CLI commands.

pub mod core;
pub mod dispatch;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod retry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
