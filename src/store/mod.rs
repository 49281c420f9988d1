//! Collaborators the scheduler mediates: the remote key-value backend and the
//! budget oracle that reports how many calls each operation category may still make.
//!
//! [`in_memory::InMemoryBackend`] together with [`budget::FixedBudget`] or
//! [`budget::WindowBudget`] lets the scheduler run without a remote service.

pub mod backend;
pub mod budget;
pub mod in_memory;
