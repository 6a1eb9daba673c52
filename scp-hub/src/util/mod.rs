//! Process-level helpers for the hub binary.

mod sig_down;

pub use sig_down::SigDown;
