//! Shared inputs for the RetroDRY benchmarks.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod utils;
