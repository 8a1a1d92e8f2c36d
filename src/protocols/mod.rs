//! Protocol implementations.
//!
//! - `echo`: newline-delimited text, each line answered with `Echo: <line>`

pub mod echo;
