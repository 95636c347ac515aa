#[macro_use]
extern crate tracing;

pub mod backend;
pub mod cli;
pub mod clients;
pub mod compositor;
pub mod frame_pacer;
pub mod output;
pub mod page_flip;
pub mod surface;
pub mod transaction;
pub mod utils;

#[cfg(test)]
mod tests;
