mod dispatch;
mod manager;
mod state;
mod worker;

#[cfg(test)]
mod tests;

pub use manager::*;
