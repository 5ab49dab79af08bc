mod actions;
mod reconcile;

pub use reconcile::{ContextData, run};
