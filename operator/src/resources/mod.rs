mod actions;
mod apply;
mod owners;
mod reconcile;

pub use reconcile::{ContextData, run};
