mod build;
mod exec;
mod inspect;

pub(crate) use build::build;
pub(crate) use exec::exec;
pub(crate) use inspect::{list_runs, plan, verify};
