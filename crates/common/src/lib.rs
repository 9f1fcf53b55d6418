// quicktab-common: shared types and protocol for the quicktab workspace

pub mod protocol;
pub mod record;
pub mod types;
pub mod window_id;
