pub(crate) mod completions;
pub(crate) mod health;
