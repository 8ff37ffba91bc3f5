pub(crate) mod events;
pub(crate) mod health;
pub(crate) mod mode;
pub(crate) mod phases;
