pub mod error;
pub mod events;
pub mod palette;
pub mod quota;
pub mod runs;
pub mod settings;
pub mod sources;
