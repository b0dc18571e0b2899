//! On-device pieces: the loader itself, and the collaborator traits it is built against instead
//! of a concrete filesystem, flash chip or allocator.

pub mod collaborators;
pub mod loader;
