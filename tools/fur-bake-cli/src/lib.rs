//! fur-bake-cli library
//!
//! Manifest parsing and glTF loading used by the `fur-bake` binary and its
//! integration tests.

pub mod manifest;
pub mod scene;

pub use manifest::{BakeManifest, load_texture, write_outputs};
pub use scene::load_surfaces;
