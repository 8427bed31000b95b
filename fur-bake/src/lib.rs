//! Texel-space fur length/visibility mask baking
//!
//! Given character surfaces, this library bakes one pair of textures per
//! material: a length mask (how far fur may grow before hitting clothing or
//! other occluders, attenuated by sphere and bone masks) and a binarized
//! alpha mask derived from it.
//!
//! Baking is cooperative. A [`BakeSession`] is ticked by the host, one
//! bounded batch of triangles per tick, until it completes or is cancelled.
//!
//! # Example
//! ```no_run
//! use fur_bake::*;
//! use std::path::Path;
//!
//! let input = BakeInput {
//!     surfaces: vec![/* Surface::new("body", mesh) */],
//!     settings: BakeSettings { texture_size: 512, ..Default::default() },
//!     ..Default::default()
//! };
//!
//! let mut session = BakeSession::new(input)?;
//! let mut progress = |p: f32, msg: &str| {
//!     println!("{:>3.0}% {msg}", p * 100.0);
//!     ProgressAction::Continue
//! };
//! if let TickStatus::Completed(output) = session.run_to_end(&mut progress) {
//!     for (material, textures) in &output {
//!         textures.length_mask.write_png(Path::new(&format!("{material}_length.png")))?;
//!     }
//! }
//! # Ok::<(), fur_bake::BakeError>(())
//! ```

pub mod config;
pub mod error;
pub mod flatten;
pub mod masks;
pub mod occluder;
pub mod postprocess;
pub mod raster;
pub mod session;
pub mod surface;
pub mod texture;

pub use config::{BakeSettings, BoneMasks, OutputMode, SphereMask};
pub use error::{BakeError, Result};
pub use masks::NormalMapEntry;
pub use postprocess::MaterialTextures;
pub use session::{
    BakeInput, BakeOutput, BakeSession, BakeState, CancelToken, NoProgress, ProgressAction,
    ProgressSink, TickStatus,
};
pub use surface::{IslandSeed, SkinBinding, Submesh, Surface, SurfaceMesh};
pub use texture::TextureBuffer;
