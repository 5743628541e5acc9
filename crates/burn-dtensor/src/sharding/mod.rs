//! Device meshes, placements and distributed tensor specs.

mod mesh;
mod placement;
mod spec;

pub use mesh::*;
pub use placement::*;
pub use spec::*;
