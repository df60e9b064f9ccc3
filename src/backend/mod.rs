//! Backend abstraction layer
//!
//! The render graph talks to the GPU only through [`GraphicsBackend`]. The
//! [`headless`] backend implements it on the CPU for tests, benchmarks and
//! offscreen tooling.

#[cfg(feature = "headless")]
pub mod headless;
pub mod traits;
pub mod types;

#[cfg(feature = "headless")]
pub use headless::{HeadlessBackend, HeadlessStats};
pub use traits::*;
pub use types::*;
