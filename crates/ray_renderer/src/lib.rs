//! Region-based CPU path tracer.
//!
//! A [`Renderer`] owns one frame and refines it one region pass at a time:
//!
//! - Scrambled Halton sequences per region ([`RegionContext`])
//! - Camera rays for perspective, orthographic and lightmap cameras
//! - BVH traversal behind the [`Traversal`] seam
//! - Secondary ray sorting by origin cell and direction octant
//! - Shading with next-event estimation and deferred shadow rays
//! - Incremental accumulation, variance and adaptive sampling
//! - NLM and learned denoising of the accumulated image
//! - Bucket tiling with cooperative cancellation

pub mod bucket;
pub mod denoise;
pub mod error;
pub mod framebuffer;
pub mod pool;
pub mod ray;
pub mod raygen;
pub mod region;
pub mod renderer;
pub mod sampling;
pub mod sequence;
pub mod settings;
pub mod shade;
pub mod sort;
pub mod stats;
pub mod traversal;

pub use bucket::{bucket_regions, generate_buckets, render_tiles, CancelFlag, DEFAULT_BUCKET_SIZE};
pub use denoise::{NlmKernel, NlmParams, UNetWeights};
pub use error::{RenderError, RenderResult};
pub use framebuffer::{Frame, Framebuffer, ShL1Data, TonemapParams};
pub use ray::{HitData, PixelCoord, RayData, RayDepth, ShadowRay};
pub use region::{Rect, RegionContext};
pub use renderer::{AuxBuffer, PixelsRef, Renderer};
pub use settings::{Capabilities, PassSettings, RendererSettings};
pub use stats::RenderStats;
pub use traversal::{SoftwareTraversal, Traversal};

/// Scene types the renderer consumes.
pub use ray_core;
pub use ray_math;
