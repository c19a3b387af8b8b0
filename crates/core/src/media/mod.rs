//! Platform media seam.
//!
//! The shrinker does not implement codecs or containers. It drives whatever
//! the host platform provides through the traits in this module:
//!
//! - [`Extractor`] / [`MetadataReader`]: read the source container
//! - [`Codec`]: hardware decoder or encoder with non-blocking buffer exchange
//! - [`Muxer`]: write the output container
//! - [`FrameRenderer`] / [`InputSurface`]: surface hand-off for video frames
//! - [`CodecResolver`]: codec capability lookup
//! - [`MediaBackend`]: factory tying them together

mod traits;
mod types;

pub use traits::{
    Codec, CodecResolver, Extractor, FrameRenderer, InputSurface, MediaBackend, MetadataReader,
    Muxer,
};
pub use types::{
    AacProfile, BufferInfo, CodecRef, CodecSetup, MediaFormat, MediaKind, OutputEvent,
    SampleFlags, SnapshotRequest, SurfaceHandle,
};
