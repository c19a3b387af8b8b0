//! Mock media backend for testing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::lock;
use super::mock_codec::{CodecShared, MockCodecBuilder, MockCodecState};
use super::mock_media::{MockExtractor, MockMetadata, MockMuxer};
use super::mock_renderer::{MockFrameRenderer, RendererShared, RendererState};
use crate::error::{Result, ShrinkError};
use crate::media::{
    Codec, CodecRef, CodecResolver, CodecSetup, Extractor, FrameRenderer, MediaBackend,
    MediaFormat, MetadataReader, Muxer, SurfaceHandle,
};

struct CreatedCodec {
    mime: String,
    is_encoder: bool,
    shared: Arc<Mutex<CodecShared>>,
}

#[derive(Default)]
struct BackendInner {
    decoders: HashMap<String, MockCodecBuilder>,
    encoders: HashMap<String, MockCodecBuilder>,
    sources: HashMap<String, (MockExtractor, MockMetadata)>,
    created: Vec<CreatedCodec>,
    renderers: HashMap<SurfaceHandle, Arc<Mutex<RendererShared>>>,
    last_renderer: Option<Arc<Mutex<RendererShared>>>,
    muxers: Vec<(PathBuf, MockMuxer)>,
    fail_muxer_writes: bool,
    next_surface: u64,
}

/// Scriptable [`MediaBackend`] that also acts as its own codec resolver.
///
/// # Example
///
/// ```rust,ignore
/// let backend = MockBackend::new();
/// backend.set_decoder("audio/mp4a-latm", MockCodec::builder("c2.aac.decoder"));
/// backend.set_encoder("audio/mp4a-latm", MockCodec::builder("c2.aac.encoder"));
/// backend.add_source("content://clip", extractor, MockMetadata::new(Some(1_000), 0));
/// ```
#[derive(Default)]
pub struct MockBackend {
    inner: Mutex<BackendInner>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder template for a source mime type.
    pub fn set_decoder(&self, mime: &str, builder: MockCodecBuilder) {
        lock(&self.inner).decoders.insert(mime.to_string(), builder);
    }

    /// Encoder template for an output mime type.
    pub fn set_encoder(&self, mime: &str, builder: MockCodecBuilder) {
        lock(&self.inner).encoders.insert(mime.to_string(), builder);
    }

    /// Registers a source. Every open gets its own clone.
    pub fn add_source(&self, source: &str, extractor: MockExtractor, metadata: MockMetadata) {
        lock(&self.inner)
            .sources
            .insert(source.to_string(), (extractor, metadata));
    }

    /// Makes every muxer created from now on fail its writes.
    pub fn fail_muxer_writes(&self) {
        lock(&self.inner).fail_muxer_writes = true;
    }

    /// Number of codecs instantiated so far.
    pub fn created_codec_count(&self) -> usize {
        lock(&self.inner).created.len()
    }

    /// State of the most recently created decoder for `mime`.
    pub fn decoder_state(&self, mime: &str) -> Option<MockCodecState> {
        self.codec_state(mime, false)
    }

    /// State of the most recently created encoder for `mime`.
    pub fn encoder_state(&self, mime: &str) -> Option<MockCodecState> {
        self.codec_state(mime, true)
    }

    fn codec_state(&self, mime: &str, is_encoder: bool) -> Option<MockCodecState> {
        lock(&self.inner)
            .created
            .iter()
            .rev()
            .find(|c| c.mime == mime && c.is_encoder == is_encoder)
            .map(|c| lock(&c.shared).state().clone())
    }

    /// Whether every codec created so far was stopped and released.
    pub fn all_codecs_released(&self) -> bool {
        lock(&self.inner).created.iter().all(|c| {
            let shared = lock(&c.shared);
            let state = shared.state();
            (!state.started || state.stopped) && state.released
        })
    }

    /// State of the most recently created frame renderer.
    pub fn renderer_state(&self) -> Option<RendererState> {
        lock(&self.inner)
            .last_renderer
            .as_ref()
            .map(|r| lock(r).state().clone())
    }

    /// The most recently created muxer.
    pub fn last_muxer(&self) -> Option<MockMuxer> {
        lock(&self.inner).muxers.last().map(|(_, m)| m.clone())
    }

    /// The source registered under `source`, sharing its observable state.
    pub fn source(&self, source: &str) -> Option<(MockExtractor, MockMetadata)> {
        lock(&self.inner).sources.get(source).cloned()
    }

    fn codec_ref(&self, mime: &str, is_encoder: bool) -> Option<CodecRef> {
        let inner = lock(&self.inner);
        let builders = if is_encoder {
            &inner.encoders
        } else {
            &inner.decoders
        };
        builders.get(mime).map(|b| CodecRef {
            name: b.name().to_string(),
            mime: mime.to_string(),
            is_encoder,
        })
    }
}

impl CodecResolver for MockBackend {
    fn find_decoder(&self, mime: &str) -> Option<CodecRef> {
        self.codec_ref(mime, false)
    }

    fn find_encoder(&self, mime: &str) -> Option<CodecRef> {
        self.codec_ref(mime, true)
    }

    fn create(
        &self,
        codec: &CodecRef,
        _format: &MediaFormat,
        setup: CodecSetup,
    ) -> Result<Box<dyn Codec>> {
        let mut inner = lock(&self.inner);
        let builders = if codec.is_encoder {
            &inner.encoders
        } else {
            &inner.decoders
        };
        let builder = builders
            .get(&codec.mime)
            .ok_or_else(|| ShrinkError::codec(format!("unknown codec {}", codec.name)))?;
        if builder.fails_create() {
            return Err(ShrinkError::codec(format!("{} refused the configuration", codec.name)));
        }
        let mut created = builder.build();

        if let CodecSetup::Decoder {
            surface: Some(surface),
        } = setup
        {
            let target = inner
                .renderers
                .get(&surface)
                .cloned()
                .ok_or_else(|| ShrinkError::codec("decoder configured with an unknown surface"))?;
            created.render_into(target);
        }

        inner.created.push(CreatedCodec {
            mime: codec.mime.clone(),
            is_encoder: codec.is_encoder,
            shared: created.shared(),
        });
        Ok(Box::new(created))
    }
}

impl MediaBackend for MockBackend {
    fn open_extractor(&self, source: &str) -> Result<Box<dyn Extractor>> {
        lock(&self.inner)
            .sources
            .get(source)
            .map(|(extractor, _)| Box::new(extractor.clone()) as Box<dyn Extractor>)
            .ok_or_else(|| ShrinkError::source_unreadable(format!("cannot open {}", source)))
    }

    fn open_metadata(&self, source: &str) -> Result<Box<dyn MetadataReader>> {
        lock(&self.inner)
            .sources
            .get(source)
            .map(|(_, metadata)| Box::new(metadata.clone()) as Box<dyn MetadataReader>)
            .ok_or_else(|| ShrinkError::source_unreadable(format!("cannot open {}", source)))
    }

    fn create_muxer(&self, path: &Path) -> Result<Box<dyn Muxer>> {
        let mut inner = lock(&self.inner);
        let muxer = MockMuxer::to_file(path);
        if inner.fail_muxer_writes {
            muxer.fail_writes();
        }
        inner.muxers.push((path.to_path_buf(), muxer.clone()));
        Ok(Box::new(muxer))
    }

    fn codecs(&self) -> &dyn CodecResolver {
        self
    }

    fn create_frame_renderer(&self, rotation: f32) -> Result<Box<dyn FrameRenderer>> {
        let mut inner = lock(&self.inner);
        inner.next_surface += 1;
        let renderer = MockFrameRenderer::new(SurfaceHandle(inner.next_surface), rotation);
        inner.renderers.insert(renderer.surface(), renderer.shared());
        inner.last_renderer = Some(renderer.shared());
        Ok(Box::new(renderer))
    }
}
