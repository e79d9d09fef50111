//! # Format Registry
//!
//! Maps container kinds to probe functions and demuxer factories, and codec
//! ids to decoder factories. Hosts may register their own formats; the
//! engine never reaches for a global table.

use crate::codec::{Decoder, DecoderFactory};
use crate::container::{self, Demuxer, DemuxerFactory, ProbeFn};
use crate::error::{PlaybackError, Result};
use crate::types::{CodecId, CodecParameters, ContainerKind};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A probe winner together with the factory that can open it.
#[derive(Clone)]
pub struct ContainerDescriptor {
    pub kind: ContainerKind,
    pub confidence: u8,
    pub factory: DemuxerFactory,
}

impl fmt::Debug for ContainerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerDescriptor")
            .field("kind", &self.kind)
            .field("confidence", &self.confidence)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub(crate) struct ContainerEntry {
    pub kind: ContainerKind,
    pub probe: ProbeFn,
    pub factory: DemuxerFactory,
}

#[derive(Clone, Default)]
pub struct FormatRegistry {
    containers: Vec<ContainerEntry>,
    codecs: Vec<(CodecId, DecoderFactory)>,
}

impl FormatRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every container and every decoder enabled by features.
    ///
    /// Containers are registered in a fixed order, which breaks probe ties.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register_container(ContainerKind::Wav, container::wav::probe, container::wav::open);
        registry.register_container(
            ContainerKind::Flac,
            container::flac::probe,
            container::flac::open,
        );
        registry.register_container(ContainerKind::Ogg, container::ogg::probe, container::ogg::open);
        registry.register_container(
            ContainerKind::Matroska,
            container::matroska::probe,
            container::matroska::open,
        );
        registry.register_container(
            ContainerKind::Mp3,
            container::mpeg::probe,
            container::mpeg::open,
        );
        registry.register_container(
            ContainerKind::Adts,
            container::adts::probe,
            container::adts::open,
        );

        for codec in [CodecId::Pcm, CodecId::ALaw, CodecId::MuLaw] {
            registry.register_codec(codec, |params: &CodecParameters| {
                Ok(Box::new(crate::codec::pcm::PcmDecoder::new(params)?) as Box<dyn Decoder>)
            });
        }

        #[cfg(feature = "decoder-flac")]
        registry.register_codec(CodecId::Flac, symphonia_factory);
        #[cfg(feature = "decoder-mp3")]
        registry.register_codec(CodecId::Mp3, symphonia_factory);
        #[cfg(feature = "decoder-aac")]
        registry.register_codec(CodecId::Aac, symphonia_factory);
        #[cfg(feature = "decoder-vorbis")]
        registry.register_codec(CodecId::Vorbis, symphonia_factory);

        #[cfg(feature = "decoder-opus")]
        registry.register_codec(CodecId::Opus, |params: &CodecParameters| {
            Ok(Box::new(crate::codec::opus::LibOpusDecoder::new(params)?) as Box<dyn Decoder>)
        });

        registry
    }

    /// Registers a container. A later registration of the same kind replaces
    /// the earlier one in place.
    pub fn register_container<P, F>(&mut self, kind: ContainerKind, probe: P, factory: F)
    where
        P: Fn(&[u8]) -> Option<u8> + Send + Sync + 'static,
        F: Fn(crate::stream::StreamHandle, &container::DemuxOptions) -> Result<Box<dyn Demuxer>>
            + Send
            + Sync
            + 'static,
    {
        let entry = ContainerEntry {
            kind: kind.clone(),
            probe: Arc::new(probe),
            factory: Arc::new(factory),
        };
        match self.containers.iter_mut().find(|e| e.kind == kind) {
            Some(existing) => *existing = entry,
            None => self.containers.push(entry),
        }
        debug!(container = %kind, "Registered container");
    }

    /// Registers a decoder, replacing any earlier factory for the codec.
    pub fn register_codec<F>(&mut self, codec: CodecId, factory: F)
    where
        F: Fn(&CodecParameters) -> Result<Box<dyn Decoder>> + Send + Sync + 'static,
    {
        let factory: DecoderFactory = Arc::new(factory);
        match self.codecs.iter_mut().find(|(id, _)| *id == codec) {
            Some(existing) => existing.1 = factory,
            None => self.codecs.push((codec.clone(), factory)),
        }
        debug!(codec = %codec, "Registered codec");
    }

    /// Registered container kinds in registration order.
    pub fn containers(&self) -> Vec<ContainerKind> {
        self.containers.iter().map(|e| e.kind.clone()).collect()
    }

    pub fn codecs(&self) -> Vec<CodecId> {
        self.codecs.iter().map(|(id, _)| id.clone()).collect()
    }

    pub(crate) fn container_entries(&self) -> &[ContainerEntry] {
        &self.containers
    }

    pub fn demuxer_for(&self, kind: &ContainerKind) -> Option<DemuxerFactory> {
        self.containers
            .iter()
            .find(|e| e.kind == *kind)
            .map(|e| e.factory.clone())
    }

    /// Builds a decoder for the parameters' codec.
    pub fn decoder_for(&self, params: &CodecParameters) -> Result<Box<dyn Decoder>> {
        let factory = self
            .codecs
            .iter()
            .find(|(id, _)| *id == params.codec)
            .map(|(_, f)| f.clone())
            .ok_or_else(|| PlaybackError::UnsupportedCodec(params.codec.to_string()))?;
        factory(params)
    }
}

#[cfg(feature = "core-decoder")]
fn symphonia_factory(params: &CodecParameters) -> Result<Box<dyn Decoder>> {
    Ok(Box::new(crate::codec::symphonia::SymphoniaDecoder::new(
        params,
    )?))
}

impl fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("containers", &self.containers())
            .field("codecs", &self.codecs())
            .finish()
    }
}
