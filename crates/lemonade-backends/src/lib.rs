//! Backend adapters.
//!
//! One adapter per inference engine family, all behind the
//! [`WrappedBackend`] contract: install the pinned engine version, spawn it
//! for a model, probe readiness, forward requests, and report telemetry.

pub mod backend;
pub mod flm;
pub mod install;
pub mod kokoro;
pub mod llamacpp;
pub mod onnx;
pub mod sd;
pub mod vllm;
pub mod whisper;

pub use backend::{
    default_llamacpp_flavor, BackendProcess, CompletionBackend, EmbeddingsBackend, ImageBackend,
    LoadOptions, RerankingBackend, SpeechBackend, TranscriptionBackend, WrappedBackend,
};

use lemonade_core::model::{ModelDescriptor, Recipe};
use lemonade_core::Result;

/// Construct the adapter serving `descriptor`'s recipe.
pub fn create_backend(
    descriptor: &ModelDescriptor,
    options: &LoadOptions,
) -> Result<Box<dyn WrappedBackend>> {
    Ok(match descriptor.recipe {
        Recipe::LlamaCpp => Box::new(llamacpp::LlamaCppBackend::new(&options.llamacpp_flavor)),
        Recipe::OgaCpu | Recipe::OgaNpu | Recipe::OgaHybrid => {
            Box::new(onnx::OnnxBackend::new(descriptor.recipe))
        }
        Recipe::Flm => Box::new(flm::FlmBackend::new()),
        Recipe::WhisperCpp => Box::new(whisper::WhisperBackend::new()),
        Recipe::SdCpp => Box::new(sd::SdBackend::new()),
        Recipe::Kokoro => Box::new(kokoro::KokoroBackend::new()),
        Recipe::Vllm => Box::new(vllm::VllmBackend::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lemonade_core::model::ModelSource;

    fn descriptor(recipe: Recipe) -> ModelDescriptor {
        ModelDescriptor {
            name: "m".into(),
            checkpoint: "org/repo:Q4_0".into(),
            recipe,
            mmproj: None,
            labels: vec![],
            size_gb: 0.0,
            suggested: false,
            source: ModelSource::Catalog,
            downloaded: false,
            resolved_path: None,
        }
    }

    #[test]
    fn test_factory_covers_every_recipe() {
        for recipe in [
            Recipe::LlamaCpp,
            Recipe::OgaCpu,
            Recipe::OgaNpu,
            Recipe::OgaHybrid,
            Recipe::Flm,
            Recipe::WhisperCpp,
            Recipe::SdCpp,
            Recipe::Kokoro,
            Recipe::Vllm,
        ] {
            let backend = create_backend(&descriptor(recipe), &LoadOptions::default()).unwrap();
            assert_eq!(backend.recipe(), recipe);
        }
    }

    #[test]
    fn test_capability_surfaces_match_recipe() {
        let llm = create_backend(&descriptor(Recipe::LlamaCpp), &LoadOptions::default()).unwrap();
        assert!(llm.as_completion().is_some());
        assert!(llm.as_image().is_none());

        let sd = create_backend(&descriptor(Recipe::SdCpp), &LoadOptions::default()).unwrap();
        assert!(sd.as_image().is_some());
        assert!(sd.as_completion().is_none());

        let whisper =
            create_backend(&descriptor(Recipe::WhisperCpp), &LoadOptions::default()).unwrap();
        assert!(whisper.as_transcription().is_some());
        assert!(whisper.as_embeddings().is_none());
    }
}
