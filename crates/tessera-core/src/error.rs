// SPDX-License-Identifier: CEPL-1.0
//! Engine error taxonomy.
//!
//! Four families of failure exist: fatal initialization errors, a stale
//! swapchain (recoverable, handled inside the frame driver), caller misuse
//! of the named-resource APIs, and resource loading failures. Anything the
//! graphics backend reports during steady state lands in [`EngineError::Backend`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// No usable device, failed allocation or failed pipeline creation.
    #[error("initialization failed: {0:#}")]
    Init(anyhow::Error),

    /// The swapchain no longer matches the surface and must be recreated.
    #[error("swapchain is out of date")]
    SwapchainStale,

    #[error("unknown model `{0}`")]
    UnknownModel(String),

    #[error("model `{model}` has no instance set `{set}`")]
    UnknownInstanceSet { model: String, set: String },

    #[error("unknown overlay `{0}`")]
    UnknownOverlay(String),

    #[error("unknown texture `{0}`")]
    UnknownTexture(String),

    #[error("unknown texture array `{0}`")]
    UnknownTextureArray(String),

    #[error("texture array `{array}` has no layer `{layer}`")]
    UnknownArrayLayer { array: String, layer: String },

    /// A texture or other asset could not be decoded or uploaded.
    #[error("failed to load `{id}`: {source:#}")]
    ResourceLoad {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl EngineError {
    /// Wraps an initialization failure.
    pub fn init(err: impl Into<anyhow::Error>) -> Self {
        Self::Init(err.into())
    }

    pub fn resource_load(id: impl Into<String>, err: impl Into<anyhow::Error>) -> Self {
        Self::ResourceLoad {
            id: id.into(),
            source: err.into(),
        }
    }

    /// True for errors caused by naming a resource that was never registered.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::UnknownModel(_)
                | Self::UnknownInstanceSet { .. }
                | Self::UnknownOverlay(_)
                | Self::UnknownTexture(_)
                | Self::UnknownTextureArray(_)
                | Self::UnknownArrayLayer { .. }
        )
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
