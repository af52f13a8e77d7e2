use thiserror::Error;

/// Recoverable failures of the shadow pipeline. None of these abort the host; every variant
/// degrades receivers to fully lit for the affected frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VsmError {
    #[error("light forward direction is degenerate")]
    InvalidLightOrientation,

    #[error("shadow map unavailable: {0}")]
    ShadowMapUnavailable(String),

    #[error("shader program missing: {0}")]
    MissingShaderProgram(String),
}

impl VsmError {
    pub fn label(&self) -> &'static str {
        match self {
            VsmError::InvalidLightOrientation => "invalid_light_orientation",
            VsmError::ShadowMapUnavailable(_) => "shadow_map_unavailable",
            VsmError::MissingShaderProgram(_) => "missing_shader_program",
        }
    }
}

pub type VsmResult<T> = Result<T, VsmError>;
