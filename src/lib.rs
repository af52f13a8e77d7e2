pub mod bounds;
pub mod camera;
pub mod cli;
pub mod config;
pub mod error;
pub mod frustum;
pub mod light;
pub mod manager;
pub mod occlusion;
pub mod receiver;
pub mod renderer;
pub mod scene;
pub mod shadow_space;

pub use bounds::{
    Aabb, BoundsConfig, LayerMask, SceneBounds, SceneBoundsEstimator, ShadowCaster, ShadowCasterId,
    ShadowCasterRegistry,
};
pub use camera::ShadowCamera;
pub use config::{VsmConfig, VsmConfigOverrides};
pub use error::{VsmError, VsmResult};
pub use frustum::{FitConfig, LightFrustum, LightFrustumFitter};
pub use light::{DirectionalLight, LightDirection, LightTransform};
pub use manager::{FrameReport, FrameStatus, VsmShadowManager};
pub use occlusion::{MomentSampler, Moments, ShadowTuning};
pub use receiver::{ReceiverId, ReceiverParameterSet, ReceiverSet, ReceiverUniform};
pub use renderer::{ShadowBackend, ShadowMapHandle, SoftwareShadowBackend, VarianceShadowRenderer};
pub use scene::SceneDescription;
pub use shadow_space::{ProjectionConvention, ShadowSpaceTransform};
