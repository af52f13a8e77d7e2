use std::fs;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use anyhow::{anyhow, Context};
use glam::{Mat4, Vec3};
use log::{error, info, warn};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use wgpu::util::DeviceExt;

use super::{MomentPass, ShadowBackend, ShadowMapDescriptor};
use crate::bounds::Aabb;
use crate::config::ShadowMapConfig;
use crate::error::{VsmError, VsmResult};
use crate::occlusion::Moments;
use crate::receiver::ReceiverUniform;
use crate::shadow_space::ProjectionConvention;

pub const MOMENT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rg32Float;
pub const MOMENT_DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
const POSITION_STRIDE: u64 = std::mem::size_of::<[f32; 3]>() as u64;
const MOMENT_TEXEL_BYTES: u32 = 8;
const EMBEDDED_MOMENT_SHADER: &str = include_str!("../../assets/shaders/vsm_moments.wgsl");
const EMBEDDED_RECEIVER_SHADER: &str = include_str!("../../assets/shaders/vsm_receiver.wgsl");
const MOMENT_ENTRY_POINTS: [&str; 2] = ["vs_main", "fs_main"];
const RECEIVER_FUNCTIONS: [&str; 2] = ["vsm_occlusion", "vsm_shadow_factor"];

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct MomentFrameUniform {
    view_proj: [[f32; 4]; 4],
    shadow_space: [[f32; 4]; 4],
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct MomentDrawUniform {
    model: [[f32; 4]; 4],
}

/// Where a WGSL program comes from.
#[derive(Debug, Clone, Default)]
pub enum ProgramSource {
    #[default]
    Embedded,
    File(PathBuf),
}

impl ProgramSource {
    fn from_path(path: Option<&PathBuf>) -> Self {
        match path {
            Some(path) => ProgramSource::File(path.clone()),
            None => ProgramSource::Embedded,
        }
    }

    fn load(&self, embedded: &str) -> VsmResult<String> {
        match self {
            ProgramSource::Embedded => Ok(embedded.to_string()),
            ProgramSource::File(path) => fs::read_to_string(path)
                .map_err(|err| VsmError::MissingShaderProgram(format!("{}: {err}", path.display()))),
        }
    }
}

/// The moment program and the receiver include.
#[derive(Debug, Clone, Default)]
pub struct ShaderPrograms {
    pub moment: ProgramSource,
    pub receiver: ProgramSource,
}

impl ShaderPrograms {
    pub fn from_config(config: &ShadowMapConfig) -> Self {
        Self {
            moment: ProgramSource::from_path(config.moment_shader.as_ref()),
            receiver: ProgramSource::from_path(config.receiver_shader.as_ref()),
        }
    }
}

/// Parses and validates WGSL, then checks that the named entry points or functions exist.
fn validate_program(
    label: &str,
    source: &str,
    entry_points: &[&str],
    functions: &[&str],
) -> VsmResult<()> {
    let invalid = |detail: String| VsmError::MissingShaderProgram(format!("{label}: {detail}"));
    let module = naga::front::wgsl::parse_str(source).map_err(|err| invalid(err.to_string()))?;
    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|err| invalid(err.to_string()))?;
    for name in entry_points {
        if !module.entry_points.iter().any(|entry| entry.name == *name) {
            return Err(invalid(format!("missing entry point '{name}'")));
        }
    }
    for name in functions {
        if !module.functions.iter().any(|(_, f)| f.name.as_deref() == Some(*name)) {
            return Err(invalid(format!("missing function '{name}'")));
        }
    }
    Ok(())
}

/// Position-only caster geometry with its world transform.
#[derive(Clone)]
pub struct GpuCasterMesh {
    pub vertex_buffer: Arc<wgpu::Buffer>,
    pub index_buffer: Arc<wgpu::Buffer>,
    pub index_count: u32,
    pub model: Mat4,
}

impl GpuCasterMesh {
    pub fn from_positions(
        device: &wgpu::Device,
        positions: &[[f32; 3]],
        indices: &[u32],
        model: Mat4,
    ) -> Self {
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("VSM Caster VB"),
            contents: bytemuck::cast_slice(positions),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("VSM Caster IB"),
            contents: bytemuck::cast_slice(indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        Self {
            vertex_buffer: Arc::new(vertex_buffer),
            index_buffer: Arc::new(index_buffer),
            index_count: indices.len() as u32,
            model,
        }
    }

    /// Axis-aligned box mesh in world space (identity model).
    pub fn from_aabb(device: &wgpu::Device, bounds: &Aabb) -> Self {
        let positions: Vec<[f32; 3]> =
            bounds.corners().iter().map(|c: &Vec3| c.to_array()).collect();
        // corner index bits: x = 1, y = 2, z = 4
        #[rustfmt::skip]
        let indices: [u32; 36] = [
            0, 2, 1, 1, 2, 3, // -z
            4, 5, 6, 5, 7, 6, // +z
            0, 4, 2, 2, 4, 6, // -x
            1, 3, 5, 3, 7, 5, // +x
            0, 1, 4, 1, 5, 4, // -y
            2, 6, 3, 3, 6, 7, // +y
        ];
        Self::from_positions(device, &positions, &indices, Mat4::IDENTITY)
    }
}

/// Moment texture plus its depth buffer.
pub struct WgpuShadowTarget {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    depth_view: wgpu::TextureView,
    resolution: u32,
}

impl WgpuShadowTarget {
    pub fn resolution(&self) -> u32 {
        self.resolution
    }
}

struct MomentPipelineResources {
    pipeline: wgpu::RenderPipeline,
    draw_bgl: wgpu::BindGroupLayout,
    frame_bind_group: wgpu::BindGroup,
    frame_buffer: wgpu::Buffer,
}

/// GPU buffer and bind group feeding `vsm_receiver.wgsl` for one receiver.
pub struct ReceiverGpuBinding {
    pub buffer: wgpu::Buffer,
    pub bind_group: wgpu::BindGroup,
}

pub struct WgpuShadowBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    programs: ShaderPrograms,
    receiver_source: Option<String>,
    resources: Option<MomentPipelineResources>,
    draw_buffer: Option<wgpu::Buffer>,
    draw_bind_group: Option<wgpu::BindGroup>,
    draw_capacity: usize,
    draw_staging: Vec<u8>,
    sampler: wgpu::Sampler,
    receiver_layout: wgpu::BindGroupLayout,
    filterable: bool,
}

impl WgpuShadowBackend {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, programs: ShaderPrograms) -> Self {
        let filterable = device.features().contains(wgpu::Features::FLOAT32_FILTERABLE);
        if !filterable {
            warn!(
                "FLOAT32_FILTERABLE unavailable; shadow moments will be sampled with nearest filtering"
            );
        }
        let filter = if filterable { wgpu::FilterMode::Linear } else { wgpu::FilterMode::Nearest };
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("VSM Moment Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: wgpu::FilterMode::Nearest,
            lod_min_clamp: 0.0,
            lod_max_clamp: 0.0,
            compare: None,
            anisotropy_clamp: 1,
            border_color: None,
        });
        let receiver_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("VSM Receiver BGL"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        multisampled: false,
                        view_dimension: wgpu::TextureViewDimension::D2,
                        sample_type: wgpu::TextureSampleType::Float { filterable },
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(if filterable {
                        wgpu::SamplerBindingType::Filtering
                    } else {
                        wgpu::SamplerBindingType::NonFiltering
                    }),
                    count: None,
                },
            ],
        });
        Self {
            device,
            queue,
            programs,
            receiver_source: None,
            resources: None,
            draw_buffer: None,
            draw_bind_group: None,
            draw_capacity: 0,
            draw_staging: Vec::new(),
            sampler,
            receiver_layout,
            filterable,
        }
    }

    /// Creates a device without a surface. Returns `Ok(None)` when no adapter is available.
    pub fn new_headless(programs: ShaderPrograms) -> anyhow::Result<Option<Self>> {
        pollster::block_on(Self::request_headless(programs))
    }

    async fn request_headless(programs: ShaderPrograms) -> anyhow::Result<Option<Self>> {
        let instance = wgpu::Instance::default();
        let adapter = match instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
        {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!("no GPU adapter for headless shadow backend: {err}");
                return Ok(None);
            }
        };
        let required_features = adapter.features() & wgpu::Features::FLOAT32_FILTERABLE;
        let required_limits = wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits());
        let device_desc = wgpu::DeviceDescriptor {
            label: Some("VSM Headless Device"),
            required_features,
            required_limits,
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: wgpu::Trace::default(),
        };
        let (device, queue) =
            adapter.request_device(&device_desc).await.context("Failed to request headless device")?;
        Ok(Some(Self::new(device, queue, programs)))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn sampler(&self) -> &wgpu::Sampler {
        &self.sampler
    }

    pub fn receiver_layout(&self) -> &wgpu::BindGroupLayout {
        &self.receiver_layout
    }

    pub fn is_filterable(&self) -> bool {
        self.filterable
    }

    /// Validated receiver WGSL for inclusion in material shaders. Available after activation.
    pub fn receiver_program(&self) -> Option<&str> {
        self.receiver_source.as_deref()
    }

    pub fn create_receiver_binding(
        &self,
        target: &WgpuShadowTarget,
        uniform: &ReceiverUniform,
    ) -> ReceiverGpuBinding {
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("VSM Receiver Uniform"),
            contents: bytemuck::bytes_of(uniform),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("VSM Receiver BG"),
            layout: &self.receiver_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: buffer.as_entire_binding() },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&target.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });
        ReceiverGpuBinding { buffer, bind_group }
    }

    pub fn update_receiver_binding(&self, binding: &ReceiverGpuBinding, uniform: &ReceiverUniform) {
        self.queue.write_buffer(&binding.buffer, 0, bytemuck::bytes_of(uniform));
    }

    fn load_programs(&self) -> VsmResult<(String, String)> {
        let moment = self.programs.moment.load(EMBEDDED_MOMENT_SHADER)?;
        validate_program("moment program", &moment, &MOMENT_ENTRY_POINTS, &[])?;
        let receiver = self.programs.receiver.load(EMBEDDED_RECEIVER_SHADER)?;
        validate_program("receiver program", &receiver, &[], &RECEIVER_FUNCTIONS)?;
        Ok((moment, receiver))
    }

    /// Copies the moment texture back to the CPU, row-major from texel `(0, 0)`.
    pub fn read_moments(&self, target: &WgpuShadowTarget) -> anyhow::Result<Vec<Moments>> {
        let res = target.resolution;
        let tight_bpr = (res * MOMENT_TEXEL_BYTES) as usize;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;
        let padded_bpr = tight_bpr.div_ceil(align) * align;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("VSM Readback Staging"),
            size: (padded_bpr * res as usize) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("VSM Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bpr as u32),
                    rows_per_image: Some(res),
                },
            },
            wgpu::Extent3d { width: res, height: res, depth_or_array_layers: 1 },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .context("Failed to wait for moment readback")?;
        receiver.recv().map_err(|_| anyhow!("map_async callback channel dropped"))??;

        let data = slice.get_mapped_range();
        let mut moments = Vec::with_capacity((res * res) as usize);
        for row in data.chunks_exact(padded_bpr) {
            for texel in row[..tight_bpr].chunks_exact(MOMENT_TEXEL_BYTES as usize) {
                let [mean, mean_sq] = bytemuck::pod_read_unaligned::<[f32; 2]>(texel);
                moments.push(Moments { mean, mean_sq });
            }
        }
        drop(data);
        staging.unmap();
        Ok(moments)
    }

    fn draw_stride(&self) -> u64 {
        let align = self.device.limits().min_uniform_buffer_offset_alignment.max(1) as u64;
        let size = std::mem::size_of::<MomentDrawUniform>() as u64;
        size.div_ceil(align) * align
    }

    fn ensure_draw_capacity(&mut self, count: usize) -> VsmResult<()> {
        if self.draw_capacity >= count && self.draw_bind_group.is_some() {
            return Ok(());
        }
        let resources = self
            .resources
            .as_ref()
            .ok_or_else(|| {
                VsmError::MissingShaderProgram("moment pipeline not prepared".to_string())
            })?;
        let mut capacity = self.draw_capacity.max(16);
        while capacity < count {
            capacity *= 2;
        }
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("VSM Draw Buffer"),
            size: self.draw_stride() * capacity as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("VSM Draw BG"),
            layout: &resources.draw_bgl,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: wgpu::BufferSize::new(std::mem::size_of::<MomentDrawUniform>() as u64),
                }),
            }],
        });
        self.draw_buffer = Some(buffer);
        self.draw_bind_group = Some(bind_group);
        self.draw_capacity = capacity;
        Ok(())
    }
}

fn uniform_layout_entry(visibility: wgpu::ShaderStages, dynamic: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: dynamic,
            min_binding_size: None,
        },
        count: None,
    }
}

impl ShadowBackend for WgpuShadowBackend {
    type Target = WgpuShadowTarget;
    type Mesh = GpuCasterMesh;

    fn prepare_program(&mut self) -> VsmResult<()> {
        if self.resources.is_some() {
            return Ok(());
        }
        let (source, receiver_source) = self.load_programs().inspect_err(|err| error!("{err}"))?;
        let device = &self.device;
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("VSM Moment Shader"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let frame_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("VSM Frame BGL"),
            entries: &[uniform_layout_entry(wgpu::ShaderStages::VERTEX, false)],
        });
        let draw_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("VSM Draw BGL"),
            entries: &[uniform_layout_entry(wgpu::ShaderStages::VERTEX, true)],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("VSM Moment Pipeline Layout"),
            bind_group_layouts: &[&frame_bgl, &draw_bgl],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("VSM Moment Pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[wgpu::VertexBufferLayout {
                    array_stride: POSITION_STRIDE,
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: &[wgpu::VertexAttribute {
                        shader_location: 0,
                        format: wgpu::VertexFormat::Float32x3,
                        offset: 0,
                    }],
                }],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: MOMENT_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: MOMENT_DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::LessEqual,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        let frame_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("VSM Frame Buffer"),
            size: std::mem::size_of::<MomentFrameUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let frame_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("VSM Frame BG"),
            layout: &frame_bgl,
            entries: &[wgpu::BindGroupEntry { binding: 0, resource: frame_buffer.as_entire_binding() }],
        });
        self.resources =
            Some(MomentPipelineResources { pipeline, draw_bgl, frame_bind_group, frame_buffer });
        self.receiver_source = Some(receiver_source);
        self.draw_bind_group = None;
        info!("VSM moment pipeline ready");
        Ok(())
    }

    fn max_resolution(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    fn required_convention(&self) -> Option<ProjectionConvention> {
        Some(ProjectionConvention::WebGpu)
    }

    fn create_target(&mut self, desc: &ShadowMapDescriptor) -> VsmResult<WgpuShadowTarget> {
        let resolution = desc.resolution;
        let size = wgpu::Extent3d { width: resolution, height: resolution, depth_or_array_layers: 1 };
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("VSM Shadow Map"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: MOMENT_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let depth = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("VSM Shadow Depth"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: MOMENT_DEPTH_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = depth.create_view(&wgpu::TextureViewDescriptor::default());
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(err) = validation.or(out_of_memory) {
            return Err(VsmError::ShadowMapUnavailable(format!("{resolution}px target: {err}")));
        }
        Ok(WgpuShadowTarget { texture, view, depth_view, resolution })
    }

    fn release_target(&mut self, target: WgpuShadowTarget) {
        target.texture.destroy();
    }

    fn clear_target(&mut self, target: &mut WgpuShadowTarget, value: Moments) {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("VSM Clear Encoder"),
        });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("VSM Clear Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: value.mean as f64,
                            g: value.mean_sq as f64,
                            b: 0.0,
                            a: 0.0,
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn render_moments(
        &mut self,
        target: &mut WgpuShadowTarget,
        pass: &MomentPass<'_, GpuCasterMesh>,
    ) -> VsmResult<()> {
        self.ensure_draw_capacity(pass.casters.len())?;
        let stride = self.draw_stride() as usize;
        self.draw_staging.clear();
        self.draw_staging.resize(stride * pass.casters.len(), 0);
        for (idx, draw) in pass.casters.iter().enumerate() {
            let uniform = MomentDrawUniform { model: draw.caster.mesh.model.to_cols_array_2d() };
            let start = idx * stride;
            self.draw_staging[start..start + std::mem::size_of::<MomentDrawUniform>()]
                .copy_from_slice(bytemuck::bytes_of(&uniform));
        }

        let resources = self
            .resources
            .as_ref()
            .ok_or_else(|| {
                VsmError::MissingShaderProgram("moment pipeline not prepared".to_string())
            })?;
        let draw_buffer = self
            .draw_buffer
            .as_ref()
            .ok_or_else(|| VsmError::ShadowMapUnavailable("draw buffer missing".to_string()))?;
        let draw_bind_group = self
            .draw_bind_group
            .as_ref()
            .ok_or_else(|| VsmError::ShadowMapUnavailable("draw bind group missing".to_string()))?;

        let frame = MomentFrameUniform {
            view_proj: pass.gpu_view_projection.to_cols_array_2d(),
            shadow_space: pass.shadow_space_matrix.to_cols_array_2d(),
        };
        self.queue.write_buffer(&resources.frame_buffer, 0, bytemuck::bytes_of(&frame));
        if !self.draw_staging.is_empty() {
            self.queue.write_buffer(draw_buffer, 0, &self.draw_staging);
        }

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("VSM Moment Encoder"),
        });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("VSM Moment Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations { load: wgpu::LoadOp::Load, store: wgpu::StoreOp::Store },
                })],
                depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                    view: &target.depth_view,
                    depth_ops: Some(wgpu::Operations {
                        load: wgpu::LoadOp::Clear(1.0),
                        store: wgpu::StoreOp::Discard,
                    }),
                    stencil_ops: None,
                }),
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            let res_f = target.resolution as f32;
            rpass.set_viewport(0.0, 0.0, res_f, res_f, 0.0, 1.0);
            rpass.set_pipeline(&resources.pipeline);
            rpass.set_bind_group(0, &resources.frame_bind_group, &[]);
            for (idx, draw) in pass.casters.iter().enumerate() {
                let mesh = &draw.caster.mesh;
                let offset = (idx * stride) as wgpu::DynamicOffset;
                rpass.set_bind_group(1, draw_bind_group, &[offset]);
                rpass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
                rpass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
                rpass.draw_indexed(0..mesh.index_count, 0, 0..1);
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}
