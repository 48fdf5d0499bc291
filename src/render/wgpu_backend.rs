use super::{GraphicsBackend, PreviewViewport, RenderError, RenderResult, RenderTarget, WgpuContext};
use crate::vr::{Extent, ImageHandle};
use pollster::block_on;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use wgpu::util::DeviceExt;

const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;
const INDICATOR_SIZE: u32 = 16;

#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct QuadVertex {
    position: [f32; 2],
    uv: [f32; 2],
}

impl QuadVertex {
    fn desc() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

#[rustfmt::skip]
const QUAD: [QuadVertex; 4] = [
    QuadVertex { position: [-1.0, -1.0], uv: [0.0, 1.0] },
    QuadVertex { position: [ 1.0, -1.0], uv: [1.0, 1.0] },
    QuadVertex { position: [-1.0,  1.0], uv: [0.0, 0.0] },
    QuadVertex { position: [ 1.0,  1.0], uv: [1.0, 0.0] },
];

/// Color attachment over one swapchain image texture.
pub struct WgpuSwapchainTarget {
    image: ImageHandle,
    extent: Extent,
    texture: Arc<wgpu::Texture>,
    view: wgpu::TextureView,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    bound: Cell<bool>,
}

impl WgpuSwapchainTarget {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// View the host renders into while the target is bound.
    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn is_bound(&self) -> bool {
        self.bound.get()
    }
}

impl RenderTarget for WgpuSwapchainTarget {
    fn image(&self) -> ImageHandle {
        self.image
    }

    fn extent(&self) -> Extent {
        self.extent
    }

    fn bind(&self) {
        if self.bound.replace(true) {
            log::warn!("[render] swapchain image {} bound twice", self.image.0);
        }
    }

    fn unbind(&self) {
        self.bound.set(false);
    }

    fn clear(&self, color: [f32; 4]) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Swapchain Clear Encoder"),
            });
        {
            let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Swapchain Clear Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color {
                            r: f64::from(color[0]),
                            g: f64::from(color[1]),
                            b: f64::from(color[2]),
                            a: f64::from(color[3]),
                        }),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }
}

struct PreviewSurface {
    extent: Extent,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    quad: wgpu::Buffer,
}

pub struct WgpuGraphicsBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    imported: HashMap<ImageHandle, Arc<wgpu::Texture>>,
    preview: Option<PreviewSurface>,
}

impl WgpuGraphicsBackend {
    pub fn initialize() -> RenderResult<Self> {
        block_on(Self::initialize_async())
    }

    async fn initialize_async() -> RenderResult<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(RenderError::Backend(
                "failed to find a compatible GPU adapter",
            ))?;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("HMD Stereo Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults(),
                },
                None,
            )
            .await
            .map_err(|_| RenderError::Backend("failed to create wgpu device"))?;

        log::info!("[render] wgpu adapter: {}", adapter.get_info().name);
        Ok(Self::from_context(WgpuContext {
            device: Arc::new(device),
            queue: Arc::new(queue),
        }))
    }

    /// Shares a device the host already created.
    pub fn from_context(context: WgpuContext) -> Self {
        Self {
            device: context.device,
            queue: context.queue,
            imported: HashMap::new(),
            preview: None,
        }
    }

    /// Associates a runtime swapchain image with a texture imported into this device.
    ///
    /// Images never registered get an offscreen texture of the requested size.
    pub fn register_image(&mut self, image: ImageHandle, texture: Arc<wgpu::Texture>) {
        self.imported.insert(image, texture);
    }

    pub fn enable_preview(&mut self, extent: Extent) {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Stereo Preview Texture"),
            size: wgpu::Extent3d {
                width: extent.width.max(1),
                height: extent.height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Stereo Blit Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/blit.wgsl").into()),
        });

        let bind_group_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Stereo Blit Bind Group Layout"),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            });

        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Stereo Blit Pipeline Layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("Stereo Blit Pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: "vs_main",
                    buffers: &[QuadVertex::desc()],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: "fs_main",
                    targets: &[Some(wgpu::ColorTargetState {
                        format: COLOR_FORMAT,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleStrip,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });

        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Stereo Blit Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let quad = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Stereo Blit Quad"),
                contents: bytemuck::cast_slice(&QUAD),
                usage: wgpu::BufferUsages::VERTEX,
            });

        self.preview = Some(PreviewSurface {
            extent,
            texture,
            view,
            pipeline,
            bind_group_layout,
            sampler,
            quad,
        });
        log::info!("[render] desktop preview enabled at {}x{}", extent.width, extent.height);
    }

    /// Composited side-by-side preview, if enabled.
    pub fn preview_texture(&self) -> Option<&wgpu::Texture> {
        self.preview.as_ref().map(|preview| &preview.texture)
    }

    fn offscreen_texture(&self, image: ImageHandle, extent: Extent) -> Arc<wgpu::Texture> {
        log::debug!("[render] no imported texture for image {}; using offscreen", image.0);
        Arc::new(self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Offscreen Eye Image"),
            size: wgpu::Extent3d {
                width: extent.width.max(1),
                height: extent.height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: COLOR_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        }))
    }
}

impl GraphicsBackend for WgpuGraphicsBackend {
    type Target = WgpuSwapchainTarget;

    fn label(&self) -> &'static str {
        "WGPU Graphics Backend"
    }

    fn create_target(&mut self, image: ImageHandle, extent: Extent) -> RenderResult<WgpuSwapchainTarget> {
        let texture = match self.imported.get(&image) {
            Some(texture) => Arc::clone(texture),
            None => self.offscreen_texture(image, extent),
        };
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(WgpuSwapchainTarget {
            image,
            extent,
            texture,
            view,
            device: Arc::clone(&self.device),
            queue: Arc::clone(&self.queue),
            bound: Cell::new(false),
        })
    }

    fn preview_extent(&self) -> Option<Extent> {
        self.preview.as_ref().map(|preview| preview.extent)
    }

    fn blit_preview(&mut self, target: &WgpuSwapchainTarget, viewport: PreviewViewport) -> RenderResult<()> {
        let preview = self.preview.as_ref().ok_or(RenderError::PreviewDisabled)?;
        if viewport.width == 0 || viewport.height == 0 {
            return Ok(());
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Stereo Blit Bind Group"),
            layout: &preview.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(target.view()),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&preview.sampler),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Stereo Blit Encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Stereo Blit Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &preview.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&preview.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.set_vertex_buffer(0, preview.quad.slice(..));
            pass.set_viewport(
                viewport.x as f32,
                viewport.y as f32,
                viewport.width as f32,
                viewport.height as f32,
                0.0,
                1.0,
            );
            pass.set_scissor_rect(viewport.x, viewport.y, viewport.width, viewport.height);
            pass.draw(0..QUAD.len() as u32, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn finish_preview(&mut self, indicator: [f32; 4]) -> RenderResult<()> {
        let preview = self.preview.as_ref().ok_or(RenderError::PreviewDisabled)?;
        let size = INDICATOR_SIZE
            .min(preview.extent.width)
            .min(preview.extent.height);
        if size == 0 || indicator[3] <= 0.0 {
            return Ok(());
        }
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &preview.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &indicator_pixels(indicator, size),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(size * 4),
                rows_per_image: Some(size),
            },
            wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn wgpu_context(&self) -> Option<WgpuContext> {
        Some(WgpuContext {
            device: Arc::clone(&self.device),
            queue: Arc::clone(&self.queue),
        })
    }
}

/// Solid square of RGBA8 texels.
fn indicator_pixels(color: [f32; 4], size: u32) -> Vec<u8> {
    let texel = color.map(|channel| (channel.clamp(0.0, 1.0) * 255.0).round() as u8);
    texel
        .iter()
        .copied()
        .cycle()
        .take((size * size * 4) as usize)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indicator_fills_square_with_color() {
        let pixels = indicator_pixels([1.0, 0.5, 0.0, 1.0], 2);
        assert_eq!(pixels.len(), 16);
        assert_eq!(&pixels[..4], &[255, 128, 0, 255]);
        assert_eq!(&pixels[12..], &[255, 128, 0, 255]);
    }

    #[test]
    fn quad_covers_clip_space() {
        let min = QUAD.iter().map(|v| v.position[0]).fold(f32::MAX, f32::min);
        let max = QUAD.iter().map(|v| v.position[1]).fold(f32::MIN, f32::max);
        assert_eq!((min, max), (-1.0, 1.0));
        assert_eq!(std::mem::size_of::<QuadVertex>(), 16);
    }
}
