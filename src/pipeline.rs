// Pipeline layout cache and pipeline creation
//
// Structurally identical layouts share one native entry: the requested
// bindings are canonicalized, content-hashed and looked up before anything
// native is built. Pipelines themselves are never deduplicated.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::handle::{Handle, HandlePool};
use crate::resources::{GarbageHandle, GarbageList};
use crate::MAX_SETS_PER_PIPELINE;

/// One compiled shader stage, passed through from the shader asset pipeline
#[derive(Debug, Clone)]
pub struct ShaderStageBlob {
    pub stage: vk::ShaderStageFlags,
    pub spirv: Vec<u32>,
}

/// A named binding slot or push-constant block reported by shader reflection
#[derive(Debug, Clone)]
pub struct ShaderParam {
    pub name: String,
    pub binding: u32,
    pub push_constant: bool,
    pub stages: vk::ShaderStageFlags,
}

/// Downward contract from the shader-compilation asset: named slots plus the
/// stage blobs themselves.
#[derive(Debug, Clone)]
pub struct ShaderReflection {
    pub name: String,
    pub params: Vec<ShaderParam>,
    pub stages: Vec<ShaderStageBlob>,
}

impl ShaderReflection {
    fn param(&self, name: &str) -> Option<&ShaderParam> {
        self.params.iter().find(|p| p.name == name)
    }

    fn stage(&self, stage: vk::ShaderStageFlags) -> Option<&ShaderStageBlob> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

#[derive(Debug, Clone)]
pub struct BindingDesc {
    pub name: String,
    pub ty: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
    pub array_count: u32,
    pub set_index: u32,
}

#[derive(Debug, Clone)]
pub struct PushConstantDesc {
    pub name: String,
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineLayoutDesc {
    pub bindings: Vec<BindingDesc>,
    pub push_constants: Vec<PushConstantDesc>,
    pub use_push_descriptors: bool,
}

/// Canonical order: issuance order never affects identity
fn canonicalize(desc: &PipelineLayoutDesc) -> PipelineLayoutDesc {
    let mut canon = desc.clone();
    canon
        .bindings
        .sort_by(|a, b| (a.set_index, a.name.as_str()).cmp(&(b.set_index, b.name.as_str())));
    canon.push_constants.sort_by(|a, b| a.name.cmp(&b.name));
    canon
}

/// Content hash of an already-canonical layout description
fn layout_hash(desc: &PipelineLayoutDesc) -> u64 {
    let mut hasher = DefaultHasher::new();
    for b in &desc.bindings {
        b.name.hash(&mut hasher);
        b.ty.as_raw().hash(&mut hasher);
        b.stages.as_raw().hash(&mut hasher);
        b.array_count.hash(&mut hasher);
        b.set_index.hash(&mut hasher);
    }
    for p in &desc.push_constants {
        p.name.hash(&mut hasher);
        p.stages.as_raw().hash(&mut hasher);
        p.offset.hash(&mut hasher);
        p.size.hash(&mut hasher);
    }
    desc.use_push_descriptors.hash(&mut hasher);
    hasher.finish()
}

/// A binding with its native slot resolved through reflection
#[derive(Debug, Clone)]
pub(crate) struct ResolvedBinding {
    pub name: String,
    pub slot: u32,
    pub ty: vk::DescriptorType,
    pub set_index: u32,
}

pub struct PipelineLayoutEntry {
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) set_layouts: Vec<vk::DescriptorSetLayout>,
    pub(crate) bindings: Vec<ResolvedBinding>,
    pub(crate) push_constants: Vec<PushConstantDesc>,
    hash: u64,
    ref_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineKind {
    Graphics,
    Compute,
}

pub struct PipelineEntry {
    pub(crate) native: vk::Pipeline,
    pub(crate) kind: PipelineKind,
}

pub type PipelineLayoutHandle = Handle<PipelineLayoutEntry>;
pub type PipelineHandle = Handle<PipelineEntry>;

#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub topology: vk::PrimitiveTopology,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub blend_enable: bool,
    pub color_formats: Vec<vk::Format>,
    /// UNDEFINED means no depth attachment
    pub depth_format: vk::Format,
}

impl Default for GraphicsPipelineDesc {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::GREATER_OR_EQUAL,
            blend_enable: false,
            color_formats: Vec::new(),
            depth_format: vk::Format::UNDEFINED,
        }
    }
}

/// Layout and pipeline tables; main-thread only
pub(crate) struct PipelineCache {
    pub layouts: HandlePool<PipelineLayoutEntry>,
    pub pipelines: HandlePool<PipelineEntry>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self {
            layouts: HandlePool::new(),
            pipelines: HandlePool::new(),
        }
    }

    /// Deduplicating layout creation: a structural match returns the existing
    /// handle with its reference count bumped.
    pub fn create_layout(
        &mut self,
        device: &ash::Device,
        limits: &vk::PhysicalDeviceLimits,
        reflection: &ShaderReflection,
        desc: &PipelineLayoutDesc,
    ) -> Result<PipelineLayoutHandle> {
        let canon = canonicalize(desc);

        let push_total: u32 = canon.push_constants.iter().map(|p| p.offset + p.size).max().unwrap_or(0);
        assert!(
            push_total <= limits.max_push_constants_size,
            "Push constants of '{}' need {} bytes, device limit is {}",
            reflection.name,
            push_total,
            limits.max_push_constants_size
        );

        let hash = layout_hash(&canon);
        if let Some(handle) = self.reuse_layout(hash) {
            return Ok(handle);
        }

        // Resolve every binding slot through the shader's reflection
        let mut resolved = Vec::with_capacity(canon.bindings.len());
        for b in &canon.bindings {
            let param = reflection.param(&b.name).unwrap_or_else(|| {
                panic!("Shader '{}' has no binding named '{}'", reflection.name, b.name)
            });
            resolved.push(ResolvedBinding {
                name: b.name.clone(),
                slot: param.binding,
                ty: b.ty,
                set_index: b.set_index,
            });
        }

        let set_count = canon.bindings.iter().map(|b| b.set_index + 1).max().unwrap_or(0) as usize;
        assert!(
            set_count <= MAX_SETS_PER_PIPELINE,
            "Layout of '{}' spans {} sets, limit is {}",
            reflection.name,
            set_count,
            MAX_SETS_PER_PIPELINE
        );

        let mut set_layouts = Vec::with_capacity(set_count);
        for set_index in 0..set_count as u32 {
            let set_bindings: Vec<vk::DescriptorSetLayoutBinding> = canon
                .bindings
                .iter()
                .zip(&resolved)
                .filter(|(b, _)| b.set_index == set_index)
                .map(|(b, r)| {
                    vk::DescriptorSetLayoutBinding::builder()
                        .binding(r.slot)
                        .descriptor_type(b.ty)
                        .descriptor_count(b.array_count.max(1))
                        .stage_flags(b.stages)
                        .build()
                })
                .collect();

            let flags = if canon.use_push_descriptors {
                vk::DescriptorSetLayoutCreateFlags::PUSH_DESCRIPTOR_KHR
            } else {
                vk::DescriptorSetLayoutCreateFlags::empty()
            };
            let info = vk::DescriptorSetLayoutCreateInfo::builder()
                .flags(flags)
                .bindings(&set_bindings);
            set_layouts.push(
                unsafe { device.create_descriptor_set_layout(&info, None) }
                    .context("Failed to create descriptor set layout")?,
            );
        }

        let push_ranges: Vec<vk::PushConstantRange> = canon
            .push_constants
            .iter()
            .map(|p| vk::PushConstantRange {
                stage_flags: p.stages,
                offset: p.offset,
                size: p.size,
            })
            .collect();

        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;

        Ok(self.layouts.add(PipelineLayoutEntry {
            layout,
            set_layouts,
            bindings: resolved,
            push_constants: canon.push_constants,
            hash,
            ref_count: 1,
        }))
    }

    /// Cache hit: a structural match returns the existing handle with its
    /// reference count bumped, and nothing native is created.
    fn reuse_layout(&mut self, hash: u64) -> Option<PipelineLayoutHandle> {
        let handle = self
            .layouts
            .iter()
            .find(|(_, entry)| entry.hash == hash)
            .map(|(handle, _)| handle)?;
        if let Some(entry) = self.layouts.get_mut(handle) {
            entry.ref_count += 1;
        }
        Some(handle)
    }

    /// Drops one reference; the native objects are quarantined when the last
    /// reference goes. Idempotent on invalid handles.
    pub fn destroy_layout(&mut self, handle: PipelineLayoutHandle, garbage: &GarbageList, frame: u64) {
        let last = match self.layouts.get_mut(handle) {
            Some(entry) => {
                entry.ref_count -= 1;
                entry.ref_count == 0
            }
            None => return,
        };
        if last {
            if let Some(entry) = self.layouts.remove(handle) {
                for set_layout in entry.set_layouts {
                    garbage.push(frame, GarbageHandle::DescriptorSetLayout(set_layout));
                }
                garbage.push(frame, GarbageHandle::PipelineLayout(entry.layout));
            }
        }
    }

    pub fn create_graphics_pipeline(
        &mut self,
        device: &ash::Device,
        reflection: &ShaderReflection,
        layout_handle: PipelineLayoutHandle,
        desc: &GraphicsPipelineDesc,
    ) -> Result<PipelineHandle> {
        let layout = self
            .layouts
            .get(layout_handle)
            .context("Graphics pipeline references a dead layout handle")?
            .layout;

        let mut modules = Vec::with_capacity(reflection.stages.len());
        let mut stage_infos = Vec::with_capacity(reflection.stages.len());
        for blob in &reflection.stages {
            let info = vk::ShaderModuleCreateInfo::builder().code(&blob.spirv);
            let module = unsafe { device.create_shader_module(&info, None) }
                .with_context(|| format!("Failed to create shader module for '{}'", reflection.name))?;
            modules.push(module);
            stage_infos.push(
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(blob.stage)
                    .module(module)
                    .name(c"main")
                    .build(),
            );
        }

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::builder().topology(desc.topology);

        // Viewport and scissor are dynamic; only the counts matter here
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(desc.depth_compare);

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .color_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::builder()
                    .blend_enable(desc.blend_enable)
                    .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                    .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                    .color_blend_op(vk::BlendOp::ADD)
                    .src_alpha_blend_factor(vk::BlendFactor::ONE)
                    .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
                    .alpha_blend_op(vk::BlendOp::ADD)
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .build()
            })
            .collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
            .color_attachment_formats(&desc.color_formats)
            .depth_attachment_format(desc.depth_format);

        let create_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let result = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info.build()], None)
        };

        for module in modules {
            unsafe { device.destroy_shader_module(module, None) };
        }

        let native = result
            .map_err(|(_, err)| err)
            .with_context(|| format!("Failed to create graphics pipeline '{}'", reflection.name))?[0];

        Ok(self.pipelines.add(PipelineEntry {
            native,
            kind: PipelineKind::Graphics,
        }))
    }

    pub fn create_compute_pipeline(
        &mut self,
        device: &ash::Device,
        reflection: &ShaderReflection,
        layout_handle: PipelineLayoutHandle,
    ) -> Result<PipelineHandle> {
        let layout = self
            .layouts
            .get(layout_handle)
            .context("Compute pipeline references a dead layout handle")?
            .layout;
        let blob = reflection
            .stage(vk::ShaderStageFlags::COMPUTE)
            .with_context(|| format!("Shader '{}' has no compute stage", reflection.name))?;

        let info = vk::ShaderModuleCreateInfo::builder().code(&blob.spirv);
        let module = unsafe { device.create_shader_module(&info, None) }
            .with_context(|| format!("Failed to create shader module for '{}'", reflection.name))?;

        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module)
            .name(c"main");
        let create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(*stage)
            .layout(layout);

        let result = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info.build()], None)
        };
        unsafe { device.destroy_shader_module(module, None) };

        let native = result
            .map_err(|(_, err)| err)
            .with_context(|| format!("Failed to create compute pipeline '{}'", reflection.name))?[0];

        Ok(self.pipelines.add(PipelineEntry {
            native,
            kind: PipelineKind::Compute,
        }))
    }

    pub fn destroy_pipeline(&mut self, handle: PipelineHandle, garbage: &GarbageList, frame: u64) {
        if let Some(entry) = self.pipelines.remove(handle) {
            garbage.push(frame, GarbageHandle::Pipeline(entry.native));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(name: &str, ty: vk::DescriptorType, set_index: u32) -> BindingDesc {
        BindingDesc {
            name: name.into(),
            ty,
            stages: vk::ShaderStageFlags::FRAGMENT,
            array_count: 1,
            set_index,
        }
    }

    #[test]
    fn issuance_order_never_affects_layout_identity() {
        let a = PipelineLayoutDesc {
            bindings: vec![
                binding("albedo", vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1),
                binding("globals", vk::DescriptorType::UNIFORM_BUFFER, 0),
                binding("normals", vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1),
            ],
            ..Default::default()
        };
        let mut b = a.clone();
        b.bindings.reverse();
        assert_eq!(layout_hash(&canonicalize(&a)), layout_hash(&canonicalize(&b)));
    }

    #[test]
    fn structurally_different_layouts_do_not_collide() {
        let a = PipelineLayoutDesc {
            bindings: vec![binding("globals", vk::DescriptorType::UNIFORM_BUFFER, 0)],
            ..Default::default()
        };
        let mut by_type = a.clone();
        by_type.bindings[0].ty = vk::DescriptorType::STORAGE_BUFFER;
        let mut by_set = a.clone();
        by_set.bindings[0].set_index = 1;
        let mut by_name = a.clone();
        by_name.bindings[0].name = "locals".into();

        let base = layout_hash(&canonicalize(&a));
        assert_ne!(base, layout_hash(&canonicalize(&by_type)));
        assert_ne!(base, layout_hash(&canonicalize(&by_set)));
        assert_ne!(base, layout_hash(&canonicalize(&by_name)));
    }

    #[test]
    fn push_descriptor_flag_is_part_of_identity() {
        let a = PipelineLayoutDesc {
            bindings: vec![binding("globals", vk::DescriptorType::UNIFORM_BUFFER, 0)],
            use_push_descriptors: true,
            ..Default::default()
        };
        let mut b = a.clone();
        b.use_push_descriptors = false;
        assert_ne!(layout_hash(&canonicalize(&a)), layout_hash(&canonicalize(&b)));
    }

    fn seeded_cache(hash: u64) -> (PipelineCache, PipelineLayoutHandle) {
        let mut cache = PipelineCache::new();
        let handle = cache.layouts.add(PipelineLayoutEntry {
            layout: vk::PipelineLayout::null(),
            set_layouts: vec![vk::DescriptorSetLayout::null()],
            bindings: Vec::new(),
            push_constants: Vec::new(),
            hash,
            ref_count: 1,
        });
        (cache, handle)
    }

    #[test]
    fn identical_layout_reuses_the_same_handle() {
        let (mut cache, first) = seeded_cache(0xfeed);

        assert_eq!(cache.reuse_layout(0xfeed), Some(first));
        assert_eq!(cache.reuse_layout(0xfeed), Some(first));
        assert_eq!(cache.layouts.get(first).unwrap().ref_count, 3);

        // A different structure misses and would build fresh natives
        assert_eq!(cache.reuse_layout(0xbeef), None);
    }

    #[test]
    fn layout_natives_survive_until_the_last_reference_drops() {
        let (mut cache, handle) = seeded_cache(0xfeed);
        cache.reuse_layout(0xfeed).unwrap();

        let garbage = GarbageList::new();
        cache.destroy_layout(handle, &garbage, 0);
        assert!(cache.layouts.get(handle).is_some(), "one reference still live");
        assert_eq!(garbage.pending(), 0);

        cache.destroy_layout(handle, &garbage, 0);
        assert!(cache.layouts.get(handle).is_none());
        // One set layout plus the pipeline layout hit the quarantine
        assert_eq!(garbage.pending(), 2);

        // Destroying a dead handle stays a no-op
        cache.destroy_layout(handle, &garbage, 0);
        assert_eq!(garbage.pending(), 2);
    }

    #[test]
    fn push_constants_participate_in_identity() {
        let a = PipelineLayoutDesc {
            push_constants: vec![PushConstantDesc {
                name: "transform".into(),
                stages: vk::ShaderStageFlags::VERTEX,
                offset: 0,
                size: 64,
            }],
            ..Default::default()
        };
        let mut b = a.clone();
        b.push_constants[0].size = 128;
        assert_ne!(layout_hash(&canonicalize(&a)), layout_hash(&canonicalize(&b)));
    }
}
