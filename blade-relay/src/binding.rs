//! Binding tables: where each named shader input lives.
//!
//! A table is either filled by hand by the code generator or reflected from
//! WGSL. Reflection maps bind groups to stages: group 0 holds vertex stage
//! resources, group 1 fragment and group 2 compute. The binding index is the
//! slot within the stage.

use crate::ShaderStage;
use std::{collections::HashMap, fmt};
use strum::EnumCount as _;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BindingKind {
    Buffer,
    Texture,
    Sampler,
    /// Member of the stage's uniform block.
    Uniform { offset: u32, size: u32 },
    VertexAttribute,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct BindingLocation {
    pub stage: ShaderStage,
    pub slot: u32,
    pub kind: BindingKind,
}

/// Loose uniforms of a stage, uploaded as inline bytes.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct UniformBlock {
    pub slot: u32,
    pub size: u32,
}

#[derive(Debug)]
pub struct ReflectionError(pub String);

impl fmt::Display for ReflectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ReflectionError {}

#[derive(Clone, Debug, Default)]
pub struct BindingTable {
    entries: HashMap<(String, ShaderStage), BindingLocation>,
    blocks: [Option<UniformBlock>; ShaderStage::COUNT],
}

impl BindingTable {
    /// Stage served by each bind group, indexed by group.
    pub const STAGE_GROUPS: [ShaderStage; 3] = [
        ShaderStage::Vertex,
        ShaderStage::Fragment,
        ShaderStage::Compute,
    ];

    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, location: BindingLocation) {
        self.entries
            .insert((name.to_string(), location.stage), location);
    }

    pub fn with(mut self, name: &str, stage: ShaderStage, slot: u32, kind: BindingKind) -> Self {
        self.insert(name, BindingLocation { stage, slot, kind });
        self
    }

    pub fn with_uniform_block(mut self, stage: ShaderStage, slot: u32, size: u32) -> Self {
        self.blocks[stage.index()] = Some(UniformBlock { slot, size });
        self
    }

    pub fn resolve(&self, name: &str, stage: ShaderStage) -> Option<BindingLocation> {
        self.entries.get(&(name.to_string(), stage)).copied()
    }

    pub fn uniform_block(&self, stage: ShaderStage) -> Option<UniformBlock> {
        self.blocks[stage.index()]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn from_wgsl(source: &str) -> Result<Self, ReflectionError> {
        let module = naga::front::wgsl::parse_str(source)
            .map_err(|e| ReflectionError(e.emit_to_string(source)))?;
        Ok(Self::from_module(&module))
    }

    pub fn from_module(module: &naga::Module) -> Self {
        let mut table = Self::new();
        for (_, var) in module.global_variables.iter() {
            let (Some(name), Some(ref binding)) = (var.name.as_deref(), var.binding) else {
                continue;
            };
            let Some(&stage) = Self::STAGE_GROUPS.get(binding.group as usize) else {
                log::warn!("Binding '{}' uses unknown group {}", name, binding.group);
                continue;
            };
            let slot = binding.binding;
            let kind = match module.types[var.ty].inner {
                naga::TypeInner::Image { .. } => BindingKind::Texture,
                naga::TypeInner::Sampler { .. } => BindingKind::Sampler,
                naga::TypeInner::Struct {
                    ref members,
                    span,
                } if var.space == naga::AddressSpace::Uniform
                    && table.blocks[stage.index()].is_none() =>
                {
                    table.blocks[stage.index()] = Some(UniformBlock { slot, size: span });
                    for member in members.iter() {
                        let Some(ref member_name) = member.name else {
                            continue;
                        };
                        let size = module.types[member.ty].inner.size(module.to_ctx());
                        table.insert(
                            member_name,
                            BindingLocation {
                                stage,
                                slot,
                                kind: BindingKind::Uniform {
                                    offset: member.offset,
                                    size,
                                },
                            },
                        );
                    }
                    BindingKind::Buffer
                }
                _ => BindingKind::Buffer,
            };
            table.insert(name, BindingLocation { stage, slot, kind });
        }

        for ep in module.entry_points.iter() {
            if ep.stage != naga::ShaderStage::Vertex {
                continue;
            }
            for arg in ep.function.arguments.iter() {
                match arg.binding {
                    Some(naga::Binding::Location { location, .. }) => {
                        if let Some(ref name) = arg.name {
                            table.insert(name, Self::attribute(location));
                        }
                    }
                    Some(naga::Binding::BuiltIn(_)) => {}
                    None => {
                        let naga::TypeInner::Struct { ref members, .. } =
                            module.types[arg.ty].inner
                        else {
                            continue;
                        };
                        for member in members.iter() {
                            if let (Some(ref name), Some(naga::Binding::Location { location, .. })) =
                                (&member.name, &member.binding)
                            {
                                table.insert(name, Self::attribute(*location));
                            }
                        }
                    }
                }
            }
        }
        table
    }

    fn attribute(location: u32) -> BindingLocation {
        BindingLocation {
            stage: ShaderStage::Vertex,
            slot: location,
            kind: BindingKind::VertexAttribute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHADER: &str = r#"
struct Globals {
    mvp: mat4x4<f32>,
    tint: vec4<f32>,
}
@group(0) @binding(0) var<uniform> globals: Globals;
@group(0) @binding(1) var<storage, read> offsets: array<vec4<f32>>;
@group(1) @binding(0) var albedo: texture_2d<f32>;
@group(1) @binding(1) var albedo_sampler: sampler;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(2) uv: vec2<f32>,
}

@vertex
fn vs_main(input: VertexInput, @location(1) color: vec4<f32>, @builtin(vertex_index) vi: u32) -> @builtin(position) vec4<f32> {
    return globals.mvp * vec4<f32>(input.position, 1.0) + offsets[vi] + color * globals.tint;
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return textureSample(albedo, albedo_sampler, vec2<f32>(0.5));
}
"#;

    #[test]
    fn reflects_wgsl() {
        let table = BindingTable::from_wgsl(SHADER).unwrap();
        let vs = ShaderStage::Vertex;
        let fs = ShaderStage::Fragment;
        assert_eq!(
            table.uniform_block(vs),
            Some(UniformBlock { slot: 0, size: 80 })
        );
        assert_eq!(table.uniform_block(fs), None);
        assert_eq!(
            table.resolve("tint", vs).map(|loc| loc.kind),
            Some(BindingKind::Uniform {
                offset: 64,
                size: 16
            })
        );
        assert_eq!(
            table.resolve("offsets", vs),
            Some(BindingLocation {
                stage: vs,
                slot: 1,
                kind: BindingKind::Buffer
            })
        );
        assert_eq!(
            table.resolve("albedo", fs).map(|loc| loc.kind),
            Some(BindingKind::Texture)
        );
        assert_eq!(
            table.resolve("albedo_sampler", fs).map(|loc| (loc.slot, loc.kind)),
            Some((1, BindingKind::Sampler))
        );
        assert_eq!(table.resolve("albedo", vs), None);
        for (name, location) in [("position", 0), ("color", 1), ("uv", 2)] {
            assert_eq!(
                table.resolve(name, vs),
                Some(BindingTable::attribute(location)),
                "{name}"
            );
        }
    }

    #[test]
    fn rejects_invalid_source() {
        assert!(BindingTable::from_wgsl("fn broken(").is_err());
    }
}
