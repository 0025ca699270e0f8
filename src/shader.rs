// Shader programs
//
// The core never compiles or cross-compiles shaders. Each backend accepts
// the artifacts it can consume: SPIR-V for Vulkan, HLSL source or DXBC for
// D3D12. The headless backend accepts any of them and only records them.

use anyhow::{bail, Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use crate::backend::ShaderKey;
use crate::device::Device;
use crate::types::ShaderStages;

const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ShaderCode {
    SpirV(Vec<u32>),
    Hlsl(String),
    Dxbc(Vec<u8>),
}

impl ShaderCode {
    /// Parse a little-endian SPIR-V binary
    pub fn spirv_from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            bail!("SPIR-V size {} is not a multiple of 4", bytes.len());
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if words.first() != Some(&SPIRV_MAGIC) {
            bail!("Missing SPIR-V magic number");
        }
        Ok(ShaderCode::SpirV(words))
    }

    pub fn load_spirv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read shader {:?}", path))?;
        Self::spirv_from_bytes(&bytes).with_context(|| format!("Invalid SPIR-V in {:?}", path))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ShaderCode::SpirV(_) => "SPIR-V",
            ShaderCode::Hlsl(_) => "HLSL",
            ShaderCode::Dxbc(_) => "DXBC",
        }
    }
}

impl std::fmt::Debug for ShaderCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderCode::SpirV(words) => write!(f, "SpirV({} words)", words.len()),
            ShaderCode::Hlsl(src) => write!(f, "Hlsl({} bytes)", src.len()),
            ShaderCode::Dxbc(bytes) => write!(f, "Dxbc({} bytes)", bytes.len()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderStageDesc {
    pub code: ShaderCode,
    pub entry_point: String,
}

impl ShaderStageDesc {
    pub fn new(code: ShaderCode, entry_point: &str) -> Self {
        Self {
            code,
            entry_point: entry_point.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ShaderProgramDesc {
    pub vert: Option<ShaderStageDesc>,
    pub tesc: Option<ShaderStageDesc>,
    pub tese: Option<ShaderStageDesc>,
    pub geom: Option<ShaderStageDesc>,
    pub frag: Option<ShaderStageDesc>,
    pub comp: Option<ShaderStageDesc>,
}

impl ShaderProgramDesc {
    pub fn graphics(vert: ShaderStageDesc, frag: ShaderStageDesc) -> Self {
        Self {
            vert: Some(vert),
            frag: Some(frag),
            ..Self::default()
        }
    }

    pub fn compute(comp: ShaderStageDesc) -> Self {
        Self {
            comp: Some(comp),
            ..Self::default()
        }
    }

    pub fn stages(&self) -> ShaderStages {
        let mut stages = ShaderStages::empty();
        for (present, stage) in [
            (self.vert.is_some(), ShaderStages::VERT),
            (self.tesc.is_some(), ShaderStages::TESC),
            (self.tese.is_some(), ShaderStages::TESE),
            (self.geom.is_some(), ShaderStages::GEOM),
            (self.frag.is_some(), ShaderStages::FRAG),
            (self.comp.is_some(), ShaderStages::COMP),
        ] {
            if present {
                stages |= stage;
            }
        }
        stages
    }

    /// Present stages, in pipeline order
    pub fn iter(&self) -> impl Iterator<Item = (ShaderStages, &ShaderStageDesc)> {
        [
            (ShaderStages::VERT, self.vert.as_ref()),
            (ShaderStages::TESC, self.tesc.as_ref()),
            (ShaderStages::TESE, self.tese.as_ref()),
            (ShaderStages::GEOM, self.geom.as_ref()),
            (ShaderStages::FRAG, self.frag.as_ref()),
            (ShaderStages::COMP, self.comp.as_ref()),
        ]
        .into_iter()
        .filter_map(|(stage, desc)| desc.map(|d| (stage, d)))
    }

    /// Stage combinations every backend can build a pipeline from
    pub fn validate(&self) -> Result<()> {
        let stages = self.stages();
        if stages.is_empty() {
            bail!("Shader program has no stages");
        }
        if stages.contains(ShaderStages::COMP) && stages.intersects(ShaderStages::ALL_GRAPHICS) {
            bail!("Compute stage cannot be combined with graphics stages");
        }
        if stages.intersects(ShaderStages::ALL_GRAPHICS) && !stages.contains(ShaderStages::VERT) {
            bail!("Graphics shader program requires a vertex stage");
        }
        if stages.contains(ShaderStages::TESC) != stages.contains(ShaderStages::TESE) {
            bail!("Tessellation requires both control and evaluation stages");
        }
        for (stage, desc) in self.iter() {
            if desc.entry_point.is_empty() {
                bail!("Empty entry point for stage {:?}", stage);
            }
        }
        Ok(())
    }
}

pub struct ShaderProgram {
    device: Arc<Device>,
    key: ShaderKey,
    stages: ShaderStages,
    content_hash: u64,
}

impl ShaderProgram {
    pub fn new(device: &Arc<Device>, desc: &ShaderProgramDesc) -> Result<Self> {
        desc.validate()?;
        let key = device
            .backend()
            .create_shader_program(desc)
            .with_context(|| format!("Failed to create shader program ({:?})", desc.stages()))?;

        let content_hash = {
            let mut hasher = DefaultHasher::new();
            desc.hash(&mut hasher);
            hasher.finish()
        };

        Ok(Self {
            device: device.clone(),
            key,
            stages: desc.stages(),
            content_hash,
        })
    }

    pub fn key(&self) -> ShaderKey {
        self.key
    }

    pub fn stages(&self) -> ShaderStages {
        self.stages
    }

    pub fn is_compute(&self) -> bool {
        self.stages.contains(ShaderStages::COMP)
    }

    pub fn has_tessellation(&self) -> bool {
        self.stages.contains(ShaderStages::TESC)
    }

    pub(crate) fn content_hash(&self) -> u64 {
        self.content_hash
    }
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        self.device.backend().destroy_shader_program(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage() -> ShaderStageDesc {
        ShaderStageDesc::new(ShaderCode::Hlsl("float4 main() : SV_Target { return 0; }".into()), "main")
    }

    #[test]
    fn spirv_requires_magic_and_word_size() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0, 1, 0]);
        assert!(matches!(ShaderCode::spirv_from_bytes(&bytes), Ok(ShaderCode::SpirV(w)) if w.len() == 2));
        assert!(ShaderCode::spirv_from_bytes(&bytes[..5]).is_err());
        assert!(ShaderCode::spirv_from_bytes(&[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn stage_combinations() {
        assert!(ShaderProgramDesc::graphics(stage(), stage()).validate().is_ok());
        assert!(ShaderProgramDesc::compute(stage()).validate().is_ok());
        assert!(ShaderProgramDesc::default().validate().is_err());

        let mixed = ShaderProgramDesc {
            comp: Some(stage()),
            ..ShaderProgramDesc::graphics(stage(), stage())
        };
        assert!(mixed.validate().is_err());

        let half_tess = ShaderProgramDesc {
            tesc: Some(stage()),
            ..ShaderProgramDesc::graphics(stage(), stage())
        };
        assert!(half_tess.validate().is_err());

        let no_vertex = ShaderProgramDesc {
            frag: Some(stage()),
            ..ShaderProgramDesc::default()
        };
        assert!(no_vertex.validate().is_err());
    }
}
