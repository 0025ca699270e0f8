// Backend-neutral pixel / vertex formats
//
// The native conversions live next to each backend (`backend::vulkan::conv`,
// `backend::d3d12::conv`); this table only knows sizes and layouts.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Format {
    #[default]
    Undefined,
    // 1 channel
    R8Unorm,
    R16Unorm,
    R16Float,
    R32Uint,
    R32Float,
    // 2 channel
    R8G8Unorm,
    R16G16Unorm,
    R16G16Float,
    R32G32Uint,
    R32G32Float,
    // 3 channel
    R8G8B8Unorm,
    R16G16B16Unorm,
    R16G16B16Float,
    R32G32B32Uint,
    R32G32B32Float,
    // 4 channel
    B8G8R8A8Unorm,
    R8G8B8A8Unorm,
    R16G16B16A16Unorm,
    R16G16B16A16Float,
    R32G32B32A32Uint,
    R32G32B32A32Float,
    // Depth/stencil
    D16Unorm,
    X8D24UnormPack32,
    D32Float,
    S8Uint,
    D16UnormS8Uint,
    D24UnormS8Uint,
    D32FloatS8Uint,
}

/// How a single channel is stored in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Unorm8,
    Unorm16,
    Float16,
    Uint32,
    Float32,
}

impl Format {
    pub const ALL: [Format; 29] = [
        Format::Undefined,
        Format::R8Unorm,
        Format::R16Unorm,
        Format::R16Float,
        Format::R32Uint,
        Format::R32Float,
        Format::R8G8Unorm,
        Format::R16G16Unorm,
        Format::R16G16Float,
        Format::R32G32Uint,
        Format::R32G32Float,
        Format::R8G8B8Unorm,
        Format::R16G16B16Unorm,
        Format::R16G16B16Float,
        Format::R32G32B32Uint,
        Format::R32G32B32Float,
        Format::B8G8R8A8Unorm,
        Format::R8G8B8A8Unorm,
        Format::R16G16B16A16Unorm,
        Format::R16G16B16A16Float,
        Format::R32G32B32A32Uint,
        Format::R32G32B32A32Float,
        Format::D16Unorm,
        Format::X8D24UnormPack32,
        Format::D32Float,
        Format::S8Uint,
        Format::D16UnormS8Uint,
        Format::D24UnormS8Uint,
        Format::D32FloatS8Uint,
    ];

    /// Lowercase name as written in config files, e.g. `r8g8b8a8_unorm`
    pub fn name(self) -> &'static str {
        use Format::*;
        match self {
            Undefined => "undefined",
            R8Unorm => "r8_unorm",
            R16Unorm => "r16_unorm",
            R16Float => "r16_float",
            R32Uint => "r32_uint",
            R32Float => "r32_float",
            R8G8Unorm => "r8g8_unorm",
            R16G16Unorm => "r16g16_unorm",
            R16G16Float => "r16g16_float",
            R32G32Uint => "r32g32_uint",
            R32G32Float => "r32g32_float",
            R8G8B8Unorm => "r8g8b8_unorm",
            R16G16B16Unorm => "r16g16b16_unorm",
            R16G16B16Float => "r16g16b16_float",
            R32G32B32Uint => "r32g32b32_uint",
            R32G32B32Float => "r32g32b32_float",
            B8G8R8A8Unorm => "b8g8r8a8_unorm",
            R8G8B8A8Unorm => "r8g8b8a8_unorm",
            R16G16B16A16Unorm => "r16g16b16a16_unorm",
            R16G16B16A16Float => "r16g16b16a16_float",
            R32G32B32A32Uint => "r32g32b32a32_uint",
            R32G32B32A32Float => "r32g32b32a32_float",
            D16Unorm => "d16_unorm",
            X8D24UnormPack32 => "x8_d24_unorm_pack32",
            D32Float => "d32_float",
            S8Uint => "s8_uint",
            D16UnormS8Uint => "d16_unorm_s8_uint",
            D24UnormS8Uint => "d24_unorm_s8_uint",
            D32FloatS8Uint => "d32_float_s8_uint",
        }
    }

    /// Size in bytes of one texel / vertex element
    pub fn stride(self) -> u32 {
        use Format::*;
        match self {
            Undefined => 0,
            R8Unorm | S8Uint => 1,
            R16Unorm | R16Float | R8G8Unorm | D16Unorm => 2,
            R8G8B8Unorm | D16UnormS8Uint => 3,
            R32Uint | R32Float | R16G16Unorm | R16G16Float | B8G8R8A8Unorm | R8G8B8A8Unorm => 4,
            X8D24UnormPack32 | D32Float | D24UnormS8Uint => 4,
            R16G16B16Unorm | R16G16B16Float => 6,
            R32G32Uint | R32G32Float | R16G16B16A16Unorm | R16G16B16A16Float => 8,
            D32FloatS8Uint => 8,
            R32G32B32Uint | R32G32B32Float => 12,
            R32G32B32A32Uint | R32G32B32A32Float => 16,
        }
    }

    pub fn channel_count(self) -> u32 {
        use Format::*;
        match self {
            Undefined => 0,
            R8Unorm | R16Unorm | R16Float | R32Uint | R32Float => 1,
            D16Unorm | X8D24UnormPack32 | D32Float | S8Uint => 1,
            R8G8Unorm | R16G16Unorm | R16G16Float | R32G32Uint | R32G32Float => 2,
            D16UnormS8Uint | D24UnormS8Uint | D32FloatS8Uint => 2,
            R8G8B8Unorm | R16G16B16Unorm | R16G16B16Float | R32G32B32Uint | R32G32B32Float => 3,
            B8G8R8A8Unorm | R8G8B8A8Unorm | R16G16B16A16Unorm | R16G16B16A16Float => 4,
            R32G32B32A32Uint | R32G32B32A32Float => 4,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Format::D16Unorm
                | Format::X8D24UnormPack32
                | Format::D32Float
                | Format::D16UnormS8Uint
                | Format::D24UnormS8Uint
                | Format::D32FloatS8Uint
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            Format::S8Uint | Format::D16UnormS8Uint | Format::D24UnormS8Uint | Format::D32FloatS8Uint
        )
    }

    pub fn is_depth_stencil(self) -> bool {
        self.is_depth() || self.has_stencil()
    }

    /// Per-channel storage of color formats; `None` for depth/stencil and undefined
    pub fn channel_kind(self) -> Option<ChannelKind> {
        use Format::*;
        match self {
            R8Unorm | R8G8Unorm | R8G8B8Unorm | B8G8R8A8Unorm | R8G8B8A8Unorm => Some(ChannelKind::Unorm8),
            R16Unorm | R16G16Unorm | R16G16B16Unorm | R16G16B16A16Unorm => Some(ChannelKind::Unorm16),
            R16Float | R16G16Float | R16G16B16Float | R16G16B16A16Float => Some(ChannelKind::Float16),
            R32Uint | R32G32Uint | R32G32B32Uint | R32G32B32A32Uint => Some(ChannelKind::Uint32),
            R32Float | R32G32Float | R32G32B32Float | R32G32B32A32Float => Some(ChannelKind::Float32),
            _ => None,
        }
    }

    /// Whether the format may feed a vertex attribute on both native backends
    pub fn is_vertex_format(self) -> bool {
        !matches!(self, Format::Undefined | Format::R8G8B8Unorm | Format::R16G16B16Unorm | Format::R16G16B16Float)
            && !self.is_depth_stencil()
    }

    /// Channel order is BGRA rather than RGBA
    pub fn is_bgra(self) -> bool {
        self == Format::B8G8R8A8Unorm
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Format::ALL
            .iter()
            .copied()
            .find(|format| format.name() == lower)
            .ok_or_else(|| format!("unknown format '{}'", s))
    }
}

impl TryFrom<String> for Format {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_channels_times_channel_size_for_color_formats() {
        for format in Format::ALL {
            let Some(kind) = format.channel_kind() else { continue };
            let channel_size = match kind {
                ChannelKind::Unorm8 => 1,
                ChannelKind::Unorm16 | ChannelKind::Float16 => 2,
                ChannelKind::Uint32 | ChannelKind::Float32 => 4,
            };
            assert_eq!(format.stride(), format.channel_count() * channel_size, "{:?}", format);
        }
    }

    #[test]
    fn depth_predicates() {
        assert!(Format::D32Float.is_depth());
        assert!(!Format::D32Float.has_stencil());
        assert!(Format::D24UnormS8Uint.is_depth() && Format::D24UnormS8Uint.has_stencil());
        assert!(Format::S8Uint.is_depth_stencil() && !Format::S8Uint.is_depth());
        assert!(!Format::R8G8B8A8Unorm.is_depth_stencil());
    }

    #[test]
    fn vertex_formats_exclude_unaligned_three_channel_small_types() {
        assert!(Format::R32G32B32Float.is_vertex_format());
        assert!(Format::R8G8B8A8Unorm.is_vertex_format());
        assert!(!Format::R8G8B8Unorm.is_vertex_format());
        assert!(!Format::D32Float.is_vertex_format());
        assert!(!Format::Undefined.is_vertex_format());
    }

    #[test]
    fn names_round_trip() {
        for format in Format::ALL {
            assert_eq!(format.name().parse::<Format>(), Ok(format));
        }
        assert!("r9_unorm".parse::<Format>().is_err());
    }

    #[test]
    fn parses_from_config_name() {
        #[derive(Deserialize)]
        struct Wrapper {
            format: Format,
        }
        let parsed: Wrapper = toml::from_str("format = \"b8g8r8a8_unorm\"").unwrap();
        assert_eq!(parsed.format, Format::B8G8R8A8Unorm);
    }
}
