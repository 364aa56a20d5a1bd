//! The renderer contract consumed by the core.
//!
//! Pixel work happens elsewhere; the core produces damage, texture handles
//! and element lists and hands them across this trait. A headless
//! [`NullRenderer`] backs tests and the default binary.

use crate::buffer::ShmFormat;
use crate::geometry::{Point, Rectangle, Region, Size};
use crate::surface::SurfaceId;
use std::collections::HashMap;
use std::os::fd::RawFd;
use thiserror::Error;

/// Stable identifier of an uploaded texture, usable as a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("texture upload failed: {0}")]
    Upload(String),
    #[error("frame submission failed: {0}")]
    Submit(String),
    #[error("unknown texture {0}")]
    UnknownTexture(u64),
}

/// Pixels for an SHM upload.
pub struct ShmTextureSource<'a> {
    pub size: Size<i32>,
    pub stride: i32,
    pub format: ShmFormat,
    pub data: &'a [u8],
}

/// Attributes of a dmabuf import. The fds are borrowed for the call.
#[derive(Debug)]
pub struct DmabufAttributes {
    pub size: Size<i32>,
    pub fourcc: u32,
    pub modifier: u64,
    pub planes: Vec<DmabufPlane>,
}

#[derive(Debug)]
pub struct DmabufPlane {
    pub fd: RawFd,
    pub offset: u32,
    pub stride: u32,
}

/// One element of a frame, back to front.
#[derive(Debug)]
pub enum RenderElement {
    Surface {
        surface: SurfaceId,
        /// `None` when the backing buffer died mid-frame; the renderer
        /// skips the element rather than crashing.
        texture: Option<TextureId>,
        position: Point<i32>,
        damage: Region,
    },
    Solid {
        rect: Rectangle<i32>,
        color: [f32; 4],
    },
    Cursor {
        texture: Option<TextureId>,
        position: Point<i32>,
        hotspot: Point<i32>,
    },
}

/// What a texture exposes to consumers.
pub trait Texture {
    fn id(&self) -> TextureId;
    fn size(&self) -> Size<i32>;
    fn format(&self) -> ShmFormat;
    /// Bind to a shader slot for sampling.
    fn bind(&self, slot: u32);
}

/// Renderer capability consumed by the core. Submission is non-blocking;
/// GPU work may proceed on the implementation's own threads.
pub trait Renderer {
    fn create_texture_from_shm(
        &mut self,
        source: ShmTextureSource<'_>,
    ) -> Result<TextureId, RendererError>;

    fn create_texture_from_dmabuf(
        &mut self,
        attributes: &DmabufAttributes,
    ) -> Result<TextureId, RendererError>;

    fn destroy_texture(&mut self, texture: TextureId);

    fn texture(&self, texture: TextureId) -> Option<&dyn Texture>;

    /// Draw one output's frame from `elements` (back to front).
    fn render_frame(
        &mut self,
        elements: &[RenderElement],
        output_rect: Rectangle<i32>,
        scale: f64,
    ) -> Result<(), RendererError>;

    fn present_frame(&mut self) -> Result<(), RendererError>;

    fn screen_size(&self) -> Size<i32>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy)]
struct NullTexture {
    id: TextureId,
    size: Size<i32>,
    format: ShmFormat,
}

impl Texture for NullTexture {
    fn id(&self) -> TextureId {
        self.id
    }

    fn size(&self) -> Size<i32> {
        self.size
    }

    fn format(&self) -> ShmFormat {
        self.format
    }

    fn bind(&self, _slot: u32) {}
}

/// Headless renderer: accounts for textures and frames without touching a
/// GPU. Used by tests and by the binary when no display backend is wired.
#[derive(Debug, Default)]
pub struct NullRenderer {
    textures: HashMap<TextureId, NullTexture>,
    next_texture: u64,
    pub frames_rendered: u64,
    pub frames_presented: u64,
    pub last_element_count: usize,
    screen: Size<i32>,
}

impl NullRenderer {
    pub fn new(screen: Size<i32>) -> Self {
        Self {
            screen,
            ..Self::default()
        }
    }

    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }
}

impl Renderer for NullRenderer {
    fn create_texture_from_shm(
        &mut self,
        source: ShmTextureSource<'_>,
    ) -> Result<TextureId, RendererError> {
        let needed = source.stride as usize * source.size.h as usize;
        if source.data.len() < needed {
            return Err(RendererError::Upload(format!(
                "buffer holds {} bytes, needs {}",
                source.data.len(),
                needed
            )));
        }
        self.next_texture += 1;
        let id = TextureId(self.next_texture);
        self.textures.insert(
            id,
            NullTexture {
                id,
                size: source.size,
                format: source.format,
            },
        );
        Ok(id)
    }

    fn create_texture_from_dmabuf(
        &mut self,
        attributes: &DmabufAttributes,
    ) -> Result<TextureId, RendererError> {
        self.next_texture += 1;
        let id = TextureId(self.next_texture);
        self.textures.insert(
            id,
            NullTexture {
                id,
                size: attributes.size,
                format: ShmFormat::Argb8888,
            },
        );
        Ok(id)
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn texture(&self, texture: TextureId) -> Option<&dyn Texture> {
        self.textures.get(&texture).map(|t| t as &dyn Texture)
    }

    fn render_frame(
        &mut self,
        elements: &[RenderElement],
        _output_rect: Rectangle<i32>,
        _scale: f64,
    ) -> Result<(), RendererError> {
        self.frames_rendered += 1;
        self.last_element_count = elements.len();
        Ok(())
    }

    fn present_frame(&mut self) -> Result<(), RendererError> {
        self.frames_presented += 1;
        Ok(())
    }

    fn screen_size(&self) -> Size<i32> {
        self.screen
    }

    fn name(&self) -> &str {
        "null"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_upload_validates_length() {
        let mut renderer = NullRenderer::new(Size::new(1920, 1080));
        let data = vec![0u8; 16 * 16 * 4];
        let ok = renderer.create_texture_from_shm(ShmTextureSource {
            size: Size::new(16, 16),
            stride: 64,
            format: ShmFormat::Argb8888,
            data: &data,
        });
        assert!(ok.is_ok());

        let short = renderer.create_texture_from_shm(ShmTextureSource {
            size: Size::new(32, 32),
            stride: 128,
            format: ShmFormat::Argb8888,
            data: &data,
        });
        assert!(matches!(short, Err(RendererError::Upload(_))));
    }

    #[test]
    fn texture_lifecycle() {
        let mut renderer = NullRenderer::new(Size::new(800, 600));
        let data = vec![0u8; 4 * 4 * 4];
        let id = renderer
            .create_texture_from_shm(ShmTextureSource {
                size: Size::new(4, 4),
                stride: 16,
                format: ShmFormat::Xrgb8888,
                data: &data,
            })
            .unwrap();
        assert_eq!(renderer.texture(id).map(|t| t.size()), Some(Size::new(4, 4)));
        renderer.destroy_texture(id);
        assert!(renderer.texture(id).is_none());
    }
}
