// Asset loading
//
// Everything the GPU side consumes from disk: a deduplicated triangle mesh,
// an RGBA8 texture and two SPIR-V blobs. Parsing is delegated to tobj and
// image; this module only shapes their output into flat arrays.

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::collections::HashMap;
use std::path::Path;

use crate::error::SetupError;

/// One interleaved vertex record as laid out in the vertex buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: Vec3,
    pub color: Vec3,
    pub tex_coord: Vec2,
}

impl Vertex {
    pub const fn new(pos: Vec3, color: Vec3, tex_coord: Vec2) -> Self {
        Self {
            pos,
            color,
            tex_coord,
        }
    }

    /// Bit pattern of every attribute. Two vertices are the same vertex
    /// exactly when their keys match.
    fn key(&self) -> [u32; 8] {
        [
            self.pos.x.to_bits(),
            self.pos.y.to_bits(),
            self.pos.z.to_bits(),
            self.color.x.to_bits(),
            self.color.y.to_bits(),
            self.color.z.to_bits(),
            self.tex_coord.x.to_bits(),
            self.tex_coord.y.to_bits(),
        ]
    }
}

/// Indexed triangle list ready for upload.
#[derive(Debug, Default, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Build an indexed mesh from a flat, unindexed vertex stream. Identical
    /// vertices are stored once and referenced by every index that uses them.
    pub fn from_vertices<I>(stream: I) -> Self
    where
        I: IntoIterator<Item = Vertex>,
    {
        let mut mesh = Mesh::default();
        let mut unique: HashMap<[u32; 8], u32> = HashMap::new();

        for vertex in stream {
            let index = *unique.entry(vertex.key()).or_insert_with(|| {
                mesh.vertices.push(vertex);
                (mesh.vertices.len() - 1) as u32
            });
            mesh.indices.push(index);
        }

        mesh
    }

    /// Load a Wavefront OBJ file. All shapes in the file are merged into one
    /// mesh; vertex color is white and V is flipped to Vulkan's convention.
    pub fn load_obj<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let (models, _materials) = tobj::load_obj(
            path,
            &tobj::LoadOptions {
                triangulate: true,
                single_index: true,
                ..Default::default()
            },
        )
        .with_context(|| format!("Failed to load model {:?}", path))?;

        let stream = models.iter().flat_map(|model| {
            let mesh = &model.mesh;
            mesh.indices.iter().map(move |&index| {
                let i = index as usize;
                let pos = Vec3::new(
                    mesh.positions[3 * i],
                    mesh.positions[3 * i + 1],
                    mesh.positions[3 * i + 2],
                );
                let tex_coord = if mesh.texcoords.len() >= 2 * i + 2 {
                    Vec2::new(mesh.texcoords[2 * i], 1.0 - mesh.texcoords[2 * i + 1])
                } else {
                    Vec2::ZERO
                };
                Vertex::new(pos, Vec3::ONE, tex_coord)
            })
        });

        let mesh = Self::from_vertices(stream);
        log::info!(
            "Loaded model {:?}: {} unique vertices, {} indices",
            path,
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(mesh)
    }

    /// A mesh without triangles would reach the GPU as zero-sized buffers.
    pub fn ensure_drawable(&self) -> Result<(), SetupError> {
        if self.indices.is_empty() || self.vertices.is_empty() {
            return Err(SetupError::EmptyAsset("model"));
        }
        Ok(())
    }
}

/// Decoded RGBA8 pixels.
pub struct TexturePixels {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl TexturePixels {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let img = image::open(path)
            .with_context(|| format!("Failed to open texture {:?}", path))?
            .into_rgba8();
        let (width, height) = img.dimensions();
        log::info!("Loaded texture {:?}: {}x{}", path, width, height);

        Ok(Self {
            width,
            height,
            rgba: img.into_raw(),
        })
    }

    pub fn ensure_drawable(&self) -> Result<(), SetupError> {
        if self.width == 0 || self.height == 0 || self.rgba.is_empty() {
            return Err(SetupError::EmptyAsset("texture"));
        }
        Ok(())
    }
}

/// Raw SPIR-V bytes. Validation happens when the module is created.
pub struct ShaderBytecode(pub Vec<u8>);

impl ShaderBytecode {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read shader {:?}", path))?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: f32, y: f32, u: f32) -> Vertex {
        Vertex::new(Vec3::new(x, y, 0.0), Vec3::ONE, Vec2::new(u, 0.0))
    }

    #[test]
    fn identical_vertices_share_one_entry() {
        let mesh = Mesh::from_vertices([v(0.0, 0.0, 0.5), v(0.0, 0.0, 0.5)]);
        assert_eq!(mesh.vertices.len(), 1);
        assert_eq!(mesh.indices, vec![0, 0]);
    }

    #[test]
    fn quad_from_two_triangles_has_four_vertices() {
        let a = v(0.0, 0.0, 0.0);
        let b = v(1.0, 0.0, 1.0);
        let c = v(1.0, 1.0, 1.0);
        let d = v(0.0, 1.0, 0.0);
        let mesh = Mesh::from_vertices([a, b, c, c, d, a]);

        assert_eq!(mesh.vertices, vec![a, b, c, d]);
        assert_eq!(mesh.indices, vec![0, 1, 2, 2, 3, 0]);
    }

    #[test]
    fn any_differing_attribute_keeps_vertices_apart() {
        let base = v(0.0, 0.0, 0.0);
        let mut recolored = base;
        recolored.color = Vec3::new(1.0, 0.0, 0.0);
        let mut retextured = base;
        retextured.tex_coord = Vec2::new(0.0, 1.0);

        let mesh = Mesh::from_vertices([base, recolored, retextured]);
        assert_eq!(mesh.vertices.len(), 3);
        assert_eq!(mesh.indices, vec![0, 1, 2]);
    }

    #[test]
    fn signed_zero_is_a_distinct_attribute() {
        let mesh = Mesh::from_vertices([v(0.0, 0.0, 0.0), v(-0.0, 0.0, 0.0)]);
        assert_eq!(mesh.vertices.len(), 2);
    }

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 32);
        assert_eq!(std::mem::offset_of!(Vertex, color), 12);
        assert_eq!(std::mem::offset_of!(Vertex, tex_coord), 24);
    }

    #[test]
    fn obj_faces_are_deduplicated() {
        let dir = std::env::temp_dir().join(format!("mip-renderer-obj-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("quad.obj");
        std::fs::write(
            &path,
            "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\n\
             vt 0 0\nvt 1 0\nvt 1 1\nvt 0 1\n\
             f 1/1 2/2 3/3\nf 3/3 4/4 1/1\n",
        )
        .unwrap();

        let mesh = Mesh::load_obj(&path).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        assert_eq!(mesh.indices[0], mesh.indices[5]);
        // V is flipped for Vulkan.
        assert_eq!(mesh.vertices[0].tex_coord, Vec2::new(0.0, 1.0));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn obj_without_faces_is_rejected() {
        let dir = std::env::temp_dir().join(format!("mip-renderer-noface-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("points.obj");
        std::fs::write(&path, "v 0 0 0\nv 1 0 0\nv 1 1 0\n").unwrap();

        let mesh = Mesh::load_obj(&path).unwrap();
        assert!(mesh.indices.is_empty());
        assert!(matches!(
            mesh.ensure_drawable(),
            Err(SetupError::EmptyAsset("model"))
        ));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn single_triangle_is_drawable() {
        let mesh = Mesh::from_vertices([v(0.0, 0.0, 0.0), v(1.0, 0.0, 1.0), v(1.0, 1.0, 1.0)]);
        assert!(mesh.ensure_drawable().is_ok());
    }

    #[test]
    fn zero_area_texture_is_rejected() {
        let empty = TexturePixels {
            width: 0,
            height: 4,
            rgba: Vec::new(),
        };
        assert!(matches!(
            empty.ensure_drawable(),
            Err(SetupError::EmptyAsset("texture"))
        ));

        let pixel = TexturePixels {
            width: 1,
            height: 1,
            rgba: vec![255; 4],
        };
        assert!(pixel.ensure_drawable().is_ok());
    }

    #[test]
    fn missing_shader_file_is_an_error() {
        assert!(ShaderBytecode::load("definitely/not/here.spv").is_err());
    }
}
