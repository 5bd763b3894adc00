// Full-screen quad sampling an external texture

use super::RendererError;
use glow::HasContext;

pub const TEXTURE_EXTERNAL_OES: u32 = 0x8D65;

const VERTEX_SHADER: &str = r#"#version 300 es
layout(location = 0) in vec2 a_position;
layout(location = 1) in vec2 a_uv;
out vec2 v_uv;
void main() {
    v_uv = a_uv;
    gl_Position = vec4(a_position, 0.0, 1.0);
}
"#;

const FRAGMENT_SHADER: &str = r#"#version 300 es
#extension GL_OES_EGL_image_external_essl3 : require
precision mediump float;
uniform samplerExternalOES u_frame;
in vec2 v_uv;
out vec4 frag_color;
void main() {
    frag_color = texture(u_frame, v_uv);
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 2],
    uv: [f32; 2],
}

/// Triangle strip covering clip space. Frame row 0 is at the top.
const VERTICES: [Vertex; 4] = [
    Vertex { position: [-1.0, -1.0], uv: [0.0, 1.0] },
    Vertex { position: [1.0, -1.0], uv: [1.0, 1.0] },
    Vertex { position: [-1.0, 1.0], uv: [0.0, 0.0] },
    Vertex { position: [1.0, 1.0], uv: [1.0, 0.0] },
];

unsafe fn compile_shader(gl: &glow::Context, kind: u32, source: &str) -> Result<glow::NativeShader, RendererError> {
    unsafe {
        let shader = gl
            .create_shader(kind)
            .map_err(|e| RendererError::InitError(format!("create_shader failed: {}", e)))?;
        gl.shader_source(shader, source);
        gl.compile_shader(shader);
        if !gl.get_shader_compile_status(shader) {
            let log = gl.get_shader_info_log(shader);
            gl.delete_shader(shader);
            return Err(RendererError::InitError(format!("Shader compile failed: {}", log)));
        }
        Ok(shader)
    }
}

unsafe fn link_program(gl: &glow::Context) -> Result<glow::NativeProgram, RendererError> {
    unsafe {
        let vs = compile_shader(gl, glow::VERTEX_SHADER, VERTEX_SHADER)?;
        let fs = match compile_shader(gl, glow::FRAGMENT_SHADER, FRAGMENT_SHADER) {
            Ok(fs) => fs,
            Err(e) => {
                gl.delete_shader(vs);
                return Err(e);
            }
        };

        let program = gl
            .create_program()
            .map_err(|e| RendererError::InitError(format!("create_program failed: {}", e)))?;
        gl.attach_shader(program, vs);
        gl.attach_shader(program, fs);
        gl.link_program(program);
        gl.detach_shader(program, vs);
        gl.detach_shader(program, fs);
        gl.delete_shader(vs);
        gl.delete_shader(fs);

        if !gl.get_program_link_status(program) {
            let log = gl.get_program_info_log(program);
            gl.delete_program(program);
            return Err(RendererError::InitError(format!("Program link failed: {}", log)));
        }
        Ok(program)
    }
}

pub struct QuadRenderer {
    program: glow::NativeProgram,
    vao: glow::NativeVertexArray,
    vbo: glow::NativeBuffer,
}

impl QuadRenderer {
    /// # Safety
    /// `gl` must be current on the calling thread.
    pub unsafe fn new(gl: &glow::Context) -> Result<Self, RendererError> {
        unsafe {
            let program = link_program(gl)?;

            let vao = gl
                .create_vertex_array()
                .map_err(|e| RendererError::InitError(format!("create_vertex_array failed: {}", e)))?;
            let vbo = gl
                .create_buffer()
                .map_err(|e| RendererError::InitError(format!("create_buffer failed: {}", e)))?;

            gl.bind_vertex_array(Some(vao));
            gl.bind_buffer(glow::ARRAY_BUFFER, Some(vbo));
            gl.buffer_data_u8_slice(
                glow::ARRAY_BUFFER,
                bytemuck::cast_slice(&VERTICES),
                glow::STATIC_DRAW,
            );

            let stride = std::mem::size_of::<Vertex>() as i32;
            gl.enable_vertex_attrib_array(0);
            gl.vertex_attrib_pointer_f32(0, 2, glow::FLOAT, false, stride, 0);
            gl.enable_vertex_attrib_array(1);
            gl.vertex_attrib_pointer_f32(1, 2, glow::FLOAT, false, stride, 8);
            gl.bind_vertex_array(None);

            gl.use_program(Some(program));
            let sampler = gl.get_uniform_location(program, "u_frame");
            gl.uniform_1_i32(sampler.as_ref(), 0);
            gl.use_program(None);

            Ok(Self { program, vao, vbo })
        }
    }

    /// # Safety
    /// `gl` must be current and `texture` a live external texture.
    pub unsafe fn draw(&self, gl: &glow::Context, texture: glow::NativeTexture, width: u32, height: u32) {
        unsafe {
            gl.viewport(0, 0, width as i32, height as i32);
            gl.clear_color(0.0, 0.0, 0.0, 1.0);
            gl.clear(glow::COLOR_BUFFER_BIT);

            gl.use_program(Some(self.program));
            gl.active_texture(glow::TEXTURE0);
            gl.bind_texture(TEXTURE_EXTERNAL_OES, Some(texture));
            gl.bind_vertex_array(Some(self.vao));
            gl.draw_arrays(glow::TRIANGLE_STRIP, 0, VERTICES.len() as i32);
            gl.bind_vertex_array(None);
            gl.bind_texture(TEXTURE_EXTERNAL_OES, None);
        }
    }

    /// # Safety
    /// `gl` must be current.
    pub unsafe fn destroy(&self, gl: &glow::Context) {
        unsafe {
            gl.delete_buffer(self.vbo);
            gl.delete_vertex_array(self.vao);
            gl.delete_program(self.program);
        }
    }
}
