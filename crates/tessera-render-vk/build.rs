// SPDX-License-Identifier: CEPL-1.0
use std::error::Error;
use std::{env, fs, path::PathBuf};

// Vertex layouts must match `pipeline.rs`:
//   scene:     binding 0 = Vertex { position, color, tex_coord }, binding 1 = InstanceData { pos }
//   glass:     binding 0 = TransparentVertex { position, rgba, tex_coord }, binding 1 = InstanceData { pos }
//   wireframe: binding 0 = WireframeVertex { position },          binding 1 = InstanceData { pos }
//   overlay:   binding 0 = OverlayVertex { position, color, tex_coord, tex_id }

const SCENE_VERT: &str = r#"
#version 450
layout(location = 0) in vec3 inPosition;
layout(location = 1) in vec3 inColor;
layout(location = 2) in vec3 inTexCoord;
layout(location = 3) in vec3 inInstancePos;

layout(set = 0, binding = 0) uniform Scene {
    mat4 model;
    mat4 view;
    mat4 projection;
    vec4 tint;
} u;

layout(location = 0) out vec3 vColor;
layout(location = 1) out vec3 vTexCoord;

void main() {
    vColor = inColor * u.tint.rgb;
    vTexCoord = inTexCoord;
    gl_Position = u.projection * u.view * u.model * vec4(inPosition + inInstancePos, 1.0);
}
"#;

const SCENE_FRAG: &str = r#"
#version 450
layout(location = 0) in vec3 vColor;
layout(location = 1) in vec3 vTexCoord;

layout(set = 0, binding = 1) uniform sampler2DArray layers;

layout(location = 0) out vec4 outColor;

void main() {
    vec4 texel = texture(layers, vTexCoord);
    if (texel.a < 0.5) {
        discard;
    }
    outColor = vec4(texel.rgb * vColor, 1.0);
}
"#;

const GLASS_VERT: &str = r#"
#version 450
layout(location = 0) in vec3 inPosition;
layout(location = 1) in vec4 inColor;
layout(location = 2) in vec3 inTexCoord;
layout(location = 3) in vec3 inInstancePos;

layout(set = 0, binding = 0) uniform Scene {
    mat4 model;
    mat4 view;
    mat4 projection;
    vec4 tint;
} u;

layout(location = 0) out vec4 vColor;
layout(location = 1) out vec3 vTexCoord;

void main() {
    vColor = vec4(inColor.rgb * u.tint.rgb, inColor.a);
    vTexCoord = inTexCoord;
    gl_Position = u.projection * u.view * u.model * vec4(inPosition + inInstancePos, 1.0);
}
"#;

const GLASS_FRAG: &str = r#"
#version 450
layout(location = 0) in vec4 vColor;
layout(location = 1) in vec3 vTexCoord;

layout(set = 0, binding = 1) uniform sampler2DArray layers;

layout(location = 0) out vec4 outColor;

void main() {
    outColor = texture(layers, vTexCoord) * vColor;
}
"#;

const WIREFRAME_VERT: &str = r#"
#version 450
layout(location = 0) in vec3 inPosition;
layout(location = 1) in vec3 inInstancePos;

layout(set = 0, binding = 0) uniform Scene {
    mat4 model;
    mat4 view;
    mat4 projection;
    vec4 tint;
} u;

layout(location = 0) out vec3 vColor;

void main() {
    vColor = u.tint.rgb;
    gl_Position = u.projection * u.view * u.model * vec4(inPosition + inInstancePos, 1.0);
}
"#;

const WIREFRAME_FRAG: &str = r#"
#version 450
layout(location = 0) in vec3 vColor;
layout(location = 0) out vec4 outColor;

void main() {
    outColor = vec4(vColor, 1.0);
}
"#;

// Overlay positions are in bounds units; (0, 0) is the bottom-left corner.
const OVERLAY_VERT: &str = r#"
#version 450
layout(location = 0) in vec3 inPosition;
layout(location = 1) in vec3 inColor;
layout(location = 2) in vec2 inTexCoord;
layout(location = 3) in uint inTexId;

layout(set = 0, binding = 0) uniform Overlay { vec4 bounds; } u;

layout(location = 0) out vec3 vColor;
layout(location = 1) out vec2 vTexCoord;
layout(location = 2) flat out uint vTexId;

void main() {
    vColor = inColor;
    vTexCoord = inTexCoord;
    vTexId = inTexId;
    vec3 ndc = inPosition / u.bounds.xyz;
    gl_Position = vec4(ndc.xy * 2.0 - 1.0, clamp(ndc.z, 0.0, 1.0), 1.0);
}
"#;

const OVERLAY_FRAG: &str = r#"
#version 450
#extension GL_EXT_nonuniform_qualifier : require

layout(constant_id = 0) const uint TEXTURE_CAPACITY = 32;

layout(location = 0) in vec3 vColor;
layout(location = 1) in vec2 vTexCoord;
layout(location = 2) flat in uint vTexId;

layout(set = 0, binding = 1) uniform sampler2D textures[TEXTURE_CAPACITY];

layout(location = 0) out vec4 outColor;

void main() {
    vec4 texel = texture(textures[nonuniformEXT(min(vTexId, TEXTURE_CAPACITY - 1))], vTexCoord);
    outColor = texel * vec4(vColor, 1.0);
}
"#;

fn main() -> Result<(), Box<dyn Error>> {
    let out = PathBuf::from(env::var("OUT_DIR")?);

    let comp = shaderc::Compiler::new()?;
    let mut opts = shaderc::CompileOptions::new()?;
    // descriptor indexing in the overlay shader needs 1.2 semantics
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_2 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let shaders = [
        ("scene.vert", SCENE_VERT, shaderc::ShaderKind::Vertex),
        ("scene.frag", SCENE_FRAG, shaderc::ShaderKind::Fragment),
        ("glass.vert", GLASS_VERT, shaderc::ShaderKind::Vertex),
        ("glass.frag", GLASS_FRAG, shaderc::ShaderKind::Fragment),
        ("wireframe.vert", WIREFRAME_VERT, shaderc::ShaderKind::Vertex),
        ("wireframe.frag", WIREFRAME_FRAG, shaderc::ShaderKind::Fragment),
        ("overlay.vert", OVERLAY_VERT, shaderc::ShaderKind::Vertex),
        ("overlay.frag", OVERLAY_FRAG, shaderc::ShaderKind::Fragment),
    ];

    for (name, src, kind) in shaders {
        let spv = comp.compile_into_spirv(src, kind, name, "main", Some(&opts))?;
        fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8())?;
    }

    println!("cargo:rerun-if-changed=build.rs");
    Ok(())
}
