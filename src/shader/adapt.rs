//! Rewrites desktop-style GLSL fragment shaders into the Vulkan dialect naga parses.
//!
//! Loose `uniform` declarations are gathered into one std140 block at binding 0,
//! `sampler2D iChannelN` becomes a `texture2D`/`sampler` pair at bindings
//! `1 + 2N` / `2 + 2N`, and stage inputs/outputs get explicit locations.

use super::uniforms::{UniformKind, UniformLayout, UniformSlot};
use crate::config::CHANNEL_COUNT;
use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use tracing::warn;

/// Binding index of the uniform block.
pub const UNIFORM_BINDING: u32 = 0;

/// Binding index of the texture for `channel`; the sampler follows it.
pub fn texture_binding(channel: usize) -> u32 {
    1 + 2 * channel as u32
}

/// A shader rewritten for naga, plus what the rewrite learned about it.
#[derive(Debug, Clone)]
pub struct AdaptedShader {
    pub glsl: String,
    /// Channels the shader declares a sampler for.
    pub channels: [bool; CHANNEL_COUNT],
    /// Initial values from `uniform float x = 1.0;` style declarations.
    pub defaults: Vec<(String, Vec<f32>)>,
}

struct Member {
    ty: &'static str,
    name: String,
}

/// Rewrites `source` (GLSL 330-style) into GLSL 450 with explicit bindings.
pub fn adapt_glsl(source: &str) -> Result<AdaptedShader> {
    let mut lines: Vec<String> = Vec::new();
    let mut members: Vec<Member> = Vec::new();
    let mut defaults = Vec::new();
    let mut channels = [false; CHANNEL_COUNT];
    let mut block_line: Option<usize> = None;
    let mut has_version = false;
    let mut in_location = 0u32;
    let mut out_location = 0u32;

    let source = strip_block_comments(source);
    for raw in source.lines() {
        let code = strip_line_comment(raw).trim();

        if code.starts_with("#version") {
            has_version = true;
            lines.push("#version 450".to_string());
            continue;
        }

        if let Some(decl) = code.strip_prefix("uniform ").and_then(|rest| rest.strip_suffix(';')) {
            if code.contains('{') {
                lines.push(raw.to_string());
                continue;
            }
            let decl = skip_precision(decl.trim());
            let (ty, names) = decl
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("Malformed uniform declaration: {}", code))?;
            let ty = ty.trim();
            if ty == "sampler2D" {
                for name in names.split(',').map(str::trim) {
                    lines.push(sampler_declaration(name, &mut channels)?);
                }
                continue;
            }
            let ty = block_type(ty).ok_or_else(|| anyhow!("Unsupported uniform type {:?} in: {}", ty, code))?;
            for declarator in split_top_level(names) {
                let (name, init) = match declarator.split_once('=') {
                    Some((name, init)) => (name.trim(), Some(init.trim())),
                    None => (declarator.trim(), None),
                };
                if !is_identifier(name) {
                    return Err(anyhow!("Malformed uniform name {:?} in: {}", name, code));
                }
                if let Some(init) = init {
                    match parse_initializer(init) {
                        Some(values) => defaults.push((name.to_string(), values)),
                        None => warn!("Ignoring non-literal initializer for uniform {}: {}", name, init),
                    }
                }
                members.push(Member { ty, name: name.to_string() });
            }
            if block_line.is_none() {
                block_line = Some(lines.len());
                lines.push(String::new());
            }
            continue;
        }

        if let Some(rest) = code.strip_prefix("in ") {
            lines.push(format!("layout(location = {}) in {}", in_location, rest));
            in_location += 1;
            continue;
        }
        if let Some(rest) = code.strip_prefix("out ") {
            lines.push(format!("layout(location = {}) out {}", out_location, rest));
            out_location += 1;
            continue;
        }

        lines.push(raw.to_string());
    }

    if let Some(index) = block_line {
        let mut block = format!("layout(set = 0, binding = {}, std140) uniform ShaderParams {{\n", UNIFORM_BINDING);
        for member in &members {
            block.push_str(&format!("    {} {};\n", member.ty, member.name));
        }
        block.push_str("};");
        lines[index] = block;
    }

    let mut glsl = String::new();
    if !has_version {
        glsl.push_str("#version 450\n");
    }
    glsl.push_str(&lines.join("\n"));
    glsl.push('\n');

    Ok(AdaptedShader { glsl, channels, defaults })
}

fn sampler_declaration(name: &str, channels: &mut [bool; CHANNEL_COUNT]) -> Result<String> {
    let channel = name
        .strip_prefix("iChannel")
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n < CHANNEL_COUNT)
        .ok_or_else(|| anyhow!("Unsupported sampler {:?}: only iChannel0..iChannel{} are bound", name, CHANNEL_COUNT - 1))?;
    channels[channel] = true;
    let binding = texture_binding(channel);
    Ok(format!(
        "layout(set = 0, binding = {tex}) uniform texture2D {name}_texture;\n\
         layout(set = 0, binding = {smp}) uniform sampler {name}_sampler;\n\
         #define {name} sampler2D({name}_texture, {name}_sampler)",
        tex = binding,
        smp = binding + 1,
        name = name
    ))
}

fn block_type(ty: &str) -> Option<&'static str> {
    Some(match ty {
        "float" => "float",
        "vec2" => "vec2",
        "vec3" => "vec3",
        "vec4" => "vec4",
        "int" => "int",
        "ivec2" => "ivec2",
        "ivec3" => "ivec3",
        "ivec4" => "ivec4",
        "uint" => "uint",
        "uvec2" => "uvec2",
        "uvec3" => "uvec3",
        "uvec4" => "uvec4",
        _ => return None,
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Splits on commas outside parentheses, so constructor initializers stay whole.
fn split_top_level(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (index, c) in list.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&list[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&list[start..]);
    parts
}

fn skip_precision(decl: &str) -> &str {
    for qualifier in ["lowp", "mediump", "highp"] {
        if let Some(rest) = decl.strip_prefix(qualifier).filter(|r| r.starts_with(char::is_whitespace)) {
            return rest.trim_start();
        }
    }
    decl
}

/// Blanks out `/* ... */` comments, keeping their newlines so line structure survives.
fn strip_block_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(open) = rest.find("/*") {
        let (before, after) = rest.split_at(open);
        // A `//` earlier on the same line already comments out the `/*`.
        let line_start = before.rfind('\n').map_or(0, |i| i + 1);
        if before[line_start..].contains("//") {
            let line_end = after.find('\n').map_or(after.len(), |i| i);
            out.push_str(before);
            out.push_str(&after[..line_end]);
            rest = &after[line_end..];
            continue;
        }
        out.push_str(before);
        match after[2..].find("*/") {
            Some(close) => {
                let comment = &after[..close + 4];
                out.extend(comment.chars().filter(|c| *c == '\n'));
                out.push(' ');
                rest = &after[close + 4..];
            }
            None => {
                out.extend(after.chars().filter(|c| *c == '\n'));
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn strip_line_comment(line: &str) -> &str {
    match line.find("//") {
        Some(index) => &line[..index],
        None => line,
    }
}

/// `1.0`, `vec2(0.5, 1.0)` or `vec3(0.2)` (splatted) as floats.
fn parse_initializer(init: &str) -> Option<Vec<f32>> {
    if let Ok(value) = init.trim_end_matches('f').parse::<f32>() {
        return Some(vec![value]);
    }
    let open = init.find('(')?;
    let ctor = init[..open].trim();
    let inner = init[open + 1..].strip_suffix(')')?;
    let values = inner
        .split(',')
        .map(|v| v.trim().trim_end_matches('f').parse::<f32>().ok())
        .collect::<Option<Vec<f32>>>()?;
    let width = ctor.chars().last()?.to_digit(10)? as usize;
    match values.len() {
        1 => Some(vec![values[0]; width]),
        n if n == width => Some(values),
        _ => None,
    }
}

/// Reads the uniform block layout out of a parsed module.
pub fn reflect_uniforms(module: &naga::Module) -> Result<UniformLayout> {
    for (_, var) in module.global_variables.iter() {
        if var.space != naga::AddressSpace::Uniform {
            continue;
        }
        if !matches!(var.binding, Some(naga::ResourceBinding { group: 0, binding: UNIFORM_BINDING })) {
            continue;
        }
        let naga::TypeInner::Struct { members, span } = &module.types[var.ty].inner else {
            return Err(anyhow!("Uniform binding {} is not a block", UNIFORM_BINDING));
        };
        let mut slots = BTreeMap::new();
        for member in members {
            let Some(name) = &member.name else { continue };
            let (kind, components) = match &module.types[member.ty].inner {
                naga::TypeInner::Scalar(scalar) => (scalar_kind(scalar)?, 1),
                naga::TypeInner::Vector { size, scalar } => (scalar_kind(scalar)?, *size as u32),
                other => return Err(anyhow!("Uniform {} has unsupported type {:?}", name, other)),
            };
            slots.insert(name.clone(), UniformSlot { offset: member.offset, kind, components });
        }
        return Ok(UniformLayout::new(slots, *span));
    }
    Ok(UniformLayout::default())
}

fn scalar_kind(scalar: &naga::Scalar) -> Result<UniformKind> {
    match scalar.kind {
        naga::ScalarKind::Float => Ok(UniformKind::Float),
        naga::ScalarKind::Sint => Ok(UniformKind::Int),
        naga::ScalarKind::Uint => Ok(UniformKind::Uint),
        other => Err(anyhow!("Unsupported uniform scalar kind {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY: &str = "#version 330\n\
        uniform vec2 iResolution;\n\
        uniform float iTime;\n\
        uniform float bassLevel, midLevel;\n\
        uniform float speed = 1.5;\n\
        uniform vec3 tint = vec3(1.0, 0.5, 0.25);\n\
        uniform sampler2D iChannel0;\n\
        uniform sampler2D iChannel2;\n\
        in vec2 v_text;\n\
        out vec4 fragColor;\n\
        void main() {\n\
            vec3 col = texture(iChannel0, v_text).rgb * (1.0 + bassLevel);\n\
            fragColor = vec4(col * tint, 1.0);\n\
        }\n";

    #[test]
    fn rewrite_collects_uniforms_and_channels() {
        let adapted = adapt_glsl(LEGACY).unwrap();
        assert!(adapted.glsl.starts_with("#version 450\n"));
        assert!(adapted.glsl.contains("uniform ShaderParams {"));
        assert!(adapted.glsl.contains("    float midLevel;"));
        assert!(adapted.glsl.contains("uniform texture2D iChannel2_texture;"));
        assert!(adapted.glsl.contains("layout(set = 0, binding = 6) uniform sampler iChannel2_sampler;"));
        assert!(adapted.glsl.contains("layout(location = 0) in vec2 v_text;"));
        assert!(adapted.glsl.contains("layout(location = 0) out vec4 fragColor;"));
        assert_eq!(adapted.channels, [true, false, true, false]);
        assert_eq!(
            adapted.defaults,
            vec![("speed".to_string(), vec![1.5]), ("tint".to_string(), vec![1.0, 0.5, 0.25])]
        );
    }

    #[test]
    fn rewritten_shader_parses_and_reflects() {
        let adapted = adapt_glsl(LEGACY).unwrap();
        let mut frontend = naga::front::glsl::Frontend::default();
        let options = naga::front::glsl::Options::from(naga::ShaderStage::Fragment);
        let module = frontend.parse(&options, &adapted.glsl).unwrap();
        let layout = reflect_uniforms(&module).unwrap();

        let resolution = layout.get("iResolution").unwrap();
        assert_eq!((resolution.offset, resolution.components), (0, 2));
        assert_eq!(layout.get("iTime").unwrap().offset, 8);
        assert_eq!(layout.get("tint").unwrap().components, 3);
        assert!(layout.get("trebleLevel").is_none());
    }

    #[test]
    fn shader_without_uniforms_has_empty_layout() {
        let src = "#version 330\nout vec4 fragColor;\nvoid main() { fragColor = vec4(1.0); }\n";
        let adapted = adapt_glsl(src).unwrap();
        assert!(!adapted.glsl.contains("ShaderParams"));
        let mut frontend = naga::front::glsl::Frontend::default();
        let options = naga::front::glsl::Options::from(naga::ShaderStage::Fragment);
        let module = frontend.parse(&options, &adapted.glsl).unwrap();
        assert_eq!(reflect_uniforms(&module).unwrap().names().count(), 0);
    }

    #[test]
    fn unsupported_declarations_are_rejected() {
        assert!(adapt_glsl("uniform sampler2D noiseTex;\n").is_err());
        assert!(adapt_glsl("uniform mat4 transform;\n").is_err());
    }

    #[test]
    fn vector_initializer_stays_one_declarator() {
        let src = "#version 330\n\
            uniform vec3 tint = vec3(1.0, 0.5, 0.25), glow = vec3(0.1);\n\
            out vec4 fragColor;\n\
            void main() { fragColor = vec4(tint + glow, 1.0); }\n";
        let adapted = adapt_glsl(src).unwrap();
        assert!(adapted.glsl.contains("    vec3 tint;\n    vec3 glow;\n"));
        assert_eq!(
            adapted.defaults,
            vec![("tint".to_string(), vec![1.0, 0.5, 0.25]), ("glow".to_string(), vec![0.1, 0.1, 0.1])]
        );
    }

    #[test]
    fn precision_qualifiers_and_block_comments_are_skipped() {
        let src = "#version 330\n\
            /* uniform mat4 unused;\n\
               still a comment */\n\
            uniform highp float speed; /* per second */\n\
            uniform mediump vec2 offset = vec2(0.5, 1.0);\n\
            out vec4 fragColor;\n\
            void main() { fragColor = vec4(speed, offset, 1.0); }\n";
        let adapted = adapt_glsl(src).unwrap();
        assert!(!adapted.glsl.contains("mat4"));
        assert!(adapted.glsl.contains("    float speed;\n    vec2 offset;\n"));
        assert_eq!(adapted.defaults, vec![("offset".to_string(), vec![0.5, 1.0])]);

        let mut frontend = naga::front::glsl::Frontend::default();
        let options = naga::front::glsl::Options::from(naga::ShaderStage::Fragment);
        let module = frontend.parse(&options, &adapted.glsl).unwrap();
        assert_eq!(reflect_uniforms(&module).unwrap().get("offset").unwrap().components, 2);
    }

    #[test]
    fn bundled_demo_shader_keeps_its_tint_default() {
        let adapted = adapt_glsl(include_str!("../../demos/Shaders/BassPulse.glsl")).unwrap();
        assert!(adapted.defaults.contains(&("tint".to_string(), vec![1.0, 0.85, 0.4])));
        let mut frontend = naga::front::glsl::Frontend::default();
        let options = naga::front::glsl::Options::from(naga::ShaderStage::Fragment);
        assert!(frontend.parse(&options, &adapted.glsl).is_ok());
    }

    #[test]
    fn top_level_split_respects_parentheses() {
        assert_eq!(split_top_level("a, b = vec2(1.0, 2.0), c"), vec!["a", " b = vec2(1.0, 2.0)", " c"]);
        assert_eq!(strip_block_comments("a /* x */ b // /* y\nc"), "a   b // /* y\nc");
    }

    #[test]
    fn initializers_parse_literals_only() {
        assert_eq!(parse_initializer("2.0"), Some(vec![2.0]));
        assert_eq!(parse_initializer("vec2(0.5)"), Some(vec![0.5, 0.5]));
        assert_eq!(parse_initializer("vec2(0.5, 1.0)"), Some(vec![0.5, 1.0]));
        assert_eq!(parse_initializer("sin(1.0)"), None);
    }
}
