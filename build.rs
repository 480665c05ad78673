// Build script to compile GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders/shader.vert");
    println!("cargo:rerun-if-changed=shaders/shader.frag");

    // Compile shaders using glslc (part of Vulkan SDK)
    compile_shader("shaders/shader.vert", "shaders/shader.vert.spv");
    compile_shader("shaders/shader.frag", "shaders/shader.frag.spv");
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    if !input_path.exists() {
        println!("cargo:warning=shader source {} is missing", input);
        return;
    }

    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            // The renderer loads SPIR-V from disk at startup, so a missing
            // compiler only matters if no prebuilt .spv is present.
            println!("cargo:warning=glslc not found ({}), {} was not rebuilt", e, output);
            println!("cargo:warning=compile manually: glslc {} -o {}", input, output);
        }
    }
}
