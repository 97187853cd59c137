/// Builds the gRPC client and server code for the `echo.proto` definition using
/// `tonic-prost-build`.
///
/// The generated modules are included by `echo_rpc_core::proto` and the
/// encoded file descriptor set is exported for the reflection service.
///
/// # Files and Paths
///
/// - Proto file: `proto/echo.proto`
/// - Includes: `proto/`
/// - Descriptor set: `$OUT_DIR/echo_descriptor.bin`
///
/// # Panics
///
/// This function will `panic!` if code generation fails.
use std::env;
use std::path::PathBuf;
fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("echo_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/echo.proto"], &["proto"])
        .unwrap();
}
