//! Compiles `proto/ohlc.proto` into Rust types at build time.
//!
//! The generated module is pulled in with `tonic::include_proto!("ohlc")`
//! in `src/server.rs` and `src/bin/client.rs`.

fn main() {
    if std::env::var_os("PROTOC").is_none() {
        std::env::set_var(
            "PROTOC",
            protoc_bin_vendored::protoc_bin_path().expect("failed to locate vendored protoc"),
        );
    }
    tonic_build::compile_protos("proto/ohlc.proto").expect("failed to compile protos");
}
