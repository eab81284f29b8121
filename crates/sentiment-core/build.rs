/// Builds the gRPC client and server code for the `sentiment.proto` definition
/// using `tonic-prost-build`.
///
/// This code generation step processes the Protocol Buffer definitions located
/// in the `proto` directory and emits Rust modules with gRPC bindings into the
/// crate's `OUT_DIR`.
///
/// # Files and Paths
///
/// - Proto file: `proto/sentiment/v1/sentiment.proto`
/// - Includes: `proto/`
///
/// # Maps
///
/// `confidence_scores` is generated as a `BTreeMap` so that labels iterate in
/// a stable order when results are printed or persisted.
///
/// # Panics
///
/// This function will `panic!` if code generation fails.
///
/// # Output
///
/// Generated code will be accessible in Rust via:
///
/// ```rust
/// pub mod proto {
///     tonic::include_proto!("sentiment.v1");
/// }
/// ```
fn main() {
    let mut config = tonic_prost_build::Config::new();

    config.btree_map([".sentiment.v1.SentimentResponse.confidence_scores"]);

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/sentiment/v1/sentiment.proto"], &["proto"])
        .unwrap();
}
