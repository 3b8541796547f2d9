use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_root = PathBuf::from("proto");

    let proto_files = vec![
        proto_root.join("mvccpb/kv.proto"),
        proto_root.join("etcdserverpb/rpc.proto"),
    ];

    for file in &proto_files {
        println!("cargo:rerun-if-changed={}", file.display());
    }

    // Only the client side of the etcd v3 API is needed here.
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&proto_files, &[proto_root])?;

    Ok(())
}
