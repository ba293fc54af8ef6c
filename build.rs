fn main() {
    tonic_build::compile_protos("proto/restore.proto").unwrap();
}
