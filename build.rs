fn main() {
    protobuf_codegen::Codegen::new()
        .pure()
        .include("proto")
        .input("proto/rendezvous.proto")
        .cargo_out_dir("proto")
        .run_from_script();
}
